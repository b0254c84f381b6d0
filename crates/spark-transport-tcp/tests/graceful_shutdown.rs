//! 优雅停机场景：提交一批耗时任务，停机期间它们必须全部跑完，停机之后
//! 提交的新任务必须被拒绝而不是悄悄排队。

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use spark_core::executor::EventExecutor;
use spark_transport_tcp::{EventLoopConfig, TcpEventLoop};

fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

#[test]
fn pending_tasks_drain_before_termination_and_late_submission_is_rejected() {
    let event_loop = TcpEventLoop::spawn(EventLoopConfig::default()).expect("spawn loop");

    let completed = Arc::new(AtomicUsize::new(0));
    for _ in 0..5 {
        let completed = completed.clone();
        event_loop.execute(Box::new(move || {
            std::thread::sleep(Duration::from_millis(20));
            completed.fetch_add(1, Ordering::SeqCst);
        }));
    }

    let started_at = Instant::now();
    let termination = event_loop.shutdown_gracefully(Duration::from_millis(50), Duration::from_secs(1));

    let late_ran = Arc::new(AtomicBool::new(false));
    let late_ran_flag = late_ran.clone();
    event_loop.execute(Box::new(move || {
        late_ran_flag.store(true, Ordering::SeqCst);
    }));

    assert!(
        wait_until(Duration::from_secs(2), || termination.is_done()),
        "event loop did not terminate in time"
    );
    let elapsed = started_at.elapsed();

    assert_eq!(completed.load(Ordering::SeqCst), 5, "all queued tasks must run before termination");
    assert!(!late_ran.load(Ordering::SeqCst), "task submitted after shutdown_gracefully must be rejected");
    assert!(elapsed >= Duration::from_millis(100), "termination was faster than the quiet period allows: {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(1050), "termination exceeded the shutdown timeout budget: {elapsed:?}");
}
