//! 任务队列：多生产者单消费者的可执行单元队列。
//!
//! # 设计背景（Why）
//! 事件循环对外暴露"任何线程都能 `execute()`"的契约，但循环体本身只能由
//! 拥有它的那一个 OS 线程消费队列——否则就失去了"同一通道的所有回调都在
//! 同一线程上"这条贯穿全文的核心不变式。于是入队必须无锁/多生产者安全，
//! 出队则被限定为仅所有者线程调用。
//!
//! # 逻辑解析（How）
//! 用一把 `parking_lot::Mutex` 保护的 `VecDeque` 承载任务本体（锁竞争只发生
//! 在极短的 push/pop 临界区，足够快）；真正的多生产者/单消费者语义体现在
//! 使用约定上——只有循环线程会调用 `drain()`。唤醒用一个"单次等待句柄"：
//! 消费者把它复位为"空"，再第二次检查队列，从而堵住"生产者在消费者刚判断
//! 队列为空、还没进入睡眠之间插入一个任务"的竞态窗口。
//!
//! # 契约说明（What）
//! - `push()` 可以从任意线程调用，返回值指示这是否是让队列从空变为非空的
//!   那一次 push（循环用它判断是否需要唤醒）。
//! - `drain_into()` 仅应由所有者线程调用，一次性取走队列中的全部任务。
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Condvar;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use parking_lot::Mutex;

/// 循环要执行的一个可运行单元。
pub type Runnable = Box<dyn FnOnce() + Send + 'static>;

/// 多生产者/单消费者任务队列。
pub struct TaskQueue {
    tasks: Mutex<VecDeque<Runnable>>,
    wake: WakeHandle,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
            wake: WakeHandle::new(),
        }
    }

    /// 入队一个任务。可以从任意线程调用。返回 `true` 表示队列从空变为非空，
    /// 调用方若不是循环线程应当据此唤醒循环。
    pub fn push(&self, task: Runnable) -> bool {
        let mut guard = self.tasks.lock();
        let was_empty = guard.is_empty();
        guard.push_back(task);
        drop(guard);
        self.wake.signal();
        was_empty
    }

    /// 只应由所有者（循环）线程调用：取出队列中全部待执行任务。
    pub fn drain_into(&self, out: &mut VecDeque<Runnable>) {
        let mut guard = self.tasks.lock();
        out.extend(guard.drain(..));
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// 循环线程专用：在队列为空时睡眠，最多 `timeout`；
    /// 通过"复位再二次检查"避免错过竞态中的唤醒信号。
    pub fn park_owner(&self, timeout: Duration) {
        self.wake.reset();
        if !self.is_empty() {
            return;
        }
        self.wake.wait_timeout(timeout);
    }
}

/// 单次等待句柄：生产者 `signal()`，消费者 `reset()` 之后 `wait_timeout()`。
struct WakeHandle {
    state: StdMutex<bool>,
    condvar: Condvar,
    signalled_eager: AtomicBool,
}

impl WakeHandle {
    fn new() -> Self {
        Self {
            state: StdMutex::new(false),
            condvar: Condvar::new(),
            signalled_eager: AtomicBool::new(false),
        }
    }

    fn signal(&self) {
        self.signalled_eager.store(true, Ordering::Release);
        let mut guard = self.state.lock().unwrap();
        *guard = true;
        self.condvar.notify_all();
    }

    fn reset(&self) {
        self.signalled_eager.store(false, Ordering::Release);
        let mut guard = self.state.lock().unwrap();
        *guard = false;
    }

    fn wait_timeout(&self, timeout: Duration) {
        if self.signalled_eager.load(Ordering::Acquire) {
            return;
        }
        let guard = self.state.lock().unwrap();
        if *guard {
            return;
        }
        let _ = self.condvar.wait_timeout(guard, timeout).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn push_reports_empty_to_nonempty_transition() {
        let q = TaskQueue::new();
        assert!(q.push(Box::new(|| {})));
        assert!(!q.push(Box::new(|| {})));
    }

    #[test]
    fn drain_runs_tasks_in_submission_order_for_single_producer() {
        let q = TaskQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            q.push(Box::new(move || order.lock().push(i)));
        }
        let mut drained = VecDeque::new();
        q.drain_into(&mut drained);
        for task in drained {
            task();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn park_owner_returns_promptly_once_signalled() {
        let q = Arc::new(TaskQueue::new());
        let q2 = q.clone();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            q2.push(Box::new(move || {
                counter2.fetch_add(1, Ordering::SeqCst);
            }));
        });
        q.park_owner(Duration::from_secs(5));
        handle.join().unwrap();
        assert_eq!(q.len(), 1);
    }
}
