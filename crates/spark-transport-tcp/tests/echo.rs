//! 端到端回声场景：客户端用裸 `std::net::TcpStream` 连接到一个由
//! `DispatcherLoop` + 单个工作循环组成的迷你服务端，服务端管道里的
//! handler 把收到的字节原样写回。

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use spark_core::channel::ChannelConfig;
use spark_core::future::Promise;
use spark_core::pipeline::context::HandlerContext;
use spark_core::pipeline::handler::{Handler, Message};
use spark_core::pipeline::Anchor;

use spark_transport_tcp::{ChannelReadyCallback, DispatcherLoop, EventLoopConfig, TcpEventLoopGroup};

/// 把收到的每一条消息原样写回并立即 flush，不转发给下游（回声到此为止）。
struct EchoHandler {
    reads: Arc<AtomicUsize>,
    read_completes: Arc<AtomicUsize>,
}

impl Handler for EchoHandler {
    fn channel_read(&self, ctx: &mut HandlerContext, message: Message) {
        self.reads.fetch_add(1, Ordering::SeqCst);
        ctx.write(message, Promise::new());
        ctx.flush();
    }

    fn channel_read_complete(&self, ctx: &mut HandlerContext) {
        self.read_completes.fetch_add(1, Ordering::SeqCst);
        ctx.fire_channel_read_complete();
    }

    fn channel_inactive(&self, ctx: &mut HandlerContext) {
        ctx.fire_channel_inactive();
    }
}

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
fn echoes_five_bytes_over_loopback_and_closes_cleanly() {
    let allocator = Arc::new(spark_core::buffer::PooledAllocator::new());
    let workers = Arc::new(TcpEventLoopGroup::spawn(1, EventLoopConfig::default()).expect("spawn worker"));

    let reads = Arc::new(AtomicUsize::new(0));
    let read_completes = Arc::new(AtomicUsize::new(0));
    let inactive = Arc::new(AtomicUsize::new(0));

    let handler_reads = reads.clone();
    let handler_read_completes = read_completes.clone();
    let handler_inactive = inactive.clone();
    let on_channel_ready: ChannelReadyCallback = Arc::new(move |channel| {
        let handler_inactive = handler_inactive.clone();
        struct TrackInactive(Arc<AtomicUsize>);
        impl Handler for TrackInactive {
            fn channel_inactive(&self, ctx: &mut HandlerContext) {
                self.0.fetch_add(1, Ordering::SeqCst);
                ctx.fire_channel_inactive();
            }
        }
        channel
            .pipeline
            .add_handler("echo", Arc::new(EchoHandler {
                reads: handler_reads.clone(),
                read_completes: handler_read_completes.clone(),
            }), Anchor::Last)
            .expect("install echo handler");
        channel
            .pipeline
            .add_handler("track-inactive", Arc::new(TrackInactive(handler_inactive)), Anchor::Last)
            .expect("install inactive tracker");
    });

    let dispatcher = DispatcherLoop::bind(
        "127.0.0.1:0".parse().unwrap(),
        workers,
        ChannelConfig::default(),
        allocator,
        on_channel_ready,
    )
    .expect("bind dispatcher");

    let addr = dispatcher.local_addr();
    let mut client = TcpStream::connect(addr).expect("client connect");
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    let payload = [0x68u8, 0x65, 0x6c, 0x6c, 0x6f];
    client.write_all(&payload).expect("client write");

    let mut echoed = [0u8; 5];
    client.read_exact(&mut echoed).expect("client read echo");
    assert_eq!(echoed, payload);

    assert!(wait_until(Duration::from_secs(1), || read_completes.load(Ordering::SeqCst) >= 1));
    assert_eq!(reads.load(Ordering::SeqCst), 1);
    assert_eq!(read_completes.load(Ordering::SeqCst), 1);

    drop(client);
    assert!(wait_until(Duration::from_secs(1), || inactive.load(Ordering::SeqCst) >= 1));

    let closed = dispatcher.close();
    assert!(wait_until(Duration::from_secs(1), || closed.is_done()));
}
