//! EventExecutorGroup：固定大小的事件循环池，带亲和性感知的 `next()`。
//!
//! # 设计背景（Why）
//! 一个通道一旦注册到某个循环，之后的生命周期都必须绑定在那个循环的
//! 线程上；但接受新连接、发起新连接这些动作本身往往发生在别的线程
//! （比如 dispatcher 线程，或者调用方自己的线程）。`next()` 如果总是
//! round-robin，会在"调用方恰好已经就是池子里某一个循环自己的线程"这种
//! 情况下选错——本可以直接原地用当前循环、却又绕道挑了另一个循环，
//! 白白多了一次跨线程 `execute()` 调度。因此亲和性检测要排在
//! round-robin 之前。
//!
//! # 逻辑解析（How）
//! 构造时按 `size` 启动等量的 [`TcpEventLoop`]；`next()` 先线性扫描
//! 判断 `in_event_loop()` 是否有命中，命中就直接返回那一个，否则用一个
//! 原子计数器取模做轮询。
//!
//! # 契约说明（What）
//! - `shutdown_gracefully` 对所有子循环广播，返回的 future 在全部子循环
//!   的 termination future 都完成后才完成（用 [`AggregatingPromise`]）。
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use spark_core::executor::{EventExecutor, EventExecutorGroup};
use spark_core::future::{AggregatingPromise, Future as SparkFuture};

use crate::event_loop::{EventLoopConfig, TcpEventLoop};

/// 固定大小的 `mio` 事件循环池。
pub struct TcpEventLoopGroup {
    loops: Vec<Arc<TcpEventLoop>>,
    next: AtomicUsize,
}

impl TcpEventLoopGroup {
    /// 启动 `size` 个事件循环，每个都拥有自己的 OS 线程。
    pub fn spawn(size: usize, config: EventLoopConfig) -> std::io::Result<Self> {
        let mut loops = Vec::with_capacity(size.max(1));
        for _ in 0..size.max(1) {
            loops.push(Arc::new(TcpEventLoop::spawn(config)?));
        }
        Ok(Self {
            loops,
            next: AtomicUsize::new(0),
        })
    }

    pub fn loops(&self) -> &[Arc<TcpEventLoop>] {
        &self.loops
    }

    fn round_robin(&self) -> Arc<TcpEventLoop> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        self.loops[index].clone()
    }
}

impl EventExecutorGroup for TcpEventLoopGroup {
    fn next(&self) -> Arc<dyn EventExecutor> {
        for loop_ in &self.loops {
            if loop_.in_event_loop() {
                return loop_.clone();
            }
        }
        self.round_robin()
    }

    fn shutdown_gracefully(&self, quiet_period: Duration, timeout: Duration) -> SparkFuture<()> {
        let aggregate = AggregatingPromise::new(self.loops.len());
        for loop_ in &self.loops {
            aggregate.attach(&to_promise(loop_.shutdown_gracefully(quiet_period, timeout)));
        }
        aggregate.as_future()
    }

    fn termination_future(&self) -> SparkFuture<()> {
        let aggregate = AggregatingPromise::new(self.loops.len());
        for loop_ in &self.loops {
            aggregate.attach(&to_promise(loop_.termination_future()));
        }
        aggregate.as_future()
    }
}

/// [`AggregatingPromise::attach`] 需要一个 [`Promise`]，而 `shutdown_gracefully`/
/// `termination_future` 返回的是只读的 [`SparkFuture`]；这里搭一个一次性的
/// 转接 promise，在原 future 完成时把结果转发过去。
fn to_promise(future: SparkFuture<()>) -> spark_core::future::Promise<()> {
    let bridge = spark_core::future::Promise::new();
    let forward = bridge.clone();
    future.on_complete(move |outcome| match outcome {
        spark_core::future::Outcome::Succeeded(()) => {
            forward.try_complete(());
        }
        spark_core::future::Outcome::Failed(err) => {
            forward.try_fail(err);
        }
        spark_core::future::Outcome::Cancelled => {
            forward.try_cancel();
        }
    });
    bridge
}
