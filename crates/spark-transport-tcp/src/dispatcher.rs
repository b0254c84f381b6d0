//! DispatcherLoop：独占监听套接字，把新连接过户给某个工作循环。
//!
//! # 设计背景（Why）
//! 服务端场景下只有一个循环适合持有监听套接字——否则多个循环各自
//! `accept()` 同一个端口会引发惊群式竞争。与此同时，真正处理业务逻辑的
//! 通道必须分散到一组工作循环上，这样才能用满多核。因此这里分离出一个
//! 专职的 dispatcher 循环，它只做一件事：`accept()` 之后把原生 socket
//! 过户给某个工作循环。
//!
//! 过户的方式原本设想是一条 OS 级 IPC 管道（命名管道/UDS），让 accept 线程
//! 和消费线程彻底解耦；但工作区里并没有引入任何额外的 IPC/消息队列依赖，
//! 而 `EventExecutor::execute()` 本身就是"把一个闭包安全地交给另一个线程
//! 执行"的现成契约——用它来传递"在这个线程上把这个原生 socket 构造成
//! 通道"这个任务，效果与管道传递文件描述符等价，却不需要多一层真实的
//! 内核 IPC 原语。
//!
//! # 逻辑解析（How）
//! `accept_loop` 收到一个新连接后，按轮询策略选一个工作循环，分配一个
//! 在该循环 `mio::Registry` 命名空间里唯一的 token，然后把"构造
//! `TcpChannel`（含注册与管道初始化事件）"整个过程打包成一个闭包，交给
//! `worker.execute()`——这样管道生命周期回调从第一次触发开始就运行在
//! 它所属的那个线程上，不需要任何事后校验或重派发。轮询游标和 token
//! 计数器被拆进独立的 `HandoffState`，由接受回调的闭包直接持有，不需要
//! 反过来引用 `DispatcherLoop` 自己——回调在监听器绑定成功之前就必须
//! 存在，而 `DispatcherLoop` 的字段要等监听器绑定完成才能确定，两者互相
//! 依赖会变成构造顺序死锁，拆开就没有这个问题。
//!
//! # 契约说明（What）
//! - 每个被接受的连接恰好交给一个工作循环，按轮询顺序分配，不做亲和性
//!   判断（接受连接的线程几乎不可能恰好就是某个工作循环自己）。
//! - `accept()` 失败（非 WouldBlock）时原生 handle 已经被 OS 层丢弃，这里
//!   只负责记录；不重试、不关闭监听器本身。
//! - 过户给工作循环的任务本身不会重试：工作循环只有在自己已经进入停机
//!   状态时才会拒绝新任务，这种情况下重试没有意义，直接记录丢弃即可。
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mio::Token;

use spark_core::buffer::PooledAllocator;
use spark_core::channel::ChannelConfig;
use spark_core::executor::EventExecutor;

use crate::event_loop::{EventLoopConfig, TcpEventLoop};
use crate::event_loop_group::TcpEventLoopGroup;
use crate::tcp::channel::TcpChannel;
use crate::tcp::listener::TcpListenerChannel;

/// 每接受一条连接、把它过户到某个工作循环并构造出通道之后调用一次。
pub type ChannelReadyCallback = Arc<dyn Fn(Arc<TcpChannel>) + Send + Sync>;

/// 轮询游标与每循环 token 计数器，独立于 `DispatcherLoop` 存在，见模块级
/// 文档对构造顺序的说明。
struct HandoffState {
    workers: Arc<TcpEventLoopGroup>,
    next_worker: AtomicUsize,
    next_token: AtomicUsize,
}

impl HandoffState {
    fn pick_worker(&self) -> Arc<TcpEventLoop> {
        let loops = self.workers.loops();
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % loops.len();
        loops[index].clone()
    }

    fn handoff(
        &self,
        stream: mio::net::TcpStream,
        peer_addr: SocketAddr,
        config: ChannelConfig,
        allocator: Arc<PooledAllocator>,
        on_channel_ready: ChannelReadyCallback,
    ) {
        let worker = self.pick_worker();
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        let worker_for_construction = worker.clone();
        worker.execute(Box::new(move || {
            match TcpChannel::from_accepted(stream, token, worker_for_construction, config, allocator) {
                Ok(channel) => on_channel_ready(channel),
                Err(err) => {
                    tracing::warn!(
                        peer = %peer_addr,
                        error = %err,
                        "failed to register accepted connection on worker loop"
                    );
                }
            }
        }));
    }
}

/// 独占一个监听套接字、把接受到的连接过户给工作循环池的调度器。
pub struct DispatcherLoop {
    dispatcher_loop: Arc<TcpEventLoop>,
    listener: Arc<TcpListenerChannel>,
    handoff: Arc<HandoffState>,
}

impl DispatcherLoop {
    /// 启动专属的 dispatcher 循环，绑定监听地址，并把接受到的连接按轮询
    /// 顺序过户给 `workers` 中的某一个循环。
    pub fn bind(
        addr: SocketAddr,
        workers: Arc<TcpEventLoopGroup>,
        channel_config: ChannelConfig,
        allocator: Arc<PooledAllocator>,
        on_channel_ready: ChannelReadyCallback,
    ) -> std::io::Result<Arc<Self>> {
        let dispatcher_loop = Arc::new(TcpEventLoop::spawn(EventLoopConfig::default())?);
        let handoff = Arc::new(HandoffState {
            workers,
            next_worker: AtomicUsize::new(0),
            next_token: AtomicUsize::new(1),
        });

        let callback_handoff = handoff.clone();
        let listener = TcpListenerChannel::bind(
            addr,
            dispatcher_loop.clone(),
            Token(0),
            Arc::new(move |stream, peer_addr| {
                callback_handoff.handoff(
                    stream,
                    peer_addr,
                    channel_config.clone(),
                    allocator.clone(),
                    on_channel_ready.clone(),
                );
            }),
        )?;

        Ok(Arc::new(Self {
            dispatcher_loop,
            listener,
            handoff,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn is_active(&self) -> bool {
        self.listener.is_active()
    }

    /// 当前池子里的工作循环数量，诊断/测试用。
    pub fn worker_count(&self) -> usize {
        self.handoff.workers.loops().len()
    }

    /// 停止接受新连接并让 dispatcher 自己的循环优雅退出；已经过户出去的
    /// 连接由它们各自的工作循环继续管理，不受影响。
    pub fn close(&self) -> spark_core::future::Future<()> {
        self.listener.close();
        self.dispatcher_loop
            .shutdown_gracefully(std::time::Duration::ZERO, std::time::Duration::from_secs(1))
    }
}
