//! spark-transport-tcp：基于 `mio` 的具体 TCP 传输实现。
//!
//! `spark-core` 只定义执行器、管道、缓冲区这些抽象契约；这个 crate 提供
//! 其中一种具体落地——单线程 `mio` 事件循环、`EventExecutorGroup` 的
//! 固定大小轮询实现，以及绑定到 `mio::net` 的监听器/通道。
#![deny(unsafe_code)]

pub mod dispatcher;
pub mod event_loop;
pub mod event_loop_group;
pub mod tcp;

pub use dispatcher::{ChannelReadyCallback, DispatcherLoop};
pub use event_loop::{EventLoopConfig, TcpEventLoop};
pub use event_loop_group::TcpEventLoopGroup;
pub use tcp::{TcpChannel, TcpListenerChannel};
