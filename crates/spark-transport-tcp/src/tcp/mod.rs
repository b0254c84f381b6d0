//! 绑定到 `mio::net` 的具体 TCP 传输：监听器与通道。
pub mod channel;
pub mod listener;
pub mod recv_allocator;

pub use channel::TcpChannel;
pub use listener::TcpListenerChannel;
