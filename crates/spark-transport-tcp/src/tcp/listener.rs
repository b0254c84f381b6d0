//! TcpListenerChannel：绑定到 `mio::net::TcpListener` 的服务端监听通道。
//!
//! # 设计背景（Why）
//! 监听器本身也是一条通道（§4.6 把它纳入同一个状态机），但它唯一关心的
//! I/O 事件是"有新连接可以 `accept()`"，不需要出站写入路径。把它独立成
//! 一个更小的类型，而不是硬塞进 `TcpChannelState` 再到处判断"这是不是监听
//! 套接字"，能让两者的状态机都保持简单。
//!
//! # 逻辑解析（How）
//! `accept_loop` 在 readable 就绪时反复 `accept()` 直到 `WouldBlock`——水平
//! 触发模式下一次就绪可能对应多个排队的连接，全部收走才不会遗漏。每接受
//! 一个连接就调用一次 `dispatch`，由调用方决定把它安置到哪个工作循环上
//! （见 `crate::dispatcher`）。
//!
//! # 契约说明（What）
//! - 监听器自身的生命周期只有 `Open → Registered → Active → Closed` 四态
//!   中的前三态在 `bind` 成功后立即达成；没有 `connect` 语义。
//! - `close()` 停止接受新连接并从事件循环注销；已经分发出去的已接受连接
//!   不受影响。
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};
use parking_lot::Mutex;

use spark_core::channel::AtomicChannelState;
use spark_core::channel::ChannelState;
use spark_core::error::CoreError;

use crate::event_loop::TcpEventLoop;

/// 每接受一个连接调用一次；`local` 是监听地址，便于日志/诊断使用。
pub type AcceptCallback = Arc<dyn Fn(TcpStream, SocketAddr) + Send + Sync>;

pub struct TcpListenerChannel {
    socket: Mutex<Option<TcpListener>>,
    token: Token,
    event_loop: Arc<TcpEventLoop>,
    state: AtomicChannelState,
    local_addr: SocketAddr,
}

impl TcpListenerChannel {
    /// 绑定并立即注册到所属事件循环；`backlog` 来自 [`spark_core::channel::ChannelConfig::so_backlog`]。
    pub fn bind(
        addr: SocketAddr,
        event_loop: Arc<TcpEventLoop>,
        token: Token,
        on_accept: AcceptCallback,
    ) -> io::Result<Arc<Self>> {
        let mut socket = TcpListener::bind(addr)?;
        let local_addr = socket.local_addr()?;
        event_loop
            .registry()
            .register(&mut socket, token, Interest::READABLE)?;

        let listener = Arc::new(Self {
            socket: Mutex::new(Some(socket)),
            token,
            event_loop: event_loop.clone(),
            state: AtomicChannelState::new(),
            local_addr,
        });
        listener.state.set(ChannelState::OPEN);
        listener.state.set(ChannelState::REGISTERED);
        listener.state.set(ChannelState::ACTIVE);

        let callback_listener = listener.clone();
        event_loop.register_source(
            token,
            Arc::new(move |_event: &mio::event::Event| {
                callback_listener.accept_loop(&on_accept);
            }),
        );
        Ok(listener)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    fn accept_loop(self: &Arc<Self>, on_accept: &AcceptCallback) {
        loop {
            let accepted = {
                let mut guard = self.socket.lock();
                match guard.as_mut() {
                    Some(socket) => socket.accept(),
                    None => return,
                }
            };
            match accepted {
                Ok((stream, peer)) => on_accept(stream, peer),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    tracing::warn!(
                        token = ?self.token,
                        error = %CoreError::from(err),
                        "accept() failed, listener continues"
                    );
                    return;
                }
            }
        }
    }

    pub fn close(&self) {
        if self.state.is_closed() {
            return;
        }
        self.state.close();
        if let Some(mut socket) = self.socket.lock().take() {
            let _ = self.event_loop.registry().deregister(&mut socket);
        }
        self.event_loop.deregister_source(self.token);
    }
}

impl Drop for TcpListenerChannel {
    fn drop(&mut self) {
        if !self.state.is_closed() {
            self.close();
        }
    }
}
