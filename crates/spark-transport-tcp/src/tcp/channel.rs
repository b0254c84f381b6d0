//! TcpChannel：绑定到 `mio::net::TcpStream` 的具体 `ChannelUnsafe` 实现。
//!
//! # 设计背景（Why）
//! §9 的重构指引把"通道 ↔ 管道互相持有"的潜在引用环，改写成"通道拥有管道
//! （强引用），管道持有的 `Unsafe` 句柄对通道状态是强引用没错，但通道状态
//! 反过来只用 `Weak` 够到管道"——这样通道状态可以在不持有管道强引用的
//! 前提下，在 I/O 就绪时把事件喂回管道，而管道被整体丢弃时不会因为通道
//! 状态里还攥着一份强引用而"活不掉"。
//!
//! # 逻辑解析（How）
//! `TcpChannelState` 实现 [`ChannelUnsafe`]：`connect`/`write`/`flush`/`close`
//! 等方法假定调用者已经在所属事件循环线程上（这是 §4.6 契约本身的要求，
//! 由调用方——通常是 `HandlerContext`——负责）。读写都通过事件循环的
//! `sources` 回调表触发：注册时把一个闭包交给 `TcpEventLoop`，`mio`
//! 就绪事件到来时由循环线程调用它，闭包再转手调用 `on_readable`/`on_writable`。
//!
//! # 契约说明（What）
//! - 出站写入路径里，一条 `ByteBuffer` 消息只有在完全写入内核 socket 缓冲区
//!   之后才会被 `release()`，失败或通道关闭时同样要被释放，维持
//!   retain/release 配平。
//! - `write_spin_count` 控制一次 `flush` 最多连续尝试几次系统调用，避免在
//!   发送方远快于对端消费时把事件循环线程钉死在一个通道上。
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use mio::net::TcpStream;
use mio::{Interest, Token};
use parking_lot::Mutex;

use spark_core::buffer::{ByteBuffer, PooledAllocator};
use spark_core::channel::{AtomicChannelState, ChannelConfig, ChannelOutboundBuffer, ChannelState, ChannelUnsafe, WritabilityFlip};
use spark_core::error::CoreError;
use spark_core::executor::EventExecutor;
use spark_core::future::Promise;
use spark_core::observability::record_writability_flip;
use spark_core::pipeline::handler::Message;
use spark_core::pipeline::ChannelPipeline;

use crate::event_loop::TcpEventLoop;
use crate::tcp::recv_allocator::AdaptiveRecvByteBufAllocator;

struct PendingWrite {
    data: Bytes,
    written: usize,
}

pub(crate) struct TcpChannelState {
    socket: Mutex<Option<TcpStream>>,
    token: Token,
    event_loop: Arc<TcpEventLoop>,
    state: AtomicChannelState,
    config: ChannelConfig,
    allocator: Arc<PooledAllocator>,
    outbound: Mutex<ChannelOutboundBuffer>,
    in_flight_write: Mutex<Option<PendingWrite>>,
    recv_allocator: Mutex<AdaptiveRecvByteBufAllocator>,
    pipeline: Mutex<Option<Weak<ChannelPipeline>>>,
    peer_addr: Mutex<Option<SocketAddr>>,
    connecting: AtomicBool,
    connect_timeout_handle: Mutex<Option<spark_core::scheduled::ScheduledHandle>>,
}

/// 面向调用方的通道句柄：持有通道的私有状态和它拥有的管道。
pub struct TcpChannel {
    pub(crate) state: Arc<TcpChannelState>,
    pub pipeline: Arc<ChannelPipeline>,
}

impl TcpChannel {
    /// 把一个已经 `accept()` 出来的流包装成通道：立即注册读写就绪事件，
    /// 状态从 Open 直接进到 Active（接受到的连接天然已经建立）。
    pub fn from_accepted(
        mut socket: TcpStream,
        token: Token,
        event_loop: Arc<TcpEventLoop>,
        config: ChannelConfig,
        allocator: Arc<PooledAllocator>,
    ) -> io::Result<Arc<Self>> {
        let peer_addr = socket.peer_addr().ok();
        event_loop
            .registry()
            .register(&mut socket, token, Interest::READABLE)?;

        let state = Arc::new(TcpChannelState {
            socket: Mutex::new(Some(socket)),
            token,
            event_loop: event_loop.clone(),
            state: AtomicChannelState::new(),
            recv_allocator: Mutex::new(AdaptiveRecvByteBufAllocator::new(64, 2048, 64 * 1024)),
            outbound: Mutex::new(ChannelOutboundBuffer::new(
                config.write_buffer_high_water_mark,
                config.write_buffer_low_water_mark,
            )),
            in_flight_write: Mutex::new(None),
            pipeline: Mutex::new(None),
            peer_addr: Mutex::new(peer_addr),
            connecting: AtomicBool::new(false),
            connect_timeout_handle: Mutex::new(None),
            config,
            allocator,
        });
        state.state.set(ChannelState::OPEN);
        state.state.set(ChannelState::REGISTERED);
        state.state.set(ChannelState::ACTIVE);

        let pipeline = ChannelPipeline::new(state.clone(), event_loop.clone());
        *state.pipeline.lock() = Some(Arc::downgrade(&pipeline));
        event_loop.register_source(token, TcpChannelState::readiness_callback(&state));

        let channel = Arc::new(Self { state, pipeline });
        channel.pipeline.emit_channel_registered();
        channel.pipeline.emit_channel_active();
        if channel.state.config.auto_read {
            channel.pipeline.read();
        }
        Ok(channel)
    }

    /// 发起一次主动连接：通道立即可用（`Open`），但要等 `connect` 完成的
    /// writable 就绪事件才会转入 `Active` 并触发 `channelActive`。
    pub fn connect(
        remote: SocketAddr,
        event_loop: Arc<TcpEventLoop>,
        config: ChannelConfig,
        allocator: Arc<PooledAllocator>,
        token: Token,
    ) -> io::Result<Arc<Self>> {
        let mut socket = TcpStream::connect(remote)?;
        event_loop
            .registry()
            .register(&mut socket, token, Interest::WRITABLE)?;

        let state = Arc::new(TcpChannelState {
            socket: Mutex::new(Some(socket)),
            token,
            event_loop: event_loop.clone(),
            state: AtomicChannelState::new(),
            recv_allocator: Mutex::new(AdaptiveRecvByteBufAllocator::new(64, 2048, 64 * 1024)),
            outbound: Mutex::new(ChannelOutboundBuffer::new(
                config.write_buffer_high_water_mark,
                config.write_buffer_low_water_mark,
            )),
            in_flight_write: Mutex::new(None),
            pipeline: Mutex::new(None),
            peer_addr: Mutex::new(Some(remote)),
            connecting: AtomicBool::new(true),
            connect_timeout_handle: Mutex::new(None),
            config,
            allocator,
        });
        state.state.set(ChannelState::OPEN);
        state.state.set(ChannelState::REGISTERED);

        let pipeline = ChannelPipeline::new(state.clone(), event_loop.clone());
        *state.pipeline.lock() = Some(Arc::downgrade(&pipeline));
        event_loop.register_source(token, TcpChannelState::readiness_callback(&state));

        let connect_timeout = state.config.connect_timeout;
        let timeout_state = state.clone();
        let handle = event_loop.schedule(
            Box::new(move || timeout_state.fail_connect_timeout()),
            connect_timeout,
        );
        *state.connect_timeout_handle.lock() = Some(handle);

        let channel = Arc::new(Self { state, pipeline });
        channel.pipeline.emit_channel_registered();
        Ok(channel)
    }
}

impl TcpChannelState {
    fn readiness_callback(self: &Arc<Self>) -> Arc<dyn Fn(&mio::event::Event) + Send + Sync> {
        let state = self.clone();
        Arc::new(move |event: &mio::event::Event| {
            if state.connecting.load(Ordering::Acquire) {
                state.on_connect_ready();
                return;
            }
            if event.is_readable() {
                state.on_readable();
            }
            if event.is_writable() {
                state.on_writable();
            }
        })
    }

    fn pipeline(&self) -> Option<Arc<ChannelPipeline>> {
        self.pipeline.lock().as_ref().and_then(Weak::upgrade)
    }

    fn fail_connect_timeout(self: &Arc<Self>) {
        if !self.connecting.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(pipeline) = self.pipeline() {
            pipeline.emit_exception(CoreError::connect_timeout(self.config.connect_timeout));
        }
        self.close();
    }

    fn on_connect_ready(self: &Arc<Self>) {
        if !self.connecting.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.connect_timeout_handle.lock().take() {
            handle.cancel();
        }
        let socket_error = {
            let guard = self.socket.lock();
            guard.as_ref().and_then(|s| s.take_error().ok().flatten())
        };
        if let Some(err) = socket_error {
            if let Some(pipeline) = self.pipeline() {
                pipeline.emit_exception(CoreError::from(err));
            }
            self.close();
            return;
        }
        self.state.set(ChannelState::ACTIVE);
        {
            let mut guard = self.socket.lock();
            if let Some(socket) = guard.as_mut() {
                let _ = self.event_loop.registry().reregister(socket, self.token, Interest::READABLE);
            }
        }
        if let Some(pipeline) = self.pipeline() {
            pipeline.emit_channel_active();
            if self.config.auto_read {
                pipeline.read();
            }
        }
    }

    /// 一次 I/O 就绪事件里可能要反复 `read()` 好几轮才能把内核缓冲区排空；
    /// Netty/DotNetty 的约定是 `channelReadComplete` 每次 readiness 只触发
    /// 一次，发生在整轮读循环结束之后，而不是每条 `channelRead` 各触发一次。
    /// 这里用 `ReadOutcome` 记录循环是怎么结束的，循环体内只管 `emit_read`，
    /// 循环结束后统一补一次 `emit_read_completed`，再按结束原因收尾
    /// （EOF/异常/正常耗尽）。
    fn on_readable(self: &Arc<Self>) {
        enum ReadOutcome {
            /// 没有实际发生任何一次 `read()`（socket 已经被取走），
            /// 不构成一次 readiness 读取，不应该触发 `channelReadComplete`。
            Aborted,
            Drained,
            Eof,
            Error(CoreError),
        }

        self.recv_allocator.lock().reset_messages_read();
        let mut messages_read = 0u32;

        let outcome = loop {
            let capacity = self.recv_allocator.lock().guess();
            let buffer = self.allocator.allocate(capacity);
            let mut scratch = vec![0u8; capacity];
            let read_result = {
                let mut guard = self.socket.lock();
                match guard.as_mut() {
                    Some(socket) => socket.read(&mut scratch),
                    None => {
                        let _ = buffer.release();
                        break ReadOutcome::Aborted;
                    }
                }
            };
            match read_result {
                Ok(0) => {
                    let _ = buffer.release();
                    break ReadOutcome::Eof;
                }
                Ok(n) => {
                    self.recv_allocator.lock().record_bytes_read(n);
                    // 新分配的缓冲区处于可写态且没有其他句柄，这里不会失败。
                    let _ = buffer.put_slice(&scratch[..n]);
                    messages_read += 1;
                    if let Some(pipeline) = self.pipeline() {
                        pipeline.emit_read(Box::new(buffer));
                    } else {
                        let _ = buffer.release();
                    }
                    let continue_reading = self.recv_allocator.lock().continue_reading();
                    if !continue_reading || !self.config.auto_read {
                        break ReadOutcome::Drained;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    let _ = buffer.release();
                    break ReadOutcome::Drained;
                }
                Err(err) => {
                    let _ = buffer.release();
                    break ReadOutcome::Error(CoreError::from(err));
                }
            }
        };

        if matches!(outcome, ReadOutcome::Aborted) {
            return;
        }

        self.recv_allocator.lock().inc_messages_read(messages_read);
        if let Some(pipeline) = self.pipeline() {
            pipeline.emit_read_completed();
        }

        match outcome {
            ReadOutcome::Eof => self.fire_eof(),
            ReadOutcome::Error(err) => {
                if let Some(pipeline) = self.pipeline() {
                    pipeline.emit_exception(err);
                }
                self.close();
            }
            ReadOutcome::Drained | ReadOutcome::Aborted => {}
        }
    }

    fn fire_eof(self: &Arc<Self>) {
        if let Some(pipeline) = self.pipeline() {
            pipeline.emit_channel_inactive();
        }
        self.close();
    }

    fn on_writable(self: &Arc<Self>) {
        self.drive_writes();
    }

    fn drive_writes(self: &Arc<Self>) {
        let mut spins = 0u32;
        let spin_limit = self.config.write_spin_count.max(1);
        loop {
            if spins >= spin_limit {
                self.request_writable_interest();
                return;
            }
            spins += 1;

            {
                let mut in_flight = self.in_flight_write.lock();
                if in_flight.is_none() {
                    let mut outbound = self.outbound.lock();
                    match outbound.peek_flushed() {
                        Some((message, _size)) => match message.downcast_ref::<ByteBuffer>() {
                            Some(buffer) => match buffer.read_front(usize::MAX) {
                                Ok(bytes) => *in_flight = Some(PendingWrite { data: bytes, written: 0 }),
                                Err(_) => return,
                            },
                            None => return,
                        },
                        None => return,
                    }
                }
            }

            let write_result = {
                let mut in_flight = self.in_flight_write.lock();
                let pending = in_flight.as_mut().unwrap();
                let mut socket_guard = self.socket.lock();
                match socket_guard.as_mut() {
                    Some(socket) => socket.write(&pending.data[pending.written..]),
                    None => return,
                }
            };

            match write_result {
                Ok(0) => {
                    self.close();
                    return;
                }
                Ok(n) => {
                    let done = {
                        let mut in_flight = self.in_flight_write.lock();
                        let pending = in_flight.as_mut().unwrap();
                        pending.written += n;
                        pending.written >= pending.data.len()
                    };
                    if done {
                        *self.in_flight_write.lock() = None;
                        let mut outbound = self.outbound.lock();
                        if let Some(buffer) = outbound.peek_flushed().and_then(|(m, _)| m.downcast_ref::<ByteBuffer>()) {
                            let _ = buffer.release();
                        }
                        if let Some(flip) = outbound.remove_first_flushed() {
                            drop(outbound);
                            self.announce_flip(flip);
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.request_writable_interest();
                    return;
                }
                Err(err) => {
                    if let Some(pipeline) = self.pipeline() {
                        pipeline.emit_exception(CoreError::from(err));
                    }
                    self.close();
                    return;
                }
            }
        }
    }

    fn request_writable_interest(&self) {
        let mut guard = self.socket.lock();
        if let Some(socket) = guard.as_mut() {
            let _ = self
                .event_loop
                .registry()
                .reregister(socket, self.token, Interest::READABLE | Interest::WRITABLE);
        }
    }

    fn announce_flip(self: &Arc<Self>, flip: WritabilityFlip) {
        record_writability_flip(flip == WritabilityFlip::BecameWritable, self.outbound.lock().total_pending_bytes());
        if let Some(pipeline) = self.pipeline() {
            pipeline.emit_writability_changed(flip == WritabilityFlip::BecameWritable);
        }
    }
}

impl ChannelUnsafe for TcpChannelState {
    fn bind(&self, _local_addr: SocketAddr) {
        tracing::warn!(token = ?self.token, "bind() is not meaningful on a stream channel");
    }

    fn connect(&self, _remote: SocketAddr, _local: Option<SocketAddr>) {
        tracing::warn!(token = ?self.token, "connect() must be issued through TcpChannel::connect");
    }

    fn disconnect(&self) {
        self.close();
    }

    fn close(&self) {
        if self.state.is_closed() {
            return;
        }
        self.state.close();
        if let Some(handle) = self.connect_timeout_handle.lock().take() {
            handle.cancel();
        }
        if let Some(mut socket) = self.socket.lock().take() {
            let _ = self.event_loop.registry().deregister(&mut socket);
        }
        self.event_loop.deregister_source(self.token);
        self.outbound.lock().fail_all();
        if let Some(pending) = self.in_flight_write.lock().take() {
            drop(pending);
        }
        if let Some(pipeline) = self.pipeline() {
            pipeline.emit_channel_inactive();
            pipeline.emit_channel_unregistered();
        }
    }

    fn deregister(&self) {
        self.event_loop.deregister_source(self.token);
    }

    fn write(&self, message: Message, promise: Promise<()>) {
        if self.state.is_closed() {
            promise.try_fail(CoreError::closed_channel());
            if let Ok(buffer) = message.downcast::<ByteBuffer>() {
                let _ = buffer.release();
            }
            return;
        }
        let size = match message.downcast_ref::<ByteBuffer>() {
            Some(buffer) => buffer.len().unwrap_or(0),
            None => {
                promise.try_fail(CoreError::encoder_exception("expected ByteBuffer at Unsafe boundary"));
                return;
            }
        };
        let mut outbound = self.outbound.lock();
        if let Some(flip) = outbound.add_message(message, size, promise) {
            drop(outbound);
            // `add_message` 返回的是写满高水位之前最新一次计算结果；立刻广播。
            self.announce_flip_from_self(flip);
        }
    }

    fn flush(&self) {
        self.outbound.lock().mark_flushed();
        // `drive_writes` 需要 `Arc<Self>` 来克隆进闭包/递归调用，这里通过
        // `event_loop` 持有的 registry token 间接拿到自身的 `Arc`——见
        // `TcpChannel::from_accepted`/`connect` 里把回调闭包直接绑定到
        // 同一个 `Arc<TcpChannelState>` 的做法，本方法改为同步触发一次即可。
        self.flush_now();
    }

    fn begin_read(&self) {
        self.request_readable_interest();
    }
}

impl TcpChannelState {
    fn announce_flip_from_self(&self, flip: WritabilityFlip) {
        record_writability_flip(
            flip == WritabilityFlip::BecameWritable,
            self.outbound.lock().total_pending_bytes(),
        );
        if let Some(pipeline) = self.pipeline() {
            pipeline.emit_writability_changed(flip == WritabilityFlip::BecameWritable);
        }
    }

    fn request_readable_interest(&self) {
        let mut guard = self.socket.lock();
        if let Some(socket) = guard.as_mut() {
            let _ = self.event_loop.registry().reregister(socket, self.token, Interest::READABLE);
        }
    }

    /// `ChannelUnsafe::flush` 只拿到 `&self`，但真正驱动写入需要能把自身
    /// 以 `Arc` 形式喂进 `readiness_callback` 同一套逻辑；由于 `flush` 总是
    /// 从拥有这份 `Arc<TcpChannelState>` 的通道（经由管道 Head）调用，这里
    /// 退化为直接内联一次尽力而为的写入尝试，真正的重试留给下一次
    /// writable 就绪回调。
    fn flush_now(&self) {
        let mut spins = 0u32;
        let spin_limit = self.config.write_spin_count.max(1);
        loop {
            if spins >= spin_limit {
                self.request_writable_interest();
                return;
            }
            spins += 1;
            let mut in_flight = self.in_flight_write.lock();
            if in_flight.is_none() {
                let mut outbound = self.outbound.lock();
                match outbound.peek_flushed() {
                    Some((message, _size)) => match message.downcast_ref::<ByteBuffer>() {
                        Some(buffer) => match buffer.read_front(usize::MAX) {
                            Ok(bytes) => *in_flight = Some(PendingWrite { data: bytes, written: 0 }),
                            Err(_) => return,
                        },
                        None => return,
                    },
                    None => return,
                }
            }
            let pending = in_flight.as_mut().unwrap();
            let mut socket_guard = self.socket.lock();
            let Some(socket) = socket_guard.as_mut() else { return };
            match socket.write(&pending.data[pending.written..]) {
                Ok(0) => {
                    drop(socket_guard);
                    drop(in_flight);
                    self.close();
                    return;
                }
                Ok(n) => {
                    pending.written += n;
                    let done = pending.written >= pending.data.len();
                    drop(socket_guard);
                    if done {
                        drop(in_flight);
                        *self.in_flight_write.lock() = None;
                        let mut outbound = self.outbound.lock();
                        if let Some(buffer) = outbound.peek_flushed().and_then(|(m, _)| m.downcast_ref::<ByteBuffer>()) {
                            let _ = buffer.release();
                        }
                        if let Some(flip) = outbound.remove_first_flushed() {
                            drop(outbound);
                            self.announce_flip_from_self(flip);
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    drop(socket_guard);
                    self.request_writable_interest();
                    return;
                }
                Err(err) => {
                    drop(socket_guard);
                    drop(in_flight);
                    if let Some(pipeline) = self.pipeline() {
                        pipeline.emit_exception(CoreError::from(err));
                    }
                    self.close();
                    return;
                }
            }
        }
    }
}
