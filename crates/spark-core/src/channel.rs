//! Channel：一个开放端点的状态机、配置与底层 I/O 契约。
//!
//! # 设计背景（Why）
//! 通道的状态必须能被安全地从任意线程查询（比如监控代码读取
//! `is_active()`），但状态的*转换*只能发生在通道所属的那一个事件循环线程
//! 上——否则"同一通道的所有回调都在同一线程"这条全局不变式就保不住。
//! 因此状态用原子位图表示，只读查询随时可做，转换操作留给 `ChannelUnsafe`
//! 的实现者在循环线程内部调用。
//!
//! # 逻辑解析（How）
//! `ChannelState` 是一组互斥又递进的位：`Open → Registered → Active`，
//! `Closed` 是终态且与其余位互斥。`ChannelUnsafe` 是管道 Head 哨兵用来驱动
//! 底层传输的私有接口，具体实现（TCP/UDP/内嵌测试通道）位于传输层 crate，
//! `spark-core` 只定义契约。`ChannelOutboundBuffer` 把待写消息分成"未刷新"
//! 和"已刷新"两段 FIFO，累计字节数越过高水位关闭可写性，回落到低水位再
//! 打开，这是背压得以在管道里表现为一个可观察事件
//! （`channelWritabilityChanged`）的核心数据结构。
//!
//! # 契约说明（What）
//! - 一旦 Registered，通道绑定的事件循环永不改变。
//! - `Active` 蕴含 `Registered` 蕴含 `Open`；`Closed` 是终态，不会再转换到
//!   任何其他状态。
//! - 通道带着未刷新/已刷新写入关闭时，每个条目的 promise 按入队顺序以
//!   `ClosedChannel` 失败，持有的缓冲区被释放。
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::buffer::ByteBuffer;
use crate::error::CoreError;
use crate::future::Promise;
use crate::pipeline::handler::Message;

/// 通道状态位图。见模块文档的状态机说明。本 crate 只需要"带了某个标志位"
/// 这一种查询，不需要为此拉一整个 `bitflags` 依赖，手写一个最小子集即可。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ChannelState(u8);

impl ChannelState {
    pub const OPEN: ChannelState = ChannelState(0b0001);
    pub const REGISTERED: ChannelState = ChannelState(0b0010);
    pub const ACTIVE: ChannelState = ChannelState(0b0100);
    pub const CLOSED: ChannelState = ChannelState(0b1000);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: ChannelState) -> bool {
        (self.0 & other.0) == other.0
    }
}

/// 原子化的通道状态位图句柄，支持从任意线程安全查询。
#[derive(Debug, Default)]
pub struct AtomicChannelState {
    bits: AtomicU8,
}

impl AtomicChannelState {
    pub fn new() -> Self {
        Self {
            bits: AtomicU8::new(0),
        }
    }

    pub fn load(&self) -> ChannelState {
        ChannelState(self.bits.load(Ordering::Acquire))
    }

    pub fn set(&self, flag: ChannelState) {
        self.bits.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    /// 不可逆地转换到 Closed，清除其余所有位之外叠加 CLOSED。
    pub fn close(&self) {
        self.bits.store(ChannelState::CLOSED.bits(), Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.load().contains(ChannelState::OPEN) && !self.load().contains(ChannelState::CLOSED)
    }

    pub fn is_registered(&self) -> bool {
        self.load().contains(ChannelState::REGISTERED)
    }

    pub fn is_active(&self) -> bool {
        self.load().contains(ChannelState::ACTIVE)
    }

    pub fn is_closed(&self) -> bool {
        self.load().contains(ChannelState::CLOSED)
    }
}

/// 通道可识别的配置项，覆盖 TCP 及通用 socket 选项。
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub so_rcv_buf: Option<usize>,
    pub so_snd_buf: Option<usize>,
    pub so_keep_alive: bool,
    pub tcp_no_delay: bool,
    pub so_reuse_addr: bool,
    pub so_reuse_port: bool,
    pub so_backlog: u32,
    pub connect_timeout: std::time::Duration,
    pub write_spin_count: u32,
    pub auto_read: bool,
    pub write_buffer_high_water_mark: usize,
    pub write_buffer_low_water_mark: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            so_rcv_buf: None,
            so_snd_buf: None,
            so_keep_alive: false,
            tcp_no_delay: true,
            so_reuse_addr: true,
            so_reuse_port: false,
            so_backlog: 1024,
            connect_timeout: std::time::Duration::from_secs(10),
            write_spin_count: 16,
            auto_read: true,
            write_buffer_high_water_mark: 64 * 1024,
            write_buffer_low_water_mark: 32 * 1024,
        }
    }
}

/// 传输私有接口，由管道 Head 哨兵驱动。所有方法都要求在通道所属的
/// 事件循环线程上调用；跨线程调用方应当把操作封装为一个任务再 `execute()`。
pub trait ChannelUnsafe: Send + Sync {
    fn bind(&self, local_addr: SocketAddr);
    fn connect(&self, remote: SocketAddr, local: Option<SocketAddr>);
    fn disconnect(&self);
    fn close(&self);
    fn deregister(&self);
    fn write(&self, message: Message, promise: Promise<()>);
    fn flush(&self);
    fn begin_read(&self);
}

/// 待写队列中的一个条目。
struct OutboundEntry {
    message: Option<Message>,
    size: usize,
    promise: Promise<()>,
}

/// 出站缓冲：未刷新/已刷新两段 FIFO，累计字节数驱动可写性翻转。
pub struct ChannelOutboundBuffer {
    unflushed: VecDeque<OutboundEntry>,
    flushed: VecDeque<OutboundEntry>,
    total_pending_bytes: AtomicUsize,
    writable: std::sync::atomic::AtomicBool,
    high_water_mark: usize,
    low_water_mark: usize,
}

/// 一次可写性翻转的结果，`None` 表示没有越过任何阈值。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritabilityFlip {
    BecameUnwritable,
    BecameWritable,
}

impl ChannelOutboundBuffer {
    pub fn new(high_water_mark: usize, low_water_mark: usize) -> Self {
        Self {
            unflushed: VecDeque::new(),
            flushed: VecDeque::new(),
            total_pending_bytes: AtomicUsize::new(0),
            writable: std::sync::atomic::AtomicBool::new(true),
            high_water_mark,
            low_water_mark,
        }
    }

    /// 追加一条待写消息，返回本次写入是否让缓冲区越过高水位而变得不可写。
    pub fn add_message(&mut self, message: Message, size: usize, promise: Promise<()>) -> Option<WritabilityFlip> {
        self.unflushed.push_back(OutboundEntry {
            message: Some(message),
            size,
            promise,
        });
        let pending = self.total_pending_bytes.fetch_add(size, Ordering::AcqRel) + size;
        self.evaluate_flip(pending)
    }

    /// 把未刷新区间整体移入已刷新区间，准备真正写向底层传输。
    pub fn mark_flushed(&mut self) {
        self.flushed.extend(self.unflushed.drain(..));
    }

    /// 已刷新区间中最靠前的条目，供传输层消费。
    pub fn peek_flushed(&self) -> Option<(&Message, usize)> {
        self.flushed
            .front()
            .map(|entry| (entry.message.as_ref().unwrap(), entry.size))
    }

    /// 标记已刷新队首条目写入完成：完成其 promise 并释放占用的字节数，
    /// 返回本次移除是否让缓冲区回落到低水位以下而恢复可写。
    pub fn remove_first_flushed(&mut self) -> Option<WritabilityFlip> {
        let entry = self.flushed.pop_front()?;
        entry.promise.try_complete(());
        let pending = self
            .total_pending_bytes
            .fetch_sub(entry.size, Ordering::AcqRel)
            - entry.size;
        self.evaluate_flip(pending)
    }

    fn evaluate_flip(&self, pending: usize) -> Option<WritabilityFlip> {
        let was_writable = self.writable.load(Ordering::Acquire);
        if was_writable && pending > self.high_water_mark {
            self.writable.store(false, Ordering::Release);
            Some(WritabilityFlip::BecameUnwritable)
        } else if !was_writable && pending <= self.low_water_mark {
            self.writable.store(true, Ordering::Release);
            Some(WritabilityFlip::BecameWritable)
        } else {
            None
        }
    }

    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    pub fn total_pending_bytes(&self) -> usize {
        self.total_pending_bytes.load(Ordering::Acquire)
    }

    /// 通道关闭时调用：按入队顺序让所有待写 promise 以 `ClosedChannel` 失败，
    /// 并释放还持有着引用计数缓冲区的条目，避免关闭时悄悄泄漏。
    pub fn fail_all(&mut self) {
        for mut entry in self.flushed.drain(..).chain(self.unflushed.drain(..)) {
            entry.promise.try_fail(CoreError::closed_channel());
            if let Some(message) = entry.message.take() {
                if let Ok(buffer) = message.downcast::<ByteBuffer>() {
                    let _ = buffer.release();
                }
            }
        }
        self.total_pending_bytes.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writability_flips_at_configured_thresholds() {
        let mut buf = ChannelOutboundBuffer::new(64, 32);
        let mut flips = Vec::new();
        for _ in 0..10 {
            if let Some(flip) = buf.add_message(Box::new(()), 8, Promise::new()) {
                flips.push(flip);
            }
        }
        assert_eq!(flips, vec![WritabilityFlip::BecameUnwritable]);
        assert!(!buf.is_writable());

        buf.mark_flushed();
        let mut release_flips = Vec::new();
        for _ in 0..6 {
            if let Some(flip) = buf.remove_first_flushed() {
                release_flips.push(flip);
            }
        }
        assert_eq!(release_flips, vec![WritabilityFlip::BecameWritable]);
        assert!(buf.is_writable());
    }

    #[test]
    fn close_fails_all_pending_promises_in_order() {
        let mut buf = ChannelOutboundBuffer::new(1000, 500);
        let p1 = Promise::<()>::new();
        let p2 = Promise::<()>::new();
        buf.add_message(Box::new(()), 10, p1.clone());
        buf.add_message(Box::new(()), 10, p2.clone());
        buf.fail_all();
        assert!(p1.is_done());
        assert!(p2.is_done());
    }

    #[test]
    fn channel_state_progresses_monotonically() {
        let state = AtomicChannelState::new();
        assert!(!state.is_open());
        state.set(ChannelState::OPEN);
        assert!(state.is_open());
        state.set(ChannelState::REGISTERED);
        assert!(state.is_registered());
        state.set(ChannelState::ACTIVE);
        assert!(state.is_active());
        state.close();
        assert!(state.is_closed());
        assert!(!state.is_open());
    }
}
