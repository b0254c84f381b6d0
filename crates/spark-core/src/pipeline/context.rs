//! HandlerContext：handler 在管道链条中用来转发事件的句柄。
//!
//! # 逻辑解析（How）
//! 每次事件分发都会拍摄管道当前链条的一份不可变快照（`Arc<[HandlerSlot]>`），
//! 连同触发事件的 handler 在快照里的下标一起构造出一个 `HandlerContext`。
//! `fire_xxx`/出站方法据此从当前下标往前/往后找到下一个对相应方向感兴趣的
//! handler 并调用它——用下标而不是裸指针遍历，天然避免了悬挂引用，也让
//! "遍历过程中管道被并发修改"这种情况只影响下一次分发用的快照，不影响
//! 本次已经开始的遍历（写时复制语义）。
//!
//! # 契约说明（What）
//! - 入站方向：下标递增，从 Head（0）走向 Tail（len-1）。
//! - 出站方向：下标递减，从 Tail 走向 Head（0）。
//! - `HandlerContext` 本身不拥有管道，只持有一次分发期间需要的只读快照和
//!   一个指向底层 I/O 操作的非拥有句柄，调用栈结束后即可丢弃。
use std::net::SocketAddr;
use std::sync::Arc;

use crate::channel::ChannelUnsafe;
use crate::error::CoreError;
use crate::future::Promise;
use crate::pipeline::handler::{Handler, Message};

pub(crate) struct HandlerSlot {
    pub name: String,
    pub handler: Arc<dyn Handler>,
}

/// 随事件分发临时构造的句柄，供 handler 调用以继续传播事件或触达底层 I/O。
pub struct HandlerContext {
    snapshot: Arc<Vec<HandlerSlot>>,
    index: usize,
    sink: Arc<dyn ChannelUnsafe>,
}

impl HandlerContext {
    pub(crate) fn new(snapshot: Arc<Vec<HandlerSlot>>, index: usize, sink: Arc<dyn ChannelUnsafe>) -> Self {
        Self {
            snapshot,
            index,
            sink,
        }
    }

    pub fn handler_name(&self) -> &str {
        &self.snapshot[self.index].name
    }

    fn next_inbound(&self) -> Option<HandlerContext> {
        if self.index + 1 < self.snapshot.len() {
            Some(HandlerContext {
                snapshot: self.snapshot.clone(),
                index: self.index + 1,
                sink: self.sink.clone(),
            })
        } else {
            None
        }
    }

    fn next_outbound(&self) -> Option<HandlerContext> {
        if self.index > 0 {
            Some(HandlerContext {
                snapshot: self.snapshot.clone(),
                index: self.index - 1,
                sink: self.sink.clone(),
            })
        } else {
            None
        }
    }

    // ---- 入站转发：下标递增，Head -> Tail ----

    pub fn fire_channel_registered(&mut self) {
        if let Some(mut next) = self.next_inbound() {
            let handler = next.snapshot[next.index].handler.clone();
            handler.channel_registered(&mut next);
        }
    }

    pub fn fire_channel_unregistered(&mut self) {
        if let Some(mut next) = self.next_inbound() {
            let handler = next.snapshot[next.index].handler.clone();
            handler.channel_unregistered(&mut next);
        }
    }

    pub fn fire_channel_active(&mut self) {
        if let Some(mut next) = self.next_inbound() {
            let handler = next.snapshot[next.index].handler.clone();
            handler.channel_active(&mut next);
        }
    }

    pub fn fire_channel_inactive(&mut self) {
        if let Some(mut next) = self.next_inbound() {
            let handler = next.snapshot[next.index].handler.clone();
            handler.channel_inactive(&mut next);
        }
    }

    pub fn fire_channel_read(&mut self, message: Message) {
        if let Some(mut next) = self.next_inbound() {
            let handler = next.snapshot[next.index].handler.clone();
            handler.channel_read(&mut next, message);
        }
        // 到达 Tail 且无人消费的消息由 Tail 哨兵的 handler_read 实现负责释放，
        // 这里只负责转发，不做特判。
    }

    pub fn fire_channel_read_complete(&mut self) {
        if let Some(mut next) = self.next_inbound() {
            let handler = next.snapshot[next.index].handler.clone();
            handler.channel_read_complete(&mut next);
        }
    }

    pub fn fire_user_event_triggered(&mut self, event: Message) {
        if let Some(mut next) = self.next_inbound() {
            let handler = next.snapshot[next.index].handler.clone();
            handler.user_event_triggered(&mut next, event);
        }
    }

    pub fn fire_channel_writability_changed(&mut self, writable: bool) {
        if let Some(mut next) = self.next_inbound() {
            let handler = next.snapshot[next.index].handler.clone();
            handler.channel_writability_changed(&mut next, writable);
        }
    }

    pub fn fire_exception_caught(&mut self, error: CoreError) {
        if let Some(mut next) = self.next_inbound() {
            let handler = next.snapshot[next.index].handler.clone();
            handler.exception_caught(&mut next, error);
        } else {
            tracing::warn!(code = error.code(), "exception reached tail unhandled");
        }
    }

    // ---- 出站转发：下标递减，Tail -> Head ----

    pub fn bind(&mut self, local_addr: SocketAddr) {
        match self.next_outbound() {
            Some(mut next) => {
                let handler = next.snapshot[next.index].handler.clone();
                handler.bind(&mut next, local_addr);
            }
            None => self.sink.bind(local_addr),
        }
    }

    pub fn connect(&mut self, remote: SocketAddr, local: Option<SocketAddr>) {
        match self.next_outbound() {
            Some(mut next) => {
                let handler = next.snapshot[next.index].handler.clone();
                handler.connect(&mut next, remote, local);
            }
            None => self.sink.connect(remote, local),
        }
    }

    pub fn disconnect(&mut self) {
        match self.next_outbound() {
            Some(mut next) => {
                let handler = next.snapshot[next.index].handler.clone();
                handler.disconnect(&mut next);
            }
            None => self.sink.disconnect(),
        }
    }

    pub fn close(&mut self) {
        match self.next_outbound() {
            Some(mut next) => {
                let handler = next.snapshot[next.index].handler.clone();
                handler.close(&mut next);
            }
            None => self.sink.close(),
        }
    }

    pub fn deregister(&mut self) {
        match self.next_outbound() {
            Some(mut next) => {
                let handler = next.snapshot[next.index].handler.clone();
                handler.deregister(&mut next);
            }
            None => self.sink.deregister(),
        }
    }

    pub fn read(&mut self) {
        match self.next_outbound() {
            Some(mut next) => {
                let handler = next.snapshot[next.index].handler.clone();
                handler.read(&mut next);
            }
            None => self.sink.begin_read(),
        }
    }

    pub fn write(&mut self, message: Message, promise: Promise<()>) {
        match self.next_outbound() {
            Some(mut next) => {
                let handler = next.snapshot[next.index].handler.clone();
                handler.write(&mut next, message, promise);
            }
            None => self.sink.write(message, promise),
        }
    }

    pub fn flush(&mut self) {
        match self.next_outbound() {
            Some(mut next) => {
                let handler = next.snapshot[next.index].handler.clone();
                handler.flush(&mut next);
            }
            None => self.sink.flush(),
        }
    }
}
