//! Handler：管道中可插拔的双向流变换单元。
//!
//! # 设计背景（Why）
//! 一个 handler 通常只关心入站或出站事件里的一小部分回调（比如一个编码器
//! 只关心 `write`），强迫它实现全部回调只会堆满样板代码。Netty 系的做法是
//! 提供一个"适配器"基类，子类按需覆写；Rust 没有实现继承，对应的惯用法是
//! 给 trait 方法一律提供转发到下一个 handler 的默认实现，具体 handler 只
//! 覆写自己关心的那几个。
//!
//! # 契约说明（What）
//! - 未覆写的入站回调一律 `ctx.fire_xxx(...)` 转发给下一个入站 handler。
//! - 未覆写的出站回调一律转发给下一个出站 handler（朝 Head 方向）。
//! - `exception_caught` 默认转发；只有 Tail 哨兵真正记录并丢弃。
use std::any::Any;
use std::fmt;

use crate::error::CoreError;
use crate::pipeline::context::HandlerContext;

/// 在管道中流转的消息。读写路径上通常是 [`crate::buffer::ByteBuffer`]，
/// 经过解码器之后可能变成任意类型化消息，因此用类型擦除表达。
pub type Message = Box<dyn Any + Send>;

/// 管道中一个双向流变换单元。实现者按需覆写自己关心的回调，其余保持默认
/// 转发行为，从而只需要表达"这个 handler 关心什么"而不是"全部流程"。
pub trait Handler: Send + Sync {
    /// 供诊断/日志使用的简短描述，默认取类型名。
    fn descriptor(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    // ---- 入站回调：沿 Head → Tail 方向传播 ----

    fn channel_registered(&self, ctx: &mut HandlerContext) {
        ctx.fire_channel_registered();
    }

    fn channel_unregistered(&self, ctx: &mut HandlerContext) {
        ctx.fire_channel_unregistered();
    }

    fn channel_active(&self, ctx: &mut HandlerContext) {
        ctx.fire_channel_active();
    }

    fn channel_inactive(&self, ctx: &mut HandlerContext) {
        ctx.fire_channel_inactive();
    }

    fn channel_read(&self, ctx: &mut HandlerContext, message: Message) {
        ctx.fire_channel_read(message);
    }

    fn channel_read_complete(&self, ctx: &mut HandlerContext) {
        ctx.fire_channel_read_complete();
    }

    fn user_event_triggered(&self, ctx: &mut HandlerContext, event: Message) {
        ctx.fire_user_event_triggered(event);
    }

    fn channel_writability_changed(&self, ctx: &mut HandlerContext, writable: bool) {
        ctx.fire_channel_writability_changed(writable);
    }

    fn exception_caught(&self, ctx: &mut HandlerContext, error: CoreError) {
        ctx.fire_exception_caught(error);
    }

    // ---- 出站回调：沿 Tail → Head 方向传播 ----

    fn bind(&self, ctx: &mut HandlerContext, local_addr: std::net::SocketAddr) {
        ctx.bind(local_addr);
    }

    fn connect(
        &self,
        ctx: &mut HandlerContext,
        remote: std::net::SocketAddr,
        local: Option<std::net::SocketAddr>,
    ) {
        ctx.connect(remote, local);
    }

    fn disconnect(&self, ctx: &mut HandlerContext) {
        ctx.disconnect();
    }

    fn close(&self, ctx: &mut HandlerContext) {
        ctx.close();
    }

    fn deregister(&self, ctx: &mut HandlerContext) {
        ctx.deregister();
    }

    fn read(&self, ctx: &mut HandlerContext) {
        ctx.read();
    }

    fn write(&self, ctx: &mut HandlerContext, message: Message, promise: crate::future::Promise<()>) {
        ctx.write(message, promise);
    }

    fn flush(&self, ctx: &mut HandlerContext) {
        ctx.flush();
    }

    /// handler 被加入管道、`handlerAdded` 生命周期回调恰好触发一次。
    fn handler_added(&self, _ctx: &mut HandlerContext) {}

    /// handler 从管道移除、`handlerRemoved` 生命周期回调恰好触发一次。
    fn handler_removed(&self, _ctx: &mut HandlerContext) {}
}

impl fmt::Debug for dyn Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("descriptor", &self.descriptor())
            .finish()
    }
}
