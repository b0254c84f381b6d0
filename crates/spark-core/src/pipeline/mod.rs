//! ChannelPipeline：Head/Tail 哨兵之间的有序双向 handler 链。
//!
//! # 设计背景（Why）
//! 管道是整个运行时组合能力的落点：一个协议的全部行为（长度分帧、心跳、
//! 日志、业务逻辑）都表达成一条 handler 链。链条在运行期间会被频繁读取
//! （每个入站字节、每次出站写入都要遍历），但修改（加一个 handler、摘掉
//! 一个 handler）相对罕见。这是一个典型的"读多写少、读路径绝不能阻塞"场
//! 景，于是选择写时复制的不可变快照而不是一把粗粒度的读写锁。
//!
//! # 逻辑解析（How）
//! `ChannelPipeline` 用 `ArcSwap<Vec<HandlerSlot>>` 保存当前链条快照；读路径
//! （`emit_*`）只需要 `load()` 一次快照就能安全遍历，即使遍历过程中另一个
//! 线程把新快照换了上去也不影响本次遍历。写路径（`add_*`/`remove`/`replace`）
//! 用一把 `Mutex<()>` 串行化，在临界区里读旧快照、构造新 `Vec`、`store` 回
//! `ArcSwap`，并递增一个单调 `epoch` 计数器供可观测性使用。按照 §4.7 的
//! 要求，若调用不在所属循环线程上，写路径会把自己重新包装成一个任务
//! `execute()` 给那个循环，保证"管道变更相对在途事件是原子的"。
//!
//! # 契约说明（What）
//! - handler 名字在管道内唯一，重名插入返回 `PipelineMisuse(DuplicateName)`。
//! - `handler_added`/`handler_removed` 生命周期回调对每个 handler 恰好触发
//!   一次。
//! - Head 哨兵把出站操作接到 `ChannelUnsafe`；Tail 哨兵是入站的终点，任何
//!   到达它的 `channelRead` 消息都会被释放（若是引用计数缓冲区）以避免
//!   静默泄漏，未被处理的异常在这里记录并丢弃。
pub mod context;
pub mod handler;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::buffer::ByteBuffer;
use crate::channel::ChannelUnsafe;
use crate::error::{CoreError, PipelineMisuseKind};
use crate::executor::EventExecutor;
use crate::future::Promise;

use context::{HandlerContext, HandlerSlot};
use handler::{Handler, Message};

const HEAD_NAME: &str = "__head__";
const TAIL_NAME: &str = "__tail__";

struct HeadSentinel;
impl Handler for HeadSentinel {
    fn descriptor(&self) -> &'static str {
        "HeadSentinel"
    }
}

struct TailSentinel;
impl Handler for TailSentinel {
    fn descriptor(&self) -> &'static str {
        "TailSentinel"
    }

    fn channel_read(&self, _ctx: &mut HandlerContext, message: Message) {
        if let Ok(buffer) = message.downcast::<ByteBuffer>() {
            if let Err(err) = buffer.release() {
                tracing::warn!(code = err.code(), "tail release of undelivered read failed");
            }
        }
    }

    fn exception_caught(&self, _ctx: &mut HandlerContext, error: CoreError) {
        tracing::error!(code = error.code(), "unhandled exception reached pipeline tail");
    }
}

/// 相对锚点，插入新 handler 时指定方位。
pub enum Anchor<'a> {
    First,
    Last,
    Before(&'a str),
    After(&'a str),
}

/// Head/Tail 哨兵之间的有序双向 handler 链。
pub struct ChannelPipeline {
    snapshot: ArcSwap<Vec<HandlerSlot>>,
    mutate_lock: Mutex<()>,
    epoch: AtomicU64,
    sink: Arc<dyn ChannelUnsafe>,
    executor: Arc<dyn EventExecutor>,
}

impl ChannelPipeline {
    pub fn new(sink: Arc<dyn ChannelUnsafe>, executor: Arc<dyn EventExecutor>) -> Arc<Self> {
        let initial = vec![
            HandlerSlot {
                name: HEAD_NAME.to_string(),
                handler: Arc::new(HeadSentinel),
            },
            HandlerSlot {
                name: TAIL_NAME.to_string(),
                handler: Arc::new(TailSentinel),
            },
        ];
        Arc::new(Self {
            snapshot: ArcSwap::from_pointee(initial),
            mutate_lock: Mutex::new(()),
            epoch: AtomicU64::new(0),
            sink,
            executor,
        })
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn snapshot_arc(&self) -> Arc<Vec<HandlerSlot>> {
        self.snapshot.load_full()
    }

    fn context_at(self: &Arc<Self>, index: usize) -> HandlerContext {
        HandlerContext::new(self.snapshot_arc(), index, self.sink.clone())
    }

    /// 在指定锚点插入一个具名 handler；若不在循环线程上，重新派发到循环。
    pub fn add_handler(
        self: &Arc<Self>,
        name: impl Into<String>,
        handler: Arc<dyn Handler>,
        anchor: Anchor<'static>,
    ) -> Result<(), CoreError> {
        let name = name.into();
        if self.executor.in_event_loop() {
            self.add_handler_now(name, handler, anchor)
        } else {
            let pipeline = self.clone();
            let (anchor_owned, target): (AnchorOwned, _) = anchor.into();
            self.executor.execute(Box::new(move || {
                let _ = pipeline.add_handler_now(name, handler, anchor_owned.as_anchor(&target));
            }));
            Ok(())
        }
    }

    fn add_handler_now(
        self: &Arc<Self>,
        name: String,
        handler: Arc<dyn Handler>,
        anchor: Anchor<'_>,
    ) -> Result<(), CoreError> {
        let _guard = self.mutate_lock.lock();
        let current = self.snapshot_arc();
        if current.iter().any(|slot| slot.name == name) {
            return Err(CoreError::pipeline_misuse(PipelineMisuseKind::DuplicateName));
        }
        let insert_at = match anchor {
            Anchor::First => 1,
            Anchor::Last => current.len() - 1,
            Anchor::Before(target) => current
                .iter()
                .position(|slot| slot.name == target)
                .ok_or_else(|| CoreError::pipeline_misuse(PipelineMisuseKind::UnknownHandle))?,
            Anchor::After(target) => {
                current
                    .iter()
                    .position(|slot| slot.name == target)
                    .ok_or_else(|| CoreError::pipeline_misuse(PipelineMisuseKind::UnknownHandle))?
                    + 1
            }
        };
        let mut next: Vec<HandlerSlot> = (*current).iter().map(HandlerSlot::clone_ref).collect();
        next.insert(
            insert_at,
            HandlerSlot {
                name,
                handler: handler.clone(),
            },
        );
        self.commit(next);
        let mut ctx = self.context_at(insert_at);
        handler.handler_added(&mut ctx);
        Ok(())
    }

    /// 按名字移除一个 handler；若不存在返回 `PipelineMisuse(UnknownHandle)`。
    pub fn remove_handler(self: &Arc<Self>, name: &str) -> Result<(), CoreError> {
        if !self.executor.in_event_loop() {
            let pipeline = self.clone();
            let name = name.to_string();
            self.executor
                .execute(Box::new(move || {
                    let _ = pipeline.remove_handler_now(&name);
                }));
            return Ok(());
        }
        self.remove_handler_now(name)
    }

    fn remove_handler_now(self: &Arc<Self>, name: &str) -> Result<(), CoreError> {
        let _guard = self.mutate_lock.lock();
        let current = self.snapshot_arc();
        let position = current
            .iter()
            .position(|slot| slot.name == name)
            .ok_or_else(|| CoreError::pipeline_misuse(PipelineMisuseKind::UnknownHandle))?;
        let removed_handler = current[position].handler.clone();
        let mut next: Vec<HandlerSlot> = (*current).iter().map(HandlerSlot::clone_ref).collect();
        next.remove(position);
        self.commit(next);
        let mut ctx = self.context_at(position.min(self.snapshot_arc().len().saturating_sub(1)));
        removed_handler.handler_removed(&mut ctx);
        Ok(())
    }

    /// 用新 handler 原地替换已有的同名条目，保持其在链中的位置不变。
    pub fn replace_handler(
        self: &Arc<Self>,
        name: &str,
        new_handler: Arc<dyn Handler>,
    ) -> Result<(), CoreError> {
        let _guard = self.mutate_lock.lock();
        let current = self.snapshot_arc();
        let position = current
            .iter()
            .position(|slot| slot.name == name)
            .ok_or_else(|| CoreError::pipeline_misuse(PipelineMisuseKind::UnknownHandle))?;
        let old_handler = current[position].handler.clone();
        let mut next: Vec<HandlerSlot> = (*current).iter().map(HandlerSlot::clone_ref).collect();
        next[position] = HandlerSlot {
            name: name.to_string(),
            handler: new_handler.clone(),
        };
        self.commit(next);
        let mut ctx = self.context_at(position);
        old_handler.handler_removed(&mut ctx);
        new_handler.handler_added(&mut ctx);
        Ok(())
    }

    fn commit(&self, next: Vec<HandlerSlot>) {
        self.snapshot.store(Arc::new(next));
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    // ---- 入站事件入口：总是从 Head（下标 0）开始 ----

    pub fn emit_channel_registered(self: &Arc<Self>) {
        let mut ctx = self.context_at(0);
        ctx.fire_channel_registered();
    }

    pub fn emit_channel_unregistered(self: &Arc<Self>) {
        let mut ctx = self.context_at(0);
        ctx.fire_channel_unregistered();
    }

    pub fn emit_channel_active(self: &Arc<Self>) {
        let mut ctx = self.context_at(0);
        ctx.fire_channel_active();
    }

    pub fn emit_channel_inactive(self: &Arc<Self>) {
        let mut ctx = self.context_at(0);
        ctx.fire_channel_inactive();
    }

    pub fn emit_read(self: &Arc<Self>, message: Message) {
        let mut ctx = self.context_at(0);
        ctx.fire_channel_read(message);
    }

    pub fn emit_read_completed(self: &Arc<Self>) {
        let mut ctx = self.context_at(0);
        ctx.fire_channel_read_complete();
    }

    pub fn emit_user_event(self: &Arc<Self>, event: Message) {
        let mut ctx = self.context_at(0);
        ctx.fire_user_event_triggered(event);
    }

    pub fn emit_writability_changed(self: &Arc<Self>, writable: bool) {
        let mut ctx = self.context_at(0);
        ctx.fire_channel_writability_changed(writable);
    }

    pub fn emit_exception(self: &Arc<Self>, error: CoreError) {
        let mut ctx = self.context_at(0);
        ctx.fire_exception_caught(error);
    }

    // ---- 出站事件入口：总是从 Tail（末尾下标）开始 ----

    fn tail_index(&self) -> usize {
        self.snapshot_arc().len() - 1
    }

    pub fn write(self: &Arc<Self>, message: Message, promise: Promise<()>) {
        let tail = self.tail_index();
        let mut ctx = self.context_at(tail);
        ctx.write(message, promise);
    }

    pub fn flush(self: &Arc<Self>) {
        let tail = self.tail_index();
        let mut ctx = self.context_at(tail);
        ctx.flush();
    }

    pub fn close(self: &Arc<Self>) {
        let tail = self.tail_index();
        let mut ctx = self.context_at(tail);
        ctx.close();
    }

    pub fn bind(self: &Arc<Self>, local_addr: std::net::SocketAddr) {
        let tail = self.tail_index();
        let mut ctx = self.context_at(tail);
        ctx.bind(local_addr);
    }

    pub fn connect(self: &Arc<Self>, remote: std::net::SocketAddr, local: Option<std::net::SocketAddr>) {
        let tail = self.tail_index();
        let mut ctx = self.context_at(tail);
        ctx.connect(remote, local);
    }

    pub fn read(self: &Arc<Self>) {
        let tail = self.tail_index();
        let mut ctx = self.context_at(tail);
        ctx.read();
    }
}

impl HandlerSlot {
    fn clone_ref(&self) -> HandlerSlot {
        HandlerSlot {
            name: self.name.clone(),
            handler: self.handler.clone(),
        }
    }
}

/// `Anchor<'static>` 在跨线程重分派时需要被拥有所有权地搬运一份；这个小
/// helper 把借用版本转换成拥有版本，在目标循环线程上再借回来使用。
enum AnchorOwned {
    First,
    Last,
    Before,
    After,
}

impl<'a> From<Anchor<'a>> for (AnchorOwned, String) {
    fn from(anchor: Anchor<'a>) -> Self {
        match anchor {
            Anchor::First => (AnchorOwned::First, String::new()),
            Anchor::Last => (AnchorOwned::Last, String::new()),
            Anchor::Before(name) => (AnchorOwned::Before, name.to_string()),
            Anchor::After(name) => (AnchorOwned::After, name.to_string()),
        }
    }
}

impl AnchorOwned {
    fn as_anchor<'a>(&self, target: &'a str) -> Anchor<'a> {
        match self {
            AnchorOwned::First => Anchor::First,
            AnchorOwned::Last => Anchor::Last,
            AnchorOwned::Before => Anchor::Before(target),
            AnchorOwned::After => Anchor::After(target),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct InlineExecutor;
    impl EventExecutor for InlineExecutor {
        fn execute(&self, task: crate::task::Runnable) {
            task();
        }
        fn schedule(&self, _task: crate::task::Runnable, _delay: Duration) -> crate::scheduled::ScheduledHandle {
            unimplemented!("not exercised in pipeline tests")
        }
        fn in_event_loop(&self) -> bool {
            true
        }
        fn shutdown_gracefully(&self, _q: Duration, _t: Duration) -> crate::future::Future<()> {
            let p = Promise::new();
            p.try_complete(());
            p.as_future()
        }
        fn termination_future(&self) -> crate::future::Future<()> {
            let p = Promise::new();
            p.try_complete(());
            p.as_future()
        }
    }

    struct NoopSink;
    impl ChannelUnsafe for NoopSink {
        fn bind(&self, _local_addr: std::net::SocketAddr) {}
        fn connect(&self, _remote: std::net::SocketAddr, _local: Option<std::net::SocketAddr>) {}
        fn disconnect(&self) {}
        fn close(&self) {}
        fn deregister(&self) {}
        fn write(&self, _message: Message, _promise: Promise<()>) {}
        fn flush(&self) {}
        fn begin_read(&self) {}
    }

    struct AppendInbound(&'static str, Arc<Mutex<String>>);
    impl Handler for AppendInbound {
        fn channel_read(&self, ctx: &mut HandlerContext, message: Message) {
            let s = *message.downcast::<String>().unwrap();
            let appended = format!("{s}{}", self.0);
            *self.1.lock() = appended.clone();
            ctx.fire_channel_read(Box::new(appended));
        }
    }

    struct PrependOutbound(&'static str);
    impl Handler for PrependOutbound {
        fn write(&self, ctx: &mut HandlerContext, message: Message, promise: Promise<()>) {
            let s = *message.downcast::<String>().unwrap();
            ctx.write(Box::new(format!("{}{s}", self.0)), promise);
        }
    }

    fn build_pipeline() -> Arc<ChannelPipeline> {
        ChannelPipeline::new(Arc::new(NoopSink), Arc::new(InlineExecutor))
    }

    struct CaptureSink(Arc<Mutex<String>>);
    impl ChannelUnsafe for CaptureSink {
        fn bind(&self, _local_addr: std::net::SocketAddr) {}
        fn connect(&self, _r: std::net::SocketAddr, _l: Option<std::net::SocketAddr>) {}
        fn disconnect(&self) {}
        fn close(&self) {}
        fn deregister(&self) {}
        fn write(&self, message: Message, promise: Promise<()>) {
            *self.0.lock() = *message.downcast::<String>().unwrap();
            promise.try_complete(());
        }
        fn flush(&self) {}
        fn begin_read(&self) {}
    }

    #[test]
    fn scenario_s4_inbound_appends_and_outbound_prepends() {
        let pipeline = build_pipeline();
        let last_seen = Arc::new(Mutex::new(String::new()));
        pipeline
            .add_handler("up", Arc::new(AppendInbound("u", last_seen.clone())), Anchor::Last)
            .unwrap();
        pipeline.emit_read(Box::new("x".to_string()));
        assert_eq!(*last_seen.lock(), "xu");

        let captured = Arc::new(Mutex::new(String::new()));
        let outbound_pipeline =
            ChannelPipeline::new(Arc::new(CaptureSink(captured.clone())), Arc::new(InlineExecutor));
        outbound_pipeline
            .add_handler("down", Arc::new(PrependOutbound("d")), Anchor::Last)
            .unwrap();
        outbound_pipeline.write(Box::new("x".to_string()), Promise::new());
        assert_eq!(*captured.lock(), "dx");
    }

    #[test]
    fn duplicate_handler_name_is_rejected() {
        let pipeline = build_pipeline();
        pipeline
            .add_handler("a", Arc::new(AppendInbound("a", Arc::new(Mutex::new(String::new())))), Anchor::Last)
            .unwrap();
        let err = pipeline
            .add_handler("a", Arc::new(AppendInbound("b", Arc::new(Mutex::new(String::new())))), Anchor::Last)
            .unwrap_err();
        assert_eq!(err.code(), crate::error::codes::PIPELINE_MISUSE);
    }

    #[test]
    fn remove_unknown_handle_fails() {
        let pipeline = build_pipeline();
        assert!(pipeline.remove_handler("ghost").is_err());
    }

    #[test]
    fn tail_releases_undelivered_byte_buffer() {
        let pipeline = build_pipeline();
        let allocator = Arc::new(crate::buffer::PooledAllocator::new());
        let buffer = allocator.allocate(64);
        assert_eq!(allocator.free_count(64), 0);
        pipeline.emit_read(Box::new(buffer));
        assert_eq!(allocator.free_count(64), 1);
    }

    #[test]
    fn epoch_advances_on_every_mutation() {
        let pipeline = build_pipeline();
        let before = pipeline.epoch();
        pipeline
            .add_handler("a", Arc::new(AppendInbound("a", Arc::new(Mutex::new(String::new())))), Anchor::Last)
            .unwrap();
        assert_eq!(pipeline.epoch(), before + 1);
        pipeline.remove_handler("a").unwrap();
        assert_eq!(pipeline.epoch(), before + 2);
    }
}
