//! EventExecutor / EventExecutorGroup：事件循环的抽象契约面。
//!
//! # 设计背景（Why）
//! `spark-core` 只刻画"单线程亲和执行器"这个能力集合应该长什么样，具体的
//! 循环实现（基于哪个 OS 轮询器、如何与通道绑定）属于传输层关心的事情。
//! 这样划分之后，管道、通道状态机等核心组件只需要针对这个抽象契约编程，
//! 不必关心背后到底是 `mio`、IOCP 还是测试用的内嵌循环——这是贯穿整个
//! 工作区的"契约面 vs 实现"分层原则的延伸。
//!
//! # 契约说明（What）
//! - `execute()` 可以从任意线程调用；如果调用方本身不是所属循环线程，
//!   实现必须保证任务被安全地唤醒执行。
//! - `in_event_loop()` 用来判断当前调用栈是否已经运行在该执行器自己的
//!   线程上，管道的"本线程立即变更 / 其他线程重分派"策略正是基于它。
//! - `shutdown_gracefully` 是幂等的：多次调用返回同一个终止 future。
use std::time::Duration;

use crate::future::Future as SparkFuture;
use crate::scheduled::ScheduledHandle;
use crate::task::Runnable;

/// 单线程亲和的任务执行器契约，即一个事件循环对外暴露的能力集合。
pub trait EventExecutor: Send + Sync {
    /// 入队一个任务。若调用方不在循环线程上，实现需要负责唤醒循环。
    fn execute(&self, task: Runnable);

    /// 在 `delay` 之后执行任务，返回一个可跨线程安全取消的句柄。
    fn schedule(&self, task: Runnable, delay: Duration) -> ScheduledHandle;

    /// 当前调用是否发生在该执行器自己的线程上。
    fn in_event_loop(&self) -> bool;

    /// 发起优雅停机：之后的新任务按实现选择的策略处理（拒绝或丢弃，
    /// 必须二选一并文档化，见 crate 级 `DESIGN.md` 的决策记录）。
    fn shutdown_gracefully(&self, quiet_period: Duration, timeout: Duration) -> SparkFuture<()>;

    /// 在完全停机与清理完成后结束的 future；多次订阅都能收到通知。
    fn termination_future(&self) -> SparkFuture<()>;
}

/// 一组固定数量的执行器，按亲和策略挑选或轮询分配。
pub trait EventExecutorGroup: Send + Sync {
    /// 挑选一个执行器：若调用线程本身就是群组中某个循环的线程，返回那个
    /// 循环（亲和）；否则按轮询策略挑选下一个。
    fn next(&self) -> std::sync::Arc<dyn EventExecutor>;

    fn shutdown_gracefully(&self, quiet_period: Duration, timeout: Duration) -> SparkFuture<()>;

    fn termination_future(&self) -> SparkFuture<()>;
}
