//! 可观测性打点辅助。
//!
//! # 设计背景（Why）
//! 具体的日志/指标后端不属于这个 crate 的职责（它们被当作外部协作者），
//! 但管道变更、引用计数误用、写背压翻转这些事件本身值得被统一地打点，
//! 否则每个调用点都要各写各的 `tracing::` 宏，字段名容易漂移。这里只收敛
//! 一组字段名常量和几个薄封装函数，不引入具体的 sink。
use crate::error::CoreError;

/// 记录一次管道结构变更（新增/移除/替换 handler），字段名固定便于检索。
pub fn record_pipeline_mutation(kind: &'static str, handler: &str, epoch: u64) {
    tracing::debug!(
        target: "spark_core::pipeline",
        mutation = kind,
        handler,
        epoch,
        "pipeline mutated"
    );
}

/// 记录一次可写性翻转。
pub fn record_writability_flip(writable: bool, pending_bytes: usize) {
    tracing::debug!(
        target: "spark_core::channel",
        writable,
        pending_bytes,
        "writability flipped"
    );
}

/// 记录一次被吞掉的任务异常：循环绝不能因为用户代码抛错而死掉，
/// 但这类异常值得在日志里留痕供排查。
pub fn record_swallowed_task_error(error: &CoreError) {
    tracing::warn!(
        target: "spark_core::executor",
        code = error.code(),
        "task raised an error and was swallowed by the loop"
    );
}

/// 记录一次致命的引用计数误用。
pub fn record_refcount_violation(error: &CoreError) {
    tracing::error!(
        target: "spark_core::refcount",
        code = error.code(),
        "illegal reference count usage"
    );
}
