//! 延迟任务队列：按单调截止时间排序的小顶堆。
//!
//! # 设计背景（Why）
//! 定时任务（连接超时、写超时、用户自定义延迟逻辑）必须严格按到期先后
//! 执行，且必须可在到期前安全取消。用墙钟（wall clock）排序会被 NTP 调整
//! 打乱顺序，因此排序键是 `Instant`（单调时钟）而不是系统时间。
//!
//! # 逻辑解析（How）
//! 队列本身只应由所有者（循环）线程操作：`push`/`poll_due`/`peek_deadline`
//! 都没有内部锁。取消走一条独立路径——每个任务携带一个原子
//! `CancellationState`，取消方做一次 `None → Requested` 的 CAS；只有 CAS
//! 成功时取消才算生效，队列在下一次遍历时把已取消的任务惰性清除，避免为
//! 了支持"从堆中间删除"而引入复杂的索引维护。
//!
//! # 契约说明（What）
//! - `cancel()` 可以从任意线程调用，是否真正生效由 CAS 结果决定，因此是
//!   幂等的：多次调用只有第一次会让 promise 进入 `Canceled`。
//! - `poll_due(now)` 会跳过已取消的任务并返回其余按 deadline 升序到期的
//!   任务；未到期任务留在堆中。
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::future::Promise;

const CANCEL_NONE: u8 = 0;
const CANCEL_REQUESTED: u8 = 1;

/// 调度任务的取消令牌，可以安全地从任意线程调用 `cancel()`。
#[derive(Clone)]
pub struct CancellationToken {
    state: Arc<AtomicU8>,
}

impl CancellationToken {
    /// 独立于任何具体队列构造一个取消令牌。调用方通常在把任务真正插入
    /// [`ScheduledTaskQueue`] 之前就需要一个可以立即返回给外部的句柄
    /// （例如任务本身还在任务队列里排队、尚未被所有者线程转交进调度堆），
    /// 令牌的取消状态与"是否已经在堆里"完全解耦。
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(CANCEL_NONE)),
        }
    }

    /// 原子地请求取消。返回 `true` 表示这次调用是第一个让状态从
    /// `None` 变为 `Requested` 的调用。
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(
                CANCEL_NONE,
                CANCEL_REQUESTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCEL_REQUESTED
    }
}

/// 一个已调度但尚未执行的任务。
pub struct ScheduledTask {
    pub deadline: Instant,
    pub cancellation: CancellationToken,
    pub promise: Promise<()>,
    pub execute: Box<dyn FnOnce() + Send + 'static>,
    /// 单调递增序号，打破同一截止时间下的排序二义性，保持插入顺序稳定。
    sequence: u64,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}
impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap 是大顶堆，取反让最早到期的 deadline 排在堆顶。
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// 按截止时间排序的调度任务队列，仅供所有者（循环）线程使用。
#[derive(Default)]
pub struct ScheduledTaskQueue {
    heap: BinaryHeap<ScheduledTask>,
    next_sequence: u64,
}

/// 提交调度任务时返回的句柄：`cancel()` 可从任意线程安全调用。
pub struct ScheduledHandle {
    pub cancellation: CancellationToken,
    pub promise: Promise<()>,
}

impl ScheduledHandle {
    pub fn cancel(&self) -> bool {
        let requested = self.cancellation.cancel();
        if requested {
            self.promise.try_cancel();
        }
        requested
    }
}

impl ScheduledTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 将一个延迟任务插入堆中，返回一个可跨线程取消的句柄。
    pub fn push(
        &mut self,
        deadline: Instant,
        promise: Promise<()>,
        execute: Box<dyn FnOnce() + Send + 'static>,
    ) -> ScheduledHandle {
        let cancellation = CancellationToken::new();
        self.push_with_token(deadline, cancellation.clone(), promise.clone(), execute);
        ScheduledHandle {
            cancellation,
            promise,
        }
    }

    /// 与 [`Self::push`] 相同，但使用调用方预先构造好的取消令牌——用在
    /// 令牌需要在任务真正入堆之前就能被外部取消的场景（见
    /// `TcpEventLoop::schedule` 的实现）。
    pub fn push_with_token(
        &mut self,
        deadline: Instant,
        cancellation: CancellationToken,
        promise: Promise<()>,
        execute: Box<dyn FnOnce() + Send + 'static>,
    ) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(ScheduledTask {
            deadline,
            cancellation: cancellation.clone(),
            promise: promise.clone(),
            execute,
            sequence,
        });
    }

    /// 截止时间最早的未取消任务的 deadline，用于计算循环下一次应当醒来的时刻。
    pub fn peek_deadline(&mut self) -> Option<Instant> {
        self.drop_cancelled_head();
        self.heap.peek().map(|t| t.deadline)
    }

    fn drop_cancelled_head(&mut self) {
        while let Some(top) = self.heap.peek() {
            if top.cancellation.is_cancelled() {
                let cancelled = self.heap.pop().unwrap();
                cancelled.promise.try_cancel();
            } else {
                break;
            }
        }
    }

    /// 取出所有 `deadline <= now` 且未被取消的任务；已取消的任务被静默丢弃。
    pub fn poll_due(&mut self, now: Instant) -> Vec<ScheduledTask> {
        let mut due = Vec::new();
        loop {
            self.drop_cancelled_head();
            match self.heap.peek() {
                Some(top) if top.deadline <= now => {
                    due.push(self.heap.pop().unwrap());
                }
                _ => break,
            }
        }
        due
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn poll_due_returns_tasks_in_deadline_order() {
        let mut q = ScheduledTaskQueue::new();
        let base = Instant::now();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for (label, ms) in [("a", 30u64), ("b", 10), ("c", 20)] {
            let order = order.clone();
            q.push(
                base + Duration::from_millis(ms),
                Promise::new(),
                Box::new(move || order.lock().push(label)),
            );
        }
        let due = q.poll_due(base + Duration::from_millis(35));
        for task in due {
            (task.execute)();
        }
        assert_eq!(*order.lock(), vec!["b", "c", "a"]);
    }

    #[test]
    fn cancelled_task_never_executes_and_promise_reports_cancelled() {
        let mut q = ScheduledTaskQueue::new();
        let base = Instant::now();
        let ran = Arc::new(parking_lot::Mutex::new(false));
        let ran2 = ran.clone();
        let handle = q.push(
            base + Duration::from_millis(50),
            Promise::new(),
            Box::new(move || *ran2.lock() = true),
        );
        assert!(handle.cancel());
        let due = q.poll_due(base + Duration::from_millis(100));
        assert!(due.is_empty());
        assert!(!*ran.lock());
        assert!(handle.promise.is_cancelled());
    }

    #[test]
    fn double_cancel_is_idempotent() {
        let mut q = ScheduledTaskQueue::new();
        let base = Instant::now();
        let handle = q.push(base + Duration::from_millis(10), Promise::new(), Box::new(|| {}));
        assert!(handle.cancel());
        assert!(!handle.cancel());
    }
}
