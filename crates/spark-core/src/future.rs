//! Promise / Future：异步通道操作的完成令牌。
//!
//! # 设计背景（Why）
//! 管道里几乎所有跨线程的异步操作（`write`、`connect`、`close`、调度任务）
//! 都需要一种"承诺在未来某一刻恰好完成一次"的句柄，并且完成通知要能在
//! 指定的执行器（通常是拥有该通道的事件循环）上触发，以维持"同一通道的
//! 所有回调都在同一线程上"这条不变式。没有直接借用 `std::future::Future`
//! 的 `Waker`/`Context` 机制，是因为这里要表达的是"写时 CAS 一次终态转换、
//! 多次订阅者回调按注册顺序触发"这种更偏"观察者列表"的语义，而不是轮询。
//!
//! # 逻辑解析（How）
//! `Promise<T>` 内部持有一个 `Mutex<PromiseState<T>>`：要么 `Pending(继续列表)`，
//! 要么已经到达某个终态。`try_complete`/`try_fail`/`try_cancel` 都走同一条
//! compare-and-swap 式路径——只有状态仍是 `Pending` 时才会转换，随后把所有
//! 已注册的回调依次调用一次；晚注册的回调如果发现已经到达终态，立即同步
//! 调用。`Future<T>` 是同一个 `Promise` 的只读克隆，只暴露订阅/查询接口。
//!
//! # 契约说明（What）
//! - 终态最多发生一次：赢得 CAS 的那次调用返回 `true`，其余全部返回 `false`
//!   且是无操作。
//! - 在完成前和完成后注册的继续都恰好触发一次。
//! - `AggregatingPromise` 在所有子 Promise 完成后才完成；只要有一个子
//!   Promise 失败就以 `Aggregate` 错误失败，否则成功。
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::CoreError;

/// Promise/Future 的终态。
#[derive(Clone)]
pub enum Outcome<T> {
    Succeeded(T),
    Failed(CoreError),
    Cancelled,
}

impl<T: fmt::Debug> fmt::Debug for Outcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Succeeded(v) => f.debug_tuple("Succeeded").field(v).finish(),
            Outcome::Failed(e) => f.debug_tuple("Failed").field(e).finish(),
            Outcome::Cancelled => write!(f, "Cancelled"),
        }
    }
}

type Continuation<T> = Box<dyn FnOnce(Outcome<T>) + Send + 'static>;

enum PromiseState<T> {
    Pending(Vec<Continuation<T>>),
    Done(Outcome<T>),
}

struct Shared<T> {
    state: Mutex<PromiseState<T>>,
}

/// 写端：持有完成一个异步操作结果的权力。
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PromiseState::Pending(Vec::new())),
            }),
        }
    }

    /// 以 `Outcome` 尝试完成。只有第一次调用会真正生效。
    fn try_settle(&self, outcome: Outcome<T>) -> bool {
        let continuations = {
            let mut guard = self.shared.state.lock();
            match &*guard {
                PromiseState::Done(_) => None,
                PromiseState::Pending(_) => {
                    let previous =
                        std::mem::replace(&mut *guard, PromiseState::Done(outcome.clone()));
                    match previous {
                        PromiseState::Pending(continuations) => Some(continuations),
                        PromiseState::Done(_) => unreachable!(),
                    }
                }
            }
        };
        match continuations {
            Some(continuations) => {
                for continuation in continuations {
                    continuation(outcome.clone());
                }
                true
            }
            None => false,
        }
    }

    pub fn try_complete(&self, value: T) -> bool {
        self.try_settle(Outcome::Succeeded(value))
    }

    pub fn try_fail(&self, error: CoreError) -> bool {
        self.try_settle(Outcome::Failed(error))
    }

    pub fn try_cancel(&self) -> bool {
        self.try_settle(Outcome::Cancelled)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(&*self.shared.state.lock(), PromiseState::Done(Outcome::Cancelled))
    }

    pub fn is_done(&self) -> bool {
        matches!(&*self.shared.state.lock(), PromiseState::Done(_))
    }

    /// 注册一个在终态触发时恰好调用一次的继续；若此时已处于终态，立即同步调用。
    pub fn on_complete<F>(&self, continuation: F)
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        let mut guard = self.shared.state.lock();
        match &mut *guard {
            PromiseState::Pending(continuations) => continuations.push(Box::new(continuation)),
            PromiseState::Done(outcome) => {
                let outcome = outcome.clone();
                drop(guard);
                continuation(outcome);
            }
        }
    }

    pub fn as_future(&self) -> Future<T> {
        Future {
            shared: self.shared.clone(),
        }
    }
}

/// 读端：订阅/查询一个 Promise 的结果，没有写权限。
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Future<T> {
    pub fn is_done(&self) -> bool {
        matches!(&*self.shared.state.lock(), PromiseState::Done(_))
    }

    pub fn on_complete<F>(&self, continuation: F)
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        let mut guard = self.shared.state.lock();
        match &mut *guard {
            PromiseState::Pending(continuations) => continuations.push(Box::new(continuation)),
            PromiseState::Done(outcome) => {
                let outcome = outcome.clone();
                drop(guard);
                continuation(outcome);
            }
        }
    }
}

/// 聚合多个子 Promise：全部成功才成功，任意失败就以 `Aggregate` 失败。
pub struct AggregatingPromise {
    total: usize,
    remaining: Arc<parking_lot::Mutex<AggregateState>>,
    promise: Promise<()>,
}

struct AggregateState {
    pending: usize,
    failures: Vec<CoreError>,
}

impl AggregatingPromise {
    pub fn new(total: usize) -> Self {
        let promise = Promise::new();
        if total == 0 {
            promise.try_complete(());
        }
        Self {
            total,
            remaining: Arc::new(parking_lot::Mutex::new(AggregateState {
                pending: total,
                failures: Vec::new(),
            })),
            promise,
        }
    }

    /// 挂接一个子 Promise；当所有子 Promise 都到达终态后汇总完成自身。
    pub fn attach<T: Clone + Send + 'static>(&self, child: &Promise<T>) {
        let remaining = self.remaining.clone();
        let total = self.total;
        let promise = self.promise.clone();
        child.on_complete(move |outcome| {
            let mut guard = remaining.lock();
            if let Outcome::Failed(err) = outcome {
                guard.failures.push(err);
            }
            guard.pending = guard.pending.saturating_sub(1);
            if guard.pending == 0 {
                if guard.failures.is_empty() {
                    promise.try_complete(());
                } else {
                    let failed = std::mem::take(&mut guard.failures);
                    promise.try_fail(CoreError::aggregate(total, failed));
                }
            }
        });
    }

    pub fn as_future(&self) -> Future<()> {
        self.promise.as_future()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_exactly_once() {
        let p = Promise::<u32>::new();
        assert!(p.try_complete(1));
        assert!(!p.try_complete(2));
        assert!(!p.try_fail(CoreError::rejected()));
    }

    #[test]
    fn continuation_registered_after_completion_fires_immediately() {
        let p = Promise::<u32>::new();
        p.try_complete(42);
        let observed = Arc::new(Mutex::new(None));
        let observed2 = observed.clone();
        p.on_complete(move |outcome| {
            if let Outcome::Succeeded(v) = outcome {
                *observed2.lock() = Some(v);
            }
        });
        assert_eq!(*observed.lock(), Some(42));
    }

    #[test]
    fn continuation_registered_before_completion_fires_once() {
        let p = Promise::<u32>::new();
        let observed = Arc::new(Mutex::new(0));
        let observed2 = observed.clone();
        p.on_complete(move |outcome| {
            if let Outcome::Succeeded(v) = outcome {
                *observed2.lock() += v;
            }
        });
        p.try_complete(7);
        assert_eq!(*observed.lock(), 7);
    }

    #[test]
    fn aggregating_promise_succeeds_only_if_all_children_succeed() {
        let agg = AggregatingPromise::new(2);
        let a = Promise::<()>::new();
        let b = Promise::<()>::new();
        agg.attach(&a);
        agg.attach(&b);
        a.try_complete(());
        assert!(!agg.as_future().is_done());
        b.try_complete(());
        assert!(agg.as_future().is_done());
    }

    #[test]
    fn aggregating_promise_fails_with_aggregate_when_any_child_fails() {
        let agg = AggregatingPromise::new(2);
        let a = Promise::<()>::new();
        let b = Promise::<()>::new();
        agg.attach(&a);
        agg.attach(&b);
        a.try_fail(CoreError::rejected());
        b.try_complete(());
        let done = Arc::new(Mutex::new(false));
        let done2 = done.clone();
        agg.as_future().on_complete(move |outcome| {
            if matches!(outcome, Outcome::Failed(_)) {
                *done2.lock() = true;
            }
        });
        assert!(*done.lock());
    }

    #[test]
    fn zero_children_aggregate_completes_immediately() {
        let agg = AggregatingPromise::new(0);
        assert!(agg.as_future().is_done());
    }
}
