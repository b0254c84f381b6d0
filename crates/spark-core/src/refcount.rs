//! 手动引用计数契约（Netty 风格 `retain`/`release`）。
//!
//! # 设计背景（Why）
//! 池化缓冲区的归还时机必须由业务代码显式声明，而不是依赖 Rust 的自动
//! `Drop`：一个 `ByteBuffer` 可能被同时挂在管道的多个 handler 手中，只有
//! 当所有持有者都调用过 `release()` 之后，底层存储才真正归还给分配器。
//! 这与托管语言运行时里"引用计数对象"的语义一致，刻意不借助 `Arc` 的自动
//! drop 语义，因为 `Arc::clone`/drop 无法表达"用后即焚，少一次释放就是
//! 泄漏，多一次释放就是非法重复释放"这种强契约。
//!
//! # 逻辑解析（How）
//! `RefCounted` 用一个原子计数器记录当前存活引用数，初始值为 1（代表创建者
//! 持有的那一份）。`retain()` 让计数 +1 并返回新句柄；`release()` 让计数 -1，
//! 当计数归零时触发底层资源回收回调。计数下降到 0 之后，任何后续的
//! `retain`/`release`/资源访问都被视为致命误用。
//!
//! # 契约说明（What）
//! - 计数归零后的 `release()`：返回 `Err(IllegalReferenceCount(ReleaseAfterZero))`，
//!   不会 panic，但调用方应当将其视为不可恢复的编程错误。
//! - 计数归零后的 `retain()`：同样返回错误而不是让计数变为负数。
//! - `is_released()` 可用于守卫路径在访问底层数据前做一次廉价检查。
//!
//! # 风险提示（Trade-offs）
//! 选择返回 `Result` 而非直接 panic，是为了让调用方（尤其是管道的异常传播
//! 路径）能把引用计数误用转换为一次 `emit_exception`，而不是让整个事件循环
//! 线程因为一次业务 bug 而崩溃。
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{CoreError, RefCountViolation};

/// 引用计数归零时执行的回收动作。由具体缓冲区类型提供，典型实现是把底层
/// `BytesMut` 归还给池化分配器。
pub trait Reclaimable: fmt::Debug {
    fn reclaim(&self);
}

/// 手动引用计数核心。不直接对外暴露，被 `ByteBuffer` 等类型组合使用。
pub struct RefCounted<T: Reclaimable> {
    count: AtomicUsize,
    inner: T,
}

impl<T: Reclaimable> fmt::Debug for RefCounted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefCounted")
            .field("count", &self.count.load(Ordering::Relaxed))
            .field("inner", &self.inner)
            .finish()
    }
}

impl<T: Reclaimable> RefCounted<T> {
    /// 以初始引用计数 1 创建一个新的受控对象。
    pub fn new(inner: T) -> Arc<Self> {
        Arc::new(Self {
            count: AtomicUsize::new(1),
            inner,
        })
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn ref_count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_released(&self) -> bool {
        self.ref_count() == 0
    }

    /// 增加一份引用计数。对已经归零的对象调用会返回
    /// `IllegalReferenceCount(RetainAfterZero)` 而不是让计数变为负数。
    pub fn retain(&self) -> Result<usize, CoreError> {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Err(CoreError::illegal_reference_count(
                    RefCountViolation::RetainAfterZero,
                ));
            }
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current + 1),
                Err(observed) => current = observed,
            }
        }
    }

    /// 释放一份引用计数。计数归零时触发 `Reclaimable::reclaim`。
    /// 对已经归零的对象再次调用会返回
    /// `IllegalReferenceCount(ReleaseAfterZero)`，这是致命误用信号。
    pub fn release(&self) -> Result<usize, CoreError> {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Err(CoreError::illegal_reference_count(
                    RefCountViolation::ReleaseAfterZero,
                ));
            }
            let next = current - 1;
            match self.count.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if next == 0 {
                        self.inner.reclaim();
                    }
                    return Ok(next);
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// 在访问底层数据前做一次守卫检查，归零之后访问一律视为致命误用。
    pub fn guard_access(&self) -> Result<(), CoreError> {
        if self.is_released() {
            Err(CoreError::illegal_reference_count(
                RefCountViolation::AccessAfterRelease,
            ))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[derive(Debug)]
    struct Flag(Arc<AtomicBool>);

    impl Reclaimable for Flag {
        fn reclaim(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn release_to_zero_triggers_reclaim_exactly_once() {
        let reclaimed = Arc::new(AtomicBool::new(false));
        let rc = RefCounted::new(Flag(reclaimed.clone()));
        rc.retain().unwrap();
        assert_eq!(rc.release().unwrap(), 1);
        assert!(!reclaimed.load(Ordering::SeqCst));
        assert_eq!(rc.release().unwrap(), 0);
        assert!(reclaimed.load(Ordering::SeqCst));
    }

    #[test]
    fn release_after_zero_is_illegal() {
        let reclaimed = Arc::new(AtomicBool::new(false));
        let rc = RefCounted::new(Flag(reclaimed));
        rc.release().unwrap();
        let err = rc.release().unwrap_err();
        assert_eq!(err.code(), crate::error::codes::ILLEGAL_REFERENCE_COUNT);
    }

    #[test]
    fn retain_after_zero_is_illegal() {
        let reclaimed = Arc::new(AtomicBool::new(false));
        let rc = RefCounted::new(Flag(reclaimed));
        rc.release().unwrap();
        assert!(rc.retain().is_err());
    }

    #[test]
    fn guard_access_after_release_fails() {
        let reclaimed = Arc::new(AtomicBool::new(false));
        let rc = RefCounted::new(Flag(reclaimed));
        assert!(rc.guard_access().is_ok());
        rc.release().unwrap();
        assert!(rc.guard_access().is_err());
    }
}
