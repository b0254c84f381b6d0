//! 统一错误分类。
//!
//! # 设计背景（Why）
//! 反应堆运行时横跨缓冲区、管道、事件循环、传输层四个子系统，调用方若要对
//! "连接已关闭"和"写入背压"做出不同的重试/熔断策略，需要一套稳定、可匹配的
//! 错误分类，而不是到处传递 `Box<dyn Error>` 再靠字符串拼接识别原因。
//!
//! # 逻辑解析（How）
//! `CoreError` 是一个带稳定错误码（`<domain>.<reason>` 形式）的结构体，内部
//! 用 `CoreErrorKind` 区分大类，再附带人类可读 message 与可选 cause 链。
//! 分类粒度对齐 §5 错误分类表：通道生命周期、连接建立、读写停滞、编解码、
//! 引用计数误用、管道误用、任务拒绝、聚合错误。
//!
//! # 契约说明（What）
//! - `CoreError::code()` 返回的字符串必须跨版本保持稳定，调用方可以把它当作
//!   程序可判定的错误标识符持久化或用于监控打点。
//! - `Aggregate` 变体用于 `ClosePromise`/`BindPromise` 等聚合型 Promise 失败时
//!   汇总多个子错误，保证"至少保留一个失败原因"的可观察性。
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// 引用计数误用的具体情形，用于在 `IllegalReferenceCount` 里区分诊断信息。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefCountViolation {
    /// 对已经归零的缓冲区再次调用 `release`。
    ReleaseAfterZero,
    /// 对已经归零的缓冲区调用 `retain`，即试图"复活"一个已回收对象。
    RetainAfterZero,
    /// 在引用计数为零之后仍然尝试读取/写入缓冲区内容。
    AccessAfterRelease,
}

impl fmt::Display for RefCountViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RefCountViolation::ReleaseAfterZero => "release called after refcount reached zero",
            RefCountViolation::RetainAfterZero => "retain called after refcount reached zero",
            RefCountViolation::AccessAfterRelease => "buffer accessed after refcount reached zero",
        };
        f.write_str(text)
    }
}

/// 管道误用的具体情形。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMisuseKind {
    /// 试图移除一个不存在（或已被移除）的 handler 句柄。
    UnknownHandle,
    /// 试图在同一个锚点两次插入同名 handler。
    DuplicateName,
    /// 在管道已经关闭之后仍尝试挂载/替换 handler。
    MutationAfterClose,
}

/// 核心错误分类，覆盖缓冲区、管道、通道、事件循环四个子系统。
#[derive(Debug, Error)]
pub enum CoreErrorKind {
    #[error("channel is closed")]
    ClosedChannel,

    #[error("channel is not yet connected")]
    NotYetConnected,

    #[error("connect attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("connection refused by peer")]
    ConnectRefused,

    #[error("address already in use")]
    AddressInUse,

    #[error("network unreachable")]
    NetworkUnreachable,

    #[error("no readable data observed for {0:?}, read stalled")]
    ReadStall(Duration),

    #[error("inbound decoder failed: {0}")]
    DecoderException(String),

    #[error("outbound encoder failed: {0}")]
    EncoderException(String),

    #[error("illegal reference count usage: {0}")]
    IllegalReferenceCount(RefCountViolation),

    #[error("pipeline misuse: {0:?}")]
    PipelineMisuse(PipelineMisuseKind),

    #[error("index out of bounds: requested {0}, limit {1}")]
    IndexOutOfBounds(usize, usize),

    #[error("task rejected by executor, queue is saturated or shutting down")]
    Rejected,

    #[error("{0} of {1} operations failed")]
    Aggregate(usize, usize),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// 运行时统一错误类型。
///
/// 携带一个稳定的短错误码，便于调用方做模式匹配或监控打标签，同时保留
/// 原始 [`CoreErrorKind`] 与可选的子错误列表（用于聚合错误）。
#[derive(Debug, Error, Clone)]
#[error("{code}: {kind}")]
pub struct CoreError {
    code: &'static str,
    kind: Arc<CoreErrorKind>,
    causes: Arc<[CoreError]>,
}

impl CoreError {
    pub fn new(code: &'static str, kind: CoreErrorKind) -> Self {
        Self {
            code,
            kind: Arc::new(kind),
            causes: Arc::from(Vec::new()),
        }
    }

    pub fn closed_channel() -> Self {
        Self::new(codes::CLOSED_CHANNEL, CoreErrorKind::ClosedChannel)
    }

    pub fn not_yet_connected() -> Self {
        Self::new(codes::NOT_YET_CONNECTED, CoreErrorKind::NotYetConnected)
    }

    pub fn connect_timeout(after: Duration) -> Self {
        Self::new(codes::CONNECT_TIMEOUT, CoreErrorKind::ConnectTimeout(after))
    }

    pub fn connect_refused() -> Self {
        Self::new(codes::CONNECT_REFUSED, CoreErrorKind::ConnectRefused)
    }

    pub fn address_in_use() -> Self {
        Self::new(codes::ADDRESS_IN_USE, CoreErrorKind::AddressInUse)
    }

    pub fn network_unreachable() -> Self {
        Self::new(codes::NETWORK_UNREACHABLE, CoreErrorKind::NetworkUnreachable)
    }

    pub fn read_stall(duration: Duration) -> Self {
        Self::new(codes::READ_STALL, CoreErrorKind::ReadStall(duration))
    }

    pub fn decoder_exception(message: impl Into<String>) -> Self {
        Self::new(
            codes::DECODER_EXCEPTION,
            CoreErrorKind::DecoderException(message.into()),
        )
    }

    pub fn encoder_exception(message: impl Into<String>) -> Self {
        Self::new(
            codes::ENCODER_EXCEPTION,
            CoreErrorKind::EncoderException(message.into()),
        )
    }

    pub fn illegal_reference_count(violation: RefCountViolation) -> Self {
        Self::new(
            codes::ILLEGAL_REFERENCE_COUNT,
            CoreErrorKind::IllegalReferenceCount(violation),
        )
    }

    pub fn pipeline_misuse(kind: PipelineMisuseKind) -> Self {
        Self::new(codes::PIPELINE_MISUSE, CoreErrorKind::PipelineMisuse(kind))
    }

    /// `requested` 为触发越界的目标偏移/长度，`limit` 为当时允许的上限
    /// （通常是 `maxCapacity` 或缓冲区当前可读长度）。
    pub fn index_out_of_bounds(requested: usize, limit: usize) -> Self {
        Self::new(
            codes::INDEX_OUT_OF_BOUNDS,
            CoreErrorKind::IndexOutOfBounds(requested, limit),
        )
    }

    pub fn rejected() -> Self {
        Self::new(codes::REJECTED, CoreErrorKind::Rejected)
    }

    /// 构造一个聚合错误：`total` 个操作里有 `failed.len()` 个失败，
    /// `failed` 保留全部子错误，`Display` 仅汇总计数，细节通过 `causes()` 获取。
    pub fn aggregate(total: usize, failed: Vec<CoreError>) -> Self {
        let failed_count = failed.len();
        Self {
            code: codes::AGGREGATE,
            kind: Arc::new(CoreErrorKind::Aggregate(failed_count, total)),
            causes: Arc::from(failed),
        }
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn kind(&self) -> &CoreErrorKind {
        &self.kind
    }

    pub fn causes(&self) -> &[CoreError] {
        &self.causes
    }
}

impl From<io::Error> for CoreError {
    fn from(err: io::Error) -> Self {
        use io::ErrorKind::*;
        match err.kind() {
            ConnectionRefused => CoreError::connect_refused(),
            AddrInUse => CoreError::address_in_use(),
            TimedOut => CoreError::connect_timeout(Duration::ZERO),
            _ => CoreError::new(codes::IO, CoreErrorKind::Io(err)),
        }
    }
}

/// 稳定错误码，跨版本保持不变，可安全用于监控打点与日志检索。
pub mod codes {
    pub const CLOSED_CHANNEL: &str = "channel.closed";
    pub const NOT_YET_CONNECTED: &str = "channel.not_yet_connected";
    pub const CONNECT_TIMEOUT: &str = "connect.timeout";
    pub const CONNECT_REFUSED: &str = "connect.refused";
    pub const ADDRESS_IN_USE: &str = "connect.address_in_use";
    pub const NETWORK_UNREACHABLE: &str = "connect.network_unreachable";
    pub const READ_STALL: &str = "io.read_stall";
    pub const DECODER_EXCEPTION: &str = "codec.decoder_exception";
    pub const ENCODER_EXCEPTION: &str = "codec.encoder_exception";
    pub const ILLEGAL_REFERENCE_COUNT: &str = "buffer.illegal_reference_count";
    pub const PIPELINE_MISUSE: &str = "pipeline.misuse";
    pub const INDEX_OUT_OF_BOUNDS: &str = "buffer.index_out_of_bounds";
    pub const REJECTED: &str = "executor.rejected";
    pub const AGGREGATE: &str = "aggregate.partial_failure";
    pub const IO: &str = "io.other";
}

pub type CoreResult<T> = Result<T, CoreError>;
