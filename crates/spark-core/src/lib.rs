//! spark-core：Netty 风格反应堆运行时的核心契约。
//!
//! 这个 crate 只定义"事件循环执行器""通道状态机""管道/handler 链""引用计数
//! 缓冲区""Promise/Future"这几个核心概念的抽象契约与可复用实现，具体的
//! OS 轮询器、传输层绑定（TCP/管道/内嵌测试通道）由独立的传输层 crate 提供。
//! 这种"契约面与实现分离"的分层方式，使得管道、通道状态机等核心组件可以
//! 针对抽象执行器编程，不必关心背后到底跑的是哪种轮询器。
#![deny(unsafe_code)]

pub mod buffer;
pub mod channel;
pub mod codec;
pub mod error;
pub mod executor;
pub mod future;
pub mod observability;
pub mod pipeline;
pub mod prelude;
pub mod refcount;
pub mod scheduled;
pub mod task;

pub use error::{CoreError, CoreErrorKind, CoreResult};
