//! 常用类型的一站式导入。
pub use crate::buffer::{ByteBuffer, PooledAllocator};
pub use crate::channel::{ChannelConfig, ChannelOutboundBuffer, ChannelState, ChannelUnsafe, WritabilityFlip};
pub use crate::codec::{ByteToMessageDecoder, DecodeOutcome, MessageToByteEncoder, MessageToMessageCodec};
pub use crate::error::{CoreError, CoreErrorKind, CoreResult};
pub use crate::executor::{EventExecutor, EventExecutorGroup};
pub use crate::future::{Future, Outcome, Promise};
pub use crate::pipeline::context::HandlerContext;
pub use crate::pipeline::handler::{Handler, Message};
pub use crate::pipeline::{Anchor, ChannelPipeline};
pub use crate::scheduled::{CancellationToken, ScheduledHandle, ScheduledTaskQueue};
pub use crate::task::{Runnable, TaskQueue};
