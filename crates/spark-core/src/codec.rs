//! 编解码框架契约（外部协作者）。
//!
//! # 设计背景（Why）
//! 具体编解码器（RESP、zlib 之类）不属于这个 crate 的职责范围，但"编解码器
//! 长什么形状、如何挂进管道、失败时怎么报告"是核心运行时必须定义清楚的
//! 契约面，否则下游没法写出能正确嵌入管道生命周期的编解码 handler。
//!
//! # 逻辑解析（How）
//! 原始来源里解码状态机是用深层嵌套的 try/catch 表达"还需要更多字节"还是
//! "解码出一个完整消息"还是"彻底失败"，这种异常驱动的控制流在 Rust 里很
//! 别扭也容易漏处理分支。这里改写成一个显式的三态结果
//! [`DecodeOutcome`]：`NeedMoreData(hint)` / `Decoded(message)` / `Error(e)`，
//! 调用方（`ByteToMessageDecoder` 的驱动循环）根据返回值决定是否继续喂数据、
//! 是否把已解码的消息转发进管道、还是把错误转换成 `exceptionCaught`。
//!
//! # 契约说明（What）
//! - `ByteToMessageDecoder::decode` 在单次累积缓冲区上被反复调用直到不再
//!   产生进展（既没有消费字节也没有产出消息），这与原始契约"被重复调用
//!   直到没有进展"一致。
//! - 累积缓冲区由调用方（管道内的解码适配 handler）持有，跨多次 `channel_read`
//!   之间保留未消费的残余字节。
use crate::buffer::ByteBuffer;
use crate::error::CoreError;

/// 单次解码尝试的结果。用显式状态机取代异常驱动的控制流。
pub enum DecodeOutcome<T> {
    /// 累积缓冲区里的数据还不足以解出一条完整消息；`hint` 是猜测还需要
    /// 的字节数，仅供分配提示使用，不是硬性约束。
    NeedMoreData { hint: usize },
    /// 成功解出一条消息，累积缓冲区里对应的字节已经被消费。
    Decoded(T),
    /// 解码失败，调用方应将其转换为一次 `exceptionCaught(DecoderException)`。
    Error(CoreError),
}

/// 把入站字节流累积并解码为类型化消息的适配器契约。
pub trait ByteToMessageDecoder: Send + Sync {
    type Message: Send + 'static;

    /// 在累积缓冲区上尝试解码一条消息。应当反复调用直到返回
    /// `NeedMoreData` 或 `Error`，或者一次调用既没有消费字节也没有产出
    /// 消息（"没有进展"，调用方据此停止本轮解码）。
    fn decode(&mut self, cumulation: &ByteBuffer) -> DecodeOutcome<Self::Message>;
}

/// 把类型化出站消息编码为字节的适配器契约。
pub trait MessageToByteEncoder: Send + Sync {
    type Message: Send + 'static;

    fn encode(&mut self, message: &Self::Message, out: &ByteBuffer) -> Result<(), CoreError>;
}

/// 双向消息转换器：入站把 `I` 转成其他表示，出站把 `O` 转回字节/消息。
pub trait MessageToMessageCodec: Send + Sync {
    type Inbound: Send + 'static;
    type Outbound: Send + 'static;
    type EncodedInbound: Send + 'static;
    type EncodedOutbound: Send + 'static;

    fn decode(&mut self, message: Self::Inbound) -> Result<Self::EncodedInbound, CoreError>;
    fn encode(&mut self, message: Self::Outbound) -> Result<Self::EncodedOutbound, CoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedWidthDecoder {
        width: usize,
    }

    impl ByteToMessageDecoder for FixedWidthDecoder {
        type Message = Vec<u8>;

        fn decode(&mut self, cumulation: &ByteBuffer) -> DecodeOutcome<Self::Message> {
            let available = match cumulation.len() {
                Ok(len) => len,
                Err(err) => return DecodeOutcome::Error(err),
            };
            if available < self.width {
                return DecodeOutcome::NeedMoreData {
                    hint: self.width - available,
                };
            }
            match cumulation.read_front(self.width) {
                Ok(bytes) => DecodeOutcome::Decoded(bytes.to_vec()),
                Err(err) => DecodeOutcome::Error(err),
            }
        }
    }

    #[test]
    fn decoder_waits_for_enough_bytes_then_decodes_exactly_once() {
        let allocator = std::sync::Arc::new(crate::buffer::PooledAllocator::new());
        let buf = allocator.allocate(16);
        buf.put_slice(b"ab").unwrap();
        let mut decoder = FixedWidthDecoder { width: 4 };
        match decoder.decode(&buf) {
            DecodeOutcome::NeedMoreData { hint } => assert_eq!(hint, 2),
            _ => panic!("expected NeedMoreData"),
        }
        buf.put_slice(b"cd").unwrap();
        match decoder.decode(&buf) {
            DecodeOutcome::Decoded(message) => assert_eq!(message, b"abcd"),
            _ => panic!("expected Decoded"),
        }
    }
}
