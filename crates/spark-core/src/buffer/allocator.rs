//! 池化分配器：按固定 chunk 规格复用底层存储。
//!
//! # 逻辑解析（How）
//! 维护一个"规格 -> 空闲 chunk 列表"的映射。分配时把请求容量向上取整到
//! 最近的规格桶，命中空闲列表就复用，否则现场分配一块新的 `BytesMut`。
//! 回收路径由 [`crate::buffer::ChunkRecycler`] 驱动，在 `ByteBuffer` 引用
//! 计数归零时被动调用，调用方无需显式"归还"。
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;

use super::{ByteBuffer, ChunkRecycler, DEFAULT_MAX_CAPACITY};

const DEFAULT_BUCKET_SIZES: [usize; 5] = [256, 1024, 4096, 16384, 65536];

fn bucket_for(requested: usize) -> usize {
    DEFAULT_BUCKET_SIZES
        .iter()
        .copied()
        .find(|&size| size >= requested)
        .unwrap_or_else(|| requested.next_power_of_two().max(requested))
}

#[derive(Debug, Default)]
struct FreeLists {
    buckets: Vec<(usize, Vec<BytesMut>)>,
}

impl FreeLists {
    fn pop(&mut self, bucket: usize) -> Option<BytesMut> {
        self.buckets
            .iter_mut()
            .find(|(size, _)| *size == bucket)
            .and_then(|(_, list)| list.pop())
    }

    fn push(&mut self, bucket: usize, mut chunk: BytesMut) {
        chunk.clear();
        match self.buckets.iter_mut().find(|(size, _)| *size == bucket) {
            Some((_, list)) => list.push(chunk),
            None => self.buckets.push((bucket, vec![chunk])),
        }
    }
}

/// 固定规格桶的池化分配器，供事件循环的读写路径申请/归还缓冲区。
#[derive(Debug)]
pub struct PooledAllocator {
    free: Mutex<FreeLists>,
}

impl Default for PooledAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PooledAllocator {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(FreeLists::default()),
        }
    }

    /// 分配一块至少能容纳 `capacity` 字节的缓冲区，优先复用空闲列表。
    /// `maxCapacity` 取桶规格与默认上限中较大者，保证刚分配出来的 chunk
    /// 自身不会立刻被当作"已经到顶"。
    pub fn allocate(self: &Arc<Self>, capacity: usize) -> ByteBuffer {
        let bucket = bucket_for(capacity);
        let chunk = self
            .free
            .lock()
            .pop(bucket)
            .unwrap_or_else(|| BytesMut::with_capacity(bucket));
        let max_capacity = bucket.max(DEFAULT_MAX_CAPACITY);
        ByteBuffer::from_bytes_mut(chunk, Some(self.clone() as Arc<dyn ChunkRecycler>), max_capacity)
    }

    /// 当前每个规格桶里空闲 chunk 的数量，用于测试与可观测性导出。
    pub fn free_count(&self, capacity: usize) -> usize {
        let bucket = bucket_for(capacity);
        self.free
            .lock()
            .buckets
            .iter()
            .find(|(size, _)| *size == bucket)
            .map(|(_, list)| list.len())
            .unwrap_or(0)
    }
}

impl ChunkRecycler for PooledAllocator {
    fn recycle(&self, chunk: BytesMut) {
        let bucket = bucket_for(chunk.capacity());
        self.free.lock().push(bucket, chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_chunk_is_reused_by_next_allocation() {
        let allocator = Arc::new(PooledAllocator::new());
        let buf = allocator.allocate(100);
        assert_eq!(allocator.free_count(100), 0);
        buf.release().unwrap();
        assert_eq!(allocator.free_count(100), 1);
        let _buf2 = allocator.allocate(100);
        assert_eq!(allocator.free_count(100), 0);
    }

    #[test]
    fn bucket_rounds_up_to_nearest_standard_size() {
        assert_eq!(bucket_for(1), 256);
        assert_eq!(bucket_for(256), 256);
        assert_eq!(bucket_for(257), 1024);
        assert_eq!(bucket_for(100_000), 131_072);
    }
}
