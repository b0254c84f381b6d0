//! 引用计数字节缓冲区与池化分配器。
//!
//! # 设计背景（Why）
//! 反应堆运行时的读写路径需要避免每次 I/O 都触发一次堆分配：连接数一多，
//! `malloc`/`free` 的抖动会直接吃掉吞吐。做法是预先分配定长 `chunk`，用
//! 手动引用计数（见 [`crate::refcount`]）追踪缓冲区生命周期，在计数归零时
//! 把底层存储交还给分配器复用，而不是交给全局堆。
//!
//! # 逻辑解析（How）
//! [`ByteBuffer`] 组合了一个 [`crate::refcount::RefCounted`] 外壳和一段
//! `bytes::BytesMut`/`bytes::Bytes` 存储。分配器 [`PooledAllocator`] 维护一个
//! 按 chunk 大小分桶的空闲列表；`allocate()` 优先复用空闲 chunk，否则现场
//! `BytesMut::with_capacity` 分配一块新的。
//!
//! 读指针在这个实现里恒为 0：`read_front`/`read_bytes`/`advance` 消费数据时
//! 直接把已读前缀从存储里物理裁掉（`BytesMut::split_to`/`advance`），而不是
//! 保留一段"已读但未回收"的间隙。`writerIndex` 因此就是存储当前的长度，
//! `capacity` 是底层分配的总容量，`maxCapacity` 是 `ensureWritable` 允许
//! 增长到的上限——四者满足 `0 = readerIndex ≤ writerIndex ≤ capacity ≤
//! maxCapacity`。
//!
//! # 契约说明（What）
//! - 新分配的缓冲区引用计数为 1，调用方拥有这一份；`retain()` 会返回一个
//!   引用计数 +1 后的新句柄（两者共享同一块底层存储）。
//! - 对一个引用计数已经归零的 `ByteBuffer` 调用任何读写方法都会返回
//!   `IllegalReferenceCount` 错误。
//! - 写入超过 `maxCapacity` 的内容会从 `ensure_writable`/`put_slice` 返回
//!   `IndexOutOfBounds`，而不是无限增长底层分配。
//! - `slice`/`duplicate` 返回的是独立生命周期的新句柄（不与源共享引用计数），
//!   `retained_duplicate` 则在此基础上对返回的句柄多做一次 `retain`，
//!   调用方需要比普通 `duplicate()` 多释放一次。
pub mod allocator;

use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

use crate::error::{CoreError, CoreResult};
use crate::refcount::{Reclaimable, RefCounted};

pub use allocator::PooledAllocator;

/// 单个缓冲区允许增长到的默认上限，避免一次异常大的写入把池化 chunk
/// 无限撑大。
pub const DEFAULT_MAX_CAPACITY: usize = 16 * 1024 * 1024;

/// 归还回调：把底层存储交还给某个分配器的空闲列表。
pub(crate) trait ChunkRecycler: fmt::Debug + Send + Sync {
    fn recycle(&self, chunk: BytesMut);
}

#[derive(Debug)]
struct BufferState {
    storage: Mutex<Storage>,
    recycler: Option<Arc<dyn ChunkRecycler>>,
    max_capacity: usize,
}

#[derive(Debug)]
enum Storage {
    Writable(BytesMut),
    ReadOnly(Bytes),
    /// 归还之后的占位态，理论上仅在 `reclaim()` 执行期间短暂存在。
    Empty,
}

impl Reclaimable for BufferState {
    fn reclaim(&self) {
        let mut guard = self.storage.lock();
        let taken = std::mem::replace(&mut *guard, Storage::Empty);
        if let Some(recycler) = &self.recycler {
            let chunk = match taken {
                Storage::Writable(buf) => buf,
                Storage::ReadOnly(bytes) => bytes.try_into_mut().unwrap_or_default(),
                Storage::Empty => BytesMut::new(),
            };
            recycler.recycle(chunk);
        }
    }
}

/// 在已经持有 `storage` 锁的前提下，把可写存储的容量增长到能再容纳
/// `additional` 字节，超出 `max_capacity` 返回 `IndexOutOfBounds`；
/// 只读/已回收存储上的任何非零增长请求都被拒绝。
fn grow_locked(storage: &mut Storage, max_capacity: usize, additional: usize) -> CoreResult<()> {
    if additional == 0 {
        return Ok(());
    }
    match storage {
        Storage::Writable(buf) => {
            let needed = buf.len() + additional;
            if needed > max_capacity {
                return Err(CoreError::index_out_of_bounds(needed, max_capacity));
            }
            if buf.capacity() < needed {
                buf.reserve(needed - buf.len());
            }
            Ok(())
        }
        Storage::ReadOnly(_) => Err(CoreError::pipeline_misuse(
            crate::error::PipelineMisuseKind::MutationAfterClose,
        )),
        Storage::Empty => Err(CoreError::illegal_reference_count(
            crate::error::RefCountViolation::AccessAfterRelease,
        )),
    }
}

/// 引用计数字节缓冲区，是管道读写路径上流转的基本数据单元。
///
/// 刻意不派生 `Clone`：获得第二份句柄必须经过 [`ByteBuffer::retain`]，
/// 这样每一份存活的句柄都对应引用计数里实打实的一次 `retain`，
/// 不会出现"结构体复制了但计数没涨"的隐性泄漏/双重释放风险。
#[derive(Debug)]
pub struct ByteBuffer {
    rc: Arc<RefCounted<BufferState>>,
}

impl ByteBuffer {
    fn from_bytes_mut(buf: BytesMut, recycler: Option<Arc<dyn ChunkRecycler>>, max_capacity: usize) -> Self {
        Self {
            rc: RefCounted::new(BufferState {
                storage: Mutex::new(Storage::Writable(buf)),
                recycler,
                max_capacity,
            }),
        }
    }

    /// 从一段只读数据构造缓冲区，常用于测试或非池化场景。`maxCapacity`
    /// 固定为数据本身的长度：只读存储不支持增长。
    pub fn from_static(data: &'static [u8]) -> Self {
        Self {
            rc: RefCounted::new(BufferState {
                storage: Mutex::new(Storage::ReadOnly(Bytes::from_static(data))),
                recycler: None,
                max_capacity: data.len(),
            }),
        }
    }

    /// 引用计数 +1，返回共享同一块底层存储的新句柄。
    pub fn retain(&self) -> CoreResult<Self> {
        self.rc.retain()?;
        Ok(Self {
            rc: self.rc.clone(),
        })
    }

    /// 引用计数 -1，归零时触发底层存储回收。
    pub fn release(&self) -> CoreResult<usize> {
        self.rc.release()
    }

    pub fn ref_count(&self) -> usize {
        self.rc.ref_count()
    }

    pub fn is_released(&self) -> bool {
        self.rc.is_released()
    }

    pub fn len(&self) -> CoreResult<usize> {
        self.rc.guard_access()?;
        let guard = self.rc.inner().storage.lock();
        Ok(match &*guard {
            Storage::Writable(buf) => buf.len(),
            Storage::ReadOnly(bytes) => bytes.len(),
            Storage::Empty => 0,
        })
    }

    pub fn is_empty(&self) -> CoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// 读指针，这个实现里恒为 0（消费即物理裁剪，见模块文档）。
    pub fn reader_index(&self) -> CoreResult<usize> {
        self.rc.guard_access()?;
        Ok(0)
    }

    /// 写指针，等于当前已写入（即已读可见）的字节数。
    pub fn writer_index(&self) -> CoreResult<usize> {
        self.len()
    }

    /// 底层存储当前的总容量（不是 `maxCapacity`，是已经实际分配的大小）。
    pub fn capacity(&self) -> CoreResult<usize> {
        self.rc.guard_access()?;
        let guard = self.rc.inner().storage.lock();
        Ok(match &*guard {
            Storage::Writable(buf) => buf.capacity(),
            Storage::ReadOnly(bytes) => bytes.len(),
            Storage::Empty => 0,
        })
    }

    /// `ensure_writable` 允许把 `capacity` 增长到的上限。
    pub fn max_capacity(&self) -> CoreResult<usize> {
        self.rc.guard_access()?;
        Ok(self.rc.inner().max_capacity)
    }

    /// `capacity() - writer_index()`：还能再写入多少字节而不触发增长。
    pub fn writable_bytes(&self) -> CoreResult<usize> {
        let capacity = self.capacity()?;
        let writer_index = self.writer_index()?;
        Ok(capacity.saturating_sub(writer_index))
    }

    /// 保证还能再写入至少 `additional` 字节：必要时把底层存储增长到
    /// 能容纳这么多数据，增长后仍然超过 `maxCapacity` 则返回
    /// `IndexOutOfBounds`，不改变任何状态。
    pub fn ensure_writable(&self, additional: usize) -> CoreResult<()> {
        self.rc.guard_access()?;
        let max_capacity = self.rc.inner().max_capacity;
        let mut guard = self.rc.inner().storage.lock();
        grow_locked(&mut guard, max_capacity, additional)
    }

    /// 复制出缓冲区当前全部可读内容，不消耗引用计数也不移动读指针。
    pub fn to_vec(&self) -> CoreResult<Vec<u8>> {
        self.rc.guard_access()?;
        let guard = self.rc.inner().storage.lock();
        Ok(match &*guard {
            Storage::Writable(buf) => buf.to_vec(),
            Storage::ReadOnly(bytes) => bytes.to_vec(),
            Storage::Empty => Vec::new(),
        })
    }

    /// 向缓冲区末尾追加数据，要求缓冲区处于可写态且未超过 `maxCapacity`。
    pub fn put_slice(&self, data: &[u8]) -> CoreResult<()> {
        self.rc.guard_access()?;
        let max_capacity = self.rc.inner().max_capacity;
        let mut guard = self.rc.inner().storage.lock();
        grow_locked(&mut guard, max_capacity, data.len())?;
        match &mut *guard {
            Storage::Writable(buf) => {
                buf.put_slice(data);
                Ok(())
            }
            Storage::ReadOnly(_) | Storage::Empty => {
                unreachable!("grow_locked already rejected non-writable storage")
            }
        }
    }

    /// `writeBytes` 的具名别名，行为与 `put_slice` 完全一致。
    pub fn write_bytes(&self, src: &[u8]) -> CoreResult<()> {
        self.put_slice(src)
    }

    /// 从缓冲区前部取出至多 `max_len` 字节的只读视图，推进读指针。
    pub fn read_front(&self, max_len: usize) -> CoreResult<Bytes> {
        self.rc.guard_access()?;
        let mut guard = self.rc.inner().storage.lock();
        match &mut *guard {
            Storage::Writable(buf) => {
                let n = max_len.min(buf.len());
                Ok(buf.split_to(n).freeze())
            }
            Storage::ReadOnly(bytes) => {
                let n = max_len.min(bytes.len());
                Ok(bytes.split_to(n))
            }
            Storage::Empty => Ok(Bytes::new()),
        }
    }

    /// 把至多 `dest.len()` 字节的可读数据拷贝进调用方提供的缓冲区，
    /// 推进读指针，返回实际读取的字节数（`readBytes` 的具名实现）。
    pub fn read_bytes(&self, dest: &mut [u8]) -> CoreResult<usize> {
        let data = self.read_front(dest.len())?;
        dest[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    /// 丢弃缓冲区前 `n` 字节而不读取，等价于一次性 `advance`。
    pub fn advance(&self, n: usize) -> CoreResult<()> {
        self.rc.guard_access()?;
        let mut guard = self.rc.inner().storage.lock();
        match &mut *guard {
            Storage::Writable(buf) => {
                buf.advance(n.min(buf.len()));
                Ok(())
            }
            Storage::ReadOnly(bytes) => {
                bytes.advance(n.min(bytes.len()));
                Ok(())
            }
            Storage::Empty => Ok(()),
        }
    }

    /// 从当前可读内容里零拷贝（只读存储时）或单次拷贝（仍处于可写态时）
    /// 取出 `[offset, offset+len)` 的视图，不消费/不影响原缓冲区的读写
    /// 指针。返回的是一个独立生命周期的新句柄：它不与源共享引用计数，
    /// `release()` 它不会影响源缓冲区，反之亦然。越界返回
    /// `IndexOutOfBounds`。
    pub fn slice(&self, offset: usize, len: usize) -> CoreResult<Self> {
        self.rc.guard_access()?;
        let guard = self.rc.inner().storage.lock();
        let available = match &*guard {
            Storage::Writable(buf) => buf.len(),
            Storage::ReadOnly(bytes) => bytes.len(),
            Storage::Empty => 0,
        };
        let end = offset
            .checked_add(len)
            .ok_or_else(|| CoreError::index_out_of_bounds(usize::MAX, available))?;
        if end > available {
            return Err(CoreError::index_out_of_bounds(end, available));
        }
        let sliced = match &*guard {
            Storage::Writable(buf) => Bytes::copy_from_slice(&buf[offset..end]),
            Storage::ReadOnly(bytes) => bytes.slice(offset..end),
            Storage::Empty => Bytes::new(),
        };
        drop(guard);
        Ok(Self {
            rc: RefCounted::new(BufferState {
                storage: Mutex::new(Storage::ReadOnly(sliced)),
                recycler: None,
                max_capacity: len,
            }),
        })
    }

    /// 对整个当前可读区间取一次快照，相当于 `slice(0, len)`。
    pub fn duplicate(&self) -> CoreResult<Self> {
        let len = self.len()?;
        self.slice(0, len)
    }

    /// `duplicate()` 之后立即对返回句柄 `retain()` 一次：调用方需要比
    /// 普通 `duplicate()` 多释放一次。
    pub fn retained_duplicate(&self) -> CoreResult<Self> {
        let duplicate = self.duplicate()?;
        duplicate.rc.retain()?;
        Ok(duplicate)
    }

    fn read_exact_front(&self, n: usize) -> CoreResult<Bytes> {
        let available = self.len()?;
        if n > available {
            return Err(CoreError::index_out_of_bounds(n, available));
        }
        self.read_front(n)
    }

    pub fn read_u16_be(&self) -> CoreResult<u16> {
        Ok(self.read_exact_front(2)?.get_u16())
    }

    pub fn read_u16_le(&self) -> CoreResult<u16> {
        Ok(self.read_exact_front(2)?.get_u16_le())
    }

    pub fn read_u32_be(&self) -> CoreResult<u32> {
        Ok(self.read_exact_front(4)?.get_u32())
    }

    pub fn read_u32_le(&self) -> CoreResult<u32> {
        Ok(self.read_exact_front(4)?.get_u32_le())
    }

    pub fn read_u64_be(&self) -> CoreResult<u64> {
        Ok(self.read_exact_front(8)?.get_u64())
    }

    pub fn read_u64_le(&self) -> CoreResult<u64> {
        Ok(self.read_exact_front(8)?.get_u64_le())
    }

    pub fn write_u16_be(&self, value: u16) -> CoreResult<()> {
        self.put_slice(&value.to_be_bytes())
    }

    pub fn write_u16_le(&self, value: u16) -> CoreResult<()> {
        self.put_slice(&value.to_le_bytes())
    }

    pub fn write_u32_be(&self, value: u32) -> CoreResult<()> {
        self.put_slice(&value.to_be_bytes())
    }

    pub fn write_u32_le(&self, value: u32) -> CoreResult<()> {
        self.put_slice(&value.to_le_bytes())
    }

    pub fn write_u64_be(&self, value: u64) -> CoreResult<()> {
        self.put_slice(&value.to_be_bytes())
    }

    pub fn write_u64_le(&self, value: u64) -> CoreResult<()> {
        self.put_slice(&value.to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retain_shares_storage_and_release_is_independent() {
        let buf = ByteBuffer::from_bytes_mut(BytesMut::from(&b"hello"[..]), None, 64);
        let handle2 = buf.retain().unwrap();
        assert_eq!(buf.ref_count(), 2);
        buf.release().unwrap();
        assert_eq!(handle2.len().unwrap(), 5);
        handle2.release().unwrap();
        assert!(handle2.is_released());
    }

    #[test]
    fn access_after_release_is_illegal() {
        let buf = ByteBuffer::from_bytes_mut(BytesMut::from(&b"x"[..]), None, 64);
        buf.release().unwrap();
        assert!(buf.len().is_err());
        assert!(buf.put_slice(b"y").is_err());
    }

    #[test]
    fn read_front_advances_and_shrinks_buffer() {
        let buf = ByteBuffer::from_bytes_mut(BytesMut::from(&b"abcdef"[..]), None, 64);
        let head = buf.read_front(3).unwrap();
        assert_eq!(&head[..], b"abc");
        assert_eq!(buf.len().unwrap(), 3);
    }

    #[test]
    fn indices_and_capacity_obey_the_invariant() {
        let buf = ByteBuffer::from_bytes_mut(BytesMut::from(&b"abcdef"[..]), None, 64);
        assert_eq!(buf.reader_index().unwrap(), 0);
        assert_eq!(buf.writer_index().unwrap(), 6);
        assert_eq!(buf.capacity().unwrap(), 6);
        assert_eq!(buf.max_capacity().unwrap(), 64);
        assert_eq!(buf.writable_bytes().unwrap(), 58);
    }

    #[test]
    fn ensure_writable_grows_up_to_max_capacity_then_fails() {
        let buf = ByteBuffer::from_bytes_mut(BytesMut::from(&b"ab"[..]), None, 4);
        buf.ensure_writable(2).unwrap();
        assert!(buf.capacity().unwrap() >= 4);
        let err = buf.ensure_writable(3).unwrap_err();
        assert_eq!(err.code(), crate::error::codes::INDEX_OUT_OF_BOUNDS);
    }

    #[test]
    fn put_slice_beyond_max_capacity_is_index_out_of_bounds() {
        let buf = ByteBuffer::from_bytes_mut(BytesMut::from(&b"ab"[..]), None, 3);
        let err = buf.put_slice(b"xy").unwrap_err();
        assert_eq!(err.code(), crate::error::codes::INDEX_OUT_OF_BOUNDS);
        // 失败的写入不改变已有内容。
        assert_eq!(buf.len().unwrap(), 2);
    }

    #[test]
    fn slice_is_a_bounded_independent_view() {
        let buf = ByteBuffer::from_bytes_mut(BytesMut::from(&b"abcdef"[..]), None, 64);
        let view = buf.slice(1, 3).unwrap();
        assert_eq!(view.to_vec().unwrap(), b"bcd");
        assert_eq!(view.ref_count(), 1);
        assert_eq!(buf.ref_count(), 1);
        view.release().unwrap();
        assert_eq!(buf.len().unwrap(), 6);
        assert!(buf.slice(5, 10).is_err());
    }

    #[test]
    fn duplicate_snapshots_current_readable_bytes() {
        let buf = ByteBuffer::from_bytes_mut(BytesMut::from(&b"hello"[..]), None, 64);
        let dup = buf.duplicate().unwrap();
        assert_eq!(dup.to_vec().unwrap(), b"hello");
        buf.release().unwrap();
        assert_eq!(dup.to_vec().unwrap(), b"hello");
        dup.release().unwrap();
    }

    #[test]
    fn retained_duplicate_needs_an_extra_release() {
        let buf = ByteBuffer::from_bytes_mut(BytesMut::from(&b"hi"[..]), None, 64);
        let dup = buf.retained_duplicate().unwrap();
        assert_eq!(dup.ref_count(), 2);
        dup.release().unwrap();
        assert!(!dup.is_released());
        dup.release().unwrap();
        assert!(dup.is_released());
    }

    #[test]
    fn endian_accessors_round_trip() {
        let buf = ByteBuffer::from_bytes_mut(BytesMut::new(), None, 64);
        buf.write_u16_be(0x0102).unwrap();
        buf.write_u32_le(0x0304_0506).unwrap();
        assert_eq!(buf.read_u16_be().unwrap(), 0x0102);
        assert_eq!(buf.read_u32_le().unwrap(), 0x0304_0506);
    }

    #[test]
    fn read_bytes_copies_into_caller_buffer_and_advances() {
        let buf = ByteBuffer::from_bytes_mut(BytesMut::from(&b"abcdef"[..]), None, 64);
        let mut dest = [0u8; 4];
        let n = buf.read_bytes(&mut dest).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&dest, b"abcd");
        assert_eq!(buf.len().unwrap(), 2);
    }
}
