//! 链：缓冲中单个固定容量的内存节点。
//!
//! # 模块定位（Why）
//! - 链式结构让尾部追加与头部抽干都是摊还 O(1)，而不必像单块可变数组那样整体搬移；
//! - 每条链记录容量、头部错位（`misalign`）与有效长度（`off`），数据始终位于
//!   `[misalign, misalign + off)`，尾部 `[misalign + off, capacity)` 为空闲区。
//!
//! # 设计概要（How）
//! - 内存来源用 [`memory::ChainMemory`] 和类型表达；
//! - 钉住、不可变、待销毁等正交状态放在 [`ChainFlags`] 位掩码中；
//! - 新链容量按“请求长度 + 元数据开销”向上取整到不小于最小块的 2 的幂，
//!   让分配器的尺寸分级命中率更高，同时把元数据开销控制在块大小的小比例内。

pub(crate) mod memory;

use std::{
    fmt, mem, ptr, slice,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::{
    error::{BufferError, Result},
    segment::FileSegment,
};

use memory::{Block, ChainMemory, ExternalRef, SegmentSlice};

/// 新链的最小分配粒度（含元数据）。64 位平台元数据更大，因此取更大的块。
#[cfg(target_pointer_width = "64")]
pub const MIN_CHUNK: usize = 1024;
/// 新链的最小分配粒度（含元数据）。
#[cfg(not(target_pointer_width = "64"))]
pub const MIN_CHUNK: usize = 512;

/// 单条链可表示的最大长度。
pub const CHAIN_MAX: usize = isize::MAX as usize;

/// 追加写入时新链容量翻倍增长的上限。
pub const MAX_AUTO_CHAIN: usize = 4096;

/// 单链扩容时愿意复制的最大已有字节数。
pub const MAX_TO_COPY_IN_EXPAND: usize = 4096;

/// 重排（把数据搬回链首）时允许移动的最大字节数。
pub const MAX_TO_REALIGN_IN_EXPAND: usize = 2048;

/// 单次向量读使用的描述符数量。
pub const NUM_READ_IOVEC: usize = 4;

/// 单次向量写使用的描述符数量上限。
pub const NUM_WRITE_IOVEC: usize = 128;

/// `read_from` 单次读取的默认上限。
pub const DEFAULT_MAX_READ: usize = 4096;

/// 每条链计入分配尺寸的元数据开销。
pub(crate) const CHAIN_OVERHEAD: usize = mem::size_of::<Chain>();

static NEXT_CHAIN_ID: AtomicU64 = AtomicU64::new(1);

/// 全局唯一的链标识；钉住令牌凭它在链移动、抽干后重新找到目标链。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ChainId(u64);

impl ChainId {
    fn next() -> Self {
        Self(NEXT_CHAIN_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn get(self) -> u64 {
        self.0
    }
}

/// 与内存来源正交的链状态位。
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ChainFlags(u8);

impl ChainFlags {
    /// 空状态。
    pub const EMPTY: Self = Self(0);
    /// 内存不可写：外部引用、文件段、别名，以及被别名过的自有链。
    pub const IMMUTABLE: Self = Self(0x08);
    /// 被钉住用于读入：尾部空闲区正被外部 I/O 写入。
    pub const PINNED_R: Self = Self(0x10);
    /// 被钉住用于写出：数据窗口正被外部 I/O 读取。
    pub const PINNED_W: Self = Self(0x20);
    /// 已从缓冲摘除但仍被钉住，最后一个钉住标志清除时释放。
    pub const DANGLING: Self = Self(0x40);

    const PINNED_ANY: u8 = Self::PINNED_R.0 | Self::PINNED_W.0;

    /// 是否包含 `other` 的全部位。
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// 原始位值。
    pub const fn bits(self) -> u8 {
        self.0
    }

    pub(crate) fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub(crate) fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub(crate) const fn is_pinned(self) -> bool {
        self.0 & Self::PINNED_ANY != 0
    }
}

impl fmt::Debug for ChainFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(ChainFlags, &str); 4] = [
            (ChainFlags::IMMUTABLE, "IMMUTABLE"),
            (ChainFlags::PINNED_R, "PINNED_R"),
            (ChainFlags::PINNED_W, "PINNED_W"),
            (ChainFlags::DANGLING, "DANGLING"),
        ];
        let mut set = f.debug_set();
        for (flag, name) in NAMES {
            if self.contains(flag) {
                set.entry(&format_args!("{name}"));
            }
        }
        set.finish()
    }
}

/// 链内存来源的公开分类。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChainKind {
    /// 缓冲自有分配。
    Owned,
    /// 外部内存引用。
    Reference,
    /// 文件段（映射或已加载）。
    FileSegment,
    /// 仅传输的文件段：写出时直接从文件拷贝到目标。
    TransferOnly,
    /// 其他缓冲链的组播别名。
    Multicast,
}

/// 单条链的诊断快照。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainInfo {
    pub kind: ChainKind,
    pub capacity: usize,
    pub misalign: usize,
    pub len: usize,
    pub refcnt: usize,
    pub flags: ChainFlags,
    pub has_memory: bool,
    /// 别名链的源缓冲标识。
    pub alias_source: Option<u64>,
    /// 源缓冲是否仍有存活句柄。
    pub alias_source_alive: bool,
}

/// 计算承载 `size` 字节所需的链容量。
///
/// - 超过 `CHAIN_MAX - CHAIN_OVERHEAD` 时直接返回溢出错误，不尝试分配；
/// - 小于 `CHAIN_MAX / 2` 时按 2 的幂向上取整，起点为 `min_chunk`；
/// - 返回值已扣除元数据开销。
pub(crate) fn capacity_for(size: usize, min_chunk: usize) -> Result<usize> {
    let max = CHAIN_MAX - CHAIN_OVERHEAD;
    if size > max {
        return Err(BufferError::Overflow {
            requested: size,
            max,
        });
    }
    let wanted = size + CHAIN_OVERHEAD;
    let to_alloc = if wanted < CHAIN_MAX / 2 {
        let mut to_alloc = min_chunk;
        while to_alloc < wanted {
            to_alloc <<= 1;
        }
        to_alloc
    } else {
        wanted
    };
    Ok(to_alloc - CHAIN_OVERHEAD)
}

/// 单条链。
pub(crate) struct Chain {
    pub(crate) id: ChainId,
    pub(crate) capacity: usize,
    pub(crate) misalign: usize,
    pub(crate) off: usize,
    pub(crate) flags: ChainFlags,
    pub(crate) memory: ChainMemory,
}

impl Chain {
    /// 分配一条至少能容纳 `size` 字节的自有链。
    pub(crate) fn owned(size: usize, min_chunk: usize) -> Result<Self> {
        let capacity = capacity_for(size, min_chunk)?;
        let block = Block::allocate(capacity)?;
        tracing::trace!(requested = size, capacity, "分配新链");
        Ok(Self {
            id: ChainId::next(),
            capacity,
            misalign: 0,
            off: 0,
            flags: ChainFlags::EMPTY,
            memory: ChainMemory::Owned(Arc::new(block)),
        })
    }

    /// 包装外部内存引用，整段即为有效数据。
    pub(crate) fn reference(external: ExternalRef) -> Self {
        let len = external.len();
        Self {
            id: ChainId::next(),
            capacity: len,
            misalign: 0,
            off: len,
            flags: ChainFlags::IMMUTABLE,
            memory: ChainMemory::Reference(Arc::new(external)),
        }
    }

    /// 引用文件段的 `[offset, offset + len)`。
    pub(crate) fn segment(
        segment: FileSegment,
        offset: usize,
        len: usize,
        transfer_only: bool,
    ) -> Self {
        Self {
            id: ChainId::next(),
            capacity: segment.len(),
            misalign: offset,
            off: len,
            flags: ChainFlags::IMMUTABLE,
            memory: ChainMemory::Segment(SegmentSlice {
                segment,
                transfer_only,
            }),
        }
    }

    /// 以共享内存构造新链，复用当前链的窗口起点，长度截断为 `len`。
    pub(crate) fn with_shared_memory(&self, memory: ChainMemory, len: usize) -> Self {
        Self {
            id: ChainId::next(),
            capacity: self.capacity,
            misalign: self.misalign,
            off: len,
            flags: ChainFlags::IMMUTABLE,
            memory,
        }
    }

    pub(crate) fn kind(&self) -> ChainKind {
        match &self.memory {
            ChainMemory::Owned(_) => ChainKind::Owned,
            ChainMemory::Reference(_) => ChainKind::Reference,
            ChainMemory::Segment(slice) if slice.transfer_only => ChainKind::TransferOnly,
            ChainMemory::Segment(_) => ChainKind::FileSegment,
            ChainMemory::Multicast(_) => ChainKind::Multicast,
        }
    }

    /// 只有未被标记不可变的自有链可以写入。
    pub(crate) fn is_writable(&self) -> bool {
        matches!(self.memory, ChainMemory::Owned(_)) && !self.flags.contains(ChainFlags::IMMUTABLE)
    }

    pub(crate) fn is_transfer_only(&self) -> bool {
        matches!(&self.memory, ChainMemory::Segment(slice) if slice.transfer_only)
    }

    pub(crate) fn is_pinned(&self) -> bool {
        self.flags.is_pinned()
    }

    pub(crate) fn is_pinned_r(&self) -> bool {
        self.flags.contains(ChainFlags::PINNED_R)
    }

    /// 尾部空闲字节数；不可写链恒为 0。
    pub(crate) fn space_len(&self) -> usize {
        if self.is_writable() {
            self.capacity - self.misalign - self.off
        } else {
            0
        }
    }

    fn block_ptr(&self) -> Option<*mut u8> {
        match &self.memory {
            ChainMemory::Owned(block) => Some(block.as_ptr()),
            _ => None,
        }
    }

    /// 尾部空闲区起始地址；非自有链返回空指针。
    pub(crate) fn space_ptr(&self) -> *mut u8 {
        match self.block_ptr() {
            // SAFETY: `misalign + off <= capacity`，偏移不越过分配末尾。
            Some(base) => unsafe { base.add(self.misalign + self.off) },
            None => ptr::null_mut(),
        }
    }

    /// 有效数据窗口。
    pub(crate) fn data(&self) -> Result<&[u8]> {
        if self.off == 0 {
            return Ok(&[]);
        }
        let base = self.memory.base_ptr()?;
        // SAFETY: 窗口 `[misalign, misalign + off)` 位于内存范围内；
        // 只读视图期间，核心持锁或钉住协议保证该窗口不被改写。
        Ok(unsafe { slice::from_raw_parts(base.add(self.misalign), self.off) })
    }

    /// 把 `data` 写入尾部空闲区。调用方保证 `data.len() <= space_len()`。
    pub(crate) fn append(&mut self, data: &[u8]) {
        debug_assert!(data.len() <= self.space_len());
        if data.is_empty() {
            return;
        }
        let dst = self.space_ptr();
        // SAFETY: 目标位于可写自有链的空闲区，与 `data` 不重叠。
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        self.off += data.len();
    }

    /// 把 `data` 写入头部错位区，紧贴现有数据之前。调用方保证 `data.len() <= misalign`。
    pub(crate) fn prepend(&mut self, data: &[u8]) {
        debug_assert!(self.is_writable() && data.len() <= self.misalign);
        let Some(base) = self.block_ptr() else {
            return;
        };
        let start = self.misalign - data.len();
        // SAFETY: `[start, misalign)` 位于自有链内，且不在任何数据窗口或钉住区域内。
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), base.add(start), data.len()) };
        self.misalign = start;
        self.off += data.len();
    }

    /// 判断是否值得把数据搬回链首来腾出 `datlen` 字节。
    pub(crate) fn should_realign(&self, datlen: usize, max_to_realign: usize) -> bool {
        self.capacity - self.off >= datlen
            && self.off < self.capacity / 2
            && self.off <= max_to_realign
    }

    /// 把数据搬到链首，`misalign` 归零。钉住或不可写的链保持不动。
    pub(crate) fn align(&mut self) {
        if !self.is_writable() || self.is_pinned() || self.misalign == 0 {
            return;
        }
        if let Some(base) = self.block_ptr() {
            // SAFETY: 源与目标都在同一分配内，`ptr::copy` 处理重叠。
            unsafe { ptr::copy(base.add(self.misalign), base, self.off) };
        }
        self.misalign = 0;
    }

    /// 自有链贡献的容量，用于统计。
    pub(crate) fn owned_capacity(&self) -> usize {
        match &self.memory {
            ChainMemory::Owned(block) => block.capacity(),
            _ => 0,
        }
    }

    pub(crate) fn info(&self) -> ChainInfo {
        let (alias_source, alias_source_alive) = match &self.memory {
            ChainMemory::Multicast(alias) => {
                (Some(alias.source_id), alias.source.strong_count() > 0)
            }
            _ => (None, false),
        };
        ChainInfo {
            kind: self.kind(),
            capacity: self.capacity,
            misalign: self.misalign,
            len: self.off,
            refcnt: self.memory.refcnt(),
            flags: self.flags,
            has_memory: self.memory.has_memory(),
            alias_source,
            alias_source_alive,
        }
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("id", &self.id.get())
            .field("kind", &self.kind())
            .field("capacity", &self.capacity)
            .field("misalign", &self.misalign)
            .field("off", &self.off)
            .field("flags", &self.flags)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_rounds_to_power_of_two_including_overhead() {
        let capacity = capacity_for(1, MIN_CHUNK).expect("小请求");
        assert_eq!(capacity + CHAIN_OVERHEAD, MIN_CHUNK);

        let capacity = capacity_for(MIN_CHUNK, MIN_CHUNK).expect("刚好越过最小块");
        assert_eq!(capacity + CHAIN_OVERHEAD, MIN_CHUNK * 2);
    }

    #[test]
    fn capacity_rejects_overflow_before_allocation() {
        let err = capacity_for(CHAIN_MAX, MIN_CHUNK).expect_err("超过上限");
        assert!(matches!(err, BufferError::Overflow { .. }));
    }

    #[test]
    fn append_then_align_moves_data_to_front() {
        let mut chain = Chain::owned(16, MIN_CHUNK).expect("分配");
        chain.append(b"abcdef");
        chain.misalign += 2;
        chain.off -= 2;
        chain.align();
        assert_eq!(chain.misalign, 0);
        assert_eq!(chain.data().expect("读取"), b"cdef");
    }

    #[test]
    fn pinned_chain_is_never_realigned() {
        let mut chain = Chain::owned(16, MIN_CHUNK).expect("分配");
        chain.append(b"xyz");
        chain.misalign += 1;
        chain.off -= 1;
        chain.flags.insert(ChainFlags::PINNED_W);
        chain.align();
        assert_eq!(chain.misalign, 1);
    }

    #[test]
    fn reference_chain_runs_cleanup_once() {
        use std::sync::atomic::AtomicUsize;
        let hits = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&hits);
        let chain = Chain::reference(ExternalRef::new(vec![1u8, 2, 3], move |_| {
            observed.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(chain.space_len(), 0);
        let shared = chain.memory.share();
        drop(chain);
        assert_eq!(hits.load(Ordering::SeqCst), 0, "仍有共享持有者");
        drop(shared);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
