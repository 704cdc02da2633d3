//! 链的内存来源。
//!
//! # 设计背景（Why）
//! - 链的内存可能来自四种途径：自有分配、外部引用、文件段、其他缓冲链的别名；
//! - 不同来源决定了“能否写入尾部空闲区”“能否搬移数据”“何时释放”三件事，
//!   因此来源用显式的和类型 [`ChainMemory`] 表达，而钉住/不可变等正交状态留在位掩码里。
//!
//! # 契约说明（What）
//! - 所有来源都通过引用计数共享底层内存；最后一个持有者释放时才真正回收或触发清理回调；
//! - 裸指针只在持有对应 `Arc` 的前提下解引用，调用方（链与缓冲核心）负责保证读写区间互不重叠。

use std::{ptr, ptr::NonNull, sync::Arc, sync::Weak};

use bytes::Bytes;
use spin::Mutex;

use crate::{
    buffer::Shared,
    error::{BufferError, Result},
    segment::FileSegment,
};

/// 自有内存块。
///
/// - 以 `Box<[u8]>` 分配后转为裸指针保存，避免 `Box` 的唯一性假设与别名读取冲突；
/// - 只有缓冲核心在持锁状态下写入尾部空闲区或头部错位区，别名只读取冻结后的数据窗口。
pub(crate) struct Block {
    ptr: NonNull<u8>,
    capacity: usize,
}

// SAFETY: `Block` 只暴露裸指针，读写区间的互斥由缓冲核心的锁与钉住协议保证。
unsafe impl Send for Block {}
// SAFETY: 同上，共享访问只发生在不可变的数据窗口上。
unsafe impl Sync for Block {}

impl Block {
    /// 分配 `capacity` 字节并清零。
    ///
    /// 使用 `try_reserve_exact` 捕获分配失败，返回 [`BufferError::OutOfMemory`] 而不是中止进程。
    pub(crate) fn allocate(capacity: usize) -> Result<Self> {
        let mut storage: Vec<u8> = Vec::new();
        storage
            .try_reserve_exact(capacity)
            .map_err(|_| BufferError::OutOfMemory {
                requested: capacity,
            })?;
        storage.resize(capacity, 0);
        let raw = Box::into_raw(storage.into_boxed_slice());
        let ptr = NonNull::new(raw.cast::<u8>()).ok_or(BufferError::OutOfMemory {
            requested: capacity,
        })?;
        Ok(Self { ptr, capacity })
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        let slice = ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.capacity);
        // SAFETY: 指针与长度来自 `allocate` 中的 `Box::into_raw`，且只在这里回收一次。
        drop(unsafe { Box::from_raw(slice) });
    }
}

/// 外部内存引用。
///
/// # 教案式说明
/// - **意图 (Why)**：调用方已经持有一段内存（静态表、`Bytes`、内存池块），希望零拷贝挂入缓冲。
/// - **契约 (What)**：拥有者被装箱以固定地址；清理闭包在最后一个持有者释放时执行且只执行一次，
///   执行线程即完成最后一次递减的线程。
/// - **执行逻辑 (How)**：与租约回收的写法一致，清理闭包放在 `Mutex<Option<_>>` 中，
///   `Drop` 时 `take` 出来调用，借助 `Arc` 的计数判定“最后一个持有者”。
pub(crate) struct ExternalRef {
    ptr: *const u8,
    len: usize,
    release: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

// SAFETY: 拥有者要求 `Send + Sync`，指针只用于只读访问。
unsafe impl Send for ExternalRef {}
// SAFETY: 同上。
unsafe impl Sync for ExternalRef {}

impl ExternalRef {
    pub(crate) fn new<T, F>(owner: T, cleanup: F) -> Self
    where
        T: AsRef<[u8]> + Send + Sync + 'static,
        F: FnOnce(T) + Send + 'static,
    {
        let owner = Box::new(owner);
        let (ptr, len) = {
            let view = (*owner).as_ref();
            (view.as_ptr(), view.len())
        };
        let release: Box<dyn FnOnce() + Send> = Box::new(move || cleanup(*owner));
        Self {
            ptr,
            len,
            release: Mutex::new(Some(release)),
        }
    }

    pub(crate) fn from_bytes(bytes: Bytes) -> Self {
        Self::new(bytes, drop)
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for ExternalRef {
    fn drop(&mut self) {
        if let Some(release) = self.release.get_mut().take() {
            release();
        }
    }
}

/// 文件段视图：链的 `misalign` 即段内偏移。
pub(crate) struct SegmentSlice {
    pub(crate) segment: FileSegment,
    pub(crate) transfer_only: bool,
}

/// 组播别名的父链信息。
///
/// - `source`：源缓冲的弱引用，只用于诊断，不延长源缓冲寿命，也不会在释放别名时回锁源缓冲；
/// - `parent`：父链内存的共享克隆，父链在源缓冲中被抽干或销毁后，别名依旧可读。
pub(crate) struct MulticastParent {
    pub(crate) source_id: u64,
    pub(crate) source: Weak<Shared>,
    pub(crate) parent: ChainMemory,
}

/// 链内存来源的和类型。
pub(crate) enum ChainMemory {
    Owned(Arc<Block>),
    Reference(Arc<ExternalRef>),
    Segment(SegmentSlice),
    Multicast(Box<MulticastParent>),
}

impl ChainMemory {
    /// 返回内存起始地址；仅传输模式的文件段在此时按需物化。
    pub(crate) fn base_ptr(&self) -> Result<*const u8> {
        match self {
            Self::Owned(block) => Ok(block.as_ptr().cast_const()),
            Self::Reference(external) => Ok(external.ptr),
            Self::Segment(slice) => Ok(slice.segment.materialize()?.as_ptr()),
            Self::Multicast(alias) => alias.parent.base_ptr(),
        }
    }

    /// 是否已经具备可直接寻址的内存。
    pub(crate) fn has_memory(&self) -> bool {
        match self {
            Self::Segment(slice) => slice.segment.is_materialized(),
            Self::Multicast(alias) => alias.parent.has_memory(),
            Self::Owned(_) | Self::Reference(_) => true,
        }
    }

    /// 为别名链克隆一份共享内存句柄。
    ///
    /// 别名的别名直接指向最初的父内存，避免形成链式依赖。
    pub(crate) fn share(&self) -> ChainMemory {
        match self {
            Self::Owned(block) => Self::Owned(Arc::clone(block)),
            Self::Reference(external) => Self::Reference(Arc::clone(external)),
            Self::Segment(slice) => Self::Segment(SegmentSlice {
                segment: slice.segment.clone(),
                transfer_only: slice.transfer_only,
            }),
            Self::Multicast(alias) => alias.parent.share(),
        }
    }

    /// 共享计数：自有与引用内存取 `Arc` 强引用数，文件段取段自身的计数。
    pub(crate) fn refcnt(&self) -> usize {
        match self {
            Self::Owned(block) => Arc::strong_count(block),
            Self::Reference(external) => Arc::strong_count(external),
            Self::Segment(slice) => slice.segment.ref_count(),
            Self::Multicast(_) => 1,
        }
    }
}
