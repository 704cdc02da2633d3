//! 钉住令牌：在不持有缓冲互斥量的情况下把链内存交给外部 I/O。
//!
//! # 设计背景（Why）
//! - 重叠 I/O 与完成端口式接口要求内存在系统调用期间地址稳定，而缓冲的其他操作会重排、释放链；
//! - 钉住协议让两者共存：被钉住的链不会被重排或回收，摘下后进入待销毁列表，直到令牌结束。
//!
//! # 契约说明（What）
//! - [`PendingRead`] 钉住尾部空闲区并冻结尾部；提交时按实际读入量计入长度；
//! - [`PendingWrite`] 钉住头部数据窗口并冻结头部；提交时抽干实际写出量；
//! - 令牌未提交即被丢弃视为取消：解除钉住、解冻，缓冲长度不变；
//! - 令牌只持有缓冲本体的共享引用而非句柄，缓冲可以在令牌存活期间销毁，此时提交返回
//!   [`BufferError::Destroyed`]，但钉住的内存直到令牌结束才回收。

use std::{
    fmt,
    io::{self, IoSlice, IoSliceMut},
    sync::Arc,
};

use super::{ChainBuffer, Shared, expand::ReservedVec, io::IoVec, state::Core};
use crate::{
    chain::{ChainFlags, ChainId, memory::ChainMemory},
    error::{BufferError, Result},
    segment::FileSegment,
};

/// 头部仅传输链的写出窗口。
struct TransferWindow {
    chain: ChainId,
    segment: FileSegment,
    offset: usize,
    len: usize,
}

enum WriteWindow {
    Slices(Vec<ReservedVec>),
    Transfer(TransferWindow),
}

impl WriteWindow {
    fn pinned(&self) -> Vec<ChainId> {
        match self {
            Self::Slices(slots) => slots.iter().map(|slot| slot.chain).collect(),
            Self::Transfer(window) => vec![window.chain],
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Slices(slots) => slots.iter().map(|slot| slot.vec.len()).sum(),
            Self::Transfer(window) => window.len,
        }
    }
}

impl Core {
    fn pin_read(&mut self, at_most: usize, n_vecs: usize) -> Result<Vec<ReservedVec>> {
        self.check_tail()?;
        if at_most == 0 || n_vecs == 0 {
            return Err(BufferError::invalid("钉住读入的长度与描述符数量都必须大于 0"));
        }
        self.check_growth(at_most)?;
        let slots = if n_vecs == 1 {
            let index = self.expand_singlechain(at_most)?;
            let chain = &self.chains[index];
            vec![ReservedVec {
                chain: chain.id,
                vec: IoVec::new(chain.space_ptr(), chain.space_len().min(at_most)),
            }]
        } else {
            self.expand_fast(at_most, n_vecs)?;
            self.read_setup_vecs(at_most, n_vecs, true)
        };
        for slot in &slots {
            if let Some(chain) = self.chains.iter_mut().find(|chain| chain.id == slot.chain) {
                chain.flags.insert(ChainFlags::PINNED_R);
            }
        }
        self.freeze_tail = true;
        tracing::trace!(buffer = self.id, vecs = slots.len(), at_most, "钉住尾部空闲区");
        Ok(slots)
    }

    fn pin_write(&mut self, at_most: usize, n_vecs: usize) -> Result<WriteWindow> {
        self.check_head()?;
        if n_vecs == 0 {
            return Err(BufferError::invalid("描述符数量至少为 1"));
        }
        let at_most = at_most.min(self.total_len);
        let mut slots = Vec::new();
        let mut transfer = None;
        let mut so_far = 0;
        for chain in &self.chains {
            if so_far >= at_most || slots.len() == n_vecs {
                break;
            }
            if chain.off == 0 {
                continue;
            }
            let take = chain.off.min(at_most - so_far);
            if chain.is_transfer_only() {
                if slots.is_empty()
                    && let ChainMemory::Segment(slice) = &chain.memory
                {
                    transfer = Some(TransferWindow {
                        chain: chain.id,
                        segment: slice.segment.clone(),
                        offset: chain.misalign,
                        len: take,
                    });
                }
                break;
            }
            let data = chain.data()?;
            slots.push(ReservedVec {
                chain: chain.id,
                vec: IoVec::new(data.as_ptr().cast_mut(), take),
            });
            so_far += take;
        }
        let window = match transfer {
            Some(window) => WriteWindow::Transfer(window),
            None => WriteWindow::Slices(slots),
        };
        for id in window.pinned() {
            if let Some(chain) = self.chains.iter_mut().find(|chain| chain.id == id) {
                chain.flags.insert(ChainFlags::PINNED_W);
            }
        }
        self.freeze_head = true;
        Ok(window)
    }

    fn commit_read(&mut self, slots: &[ReservedVec], read: usize) -> Result<usize> {
        for slot in slots {
            self.unpin(slot.chain, ChainFlags::PINNED_R);
        }
        self.freeze_tail = false;
        if self.destroyed {
            return Err(BufferError::Destroyed);
        }
        let reserved: usize = slots.iter().map(|slot| slot.vec.len()).sum();
        if read > reserved {
            return Err(BufferError::invalid(format!(
                "提交 {read} 字节超过钉住的 {reserved} 字节"
            )));
        }
        self.check_growth(read)?;
        let mut remaining = read;
        let mut credited = 0;
        for slot in slots {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(slot.vec.len());
            remaining -= take;
            match self.chains.iter_mut().find(|chain| chain.id == slot.chain) {
                Some(chain) => {
                    chain.off += take;
                    credited += take;
                }
                None => {
                    tracing::warn!(buffer = self.id, chain = slot.chain.get(), "钉住的链已不在缓冲中，丢弃读入");
                }
            }
        }
        self.recompute_last_with_data();
        self.total_len += credited;
        self.n_add_for_cb += credited;
        Ok(credited)
    }

    fn commit_write(&mut self, window: &WriteWindow, written: usize) -> Result<usize> {
        self.freeze_head = false;
        let pinned = window.pinned();
        if self.destroyed {
            for id in pinned {
                self.unpin(id, ChainFlags::PINNED_W);
            }
            return Err(BufferError::Destroyed);
        }
        let reserved = window.len();
        let result = if written > reserved {
            Err(BufferError::invalid(format!(
                "提交 {written} 字节超过钉住的 {reserved} 字节"
            )))
        } else {
            self.drain(written)
        };
        for id in pinned {
            self.unpin(id, ChainFlags::PINNED_W);
        }
        result
    }
}

/// 未提交的钉住读入。
///
/// # 教案式说明
/// - **意图 (Why)**：让读入系统调用直接写进链的空闲区，且调用期间不持有缓冲互斥量。
/// - **契约 (What)**：
///   - 存活期间缓冲尾部冻结，追加类操作返回 [`BufferError::Frozen`]；头部操作照常进行；
///   - [`commit`](Self::commit) 只能调用一次，`read` 不得超过 [`len`](Self::len)；
///   - 丢弃而不提交等价于读入 0 字节。
/// - **执行逻辑 (How)**：令牌记录每个描述符所属链的标识，提交时按标识重新定位，
///   因此期间的抽干、前插不影响计入位置。
pub struct PendingRead {
    shared: Arc<Shared>,
    slots: Vec<ReservedVec>,
    done: bool,
}

impl PendingRead {
    /// 钉住的空闲区总长度。
    pub fn len(&self) -> usize {
        self.slots.iter().map(|slot| slot.vec.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 钉住区间的原始描述符。
    pub fn iovecs(&self) -> Vec<IoVec> {
        self.slots.iter().map(|slot| slot.vec).collect()
    }

    /// 以 `IoSliceMut` 形式借出钉住区间，可直接交给 `read_vectored`。
    pub fn io_slices_mut(&mut self) -> Vec<IoSliceMut<'_>> {
        self.slots
            .iter()
            .map(|slot| {
                // SAFETY: 区间属于被读钉住的链，链在令牌结束前既不释放也不重排；
                // 尾部冻结保证没有其他写者，`&mut self` 保证令牌内不存在第二个借用。
                IoSliceMut::new(unsafe { slot.vec.as_mut_slice() })
            })
            .collect()
    }

    /// 计入实际读入的 `read` 字节，返回计入量并触发回调。
    pub fn commit(mut self, read: usize) -> Result<usize> {
        self.done = true;
        let _guard = self.shared.outer_lock();
        let slots = std::mem::take(&mut self.slots);
        let (result, revived) = self.shared.with_core(|core| {
            let result = core.commit_read(&slots, read);
            (result, revive(core, &self.shared))
        });
        if let Some(buffer) = revived {
            buffer.invoke_callbacks();
        }
        result
    }
}

impl Drop for PendingRead {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let slots = std::mem::take(&mut self.slots);
        self.shared.with_core(|core| {
            for slot in &slots {
                core.unpin(slot.chain, ChainFlags::PINNED_R);
            }
            core.freeze_tail = false;
        });
        tracing::trace!(buffer = self.shared.id(), "钉住读入被取消");
    }
}

impl fmt::Debug for PendingRead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRead")
            .field("buffer", &self.shared.id())
            .field("vecs", &self.slots.len())
            .field("len", &self.len())
            .finish()
    }
}

/// 未提交的钉住写出。
///
/// 普通数据以描述符暴露；头部是仅传输文件段时改为传输模式，
/// [`write_to`](Self::write_to) 直接从文件读取后写往目标，此时 [`io_slices`](Self::io_slices) 为空。
pub struct PendingWrite {
    shared: Arc<Shared>,
    window: WriteWindow,
    done: bool,
}

impl PendingWrite {
    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 是否处于文件段传输模式。
    pub fn is_transfer(&self) -> bool {
        matches!(self.window, WriteWindow::Transfer(_))
    }

    /// 以 `IoSlice` 形式借出钉住的数据窗口。
    pub fn io_slices(&self) -> Vec<IoSlice<'_>> {
        match &self.window {
            WriteWindow::Slices(slots) => slots
                .iter()
                // SAFETY: 数据窗口属于被写钉住的链，头部冻结期间不会被抽干或改写。
                .map(|slot| IoSlice::new(unsafe { slot.vec.as_slice() }))
                .collect(),
            WriteWindow::Transfer(_) => Vec::new(),
        }
    }

    /// 把钉住的内容写往 `sink` 一次，返回写出的字节数，`Interrupted` 会重试。
    pub fn write_to<W>(&self, sink: &mut W) -> Result<usize>
    where
        W: io::Write + ?Sized,
    {
        match &self.window {
            WriteWindow::Transfer(window) => {
                window
                    .segment
                    .transfer_to(sink, window.offset, window.len)
            }
            WriteWindow::Slices(_) => {
                let slices = self.io_slices();
                loop {
                    match sink.write_vectored(&slices) {
                        Ok(written) => return Ok(written),
                        Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                        Err(error) => return Err(error.into()),
                    }
                }
            }
        }
    }

    /// 抽干实际写出的 `written` 字节，返回抽干量并触发回调。
    pub fn commit(mut self, written: usize) -> Result<usize> {
        self.done = true;
        let _guard = self.shared.outer_lock();
        let window = std::mem::replace(&mut self.window, WriteWindow::Slices(Vec::new()));
        let (result, revived) = self.shared.with_core(|core| {
            let result = core.commit_write(&window, written);
            (result, revive(core, &self.shared))
        });
        if let Some(buffer) = revived {
            buffer.invoke_callbacks();
        }
        result
    }
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let pinned = self.window.pinned();
        self.shared.with_core(|core| {
            for id in pinned {
                core.unpin(id, ChainFlags::PINNED_W);
            }
            core.freeze_head = false;
        });
        tracing::trace!(buffer = self.shared.id(), "钉住写出被取消");
    }
}

impl fmt::Debug for PendingWrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingWrite")
            .field("buffer", &self.shared.id())
            .field("transfer", &self.is_transfer())
            .field("len", &self.len())
            .finish()
    }
}

/// 缓冲未销毁时借一个临时句柄用于回调遍历。
fn revive(core: &mut Core, shared: &Arc<Shared>) -> Option<ChainBuffer> {
    if core.destroyed {
        return None;
    }
    core.refcnt += 1;
    Some(ChainBuffer {
        shared: Arc::clone(shared),
    })
}

impl ChainBuffer {
    /// 钉住至少 `at_most` 字节的尾部空闲区（至多 `n_vecs` 段），用于外部读入。
    ///
    /// `n_vecs == 1` 时保证单段连续。令牌存活期间尾部冻结。
    pub fn launch_read(&self, at_most: usize, n_vecs: usize) -> Result<PendingRead> {
        let slots = self.locked(|core| core.pin_read(at_most, n_vecs))?;
        Ok(PendingRead {
            shared: Arc::clone(&self.shared),
            slots,
            done: false,
        })
    }

    /// 钉住头部至多 `at_most` 字节的数据（至多 `n_vecs` 段），用于外部写出。令牌存活期间头部冻结。
    pub fn launch_write(&self, at_most: usize, n_vecs: usize) -> Result<PendingWrite> {
        let window = self.locked(|core| core.pin_write(at_most, n_vecs))?;
        Ok(PendingWrite {
            shared: Arc::clone(&self.shared),
            window,
            done: false,
        })
    }

    /// 预留、写入、提交的一站式入口：闭包收到钉住的空闲区，返回实际写入的字节数。
    pub fn reserve_with<F>(&self, size: usize, n_vecs: usize, fill: F) -> Result<usize>
    where
        F: FnOnce(&mut [IoSliceMut<'_>]) -> usize,
    {
        let mut pending = self.launch_read(size, n_vecs)?;
        let written = {
            let mut slices = pending.io_slices_mut();
            fill(&mut slices)
        };
        pending.commit(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferEnd;

    #[test]
    fn read_token_freezes_tail_until_commit() {
        let buffer = ChainBuffer::new();
        let mut pending = buffer.launch_read(8, 1).expect("钉住");
        let err = buffer.add(b"x").expect_err("尾部冻结");
        assert!(matches!(err, BufferError::Frozen { end: BufferEnd::Tail }));
        {
            let mut slices = pending.io_slices_mut();
            slices[0][..3].copy_from_slice(b"abc");
        }
        assert_eq!(pending.commit(3).expect("提交"), 3);
        assert_eq!(buffer.remove_bytes(3).expect("读出"), &b"abc"[..]);
        buffer.check_invariants().expect("不变式");
    }

    #[test]
    fn dropped_write_token_cancels() {
        let buffer = ChainBuffer::new();
        buffer.add(b"payload").expect("追加");
        let pending = buffer.launch_write(usize::MAX, 4).expect("钉住");
        assert_eq!(pending.len(), 7);
        drop(pending);
        assert!(!buffer.is_frozen(BufferEnd::Head));
        assert_eq!(buffer.len(), 7);
        assert!(buffer.chain_info().iter().all(|info| !info.flags.contains(ChainFlags::PINNED_W)));
    }

    #[test]
    fn commit_after_destroy_reports_destroyed() {
        let buffer = ChainBuffer::new();
        buffer.add(b"data").expect("追加");
        let pending = buffer.launch_write(4, 1).expect("钉住");
        let slices = pending.io_slices();
        assert_eq!(&*slices[0], b"data");
        drop(slices);
        drop(buffer);
        let err = pending.commit(4).expect_err("缓冲已销毁");
        assert!(matches!(err, BufferError::Destroyed));
    }

    #[test]
    fn reserve_with_commits_returned_length() {
        let buffer = ChainBuffer::new();
        let added = buffer
            .reserve_with(16, 2, |slices| {
                slices[0][..5].copy_from_slice(b"hello");
                5
            })
            .expect("预留并提交");
        assert_eq!(added, 5);
        assert_eq!(buffer.remove_bytes(16).expect("读出"), &b"hello"[..]);
    }
}
