//! 缓冲核心状态与单缓冲算法。
//!
//! # 模块定位（Why）
//! - [`Core`] 是受缓冲内部互斥量保护的全部可变状态：链序列、长度计数、冻结标记、回调表与钉住链的暂存区；
//! - 本文件只放“在一把锁内即可完成”的算法，双缓冲搬移见 `transfer`，扩容见 `expand`。
//!
//! # 不变式（What）
//! - `total_len` 恒等于链序列中所有 `off` 之和，热路径上只做增量维护；
//! - `last_with_data` 在没有链或没有数据时为 0，否则是最后一条含数据链的下标；
//! - 被钉住的链永远不会被直接释放：摘下时进入 `dangling`，最后一个钉住标志清除时才回收；
//! - 释放的链先进入 `graveyard`，由调用方在释放互斥量之后统一丢弃，清理回调因此永远不在锁内执行。

use std::{
    any::Any,
    collections::VecDeque,
    mem,
    sync::{Arc, Weak},
};

use crate::{
    buffer::{BufferEnd, BufferFlags, BufferStats},
    callback::{CallbackEntry, CallbackInfo, CallbackPass, CallbackRegistry, PassMode},
    chain::{Chain, ChainFlags, ChainId, ChainInfo, memory::ExternalRef},
    config::BufferConfig,
    deferred::DeferredHandle,
    error::{BufferError, Result},
    segment::FileSegment,
};

/// 缓冲销毁时从核心中摘下、需要在锁外释放的资源。
pub(crate) struct Teardown {
    _chains: Vec<Chain>,
    _callbacks: Vec<Arc<CallbackEntry>>,
    _deferred: Option<Arc<DeferredHandle>>,
    _owner: Option<Weak<dyn Any + Send + Sync>>,
}

pub(crate) struct Core {
    pub(crate) id: u64,
    pub(crate) chains: VecDeque<Chain>,
    pub(crate) last_with_data: usize,
    pub(crate) total_len: usize,
    pub(crate) n_add_for_cb: usize,
    pub(crate) n_del_for_cb: usize,
    pub(crate) freeze_head: bool,
    pub(crate) freeze_tail: bool,
    pub(crate) refcnt: usize,
    pub(crate) destroyed: bool,
    pub(crate) flags: BufferFlags,
    pub(crate) max_read: usize,
    pub(crate) config: BufferConfig,
    pub(crate) callbacks: CallbackRegistry,
    pub(crate) deferred: Option<Arc<DeferredHandle>>,
    pub(crate) owner: Option<Weak<dyn Any + Send + Sync>>,
    pub(crate) dangling: Vec<Chain>,
    pub(crate) graveyard: Vec<Chain>,
    pub(crate) chains_allocated: u64,
    pub(crate) chains_freed: u64,
}

impl Core {
    pub(crate) fn new(id: u64, config: BufferConfig, flags: BufferFlags) -> Self {
        Self {
            id,
            chains: VecDeque::new(),
            last_with_data: 0,
            total_len: 0,
            n_add_for_cb: 0,
            n_del_for_cb: 0,
            freeze_head: false,
            freeze_tail: false,
            refcnt: 1,
            destroyed: false,
            flags,
            max_read: config.max_read,
            config,
            callbacks: CallbackRegistry::default(),
            deferred: None,
            owner: None,
            dangling: Vec::new(),
            graveyard: Vec::new(),
            chains_allocated: 0,
            chains_freed: 0,
        }
    }

    pub(crate) fn check_tail(&self) -> Result<()> {
        if self.freeze_tail {
            tracing::warn!(buffer = self.id, "缓冲尾部已冻结，拒绝修改");
            return Err(BufferError::Frozen {
                end: BufferEnd::Tail,
            });
        }
        Ok(())
    }

    pub(crate) fn check_head(&self) -> Result<()> {
        if self.freeze_head {
            tracing::warn!(buffer = self.id, "缓冲头部已冻结，拒绝修改");
            return Err(BufferError::Frozen {
                end: BufferEnd::Head,
            });
        }
        Ok(())
    }

    /// 总长度再增加 `extra` 字节是否仍可表示。
    pub(crate) fn check_growth(&self, extra: usize) -> Result<()> {
        let max = usize::MAX - self.total_len;
        if extra > max {
            return Err(BufferError::Overflow {
                requested: extra,
                max,
            });
        }
        Ok(())
    }

    pub(crate) fn new_chain(&mut self, size: usize) -> Result<Chain> {
        let chain = Chain::owned(size, self.config.min_chunk)?;
        self.chains_allocated += 1;
        Ok(chain)
    }

    /// 释放一条已从序列中摘下的链；仍被钉住的链转入 `dangling`。
    pub(crate) fn free_chain(&mut self, mut chain: Chain) {
        if chain.is_pinned() {
            chain.flags.insert(ChainFlags::DANGLING);
            tracing::debug!(buffer = self.id, chain = chain.id.get(), "链仍被钉住，推迟到解除钉住后释放");
            self.dangling.push(chain);
            return;
        }
        tracing::trace!(buffer = self.id, chain = chain.id.get(), "释放链");
        self.chains_freed += 1;
        self.graveyard.push(chain);
    }

    pub(crate) fn take_graveyard(&mut self) -> Vec<Chain> {
        mem::take(&mut self.graveyard)
    }

    pub(crate) fn recompute_last_with_data(&mut self) {
        self.last_with_data = self
            .chains
            .iter()
            .rposition(|chain| chain.off > 0)
            .unwrap_or(0);
    }

    /// 下标 `index` 的链刚获得数据；它必然不早于当前的 `last_with_data`。
    pub(crate) fn mark_data_at(&mut self, index: usize) {
        self.last_with_data = self.last_with_data.max(index);
    }

    /// 从 `last_with_data` 开始跳过含数据或被钉住的链，释放第一条空闲链及其后的全部链，
    /// 返回新链应插入的下标。
    pub(crate) fn free_trailing_empty_chains(&mut self) -> usize {
        let mut index = self.last_with_data;
        while let Some(chain) = self.chains.get(index) {
            if chain.off == 0 && !chain.is_pinned() {
                break;
            }
            index += 1;
        }
        let removed: Vec<Chain> = self.chains.drain(index..).collect();
        for chain in removed {
            self.free_chain(chain);
        }
        index
    }

    /// 把链接到序列尾部，并维护总长度与 `last_with_data`。
    pub(crate) fn insert_chain(&mut self, chain: Chain) {
        let off = chain.off;
        if self.chains.is_empty() {
            self.chains.push_back(chain);
            self.last_with_data = 0;
        } else {
            let at = self.free_trailing_empty_chains();
            self.chains.push_back(chain);
            if off > 0 {
                self.last_with_data = at;
            }
        }
        self.total_len += off;
    }

    /// 追加字节。
    ///
    /// 优先写入最后一条含数据链的空闲区；放不下时若搬移代价低则先重排；
    /// 否则先分配新链（容量按上一条链翻倍增长，上限 `max_auto_chain`），
    /// 再把能放下的前缀写入旧链、剩余写入新链。
    pub(crate) fn add(&mut self, data: &[u8]) -> Result<()> {
        self.check_tail()?;
        if data.is_empty() {
            return Ok(());
        }
        self.check_growth(data.len())?;
        let datlen = data.len();

        if self.chains.is_empty() {
            let mut chain = self.new_chain(datlen)?;
            chain.append(data);
            self.insert_chain(chain);
            self.n_add_for_cb += datlen;
            return Ok(());
        }

        let index = self.last_with_data;
        let max_realign = self.config.max_to_realign_in_expand;
        let (writable, remain, realign, capacity) = {
            let chain = &self.chains[index];
            let writable = chain.is_writable();
            let remain = chain.space_len();
            let realign = writable
                && remain < datlen
                && !chain.is_pinned()
                && chain.should_realign(datlen, max_realign);
            (writable, remain, realign, chain.capacity)
        };

        if writable && (remain >= datlen || realign) {
            let chain = &mut self.chains[index];
            if realign {
                chain.align();
            }
            chain.append(data);
            self.total_len += datlen;
            self.n_add_for_cb += datlen;
            return Ok(());
        }

        // 扩容预留的下一条空链放得下剩余部分时直接使用它。
        let spill = self.chains.get(index + 1).is_some_and(|next| {
            next.off == 0 && !next.is_pinned() && next.space_len() >= datlen - remain
        });
        if spill {
            if remain > 0 {
                self.chains[index].append(&data[..remain]);
            }
            self.chains[index + 1].append(&data[remain..]);
            self.mark_data_at(index + 1);
            self.total_len += datlen;
            self.n_add_for_cb += datlen;
            return Ok(());
        }

        let mut to_alloc = if writable { capacity } else { 0 };
        if to_alloc <= self.config.max_auto_chain / 2 {
            to_alloc <<= 1;
        }
        to_alloc = to_alloc.max(datlen);
        let mut tmp = self.new_chain(to_alloc)?;

        if remain > 0 {
            self.chains[index].append(&data[..remain]);
            self.total_len += remain;
        }
        tmp.append(&data[remain..]);
        self.insert_chain(tmp);
        self.n_add_for_cb += datlen;
        Ok(())
    }

    /// 在头部插入字节，顺序与 `data` 一致。
    ///
    /// 首链可写且未钉住时先填它的头部错位区（空链视为“整段都在头部”），
    /// 剩余部分写入新分配的链并挂到最前面；新链在任何修改之前分配。
    pub(crate) fn prepend(&mut self, data: &[u8]) -> Result<()> {
        self.check_head()?;
        if data.is_empty() {
            return Ok(());
        }
        self.check_growth(data.len())?;
        let datlen = data.len();

        let room = match self.chains.front() {
            Some(chain) if chain.is_writable() && !chain.is_pinned() => {
                if chain.off == 0 {
                    chain.capacity
                } else {
                    chain.misalign
                }
            }
            _ => 0,
        };
        let rest = datlen.saturating_sub(room);
        let fresh = if rest > 0 {
            Some(self.new_chain(rest)?)
        } else {
            None
        };

        let had_data = self.total_len > 0;
        let fit = datlen - rest;
        if fit > 0 {
            let front = &mut self.chains[0];
            if front.off == 0 {
                front.misalign = front.capacity;
            }
            front.prepend(&data[rest..]);
        }
        if let Some(mut chain) = fresh {
            chain.misalign = chain.capacity;
            chain.prepend(&data[..rest]);
            let shift = had_data || fit > 0;
            self.chains.push_front(chain);
            self.last_with_data = if shift { self.last_with_data + 1 } else { 0 };
        }
        self.total_len += datlen;
        self.n_add_for_cb += datlen;
        Ok(())
    }

    /// 从头部抽干至多 `len` 字节，返回实际抽干的字节数。
    ///
    /// - 全部抽干且没有读钉住链时直接释放所有链；
    /// - 否则逐条释放被完整消费的链；读钉住的链不释放，只把数据窗口推到末尾，
    ///   其空闲区地址因此保持不变，进行中的读入仍然有效。
    pub(crate) fn drain(&mut self, len: usize) -> Result<usize> {
        if len == 0 {
            return Ok(0);
        }
        self.check_head()?;
        let len = len.min(self.total_len);

        if len == self.total_len && !self.chains.iter().any(Chain::is_pinned_r) {
            let chains = mem::take(&mut self.chains);
            for chain in chains {
                self.free_chain(chain);
            }
            self.last_with_data = 0;
            self.total_len = 0;
        } else {
            self.total_len -= len;
            let mut remaining = len;
            while let Some(front) = self.chains.front_mut() {
                if remaining < front.off {
                    front.misalign += remaining;
                    front.off -= remaining;
                    remaining = 0;
                    break;
                }
                remaining -= front.off;
                if front.is_pinned_r() {
                    front.misalign += front.off;
                    front.off = 0;
                    break;
                }
                if let Some(chain) = self.chains.pop_front() {
                    self.free_chain(chain);
                }
                self.last_with_data = self.last_with_data.saturating_sub(1);
            }
            if remaining > 0 {
                // 读钉住链只位于尾部，其后仍有数据说明序列已损坏。
                tracing::error!(
                    buffer = self.id,
                    requested = len,
                    remaining,
                    "抽干在读钉住链处提前终止"
                );
                self.total_len += remaining;
                self.recompute_last_with_data();
                let drained = len - remaining;
                self.n_del_for_cb += drained;
                return Ok(drained);
            }
            if self.total_len == 0 {
                self.last_with_data = 0;
            }
        }
        self.n_del_for_cb += len;
        Ok(len)
    }

    /// 返回覆盖 `[start, start + len)` 的只读切片序列。
    pub(crate) fn slices(&self, start: usize, len: usize) -> Result<Vec<&[u8]>> {
        let mut out = Vec::new();
        let mut skip = start;
        let mut left = len;
        for chain in &self.chains {
            if left == 0 {
                break;
            }
            if skip >= chain.off {
                skip -= chain.off;
                continue;
            }
            let data = &chain.data()?[skip..];
            skip = 0;
            let take = data.len().min(left);
            out.push(&data[..take]);
            left -= take;
        }
        Ok(out)
    }

    /// 从 `pos` 开始复制到 `out`，返回复制的字节数。
    pub(crate) fn copy_out_from(&self, pos: usize, out: &mut [u8]) -> Result<usize> {
        if pos > self.total_len {
            return Err(BufferError::invalid(format!(
                "起始位置 {pos} 超过缓冲长度 {}",
                self.total_len
            )));
        }
        let len = out.len().min(self.total_len - pos);
        let mut written = 0;
        for slice in self.slices(pos, len)? {
            out[written..written + slice.len()].copy_from_slice(slice);
            written += slice.len();
        }
        Ok(written)
    }

    /// 追加外部引用链；失败或空引用时清理闭包在锁外执行。
    pub(crate) fn add_reference(&mut self, external: ExternalRef) -> Result<()> {
        let chain = Chain::reference(external);
        if let Err(err) = self.check_tail().and_then(|()| self.check_growth(chain.off)) {
            self.graveyard.push(chain);
            return Err(err);
        }
        if chain.off == 0 {
            self.graveyard.push(chain);
            return Ok(());
        }
        self.n_add_for_cb += chain.off;
        self.insert_chain(chain);
        Ok(())
    }

    /// 挂入文件段的 `[offset, offset + len)`。
    ///
    /// 只有缓冲声明了 `DRAINS_TO_SINK` 且段允许直接传输时才以仅传输链挂入，
    /// 其余情况先在段锁内物化，保证链具备可寻址内存。
    pub(crate) fn add_file_segment(
        &mut self,
        segment: &FileSegment,
        offset: usize,
        len: Option<usize>,
    ) -> Result<()> {
        self.check_tail()?;
        let len = match len {
            Some(len) => len,
            None => segment
                .len()
                .checked_sub(offset)
                .ok_or_else(|| BufferError::invalid("偏移超过文件段长度"))?,
        };
        if offset.checked_add(len).is_none_or(|end| end > segment.len()) {
            return Err(BufferError::invalid(format!(
                "区间 [{offset}, {offset}+{len}) 越过文件段长度 {}",
                segment.len()
            )));
        }
        self.check_growth(len)?;
        if len == 0 {
            return Ok(());
        }
        let transfer_only =
            self.flags.contains(BufferFlags::DRAINS_TO_SINK) && segment.can_transfer_direct();
        if !transfer_only {
            segment.materialize()?;
        }
        let chain = Chain::segment(segment.clone(), offset, len, transfer_only);
        tracing::trace!(buffer = self.id, chain = chain.id.get(), len, transfer_only, "挂入文件段");
        self.n_add_for_cb += len;
        self.insert_chain(chain);
        Ok(())
    }

    /// 清除钉住标志；待销毁的链在最后一个钉住标志清除时回收，且只回收一次。
    pub(crate) fn unpin(&mut self, id: ChainId, flag: ChainFlags) {
        if let Some(chain) = self.chains.iter_mut().find(|chain| chain.id == id) {
            chain.flags.remove(flag);
            return;
        }
        let Some(index) = self.dangling.iter().position(|chain| chain.id == id) else {
            return;
        };
        self.dangling[index].flags.remove(flag);
        if !self.dangling[index].is_pinned() {
            let chain = self.dangling.swap_remove(index);
            tracing::debug!(buffer = self.id, chain = id.get(), "钉住解除，回收待销毁链");
            self.chains_freed += 1;
            self.graveyard.push(chain);
        }
    }

    /// 取出一次回调遍历的快照。
    ///
    /// 没有回调时直接清零累计计数；计数为零时不遍历；
    /// 推迟模式的同步阶段不清零，计数留给随后的推迟遍历。
    pub(crate) fn take_pass(&mut self, mode: PassMode) -> Option<CallbackPass> {
        if self.callbacks.is_empty() {
            self.n_add_for_cb = 0;
            self.n_del_for_cb = 0;
            return None;
        }
        if self.n_add_for_cb == 0 && self.n_del_for_cb == 0 {
            return None;
        }
        let info = CallbackInfo {
            orig_size: self
                .total_len
                .saturating_add(self.n_del_for_cb)
                .saturating_sub(self.n_add_for_cb),
            new_size: self.total_len,
            n_added: self.n_add_for_cb,
            n_deleted: self.n_del_for_cb,
        };
        if mode.clears_counts() {
            self.n_add_for_cb = 0;
            self.n_del_for_cb = 0;
        }
        Some(self.callbacks.pass(info, mode))
    }

    /// 引用计数归零后的销毁：链（钉住的除外）与回调全部摘下，推迟投递取消。
    pub(crate) fn destroy(&mut self) -> Teardown {
        self.destroyed = true;
        let chains = mem::take(&mut self.chains);
        for chain in chains {
            self.free_chain(chain);
        }
        self.total_len = 0;
        self.last_with_data = 0;
        self.n_add_for_cb = 0;
        self.n_del_for_cb = 0;
        let deferred = self.deferred.take();
        if let Some(handle) = &deferred {
            handle.cancel();
        }
        tracing::debug!(buffer = self.id, dangling = self.dangling.len(), "缓冲销毁");
        Teardown {
            _chains: self.take_graveyard(),
            _callbacks: self.callbacks.take_all(),
            _deferred: deferred,
            _owner: self.owner.take(),
        }
    }

    pub(crate) fn stats(&self) -> BufferStats {
        BufferStats {
            len: self.total_len,
            chains: self.chains.len(),
            dangling: self.dangling.len(),
            owned_bytes: self
                .chains
                .iter()
                .chain(self.dangling.iter())
                .map(Chain::owned_capacity)
                .sum(),
            chains_allocated: self.chains_allocated,
            chains_freed: self.chains_freed,
            callbacks: self.callbacks.len(),
        }
    }

    pub(crate) fn chain_info(&self) -> Vec<ChainInfo> {
        self.chains.iter().map(Chain::info).collect()
    }

    /// 遍历校验全部不变式，返回第一条违例的描述。
    pub(crate) fn check_invariants(&self) -> std::result::Result<(), String> {
        let sum: usize = self.chains.iter().map(|chain| chain.off).sum();
        if sum != self.total_len {
            return Err(format!("total_len = {}，链长度之和 = {sum}", self.total_len));
        }
        let expected = self
            .chains
            .iter()
            .rposition(|chain| chain.off > 0)
            .unwrap_or(0);
        if expected != self.last_with_data {
            return Err(format!(
                "last_with_data = {}，应为 {expected}",
                self.last_with_data
            ));
        }
        for chain in &self.chains {
            if chain.misalign + chain.off > chain.capacity {
                return Err(format!("{chain:?} 的数据窗口越过容量"));
            }
            if chain.flags.contains(ChainFlags::DANGLING) {
                return Err(format!("{chain:?} 已标记待销毁却仍在序列中"));
            }
        }
        if let Some(chain) = self.dangling.iter().find(|chain| !chain.is_pinned()) {
            return Err(format!("{chain:?} 未被钉住却停留在待销毁列表"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MIN_CHUNK;

    fn core() -> Core {
        Core::new(1, BufferConfig::default(), BufferFlags::EMPTY)
    }

    fn contents(core: &Core) -> Vec<u8> {
        let mut out = vec![0; core.total_len];
        core.copy_out_from(0, &mut out).expect("复制");
        out
    }

    #[test]
    fn last_with_data_skips_leading_empty_chain() {
        let mut core = core();
        let empty = core.new_chain(16).expect("分配");
        core.chains.push_back(empty);
        let mut full = core.new_chain(16).expect("分配");
        full.append(b"abc");
        core.chains.push_back(full);
        core.total_len = 3;
        core.recompute_last_with_data();
        assert_eq!(core.last_with_data, 1, "首链为空时指向后面的含数据链");
        core.check_invariants().expect("不变式");
    }

    #[test]
    fn add_doubles_following_chain_capacity() {
        let mut core = core();
        core.add(&[1u8]).expect("追加");
        let first_capacity = core.chains[0].capacity;
        assert!(first_capacity < MIN_CHUNK);
        core.add(&vec![1u8; first_capacity - 1]).expect("填满首链");
        assert_eq!(core.chains.len(), 1);
        core.add(&[2u8]).expect("追加");
        assert_eq!(core.chains.len(), 2);
        assert!(core.chains[1].capacity >= first_capacity * 2);
        assert_eq!(core.last_with_data, 1);
        core.check_invariants().expect("不变式");
    }

    #[test]
    fn add_spills_into_reserved_chain() {
        let mut core = core();
        core.add(&[1u8; 4500]).expect("追加");
        core.expand_singlechain(5000).expect("扩容");
        assert_eq!(core.chains.len(), 2, "已有数据过多，扩容插入新链");
        let allocated = core.chains_allocated;
        core.add(&[2u8; 5000]).expect("追加");
        assert_eq!(core.chains_allocated, allocated, "预留链放得下剩余部分");
        assert_eq!(core.last_with_data, 1);
        assert_eq!(core.total_len, 9500);
        core.check_invariants().expect("不变式");
    }

    #[test]
    fn prepend_fills_misalign_then_allocates() {
        let mut core = core();
        core.add(b"world").expect("追加");
        core.drain(0).expect("空抽干");
        core.prepend(b"hello ").expect("前插");
        assert_eq!(contents(&core), b"hello world");
        core.check_invariants().expect("不变式");
    }

    #[test]
    fn drain_keeps_read_pinned_chain_linked() {
        let mut core = core();
        core.add(b"abcdef").expect("追加");
        core.chains[0].flags.insert(ChainFlags::PINNED_R);
        let space_before = core.chains[0].space_ptr();
        assert_eq!(core.drain(6).expect("抽干"), 6);
        assert_eq!(core.chains.len(), 1, "读钉住的链不被释放");
        assert_eq!(core.chains[0].space_ptr(), space_before);
        core.check_invariants().expect("不变式");
    }

    #[test]
    fn drain_stopped_by_read_pinned_chain_keeps_accounting() {
        let mut core = core();
        let mut pinned = core.new_chain(16).expect("分配");
        pinned.append(b"abc");
        pinned.flags.insert(ChainFlags::PINNED_R);
        core.chains.push_back(pinned);
        let mut tail = core.new_chain(16).expect("分配");
        tail.append(b"def");
        core.chains.push_back(tail);
        core.total_len = 6;
        core.recompute_last_with_data();

        assert_eq!(core.drain(6).expect("抽干"), 3, "只报告实际抽干的字节");
        assert_eq!(core.total_len, 3);
        assert_eq!(core.n_del_for_cb, 3);
        assert_eq!(contents(&core), b"def");
        core.check_invariants().expect("不变式");
    }

    #[test]
    fn pinned_chain_freed_once_after_unpin() {
        let mut core = core();
        core.add(b"payload").expect("追加");
        let id = core.chains[0].id;
        core.chains[0].flags.insert(ChainFlags::PINNED_W);
        core.drain(7).expect("抽干");
        assert_eq!(core.dangling.len(), 1);
        let freed = core.chains_freed;
        core.unpin(id, ChainFlags::PINNED_W);
        assert!(core.dangling.is_empty());
        assert_eq!(core.chains_freed, freed + 1);
        core.unpin(id, ChainFlags::PINNED_W);
        assert_eq!(core.chains_freed, freed + 1, "重复解除不会再次回收");
    }

    #[test]
    fn frozen_tail_rejects_add_without_change() {
        let mut core = core();
        core.freeze_tail = true;
        let err = core.add(b"x").expect_err("尾部冻结");
        assert!(matches!(err, BufferError::Frozen { end: BufferEnd::Tail }));
        assert_eq!(core.total_len, 0);
        assert!(core.chains.is_empty());
    }
}
