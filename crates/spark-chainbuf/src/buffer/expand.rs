//! 尾部扩容与分散读准备。
//!
//! # 设计背景（Why）
//! - 读入前必须保证尾部有足够空闲区，否则一次 `readv` 会被截断成多次系统调用；
//! - 追求单块连续会放大内存峰值，追求分散又会增加描述符数量，
//!   因此提供“单链精确扩容”与“跨多链快速扩容”两种入口。
//!
//! # 契约说明（What）
//! - 扩容成功后，写入 `datlen` 字节（连续或分散）不再需要分配；
//! - 扩容失败时缓冲的长度与布局保持不变：新链总在摘除任何旧链之前分配。

use std::mem;

use crate::{
    buffer::{io::IoVec, state::Core},
    chain::{CHAIN_MAX, ChainId},
    error::{BufferError, Result},
};

/// 分散读准备产出的一个描述符及其所属链。
#[derive(Clone, Copy, Debug)]
pub(crate) struct ReservedVec {
    pub(crate) chain: ChainId,
    pub(crate) vec: IoVec,
}

fn commit_mismatch() -> BufferError {
    tracing::warn!("提交的描述符与缓冲空闲区不匹配");
    BufferError::invalid("提交的描述符与缓冲当前空闲区不一致")
}

impl Core {
    /// 保证某一条链拥有至少 `datlen` 字节的连续空闲区，返回该链下标。
    ///
    /// 从最后一条含数据的链出发：空间够就直接用；不可写、被钉住或为空时插入新链；
    /// 搬移代价低时重排；复制量可接受且不会浪费大块空闲时整体换成更大的链；
    /// 否则尝试下一条链，仍不够再插入新链。
    pub(crate) fn expand_singlechain(&mut self, datlen: usize) -> Result<usize> {
        if self.chains.is_empty() {
            return self.insert_new(datlen);
        }
        let index = self.last_with_data;
        let (blocked, space, off, capacity, realign) = {
            let chain = &self.chains[index];
            (
                !chain.is_writable() || chain.is_pinned(),
                chain.space_len(),
                chain.off,
                chain.capacity,
                chain.should_realign(datlen, self.config.max_to_realign_in_expand),
            )
        };
        if blocked {
            return self.insert_new(datlen);
        }
        if space >= datlen {
            return Ok(index);
        }
        if off == 0 {
            return self.insert_new(datlen);
        }
        if realign {
            self.chains[index].align();
            return Ok(index);
        }
        if space < capacity / 8
            || off > self.config.max_to_copy_in_expand
            || datlen >= CHAIN_MAX - off
        {
            if self
                .chains
                .get(index + 1)
                .is_some_and(|next| next.space_len() >= datlen)
            {
                return Ok(index + 1);
            }
            return self.insert_new(datlen);
        }

        let mut bigger = self.new_chain(off + datlen)?;
        bigger.append(self.chains[index].data()?);
        let old = mem::replace(&mut self.chains[index], bigger);
        tracing::trace!(buffer = self.id, copied = off, "扩容替换链");
        self.free_chain(old);
        Ok(index)
    }

    fn insert_new(&mut self, datlen: usize) -> Result<usize> {
        let chain = self.new_chain(datlen)?;
        self.insert_chain(chain);
        Ok(self.chains.len() - 1)
    }

    /// 让从最后一条含数据链开始的至多 `n` 条链合计拥有 `datlen` 字节空闲区。
    ///
    /// 前 `n` 条链不够且已用满 `n` 条时，把所有尾随空链替换为一条足够大的新链，
    /// 以连续性换取描述符数量。
    pub(crate) fn expand_fast(&mut self, datlen: usize, n: usize) -> Result<()> {
        if datlen == 0 {
            return Ok(());
        }
        let last_blocked = self
            .chains
            .back()
            .is_none_or(|chain| !chain.is_writable() || chain.is_pinned());
        if last_blocked {
            let chain = self.new_chain(datlen)?;
            self.insert_chain(chain);
            return Ok(());
        }

        let mut used = 0;
        let mut avail = 0;
        let start = self.last_with_data;
        for chain in self.chains.iter_mut().skip(start) {
            if chain.off > 0 {
                let space = chain.space_len();
                if space > 0 {
                    avail += space;
                    used += 1;
                }
            } else if chain.is_writable() && !chain.is_pinned() {
                chain.misalign = 0;
                avail += chain.capacity;
                used += 1;
            }
            if avail >= datlen {
                return Ok(());
            }
            if used == n {
                break;
            }
        }

        if used < n {
            let chain = self.new_chain(datlen - avail)?;
            self.chains.push_back(chain);
            return Ok(());
        }

        let keep_lwd = self.chains[start].off > 0;
        let (keep, avail) = if keep_lwd {
            (start + 1, self.chains[start].space_len())
        } else {
            (start, 0)
        };
        let replacement = self.new_chain(datlen - avail)?;
        let removed: Vec<_> = self.chains.drain(keep..).collect();
        tracing::trace!(buffer = self.id, removed = removed.len(), "合并尾随空链");
        for chain in removed {
            self.free_chain(chain);
        }
        self.chains.push_back(replacement);
        if !keep_lwd {
            self.last_with_data = 0;
        }
        Ok(())
    }

    /// 从第一条有空闲区的链开始填充至多 `n_vecs` 个描述符，直到覆盖 `howmuch` 字节。
    ///
    /// 精确模式下最后一个描述符截断到剩余长度。
    pub(crate) fn read_setup_vecs(
        &self,
        howmuch: usize,
        n_vecs: usize,
        exact: bool,
    ) -> Vec<ReservedVec> {
        let mut first = self.last_with_data;
        if self
            .chains
            .get(first)
            .is_some_and(|chain| chain.space_len() == 0)
        {
            first += 1;
        }
        let mut vecs = Vec::with_capacity(n_vecs);
        let mut so_far = 0;
        for chain in self.chains.iter().skip(first) {
            if vecs.len() == n_vecs || so_far >= howmuch {
                break;
            }
            let mut avail = chain.space_len();
            if exact && avail > howmuch - so_far {
                avail = howmuch - so_far;
            }
            vecs.push(ReservedVec {
                chain: chain.id,
                vec: IoVec::new(chain.space_ptr(), avail),
            });
            so_far += avail;
        }
        vecs
    }

    /// 预留空闲区并返回描述符；单描述符时保证连续。
    pub(crate) fn reserve_space(&mut self, size: usize, n_vecs: usize) -> Result<Vec<IoVec>> {
        self.check_tail()?;
        if n_vecs == 0 {
            return Err(BufferError::invalid("描述符数量至少为 1"));
        }
        self.check_growth(size)?;
        if n_vecs == 1 {
            let index = self.expand_singlechain(size)?;
            let chain = &self.chains[index];
            return Ok(vec![IoVec::new(chain.space_ptr(), chain.space_len())]);
        }
        self.expand_fast(size, n_vecs)?;
        Ok(self
            .read_setup_vecs(size, n_vecs, false)
            .into_iter()
            .map(|reserved| reserved.vec)
            .collect())
    }

    /// 把写入预留区的字节计入缓冲。
    ///
    /// 先校验全部描述符仍指向各自链当前的空闲区起点且长度不越界，再统一修改。
    pub(crate) fn commit_space(&mut self, vecs: &[IoVec]) -> Result<usize> {
        self.check_tail()?;
        if vecs.is_empty() {
            return Ok(0);
        }
        let added = vecs
            .iter()
            .try_fold(0usize, |acc, vec| acc.checked_add(vec.len()))
            .ok_or_else(commit_mismatch)?;
        self.check_growth(added)?;

        if let [vec] = vecs {
            let found = self
                .chains
                .iter()
                .enumerate()
                .skip(self.last_with_data)
                .find(|(_, chain)| chain.is_writable() && chain.space_ptr() == vec.as_ptr())
                .map(|(index, _)| index);
            if let Some(index) = found {
                if vec.len() > self.chains[index].space_len() {
                    return Err(commit_mismatch());
                }
                self.chains[index].off += vec.len();
                if !vec.is_empty() {
                    self.mark_data_at(index);
                }
                self.total_len += added;
                self.n_add_for_cb += added;
                return Ok(added);
            }
        }

        let mut first = self.last_with_data;
        if self
            .chains
            .get(first)
            .is_some_and(|chain| chain.space_len() == 0)
        {
            first += 1;
        }
        for (offset, vec) in vecs.iter().enumerate() {
            let chain = self.chains.get(first + offset).ok_or_else(commit_mismatch)?;
            if !chain.is_writable()
                || chain.space_ptr() != vec.as_ptr()
                || vec.len() > chain.space_len()
            {
                return Err(commit_mismatch());
            }
        }
        for (offset, vec) in vecs.iter().enumerate() {
            let index = first + offset;
            self.chains[index].off += vec.len();
            if !vec.is_empty() {
                self.last_with_data = index;
            }
        }
        self.total_len += added;
        self.n_add_for_cb += added;
        Ok(added)
    }
}
