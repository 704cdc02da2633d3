//! 双缓冲操作：整体搬移、前插搬移、区间转移与组播别名。
//!
//! # 设计背景（Why）
//! - 代理、过滤器等中间层要把输入缓冲的数据交给输出缓冲；逐字节复制的成本与数据量成正比，
//!   而链所有权的转移只与链数量有关；
//! - 一份数据需要同时发往多个连接时，组播别名让多个缓冲共享同一块只读内存。
//!
//! # 契约说明（What）
//! - 两个缓冲按标识升序获取串行化锁与内部互斥量，反向并发调用不会死锁；
//! - 所有分配与物化都在修改任何一方之前完成，失败时两个缓冲都保持原状；
//! - 源缓冲中被读钉住的链不会被搬走：其中的数据被复制，链本身留在原缓冲继续接收读入。
//!
//! # 风险提示（Trade-offs）
//! - 被别名的自有链会被标记为不可变，源缓冲随后的追加改为分配新链；
//! - 别名只弱引用源缓冲，不延长其寿命；数据本身由共享内存句柄保活。

use std::{
    collections::VecDeque,
    mem,
    sync::{Arc, Weak},
};

use super::{BufferFlags, ChainBuffer, Shared, state::Core};
use crate::{
    chain::{
        Chain, ChainFlags,
        memory::{ChainMemory, MulticastParent, SegmentSlice},
    },
    error::{BufferError, Result},
};

/// 从源缓冲摘下、等待接入目标缓冲的链。
struct Detached {
    chains: VecDeque<Chain>,
    last_with_data: usize,
    len: usize,
}

impl Core {
    /// 摘下全部可搬移的数据。
    ///
    /// 没有读钉住链时整条序列直接转移；否则钉住链之前的链转移，
    /// 钉住链及其后的数据复制进一条新链，钉住链清空后留在原位。
    fn detach_all(&mut self) -> Result<Detached> {
        let len = self.total_len;
        let Some(pinned) = self.chains.iter().position(Chain::is_pinned_r) else {
            let mut chains = mem::take(&mut self.chains);
            let last_with_data = self.last_with_data;
            // 尾随空链留在源侧释放，前插时它们不会夹在目标数据中间。
            for spare in chains.split_off(last_with_data + 1) {
                self.free_chain(spare);
            }
            self.total_len = 0;
            self.last_with_data = 0;
            self.n_del_for_cb += len;
            return Ok(Detached {
                chains,
                last_with_data,
                len,
            });
        };

        let tail_len: usize = self.chains.iter().skip(pinned).map(|chain| chain.off).sum();
        let copy = if tail_len > 0 {
            let mut copy = self.new_chain(tail_len)?;
            for chain in self.chains.iter().skip(pinned) {
                copy.append(chain.data()?);
            }
            Some(copy)
        } else {
            None
        };

        let mut chains: VecDeque<Chain> = self.chains.drain(..pinned).collect();
        let rest = mem::take(&mut self.chains);
        for mut chain in rest {
            if chain.is_pinned() {
                chain.misalign += chain.off;
                chain.off = 0;
                self.chains.push_back(chain);
            } else {
                self.free_chain(chain);
            }
        }
        if let Some(copy) = copy {
            chains.push_back(copy);
        }
        let last_with_data = chains.iter().rposition(|chain| chain.off > 0).unwrap_or(0);
        tracing::debug!(buffer = self.id, chain_index = pinned, "源缓冲存在读钉住链，复制其数据");
        self.total_len = 0;
        self.last_with_data = 0;
        self.n_del_for_cb += len;
        Ok(Detached {
            chains,
            last_with_data,
            len,
        })
    }

    /// 把摘下的链接到尾部。
    fn attach_tail(&mut self, detached: Detached) {
        if self.total_len == 0 {
            let old = mem::replace(&mut self.chains, detached.chains);
            for chain in old {
                self.free_chain(chain);
            }
            self.last_with_data = detached.last_with_data;
        } else {
            let at = self.free_trailing_empty_chains();
            self.chains.extend(detached.chains);
            self.last_with_data = at + detached.last_with_data;
        }
        self.total_len += detached.len;
        self.n_add_for_cb += detached.len;
    }

    /// 把摘下的链接到头部；目标为空时丢弃未钉住的空链。
    fn attach_head(&mut self, detached: Detached) {
        let count = detached.chains.len();
        if self.total_len == 0 {
            let old = mem::replace(&mut self.chains, detached.chains);
            for chain in old {
                if chain.is_pinned() {
                    self.chains.push_back(chain);
                } else {
                    self.free_chain(chain);
                }
            }
            self.last_with_data = detached.last_with_data;
        } else {
            for chain in detached.chains.into_iter().rev() {
                self.chains.push_front(chain);
            }
            self.last_with_data += count;
        }
        self.total_len += detached.len;
        self.n_add_for_cb += detached.len;
    }
}

fn move_all(dst: &mut Core, src: &mut Core) -> Result<()> {
    dst.check_tail()?;
    src.check_head()?;
    if src.total_len == 0 {
        return Ok(());
    }
    dst.check_growth(src.total_len)?;
    let detached = src.detach_all()?;
    tracing::trace!(from = src.id, to = dst.id, len = detached.len, "整体搬移");
    dst.attach_tail(detached);
    Ok(())
}

fn move_all_to_head(dst: &mut Core, src: &mut Core) -> Result<()> {
    dst.check_head()?;
    src.check_head()?;
    if src.total_len == 0 {
        return Ok(());
    }
    dst.check_growth(src.total_len)?;
    let detached = src.detach_all()?;
    tracing::trace!(from = src.id, to = dst.id, len = detached.len, "前插搬移");
    dst.attach_head(detached);
    Ok(())
}

/// 从 `src` 头部转移 `len` 字节到 `dst` 尾部，整链转移所有权，只复制最后的零头。
fn move_range(src: &mut Core, dst: &mut Core, len: usize) -> Result<usize> {
    src.check_head()?;
    dst.check_tail()?;
    if len == 0 || src.total_len == 0 {
        return Ok(0);
    }
    if len >= src.total_len {
        let moved = src.total_len;
        move_all(dst, src)?;
        return Ok(moved);
    }
    dst.check_growth(len)?;

    let mut whole = 0;
    let mut whole_len = 0;
    for chain in &src.chains {
        if chain.is_pinned() || chain.off > len - whole_len {
            break;
        }
        whole_len += chain.off;
        whole += 1;
    }
    let rest = len - whole_len;
    let mut partial = vec![0u8; rest];
    src.copy_out_from(whole_len, &mut partial)?;

    if whole == 0 {
        dst.add(&partial)?;
        src.drain(rest)?;
        return Ok(len);
    }

    let fits = src.chains[whole - 1].space_len() >= rest;
    let fresh = if rest > 0 && !fits {
        Some(dst.new_chain(rest)?)
    } else {
        None
    };

    let mut moved: VecDeque<Chain> = src.chains.drain(..whole).collect();
    src.total_len -= whole_len;
    src.n_del_for_cb += whole_len;
    src.recompute_last_with_data();
    if rest > 0 {
        match fresh {
            Some(mut chain) => {
                chain.append(&partial);
                moved.push_back(chain);
            }
            None => {
                if let Some(last) = moved.back_mut() {
                    last.append(&partial);
                }
            }
        }
        src.drain(rest)?;
    }

    if dst.total_len == 0 {
        let old = mem::replace(&mut dst.chains, moved);
        for chain in old {
            dst.free_chain(chain);
        }
    } else {
        dst.free_trailing_empty_chains();
        dst.chains.extend(moved);
    }
    dst.recompute_last_with_data();
    dst.total_len += len;
    dst.n_add_for_cb += len;
    tracing::trace!(from = src.id, to = dst.id, len, whole, "区间转移");
    Ok(len)
}

/// 为 `src` 头部至多 `limit` 字节建立别名并追加到 `dst`，返回别名覆盖的字节数。
fn alias_range(
    dst: &mut Core,
    src: &mut Core,
    source: &Weak<Shared>,
    limit: usize,
) -> Result<usize> {
    dst.check_tail()?;
    let len = limit.min(src.total_len);
    if len == 0 {
        return Ok(0);
    }
    dst.check_growth(len)?;
    let keep_transfer = dst.flags.contains(BufferFlags::DRAINS_TO_SINK);

    let mut aliases = Vec::new();
    let mut used = 0;
    let mut remaining = len;
    for chain in &src.chains {
        if remaining == 0 {
            break;
        }
        used += 1;
        if chain.off == 0 {
            continue;
        }
        let take = chain.off.min(remaining);
        let memory = match &chain.memory {
            ChainMemory::Segment(slice) => {
                let transfer_only = slice.transfer_only && keep_transfer;
                if !transfer_only {
                    slice.segment.materialize()?;
                }
                ChainMemory::Segment(SegmentSlice {
                    segment: slice.segment.clone(),
                    transfer_only,
                })
            }
            memory => ChainMemory::Multicast(Box::new(MulticastParent {
                source_id: src.id,
                source: source.clone(),
                parent: memory.share(),
            })),
        };
        aliases.push(chain.with_shared_memory(memory, take));
        remaining -= take;
    }

    for chain in src.chains.iter_mut().take(used) {
        if chain.off > 0 && matches!(chain.memory, ChainMemory::Owned(_)) {
            chain.flags.insert(ChainFlags::IMMUTABLE);
        }
    }
    for alias in aliases {
        dst.insert_chain(alias);
    }
    dst.n_add_for_cb += len;
    tracing::trace!(from = src.id, to = dst.id, len, "建立组播别名");
    Ok(len)
}

impl ChainBuffer {
    /// 同时锁定两个缓冲并执行 `f(self_core, other_core)`，结束后分别触发回调。
    ///
    /// 串行化锁与内部互斥量都按标识升序获取；调用方保证两者不是同一个缓冲。
    fn with_pair<T>(
        &self,
        other: &ChainBuffer,
        f: impl FnOnce(&mut Core, &mut Core) -> Result<T>,
    ) -> Result<T> {
        let self_first = self.id() < other.id();
        let (first, second) = if self_first {
            (&self.shared, &other.shared)
        } else {
            (&other.shared, &self.shared)
        };
        let _first_guard = first.outer_lock();
        let _second_guard = second.outer_lock();
        let (result, graveyards) = {
            let mut first_core = first.core.lock();
            let mut second_core = second.core.lock();
            let result = if self_first {
                f(&mut first_core, &mut second_core)
            } else {
                f(&mut second_core, &mut first_core)
            };
            (
                result,
                (first_core.take_graveyard(), second_core.take_graveyard()),
            )
        };
        drop(graveyards);
        self.invoke_callbacks();
        other.invoke_callbacks();
        result
    }

    fn same_buffer(&self, other: &ChainBuffer) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// 把 `src` 的全部数据搬到本缓冲尾部，`src` 随之清空。
    ///
    /// # 教案式说明
    /// - **意图 (Why)**：过滤链路上“把上游读到的全部字节交给下游”是最常见的搬移，整链转移避免复制。
    /// - **契约 (What)**：
    ///   - 本缓冲尾部或 `src` 头部冻结时返回 [`BufferError::Frozen`]；
    ///   - 同一缓冲或空源为无操作；
    ///   - 本缓冲为空时原有空链被释放，序列整体替换为源链。
    /// - **执行逻辑 (How)**：源中若有读钉住链，其数据复制进新链后再转移，钉住链留在源中。
    pub fn add_buffer(&self, src: &ChainBuffer) -> Result<()> {
        if self.same_buffer(src) {
            return Ok(());
        }
        self.with_pair(src, move_all)
    }

    /// 把 `src` 的全部数据搬到本缓冲头部，顺序保持为 `src` 在前。
    pub fn prepend_buffer(&self, src: &ChainBuffer) -> Result<()> {
        if self.same_buffer(src) {
            return Ok(());
        }
        self.with_pair(src, move_all_to_head)
    }

    /// 从本缓冲头部转移至多 `len` 字节到 `dst` 尾部，返回转移的字节数。
    ///
    /// 整条链直接转移所有权，跨链边界的零头复制；`len` 不小于总长度时等价于
    /// `dst.add_buffer(self)`。
    pub fn remove_buffer(&self, dst: &ChainBuffer, len: usize) -> Result<usize> {
        if self.same_buffer(dst) {
            return Err(BufferError::invalid("源与目标是同一个缓冲"));
        }
        self.with_pair(dst, |src, dst| move_range(src, dst, len))
    }

    /// 以组播别名把 `src` 的全部数据追加到本缓冲，`src` 不被抽干。
    pub fn add_buffer_reference(&self, src: &ChainBuffer) -> Result<usize> {
        self.add_buffer_reference_range(src, usize::MAX)
    }

    /// 以组播别名把 `src` 头部至多 `len` 字节追加到本缓冲，返回别名覆盖的字节数。
    ///
    /// 源中被别名的自有链标记为不可变；文件段链共享同一个段句柄，
    /// 本缓冲未声明 `DRAINS_TO_SINK` 时仅传输的段先被物化。
    pub fn add_buffer_reference_range(&self, src: &ChainBuffer, len: usize) -> Result<usize> {
        if self.same_buffer(src) {
            return Err(BufferError::invalid("不能为缓冲自身建立别名"));
        }
        let source = Arc::downgrade(&src.shared);
        self.with_pair(src, |dst, src| alias_range(dst, src, &source, len))
    }
}
