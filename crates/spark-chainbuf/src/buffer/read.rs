//! 面向协议解析层的读取辅助：跨链查找、行尾识别、按行读取、线性化与窥视。
//!
//! 所有查找都以字节偏移表达位置，偏移相对于缓冲当前头部；
//! 查找期间只持有内部互斥量，结果在下一次头部修改之后失效。

use bytes::{Bytes, BytesMut};

use super::{ChainBuffer, state::Core};
use crate::error::{BufferError, Result};

/// 行尾的识别方式。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EolStyle {
    /// 任意长度的 `\r`/`\n` 组合。
    Any,
    /// 可选的 `\r` 后跟 `\n`。
    Crlf,
    /// 严格的 `\r\n`。
    CrlfStrict,
    /// 单个 `\n`。
    Lf,
    /// 单个 `\0`。
    Nul,
}

/// 按顺序遍历若干切片中的字节，附带绝对位置。
fn bytes_from<'a>(slices: &'a [&'a [u8]], base: usize) -> impl Iterator<Item = (usize, u8)> + 'a {
    slices
        .iter()
        .flat_map(|slice| slice.iter().copied())
        .enumerate()
        .map(move |(index, byte)| (base + index, byte))
}

/// 判断 `needle` 是否从第 `slice` 个切片的 `offset` 处开始出现。
fn matches_at(slices: &[&[u8]], mut slice: usize, mut offset: usize, needle: &[u8]) -> bool {
    for &want in needle {
        while slices.get(slice).is_some_and(|current| offset >= current.len()) {
            slice += 1;
            offset = 0;
        }
        match slices.get(slice) {
            Some(current) if current[offset] == want => offset += 1,
            _ => return false,
        }
    }
    true
}

fn find(slices: &[&[u8]], needle: &[u8], base: usize) -> Option<usize> {
    let first = *needle.first()?;
    let mut position = base;
    for (index, slice) in slices.iter().enumerate() {
        let mut from = 0;
        while let Some(hit) = slice[from..].iter().position(|&byte| byte == first) {
            let offset = from + hit;
            if matches_at(slices, index, offset, needle) {
                return Some(position + offset);
            }
            from = offset + 1;
        }
        position += slice.len();
    }
    None
}

fn find_eol(slices: &[&[u8]], base: usize, style: EolStyle) -> Option<(usize, usize)> {
    match style {
        EolStyle::Any => {
            let mut iter = bytes_from(slices, base).skip_while(|&(_, byte)| !is_crlf(byte));
            let (start, _) = iter.next()?;
            let run = 1 + iter.take_while(|&(_, byte)| is_crlf(byte)).count();
            Some((start, run))
        }
        EolStyle::Crlf => {
            let mut previous_cr = None;
            for (position, byte) in bytes_from(slices, base) {
                match byte {
                    b'\n' => {
                        return Some(match previous_cr {
                            Some(cr) => (cr, 2),
                            None => (position, 1),
                        });
                    }
                    b'\r' => previous_cr = Some(position),
                    _ => previous_cr = None,
                }
            }
            None
        }
        EolStyle::CrlfStrict => find(slices, b"\r\n", base).map(|position| (position, 2)),
        EolStyle::Lf => find(slices, b"\n", base).map(|position| (position, 1)),
        EolStyle::Nul => find(slices, b"\0", base).map(|position| (position, 1)),
    }
}

fn is_crlf(byte: u8) -> bool {
    byte == b'\r' || byte == b'\n'
}

impl Core {
    fn check_position(&self, start: usize) -> Result<()> {
        if start > self.total_len {
            return Err(BufferError::invalid(format!(
                "起始位置 {start} 超过缓冲长度 {}",
                self.total_len
            )));
        }
        Ok(())
    }

    pub(crate) fn search_range(
        &self,
        needle: &[u8],
        start: usize,
        end: usize,
    ) -> Result<Option<usize>> {
        self.check_position(start)?;
        if needle.is_empty() {
            return Ok(Some(start));
        }
        let end = end.min(self.total_len);
        if end < start || end - start < needle.len() {
            return Ok(None);
        }
        let slices = self.slices(start, end - start)?;
        Ok(find(&slices, needle, start))
    }

    pub(crate) fn search_eol(&self, start: usize, style: EolStyle) -> Result<Option<(usize, usize)>> {
        self.check_position(start)?;
        let slices = self.slices(start, self.total_len - start)?;
        Ok(find_eol(&slices, start, style))
    }

    /// 让头部 `size` 字节落在首链的连续内存中。
    ///
    /// 首链可写且从错位起点到容量末尾放得下时就地追加，否则先分配新链再复制；
    /// 被完整吸收的链释放，部分吸收的链推进数据窗口。涉及的链被钉住时拒绝。
    pub(crate) fn pullup(&mut self, size: usize) -> Result<()> {
        if size > self.total_len {
            return Err(BufferError::invalid(format!(
                "线性化长度 {size} 超过缓冲长度 {}",
                self.total_len
            )));
        }
        if size == 0 || self.chains.front().is_some_and(|front| front.off >= size) {
            return Ok(());
        }

        let mut covered = 0;
        let mut needed = 0;
        for chain in &self.chains {
            if covered >= size {
                break;
            }
            if chain.is_pinned() {
                return Err(BufferError::Pinned {
                    chain: chain.id.get(),
                });
            }
            chain.data()?;
            covered += chain.off;
            needed += 1;
        }
        tracing::trace!(buffer = self.id, size, chains = needed, "线性化头部");

        let in_place = self
            .chains
            .front()
            .is_some_and(|front| front.is_writable() && front.capacity - front.misalign >= size);
        let consumed = if in_place {
            let Some((front, rest)) = self.chains.make_contiguous().split_first_mut() else {
                return Ok(());
            };
            let mut remaining = size - front.off;
            let mut consumed = 0;
            for chain in rest.iter_mut() {
                if remaining == 0 {
                    break;
                }
                let take = remaining.min(chain.off);
                front.append(&chain.data()?[..take]);
                chain.misalign += take;
                chain.off -= take;
                remaining -= take;
                if chain.off == 0 {
                    consumed += 1;
                }
            }
            self.chains.drain(1..1 + consumed).collect::<Vec<_>>()
        } else {
            let mut fresh = self.new_chain(size)?;
            let mut remaining = size;
            let mut consumed = 0;
            for chain in self.chains.iter_mut() {
                if remaining == 0 {
                    break;
                }
                let take = remaining.min(chain.off);
                fresh.append(&chain.data()?[..take]);
                chain.misalign += take;
                chain.off -= take;
                remaining -= take;
                if chain.off == 0 {
                    consumed += 1;
                }
            }
            let drained: Vec<_> = self.chains.drain(..consumed).collect();
            self.chains.push_front(fresh);
            drained
        };
        for chain in consumed {
            self.free_chain(chain);
        }
        self.recompute_last_with_data();
        Ok(())
    }
}

impl ChainBuffer {
    /// 从 `start` 开始查找 `needle`，返回首次出现的位置。空模式匹配 `start` 本身。
    pub fn search(&self, needle: &[u8], start: usize) -> Result<Option<usize>> {
        self.locked(|core| core.search_range(needle, start, usize::MAX))
    }

    /// 在 `[start, end)` 内查找 `needle`，匹配必须完整落在区间内。
    pub fn search_range(&self, needle: &[u8], start: usize, end: usize) -> Result<Option<usize>> {
        self.locked(|core| core.search_range(needle, start, end))
    }

    /// 从 `start` 开始查找行尾，返回 `(位置, 行尾长度)`。
    pub fn search_eol(&self, start: usize, style: EolStyle) -> Result<Option<(usize, usize)>> {
        self.locked(|core| core.search_eol(start, style))
    }

    /// 读出并移除一行，返回值不含行尾；没有完整行时返回 `None` 且缓冲不变。
    ///
    /// # 教案式说明
    /// - **意图 (Why)**：请求行、头部字段等按行组织的协议需要“有完整行才消费”的原语。
    /// - **契约 (What)**：头部冻结时返回 [`BufferError::Frozen`]；行与行尾一并抽干，回调只看到一次删除。
    /// - **执行逻辑 (How)**：在同一临界区内完成查找、复制与抽干，期间不会有其他线程插入数据。
    pub fn readln(&self, style: EolStyle) -> Result<Option<Bytes>> {
        self.mutate(|core| {
            core.check_head()?;
            let Some((position, eol_len)) = core.search_eol(0, style)? else {
                return Ok(None);
            };
            let mut line = BytesMut::zeroed(position);
            core.copy_out_from(0, &mut line)?;
            core.drain(position + eol_len)?;
            Ok(Some(line.freeze()))
        })
    }

    /// 让头部 `size` 字节连续存放。
    pub fn pullup(&self, size: usize) -> Result<()> {
        self.locked(|core| core.pullup(size))
    }

    /// 线性化头部 `size` 字节后以连续切片交给 `f`。
    ///
    /// `f` 在内部互斥量内执行，不得再操作同一缓冲。
    pub fn pullup_with<T>(&self, size: usize, f: impl FnOnce(&[u8]) -> T) -> Result<T> {
        self.locked(|core| {
            core.pullup(size)?;
            if size == 0 {
                return Ok(f(&[]));
            }
            let front = core
                .chains
                .front()
                .ok_or_else(|| BufferError::invalid("线性化后缺少首链"))?;
            Ok(f(&front.data()?[..size]))
        })
    }

    /// 以切片序列窥视头部至多 `len` 字节，不移除、不复制。
    ///
    /// `f` 在内部互斥量内执行，不得再操作同一缓冲。
    pub fn peek_with<T>(&self, len: usize, f: impl FnOnce(&[&[u8]]) -> T) -> Result<T> {
        self.locked(|core| {
            let len = len.min(core.total_len);
            let slices = core.slices(0, len)?;
            Ok(f(&slices))
        })
    }
}
