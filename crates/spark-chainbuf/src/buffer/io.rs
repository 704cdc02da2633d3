//! 缓冲与 `std::io` 之间的适配。
//!
//! # 设计背景（Why）
//! - 连接层最常见的两件事是“从套接字读入尾部”和“把头部写往套接字”；
//! - 两者都建立在钉住令牌之上：读入期间尾部空闲区被钉住，写出期间头部数据窗口被钉住，
//!   系统调用可以在不持有缓冲内部互斥量的情况下直接访问链内存。
//!
//! # 契约说明（What）
//! - `read_from` 单次读取不超过 `max_read`；读到 0 字节表示对端关闭，缓冲不变；
//! - `write_to` 只抽干实际写出的字节数，部分写出时剩余数据保持原位；
//! - `Interrupted` 会被透明重试，其余 I/O 错误原样返回且不改变缓冲。

use std::{fmt, io, slice};

use super::ChainBuffer;
use crate::error::{BufferError, Result};

/// 指向链内存的一段原始区间。
///
/// 由 [`ChainBuffer::reserve_space`] 返回，指向尾部空闲区；调用方写入后截断长度再提交。
/// 描述符本身不持有内存，在提交或下一次尾部修改之后即失效。
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct IoVec {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: 描述符只是地址与长度，解引用的安全性由 `as_mut_slice` 的调用方负责。
unsafe impl Send for IoVec {}
// SAFETY: 同上。
unsafe impl Sync for IoVec {}

impl IoVec {
    pub(crate) fn new(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// 把长度截断为实际写入量；不能加长。
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    /// 以可变切片访问区间。
    ///
    /// # Safety
    /// 调用方保证描述符仍然有效（尚未提交、缓冲尾部未被修改），且同一区间不存在其他活跃借用。
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        if self.len == 0 {
            return &mut [];
        }
        // SAFETY: 由调用方保证区间有效且独占。
        unsafe { slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    /// 以只读切片访问区间。
    ///
    /// # Safety
    /// 调用方保证区间有效，且没有并发写入。
    pub(crate) unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        if self.len == 0 {
            return &[];
        }
        // SAFETY: 由调用方保证。
        unsafe { slice::from_raw_parts(self.ptr.cast_const(), self.len) }
    }
}

impl fmt::Debug for IoVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoVec")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

impl ChainBuffer {
    /// 从 `reader` 读入至多 `at_most` 字节追加到尾部，返回读入的字节数。
    ///
    /// # 教案式说明
    /// - **意图 (Why)**：把“扩容、分散读、提交”三步收敛为一次调用，供事件循环在可读事件中使用。
    /// - **契约 (What)**：
    ///   - `at_most` 被截断到 [`max_read`](Self::max_read)，为 0 时直接返回 `Ok(0)`；
    ///   - 返回 `Ok(0)` 表示读到文件尾或对端关闭；
    ///   - 读失败时缓冲长度不变，预留的空闲区保留给下一次读入。
    /// - **执行逻辑 (How)**：启用串行化锁时整个过程持锁；
    ///   以 `read_iovecs` 个描述符钉住尾部空闲区，调用 `read_vectored`，再按实际字节数提交。
    pub fn read_from<R>(&self, reader: &mut R, at_most: usize) -> Result<usize>
    where
        R: io::Read + ?Sized,
    {
        let _guard = self.lock();
        let (max_read, n_vecs) = self.locked(|core| (core.max_read, core.config.read_iovecs));
        let at_most = at_most.min(max_read);
        if at_most == 0 {
            return Ok(0);
        }
        let mut pending = self.launch_read(at_most, n_vecs)?;
        let read = loop {
            let mut slices = pending.io_slices_mut();
            match reader.read_vectored(&mut slices) {
                Ok(read) => break read,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    tracing::debug!(buffer = self.id(), %error, "读入失败");
                    return Err(error.into());
                }
            }
        };
        pending.commit(read)
    }

    /// 把全部数据写往 `sink`（受单次描述符数量限制），返回写出并抽干的字节数。
    pub fn write_to<W>(&self, sink: &mut W) -> Result<usize>
    where
        W: io::Write + ?Sized,
    {
        self.write_to_at_most(sink, usize::MAX)
    }

    /// 把至多 `at_most` 字节写往 `sink`。
    ///
    /// 头部是仅传输的文件段时，本次只处理这一条链，直接从文件读取后写出；
    /// 否则以 `write_iovecs` 个描述符做一次向量写。
    pub fn write_to_at_most<W>(&self, sink: &mut W, at_most: usize) -> Result<usize>
    where
        W: io::Write + ?Sized,
    {
        let _guard = self.lock();
        let n_vecs = self.locked(|core| core.config.write_iovecs);
        let pending = self.launch_write(at_most, n_vecs)?;
        if pending.is_empty() {
            pending.commit(0)?;
            return Ok(0);
        }
        let written = match pending.write_to(sink) {
            Ok(written) => written,
            Err(error) => {
                tracing::debug!(buffer = self.id(), %error, "写出失败");
                return Err(error);
            }
        };
        pending.commit(written)
    }
}

fn to_io_error(error: BufferError) -> io::Error {
    match error {
        BufferError::Io { source } => source,
        other => io::Error::other(other),
    }
}

impl io::Write for &ChainBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.add(buf).map_err(to_io_error)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Write for ChainBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut &*self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Read for &ChainBuffer {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        self.remove(out).map_err(to_io_error)
    }
}

impl io::Read for ChainBuffer {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut &*self, out)
    }
}

impl fmt::Write for ChainBuffer {
    fn write_str(&mut self, text: &str) -> fmt::Result {
        self.add(text.as_bytes()).map_err(|_| fmt::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    /// 每次最多接受 `limit` 字节的输出端。
    struct Trickle {
        limit: usize,
        out: Vec<u8>,
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let take = buf.len().min(self.limit);
            self.out.extend_from_slice(&buf[..take]);
            Ok(take)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn read_from_respects_max_read() {
        let buffer = ChainBuffer::new();
        buffer.set_max_read(10).expect("设置上限");
        let mut source: &[u8] = b"0123456789abcdef";
        let read = buffer.read_from(&mut source, 100).expect("读入");
        assert_eq!(read, 10);
        assert_eq!(buffer.len(), 10);
        buffer.check_invariants().expect("不变式");
    }

    #[test]
    fn read_from_eof_leaves_buffer_unchanged() {
        let buffer = ChainBuffer::new();
        buffer.add(b"kept").expect("追加");
        let mut source: &[u8] = b"";
        assert_eq!(buffer.read_from(&mut source, 64).expect("读入"), 0);
        assert_eq!(buffer.len(), 4);
        assert!(!buffer.is_frozen(crate::buffer::BufferEnd::Tail), "令牌提交后尾部解冻");
    }

    #[test]
    fn partial_write_drains_only_written_bytes() {
        let buffer = ChainBuffer::new();
        buffer.add(b"hello world").expect("追加");
        let mut sink = Trickle {
            limit: 5,
            out: Vec::new(),
        };
        assert_eq!(buffer.write_to(&mut sink).expect("写出"), 5);
        assert_eq!(sink.out, b"hello");
        assert_eq!(buffer.len(), 6);
    }

    #[test]
    fn std_traits_route_through_buffer() {
        let mut buffer = ChainBuffer::new();
        write!(buffer, "{}-{}", 7, "x").expect("格式化写入");
        let mut out = String::new();
        buffer.read_to_string(&mut out).expect("读出");
        assert_eq!(out, "7-x");
        assert!(buffer.is_empty());
    }
}
