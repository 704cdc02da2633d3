//! 文件段：对打开文件某一字节区间的共享句柄。
//!
//! # 模块定位（Why）
//! - 静态文件、日志回放等出站场景希望把文件内容挂入输出缓冲而不经用户态复制；
//! - 同一个段可能同时挂在多个缓冲（或同一缓冲的多条链）上，因此段拥有独立于任何缓冲的锁与计数。
//!
//! # 设计概要（How）
//! - 段创建时记录文件、偏移与长度；若允许直接传输，则延迟物化，挂入“排空到输出端”的缓冲时
//!   作为仅传输链存在，写出时直接从文件读取并写入目标；
//! - 其余情况按需物化：优先 `memmap2` 映射，映射失败或被禁用时整段读入内存；
//! - 计数与清理回调由段自己的 `spin::Mutex` 保护，最后一个句柄释放时恰好执行一次清理。
//!
//! # 风险提示（Trade-offs）
//! - 映射文件在其他进程截断时访问会触发 `SIGBUS`，这是 mmap 的固有风险；对不可信文件请禁用映射。

use std::{
    fmt,
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
    sync::{Arc, OnceLock},
};

use memmap2::{Mmap, MmapOptions};
use spin::Mutex as SpinMutex;

use crate::{
    chain::CHAIN_MAX,
    error::{BufferError, Result},
};

/// 仅传输模式下单次从文件读取的最大字节数。
const TRANSFER_CHUNK: usize = 64 * 1024;

/// 文件段的创建选项。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentOptions {
    /// 禁用内存映射，物化时改为整段读入。
    pub disable_mmap: bool,
    /// 禁用直接传输，创建时立即物化。
    pub disable_direct_transfer: bool,
}

impl SegmentOptions {
    /// 禁用内存映射。
    pub fn without_mmap(mut self) -> Self {
        self.disable_mmap = true;
        self
    }

    /// 禁用直接传输。
    pub fn without_direct_transfer(mut self) -> Self {
        self.disable_direct_transfer = true;
        self
    }
}

/// 清理回调收到的段描述。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentInfo {
    pub file_offset: u64,
    pub length: usize,
    pub mapped: bool,
}

type SegmentCleanup = Box<dyn FnOnce(&SegmentInfo) + Send>;

enum Backing {
    Mapped(Mmap),
    Loaded(Box<[u8]>),
}

impl Backing {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Mapped(map) => map,
            Self::Loaded(bytes) => bytes,
        }
    }
}

struct SegmentState {
    refcnt: usize,
    cleanup: Option<SegmentCleanup>,
}

struct SegmentInner {
    file: parking_lot::Mutex<File>,
    file_offset: u64,
    length: usize,
    options: SegmentOptions,
    backing: OnceLock<Backing>,
    state: SpinMutex<SegmentState>,
}

impl SegmentInner {
    fn build_backing(&self, file: &mut File) -> Result<Backing> {
        if self.length == 0 {
            return Ok(Backing::Loaded(Box::default()));
        }
        if !self.options.disable_mmap {
            // SAFETY: 映射为只读；文件在映射存活期间被外部截断属于调用方须规避的已知风险。
            let mapped = unsafe {
                MmapOptions::new()
                    .offset(self.file_offset)
                    .len(self.length)
                    .map(&*file)
            };
            match mapped {
                Ok(map) => {
                    tracing::debug!(offset = self.file_offset, len = self.length, "文件段已映射");
                    return Ok(Backing::Mapped(map));
                }
                Err(error) => {
                    tracing::debug!(%error, "文件段映射失败，回退为整段读取");
                }
            }
        }
        let mut contents: Vec<u8> = Vec::new();
        contents
            .try_reserve_exact(self.length)
            .map_err(|_| BufferError::OutOfMemory {
                requested: self.length,
            })?;
        contents.resize(self.length, 0);
        file.seek(SeekFrom::Start(self.file_offset))?;
        file.read_exact(&mut contents)?;
        tracing::debug!(offset = self.file_offset, len = self.length, "文件段已读入内存");
        Ok(Backing::Loaded(contents.into_boxed_slice()))
    }
}

/// 引用计数的文件段句柄。
///
/// # 教案式说明
/// - **意图 (Why)**：让多个缓冲零拷贝地共享同一文件区间，并在最后一个使用者离开时通知拥有者。
/// - **契约 (What)**：
///   - `Clone` 在段锁内递增计数，`Drop` 在段锁内递减；计数归零时在锁外调用清理回调，仅一次；
///   - 映射与文件描述符随最后一个句柄一同释放；
///   - 段内容只读，任何缓冲都不能通过段链写入。
/// - **执行逻辑 (How)**：计数与 `Arc` 强引用同步增减，显式计数让清理时机可观测、可测试。
pub struct FileSegment {
    inner: Arc<SegmentInner>,
}

impl FileSegment {
    /// 以已打开的文件创建段。
    ///
    /// - `length` 为 `None` 时取 `文件长度 - offset`，显式长度不得越过文件末尾；
    /// - 偏移超过文件长度返回参数错误，长度超过链上限返回溢出错误；
    /// - 禁用直接传输时立即物化，物化失败的错误直接返回。
    pub fn new(file: File, offset: u64, length: Option<u64>, options: SegmentOptions) -> Result<Self> {
        let remaining = file
            .metadata()?
            .len()
            .checked_sub(offset)
            .ok_or_else(|| BufferError::invalid("文件段偏移超过文件长度"))?;
        let length = match length {
            Some(length) if length > remaining => {
                return Err(BufferError::invalid("文件段区间越过文件末尾"));
            }
            Some(length) => length,
            None => remaining,
        };
        let length = usize::try_from(length)
            .ok()
            .filter(|length| *length <= CHAIN_MAX)
            .ok_or(BufferError::Overflow {
                requested: usize::try_from(length).unwrap_or(usize::MAX),
                max: CHAIN_MAX,
            })?;

        let segment = Self {
            inner: Arc::new(SegmentInner {
                file: parking_lot::Mutex::new(file),
                file_offset: offset,
                length,
                options,
                backing: OnceLock::new(),
                state: SpinMutex::new(SegmentState {
                    refcnt: 1,
                    cleanup: None,
                }),
            }),
        };
        if options.disable_direct_transfer {
            segment.materialize()?;
        }
        Ok(segment)
    }

    /// 打开路径并创建段。
    pub fn open(
        path: impl AsRef<Path>,
        offset: u64,
        length: Option<u64>,
        options: SegmentOptions,
    ) -> Result<Self> {
        Self::new(File::open(path)?, offset, length, options)
    }

    /// 注册清理回调；重复注册时以最后一次为准。
    pub fn add_cleanup<F>(&self, cleanup: F)
    where
        F: FnOnce(&SegmentInfo) + Send + 'static,
    {
        self.inner.state.lock().cleanup = Some(Box::new(cleanup));
    }

    pub fn len(&self) -> usize {
        self.inner.length
    }

    pub fn is_empty(&self) -> bool {
        self.inner.length == 0
    }

    pub fn file_offset(&self) -> u64 {
        self.inner.file_offset
    }

    /// 当前持有者数量。
    pub fn ref_count(&self) -> usize {
        self.inner.state.lock().refcnt
    }

    /// 是否允许写出时绕过物化直接从文件传输。
    pub fn can_transfer_direct(&self) -> bool {
        !self.inner.options.disable_direct_transfer
    }

    /// 是否已由内存映射承载。
    pub fn is_mapped(&self) -> bool {
        matches!(self.inner.backing.get(), Some(Backing::Mapped(_)))
    }

    pub fn is_materialized(&self) -> bool {
        self.inner.backing.get().is_some()
    }

    pub fn info(&self) -> SegmentInfo {
        SegmentInfo {
            file_offset: self.inner.file_offset,
            length: self.inner.length,
            mapped: self.is_mapped(),
        }
    }

    /// 返回段内容，首次调用时在段锁内物化。
    pub(crate) fn materialize(&self) -> Result<&[u8]> {
        if let Some(backing) = self.inner.backing.get() {
            return Ok(backing.as_slice());
        }
        {
            let mut file = self.inner.file.lock();
            if self.inner.backing.get().is_none() {
                let backing = self.inner.build_backing(&mut file)?;
                if self.inner.backing.set(backing).is_err() {
                    // 物化只在文件锁内发生，此分支意味着锁序被破坏。
                    return Err(BufferError::invalid("文件段重复物化"));
                }
            }
        }
        self.inner
            .backing
            .get()
            .map(Backing::as_slice)
            .ok_or_else(|| BufferError::invalid("文件段物化结果丢失"))
    }

    /// 把段内 `[offset, offset + len)` 的前缀写入 `sink`，返回实际写出的字节数。
    ///
    /// 已物化的段直接写出内存视图；否则从文件读取至多一个传输块后单次写出，
    /// 部分写出时返回值小于 `len`，调用方只抽干已写出的部分。
    pub(crate) fn transfer_to<W>(&self, sink: &mut W, offset: usize, len: usize) -> Result<usize>
    where
        W: Write + ?Sized,
    {
        if len == 0 {
            return Ok(0);
        }
        if let Some(backing) = self.inner.backing.get() {
            let view = backing
                .as_slice()
                .get(offset..offset + len)
                .ok_or_else(|| BufferError::invalid("传输区间越过文件段末尾"))?;
            return write_retrying(sink, view);
        }
        let chunk_len = len.min(TRANSFER_CHUNK);
        let mut chunk = vec![0u8; chunk_len];
        {
            let mut file = self.inner.file.lock();
            file.seek(SeekFrom::Start(self.inner.file_offset + offset as u64))?;
            file.read_exact(&mut chunk)?;
        }
        write_retrying(sink, &chunk)
    }
}

/// 单次写出，`Interrupted` 时重试。
fn write_retrying<W>(sink: &mut W, bytes: &[u8]) -> Result<usize>
where
    W: Write + ?Sized,
{
    loop {
        match sink.write(bytes) {
            Ok(written) => return Ok(written),
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(error.into()),
        }
    }
}

impl Clone for FileSegment {
    fn clone(&self) -> Self {
        self.inner.state.lock().refcnt += 1;
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for FileSegment {
    fn drop(&mut self) {
        let cleanup = {
            let mut state = self.inner.state.lock();
            state.refcnt -= 1;
            if state.refcnt == 0 {
                Some(state.cleanup.take())
            } else {
                None
            }
        };
        if let Some(cleanup) = cleanup {
            let info = self.info();
            tracing::debug!(offset = info.file_offset, len = info.length, "文件段最后一个持有者释放");
            if let Some(cleanup) = cleanup {
                cleanup(&info);
            }
        }
    }
}

impl fmt::Debug for FileSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSegment")
            .field("file_offset", &self.inner.file_offset)
            .field("length", &self.inner.length)
            .field("ref_count", &self.ref_count())
            .field("mapped", &self.is_mapped())
            .finish()
    }
}
