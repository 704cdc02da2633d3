//! 链式字节缓冲。
//!
//! # 模块定位（Why）
//! - 事件驱动 I/O 库的输入、输出方向都需要“尾部追加、头部抽干”的字节队列；
//! - 以固定容量的链拼接而非单块可变数组，追加与抽干都是摊还 O(1)，
//!   并且可以零拷贝地挂入外部内存、文件段与其他缓冲的链。
//!
//! # 结构概览（How）
//! - [`ChainBuffer`] 是可克隆的句柄，克隆即增加缓冲引用计数，最后一个句柄释放时销毁；
//! - 可变状态集中在内部互斥量保护的核心里，算法分布在子模块：
//!   `state`（追加/抽干/回调计数）、`expand`（扩容与分散读准备）、`pin`（钉住令牌）、
//!   `transfer`（双缓冲搬移与组播别名）、`read`（查找与按行读取）、`io`（读写适配）；
//! - 回调在内部互斥量释放之后执行，可选的 [`BufferLock`] 则在整个操作（含回调遍历）期间持有。

mod expand;
mod io;
mod pin;
mod read;
mod state;
mod transfer;

use std::{
    any::Any,
    fmt,
    fs::File,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use arc_swap::ArcSwapOption;
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, ReentrantMutex};

use crate::{
    callback::{CallbackHandle, CallbackInfo, PassMode},
    chain::{ChainInfo, memory::ExternalRef},
    config::BufferConfig,
    deferred::{DeferredHandle, DeferredScheduler},
    error::{BufferError, Result},
    lock::{BufferGuard, BufferLock},
    segment::{FileSegment, SegmentOptions},
};

pub use io::IoVec;
pub use pin::{PendingRead, PendingWrite};
pub use read::EolStyle;

pub(crate) use state::Core;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// 缓冲的两端。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferEnd {
    /// 抽干一侧。
    Head,
    /// 追加一侧。
    Tail,
}

impl fmt::Display for BufferEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Head => f.write_str("头部"),
            Self::Tail => f.write_str("尾部"),
        }
    }
}

/// 缓冲级别的行为标志。
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const EMPTY: Self = Self(0);
    /// 缓冲内容最终写往输出端：允许以仅传输链挂入文件段，写出时直接从文件传输。
    pub const DRAINS_TO_SINK: Self = Self(1);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl fmt::Debug for BufferFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferFlags")
            .field("drains_to_sink", &self.contains(Self::DRAINS_TO_SINK))
            .finish()
    }
}

/// 缓冲的运行时统计。
///
/// - `owned_bytes` 只统计缓冲自有分配（含待销毁链），外部引用、文件段与别名不计入；
/// - `chains_allocated` / `chains_freed` 为累计值，二者之差加上外部来源的链数即为存活链数。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub len: usize,
    pub chains: usize,
    pub dangling: usize,
    pub owned_bytes: usize,
    pub chains_allocated: u64,
    pub chains_freed: u64,
    pub callbacks: usize,
}

/// 所有句柄共享的缓冲本体。
pub(crate) struct Shared {
    id: u64,
    lock: ArcSwapOption<ReentrantMutex<()>>,
    core: Mutex<Core>,
}

impl Shared {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// 获取可选的串行化锁。
    pub(crate) fn outer_lock(&self) -> Option<BufferGuard> {
        self.lock.load_full().map(|lock| lock.lock_arc())
    }

    /// 在内部互斥量内执行 `f`，随后在锁外丢弃本次释放的链。
    pub(crate) fn with_core<T>(&self, f: impl FnOnce(&mut Core) -> T) -> T {
        let (value, graveyard) = {
            let mut core = self.core.lock();
            let value = f(&mut core);
            (value, core.take_graveyard())
        };
        drop(graveyard);
        value
    }
}

/// 链式缓冲句柄。
///
/// # 教案式说明
/// - **意图 (Why)**：为连接层提供“追加、抽干、窥视、跨缓冲搬移、挂入文件段、观察长度变化”的统一原语。
/// - **契约 (What)**：
///   - `Clone` 增加缓冲引用计数，`Drop` 递减；归零即销毁，这是唯一的销毁路径；
///   - 任何返回 `Err` 的操作都不改变缓冲内容与布局；
///   - 每个修改操作结束时按需触发一次回调遍历，同步执行或交给推迟调度器；
///   - 句柄 `Send + Sync`，单个操作总是线程安全的；需要跨多个操作保持原子性时启用 [`BufferLock`]。
/// - **执行逻辑 (How)**：操作先获取可选的串行化锁，再在内部互斥量内运行算法，
///   释放互斥量后丢弃被释放的链并执行回调。
///
/// # 风险提示（Trade-offs）
/// - 回调、窥视闭包收到的是借用视图；在 `peek_with`/`pullup_with` 闭包中再次操作同一缓冲会死锁。
pub struct ChainBuffer {
    shared: Arc<Shared>,
}

impl ChainBuffer {
    /// 以默认配置创建空缓冲。
    pub fn new() -> Self {
        Self::from_builder(BufferBuilder::new())
    }

    pub fn builder() -> BufferBuilder {
        BufferBuilder::new()
    }

    fn from_builder(builder: BufferBuilder) -> Self {
        let id = NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed);
        let mut core = Core::new(id, builder.config, builder.flags);
        core.deferred = builder.scheduler.map(DeferredHandle::new);
        core.owner = builder.owner;
        tracing::trace!(buffer = id, "创建缓冲");
        Self {
            shared: Arc::new(Shared {
                id,
                lock: ArcSwapOption::new(builder.lock.map(BufferLock::into_arc)),
                core: Mutex::new(core),
            }),
        }
    }

    /// 进程内唯一的缓冲标识，双缓冲操作按它排序加锁。
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// 在串行化锁内访问核心，不触发回调。
    pub(crate) fn locked<T>(&self, f: impl FnOnce(&mut Core) -> T) -> T {
        let _guard = self.shared.outer_lock();
        self.shared.with_core(f)
    }

    /// 执行修改操作并在结束时触发回调遍历。
    pub(crate) fn mutate<T>(&self, f: impl FnOnce(&mut Core) -> Result<T>) -> Result<T> {
        let _guard = self.shared.outer_lock();
        let result = self.shared.with_core(f);
        self.invoke_callbacks();
        result
    }

    /// 一次修改结束后的回调遍历。
    ///
    /// 未启用推迟时同步执行全部启用的回调并清零计数；
    /// 启用推迟时先调度推迟任务，再同步执行免推迟回调，计数留给推迟遍历清零。
    pub(crate) fn invoke_callbacks(&self) {
        let (pass, deferred) = self.shared.with_core(|core| match core.deferred.clone() {
            Some(handle) => {
                let due = !core.callbacks.is_empty()
                    && (core.n_add_for_cb != 0 || core.n_del_for_cb != 0);
                (
                    core.take_pass(PassMode::InlineNoDefer),
                    due.then_some(handle),
                )
            }
            None => (core.take_pass(PassMode::Inline), None),
        });
        if let Some(handle) = deferred {
            handle.schedule(self);
        }
        if let Some(pass) = pass {
            pass.run(self);
        }
    }

    pub(crate) fn run_deferred_callbacks(&self) {
        let _guard = self.shared.outer_lock();
        let pass = self
            .shared
            .with_core(|core| core.take_pass(PassMode::Deferred));
        if let Some(pass) = pass {
            pass.run(self);
        }
    }

    pub fn len(&self) -> usize {
        self.locked(|core| core.total_len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 首链中连续可读的字节数。
    pub fn contiguous_space(&self) -> usize {
        self.locked(|core| core.chains.front().map_or(0, |chain| chain.off))
    }

    /// 追加字节。
    pub fn add(&self, data: &[u8]) -> Result<()> {
        self.mutate(|core| core.add(data))
    }

    /// 追加格式化文本，返回写入的字节数。
    pub fn add_fmt(&self, args: fmt::Arguments<'_>) -> Result<usize> {
        match args.as_str() {
            Some(text) => self.add(text.as_bytes()).map(|()| text.len()),
            None => {
                let text = args.to_string();
                self.add(text.as_bytes()).map(|()| text.len())
            }
        }
    }

    /// 在头部插入字节。
    pub fn prepend(&self, data: &[u8]) -> Result<()> {
        self.mutate(|core| core.prepend(data))
    }

    /// 从头部丢弃至多 `len` 字节，返回实际丢弃的字节数。
    pub fn drain(&self, len: usize) -> Result<usize> {
        self.mutate(|core| core.drain(len))
    }

    /// 读出并移除至多 `out.len()` 字节。
    pub fn remove(&self, out: &mut [u8]) -> Result<usize> {
        self.mutate(|core| {
            core.check_head()?;
            let copied = core.copy_out_from(0, out)?;
            core.drain(copied)
        })
    }

    /// 读出并移除至多 `len` 字节，以 [`Bytes`] 返回。
    pub fn remove_bytes(&self, len: usize) -> Result<Bytes> {
        self.mutate(|core| {
            core.check_head()?;
            let len = len.min(core.total_len);
            let mut out = BytesMut::zeroed(len);
            core.copy_out_from(0, &mut out)?;
            core.drain(len)?;
            Ok(out.freeze())
        })
    }

    /// 复制头部至多 `out.len()` 字节而不移除。
    pub fn copy_out(&self, out: &mut [u8]) -> Result<usize> {
        self.copy_out_from(0, out)
    }

    /// 从位置 `pos` 开始复制而不移除；`pos` 超过长度时返回参数错误。
    pub fn copy_out_from(&self, pos: usize, out: &mut [u8]) -> Result<usize> {
        self.locked(|core| core.copy_out_from(pos, out))
    }

    /// 保证尾部至少有 `size` 字节的连续空闲区。
    pub fn expand(&self, size: usize) -> Result<()> {
        self.mutate(|core| {
            core.check_tail()?;
            core.check_growth(size)?;
            core.expand_singlechain(size).map(drop)
        })
    }

    /// 预留至少 `size` 字节的空闲区，返回至多 `n_vecs` 个描述符。
    ///
    /// `n_vecs == 1` 时保证连续；否则可能分散在多条链上。
    /// 写入后以 [`commit_space`](Self::commit_space) 提交，提交前不得有其他尾部修改。
    pub fn reserve_space(&self, size: usize, n_vecs: usize) -> Result<Vec<IoVec>> {
        self.mutate(|core| core.reserve_space(size, n_vecs))
    }

    /// 提交写入预留区的字节；描述符长度应截断为实际写入量。
    pub fn commit_space(&self, vecs: &[IoVec]) -> Result<usize> {
        self.mutate(|core| core.commit_space(vecs))
    }

    /// 零拷贝挂入外部内存。
    ///
    /// `owner` 被装箱固定地址，最后一个引用释放时以 `cleanup(owner)` 归还，
    /// 执行线程即完成最后一次释放的线程。
    pub fn add_reference<T, F>(&self, owner: T, cleanup: F) -> Result<()>
    where
        T: AsRef<[u8]> + Send + Sync + 'static,
        F: FnOnce(T) + Send + 'static,
    {
        let external = ExternalRef::new(owner, cleanup);
        self.mutate(move |core| core.add_reference(external))
    }

    /// 零拷贝挂入 [`Bytes`]。
    pub fn add_bytes(&self, bytes: Bytes) -> Result<()> {
        let external = ExternalRef::from_bytes(bytes);
        self.mutate(move |core| core.add_reference(external))
    }

    /// 挂入文件段的 `[offset, offset + len)`；`len` 为 `None` 时取到段末尾。
    pub fn add_file_segment(
        &self,
        segment: &FileSegment,
        offset: usize,
        len: Option<usize>,
    ) -> Result<()> {
        self.mutate(|core| core.add_file_segment(segment, offset, len))
    }

    /// 以文件创建段并整段挂入；文件随最后一个引用关闭。
    pub fn add_file(&self, file: File, offset: u64, len: Option<u64>) -> Result<()> {
        let segment = FileSegment::new(file, offset, len, SegmentOptions::default())?;
        self.add_file_segment(&segment, 0, None)
    }

    /// 冻结一端，之后在该端的修改返回 [`BufferError::Frozen`]。
    pub fn freeze(&self, end: BufferEnd) {
        self.locked(|core| match end {
            BufferEnd::Head => core.freeze_head = true,
            BufferEnd::Tail => core.freeze_tail = true,
        });
    }

    pub fn unfreeze(&self, end: BufferEnd) {
        self.locked(|core| match end {
            BufferEnd::Head => core.freeze_head = false,
            BufferEnd::Tail => core.freeze_tail = false,
        });
    }

    pub fn is_frozen(&self, end: BufferEnd) -> bool {
        self.locked(|core| match end {
            BufferEnd::Head => core.freeze_head,
            BufferEnd::Tail => core.freeze_tail,
        })
    }

    pub fn set_flags(&self, flags: BufferFlags) {
        self.locked(|core| core.flags.insert(flags));
    }

    pub fn clear_flags(&self, flags: BufferFlags) {
        self.locked(|core| core.flags.remove(flags));
    }

    pub fn flags(&self) -> BufferFlags {
        self.locked(|core| core.flags)
    }

    /// 设置 `read_from` 单次读取的上限。
    pub fn set_max_read(&self, max_read: usize) -> Result<()> {
        if max_read == 0 {
            return Err(BufferError::invalid("单次读取上限不能为 0"));
        }
        self.locked(|core| core.max_read = max_read);
        Ok(())
    }

    pub fn max_read(&self) -> usize {
        self.locked(|core| core.max_read)
    }

    /// 启用串行化锁；传入 `None` 时创建一把新锁。返回实际安装的锁，便于与其他缓冲共享。
    pub fn enable_locking(&self, lock: Option<BufferLock>) -> BufferLock {
        let lock = lock.unwrap_or_default();
        self.shared.lock.store(Some(lock.clone().into_arc()));
        lock
    }

    pub fn disable_locking(&self) {
        self.shared.lock.store(None);
    }

    /// 当前安装的串行化锁。
    pub fn buffer_lock(&self) -> Option<BufferLock> {
        self.shared.lock.load_full().map(BufferLock::from_arc)
    }

    /// 获取串行化锁以把多个操作组合为原子序列；未启用锁时返回 `None`。
    pub fn lock(&self) -> Option<BufferGuard> {
        self.shared.outer_lock()
    }

    /// 启用推迟投递：之后未标记免推迟的回调交给 `scheduler` 执行。
    pub fn defer_callbacks(&self, scheduler: Arc<dyn DeferredScheduler>) {
        let previous = self.locked(|core| core.deferred.replace(DeferredHandle::new(scheduler)));
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    /// 关闭推迟投递；已调度但未执行的任务将空转。
    pub fn disable_deferred(&self) {
        let previous = self.locked(|core| core.deferred.take());
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    /// 推迟任务是否已调度且尚未执行。
    pub fn deferred_pending(&self) -> bool {
        self.locked(|core| {
            core.deferred
                .as_ref()
                .is_some_and(|handle| handle.is_scheduled())
        })
    }

    /// 注册长度变化回调，默认启用。
    pub fn add_cb<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&ChainBuffer, &CallbackInfo) + Send + Sync + 'static,
    {
        self.locked(|core| core.callbacks.register(Box::new(callback)))
    }

    /// 移除回调；句柄不属于该缓冲或已移除时返回 [`BufferError::CallbackNotFound`]。
    pub fn remove_cb(&self, handle: &CallbackHandle) -> Result<()> {
        let removed = self.locked(|core| core.callbacks.remove(handle));
        match removed {
            Some(entry) => {
                drop(entry);
                Ok(())
            }
            None => Err(BufferError::CallbackNotFound),
        }
    }

    /// 记录逻辑拥有者的弱引用，不延长其寿命。
    pub fn set_owner<T>(&self, owner: &Arc<T>)
    where
        T: Any + Send + Sync,
    {
        let weak: Weak<T> = Arc::downgrade(owner);
        let weak: Weak<dyn Any + Send + Sync> = weak;
        let previous = self.locked(|core| core.owner.replace(weak));
        drop(previous);
    }

    pub fn clear_owner(&self) {
        let previous = self.locked(|core| core.owner.take());
        drop(previous);
    }

    /// 拥有者仍然存活时返回它。
    pub fn owner(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.locked(|core| core.owner.as_ref().and_then(Weak::upgrade))
    }

    /// 不持有引用计数的弱句柄。
    pub fn downgrade(&self) -> WeakBuffer {
        WeakBuffer {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn stats(&self) -> BufferStats {
        self.locked(|core| core.stats())
    }

    /// 每条链的诊断快照，按序列顺序排列。
    pub fn chain_info(&self) -> Vec<ChainInfo> {
        self.locked(|core| core.chain_info())
    }

    /// 遍历校验内部不变式：总长度、最后含数据链下标、数据窗口边界与待销毁链状态。
    ///
    /// 面向测试与故障诊断，返回第一条违例的描述。
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        self.locked(|core| core.check_invariants())
    }
}

impl Default for ChainBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ChainBuffer {
    fn clone(&self) -> Self {
        self.shared.core.lock().refcnt += 1;
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for ChainBuffer {
    fn drop(&mut self) {
        let teardown = {
            let mut core = self.shared.core.lock();
            core.refcnt -= 1;
            if core.refcnt > 0 {
                return;
            }
            core.destroy()
        };
        drop(teardown);
    }
}

impl fmt::Debug for ChainBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("ChainBuffer")
            .field("id", &self.shared.id)
            .field("len", &stats.len)
            .field("chains", &stats.chains)
            .finish()
    }
}

/// 不持有引用计数的缓冲句柄。
#[derive(Clone, Debug)]
pub struct WeakBuffer {
    shared: Weak<Shared>,
}

impl WeakBuffer {
    /// 缓冲尚未销毁时恢复一个强句柄。
    pub fn upgrade(&self) -> Option<ChainBuffer> {
        let shared = self.shared.upgrade()?;
        {
            let mut core = shared.core.lock();
            if core.destroyed {
                return None;
            }
            core.refcnt += 1;
        }
        Some(ChainBuffer { shared })
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared").field("id", &self.id).finish()
    }
}

/// 缓冲构建器。
///
/// # 教案式说明
/// - **意图 (Why)**：锁、调度器、拥有者、配置通常在连接建立时一次性确定，集中到构建阶段可以避免
///   “先创建再逐项设置”期间的中间状态被其他线程观察到。
/// - **契约 (What)**：`build` 先校验 [`BufferConfig`]，非法配置返回 [`BufferError::Config`]。
#[derive(Default)]
pub struct BufferBuilder {
    config: BufferConfig,
    flags: BufferFlags,
    lock: Option<BufferLock>,
    scheduler: Option<Arc<dyn DeferredScheduler>>,
    owner: Option<Weak<dyn Any + Send + Sync>>,
}

impl BufferBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: BufferConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_flags(mut self, flags: BufferFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_lock(mut self, lock: BufferLock) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn DeferredScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_owner<T>(mut self, owner: &Arc<T>) -> Self
    where
        T: Any + Send + Sync,
    {
        let weak: Weak<T> = Arc::downgrade(owner);
        let weak: Weak<dyn Any + Send + Sync> = weak;
        self.owner = Some(weak);
        self
    }

    pub fn build(self) -> Result<ChainBuffer> {
        self.config.validate()?;
        Ok(ChainBuffer::from_builder(self))
    }
}

impl fmt::Debug for BufferBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferBuilder")
            .field("config", &self.config)
            .field("flags", &self.flags)
            .field("locked", &self.lock.is_some())
            .field("deferred", &self.scheduler.is_some())
            .finish()
    }
}
