//! 回调注册表。
//!
//! # 设计背景（Why）
//! - 上层（连接、限速器、水位监控）需要在缓冲长度变化时得到通知；
//! - 通知既要能同步执行，也要能推迟到外部事件循环，以免互相修改缓冲的回调无限递归。
//!
//! # 契约说明（What）
//! - 回调按注册顺序执行，收到缓冲句柄与 [`CallbackInfo`]；
//! - 启用、免推迟标志是原子量，在执行时刻才检查：推迟遍历运行前禁用的回调不会被调用；
//! - 回调执行期间缓冲内部互斥量不被持有，回调可以再次操作同一缓冲。

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use crate::buffer::ChainBuffer;

/// 回调标志。
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CallbackFlags(u32);

impl CallbackFlags {
    pub const EMPTY: Self = Self(0);
    /// 参与调用。
    pub const ENABLED: Self = Self(1);
    /// 即使缓冲启用了推迟投递也同步执行。
    pub const NO_DEFER: Self = Self(2);

    pub(crate) const REMOVED: Self = Self(0x1_0000);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for CallbackFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackFlags")
            .field("enabled", &self.contains(Self::ENABLED))
            .field("no_defer", &self.contains(Self::NO_DEFER))
            .finish()
    }
}

/// 一次回调遍历所报告的长度变化。
///
/// 推迟模式下，`n_added`/`n_deleted` 是自上次遍历以来的累计值，而不是单次修改的精确值。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallbackInfo {
    /// 累计变化发生之前的长度。
    pub orig_size: usize,
    /// 遍历开始时的长度。
    pub new_size: usize,
    pub n_added: usize,
    pub n_deleted: usize,
}

pub(crate) type CallbackFn = Box<dyn Fn(&ChainBuffer, &CallbackInfo) + Send + Sync>;

pub(crate) struct CallbackEntry {
    func: CallbackFn,
    flags: AtomicU32,
}

impl CallbackEntry {
    fn flags(&self) -> CallbackFlags {
        CallbackFlags(self.flags.load(Ordering::Acquire))
    }
}

/// 已注册回调的句柄。
///
/// # 教案式说明
/// - **意图 (Why)**：让调用方在不移除注册的前提下临时屏蔽回调，或切换其推迟策略。
/// - **契约 (What)**：句柄可以克隆、跨线程传递；回调被移除后，对句柄的启停操作不再有任何效果。
/// - **执行逻辑 (How)**：标志位保存在共享的原子量中，遍历时读取最新值。
#[derive(Clone)]
pub struct CallbackHandle {
    entry: Arc<CallbackEntry>,
}

impl CallbackHandle {
    pub fn enable(&self) {
        self.entry
            .flags
            .fetch_or(CallbackFlags::ENABLED.0, Ordering::AcqRel);
    }

    pub fn disable(&self) {
        self.entry
            .flags
            .fetch_and(!CallbackFlags::ENABLED.0, Ordering::AcqRel);
    }

    /// 设置或清除免推迟标志。
    pub fn set_no_defer(&self, no_defer: bool) {
        if no_defer {
            self.entry
                .flags
                .fetch_or(CallbackFlags::NO_DEFER.0, Ordering::AcqRel);
        } else {
            self.entry
                .flags
                .fetch_and(!CallbackFlags::NO_DEFER.0, Ordering::AcqRel);
        }
    }

    /// 当前标志（不含内部状态位）。
    pub fn flags(&self) -> CallbackFlags {
        CallbackFlags(self.entry.flags().0 & (CallbackFlags::ENABLED.0 | CallbackFlags::NO_DEFER.0))
    }

    /// 回调是否已从缓冲移除。
    pub fn is_removed(&self) -> bool {
        self.entry.flags().contains(CallbackFlags::REMOVED)
    }
}

impl fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackHandle")
            .field("flags", &self.flags())
            .field("removed", &self.is_removed())
            .finish()
    }
}

/// 一次遍历选择哪些回调、是否清零累计计数。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PassMode {
    /// 未启用推迟：所有启用的回调同步执行。
    Inline,
    /// 启用推迟时的同步阶段：只执行免推迟回调，计数留给推迟遍历。
    InlineNoDefer,
    /// 推迟遍历：执行启用且未免推迟的回调。
    Deferred,
}

impl PassMode {
    fn selector(self) -> (u32, u32) {
        let enabled = CallbackFlags::ENABLED.0;
        let both = enabled | CallbackFlags::NO_DEFER.0;
        match self {
            Self::Inline => (enabled, enabled),
            Self::InlineNoDefer => (both, both),
            Self::Deferred => (both, enabled),
        }
    }

    pub(crate) fn clears_counts(self) -> bool {
        !matches!(self, Self::InlineNoDefer)
    }
}

/// 从注册表中取出的一次遍历快照，在缓冲内部互斥量之外执行。
pub(crate) struct CallbackPass {
    info: CallbackInfo,
    mode: PassMode,
    entries: Vec<Arc<CallbackEntry>>,
}

impl CallbackPass {
    pub(crate) fn run(self, buffer: &ChainBuffer) {
        let (mask, expected) = self.mode.selector();
        for entry in &self.entries {
            let flags = entry.flags().0;
            if flags & CallbackFlags::REMOVED.0 != 0 || flags & mask != expected {
                continue;
            }
            (entry.func)(buffer, &self.info);
        }
    }
}

/// 按注册顺序保存回调。
#[derive(Default)]
pub(crate) struct CallbackRegistry {
    entries: Vec<Arc<CallbackEntry>>,
}

impl CallbackRegistry {
    pub(crate) fn register(&mut self, func: CallbackFn) -> CallbackHandle {
        let entry = Arc::new(CallbackEntry {
            func,
            flags: AtomicU32::new(CallbackFlags::ENABLED.0),
        });
        self.entries.push(Arc::clone(&entry));
        CallbackHandle { entry }
    }

    /// 移除句柄对应的回调，返回被摘下的条目，由调用方在锁外释放。
    pub(crate) fn remove(&mut self, handle: &CallbackHandle) -> Option<Arc<CallbackEntry>> {
        let index = self
            .entries
            .iter()
            .position(|entry| Arc::ptr_eq(entry, &handle.entry))?;
        let entry = self.entries.remove(index);
        entry
            .flags
            .fetch_or(CallbackFlags::REMOVED.0, Ordering::AcqRel);
        Some(entry)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn pass(&self, info: CallbackInfo, mode: PassMode) -> CallbackPass {
        CallbackPass {
            info,
            mode,
            entries: self.entries.clone(),
        }
    }

    /// 销毁缓冲时摘下全部条目。
    pub(crate) fn take_all(&mut self) -> Vec<Arc<CallbackEntry>> {
        for entry in &self.entries {
            entry
                .flags
                .fetch_or(CallbackFlags::REMOVED.0, Ordering::AcqRel);
        }
        std::mem::take(&mut self.entries)
    }
}
