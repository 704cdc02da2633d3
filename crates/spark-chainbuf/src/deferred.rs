//! 推迟投递：把回调遍历交给外部事件循环执行。
//!
//! # 设计背景（Why）
//! - 回调在同步路径上修改缓冲会再次触发回调，深度没有上界；
//! - 把遍历挪到事件循环自己的一轮执行中，栈深度就被事件循环截断。
//!
//! # 契约说明（What）
//! - [`DeferredScheduler::schedule`] 收到的每个任务最多执行一次，且不得嵌套在调用者的栈内执行；
//! - 同一缓冲在任务尚未执行时重复调度只入队一次；
//! - 任务持有缓冲的一个引用，执行或丢弃后归还；
//! - 任务执行前禁用推迟投递会让任务空转。
//!
//! # 实现提示（How）
//! - [`QueueScheduler`] 是手动驱动的队列，适合测试与自带循环的宿主；
//! - 启用 `runtime-tokio` 特性后，[`TokioScheduler`] 把任务提交到 Tokio 运行时。

use std::{
    collections::VecDeque,
    fmt, mem,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::buffer::ChainBuffer;

/// 外部事件循环提供的调度能力。
///
/// # 教案式说明
/// - **意图 (Why)**：缓冲引擎不拥有任何线程，推迟执行必须借助宿主的事件循环。
/// - **契约 (What)**：
///   - 实现者必须在自己的执行轮次中调用 [`DeferredTask::run`]，不能在 `schedule` 内联执行；
///   - 丢弃任务而不执行是允许的，等价于取消这一次投递。
/// - **风险提示 (Trade-offs)**：任务持有缓冲引用，长期不执行的队列会延长缓冲寿命。
pub trait DeferredScheduler: Send + Sync + 'static {
    fn schedule(&self, task: DeferredTask);
}

/// 缓冲上的推迟投递登记。
pub(crate) struct DeferredHandle {
    scheduler: Arc<dyn DeferredScheduler>,
    scheduled: AtomicBool,
    cancelled: AtomicBool,
}

impl DeferredHandle {
    pub(crate) fn new(scheduler: Arc<dyn DeferredScheduler>) -> Arc<Self> {
        Arc::new(Self {
            scheduler,
            scheduled: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        })
    }

    /// 调度一次推迟遍历；已有待执行任务时直接返回。
    ///
    /// 调用方不得持有缓冲内部互斥量，克隆缓冲句柄需要获取它。
    pub(crate) fn schedule(self: &Arc<Self>, buffer: &ChainBuffer) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        if self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(buffer = buffer.id(), "调度推迟回调遍历");
        self.scheduler.schedule(DeferredTask {
            handle: Arc::clone(self),
            buffer: buffer.clone(),
            armed: true,
        });
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub(crate) fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::Acquire)
    }
}

/// 交给调度器的一次推迟遍历。
pub struct DeferredTask {
    handle: Arc<DeferredHandle>,
    buffer: ChainBuffer,
    armed: bool,
}

impl DeferredTask {
    /// 执行推迟遍历。
    ///
    /// 先清除“已调度”标记，遍历中的修改因此可以再次调度下一轮。
    pub fn run(mut self) {
        self.armed = false;
        self.handle.scheduled.store(false, Ordering::Release);
        if self.handle.cancelled.load(Ordering::Acquire) {
            tracing::debug!(buffer = self.buffer.id(), "推迟投递已取消，跳过遍历");
            return;
        }
        self.buffer.run_deferred_callbacks();
    }

    /// 任务所属缓冲的标识。
    pub fn buffer_id(&self) -> u64 {
        self.buffer.id()
    }
}

impl Drop for DeferredTask {
    fn drop(&mut self) {
        if self.armed {
            self.handle.scheduled.store(false, Ordering::Release);
        }
    }
}

impl fmt::Debug for DeferredTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredTask")
            .field("buffer", &self.buffer.id())
            .field("armed", &self.armed)
            .finish()
    }
}

/// 手动驱动的任务队列。
///
/// `run_pending` 只执行调用时已入队的任务，执行期间新入队的任务留到下一次调用，
/// 与事件循环“一轮只处理本轮就绪事件”的语义一致。
#[derive(Default)]
pub struct QueueScheduler {
    queue: parking_lot::Mutex<VecDeque<DeferredTask>>,
}

impl QueueScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 执行当前批次，返回执行的任务数。
    pub fn run_pending(&self) -> usize {
        let batch = mem::take(&mut *self.queue.lock());
        let count = batch.len();
        for task in batch {
            task.run();
        }
        count
    }

    /// 队列中尚未执行的任务数。
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

impl DeferredScheduler for QueueScheduler {
    fn schedule(&self, task: DeferredTask) {
        self.queue.lock().push_back(task);
    }
}

impl fmt::Debug for QueueScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueScheduler")
            .field("pending", &self.pending())
            .finish()
    }
}

/// 基于 Tokio 运行时句柄的调度器。
#[cfg(feature = "runtime-tokio")]
#[derive(Clone, Debug)]
pub struct TokioScheduler {
    handle: tokio::runtime::Handle,
}

#[cfg(feature = "runtime-tokio")]
impl TokioScheduler {
    pub fn new(handle: tokio::runtime::Handle) -> Arc<Self> {
        Arc::new(Self { handle })
    }

    /// 使用当前上下文中的运行时；不在运行时内调用会 panic，与 `Handle::current` 一致。
    pub fn current() -> Arc<Self> {
        Self::new(tokio::runtime::Handle::current())
    }
}

#[cfg(feature = "runtime-tokio")]
impl DeferredScheduler for TokioScheduler {
    fn schedule(&self, task: DeferredTask) {
        self.handle.spawn(async move { task.run() });
    }
}
