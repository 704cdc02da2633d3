//! 可选的缓冲串行化锁。
//!
//! # 设计背景（Why）
//! - 缓冲内部状态始终由自身的互斥量保护，单个原语因此总是内存安全的；
//! - 但“读出一行再抽干”“追加后立刻登记回调”等复合操作需要跨多次调用保持原子性，
//!   连接层还常常让输入、输出两个缓冲共享同一把锁，这就是 [`BufferLock`] 的职责。
//!
//! # 契约说明（What）
//! - 锁是可重入的：持有者在回调中再次操作同一缓冲不会自锁；
//! - 启用后，缓冲的每个操作连同其回调遍历都在该锁内执行；
//! - 双缓冲操作按缓冲标识升序获取两把锁，同一把共享锁只获取一次。

use std::{fmt, sync::Arc};

use parking_lot::{RawMutex, RawThreadId, ReentrantMutex, lock_api::ArcReentrantMutexGuard};

/// 持有期间串行化缓冲操作的守卫。
pub type BufferGuard = ArcReentrantMutexGuard<RawMutex, RawThreadId, ()>;

/// 可在多个缓冲之间共享的可重入锁。
#[derive(Clone, Default)]
pub struct BufferLock(Arc<ReentrantMutex<()>>);

impl BufferLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取锁；同一线程可重复获取。
    pub fn lock(&self) -> BufferGuard {
        self.0.lock_arc()
    }

    /// 两个句柄是否指向同一把锁。
    pub fn same_as(&self, other: &BufferLock) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn from_arc(inner: Arc<ReentrantMutex<()>>) -> Self {
        Self(inner)
    }

    pub(crate) fn into_arc(self) -> Arc<ReentrantMutex<()>> {
        self.0
    }
}

impl fmt::Debug for BufferLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferLock")
            .field("locked", &self.0.is_locked())
            .finish()
    }
}
