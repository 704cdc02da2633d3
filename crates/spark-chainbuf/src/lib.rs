//! `spark-chainbuf` 提供事件驱动 I/O 栈底层的链式字节缓冲引擎。
//!
//! # 模块定位（Why）
//! - 连接层的输入、输出缓冲都是“尾部追加、头部抽干”的字节队列，
//!   以固定容量链拼接可以让两端操作摊还 O(1)，避免单块数组的整体搬移；
//! - 在此之上提供零拷贝共享（外部引用、组播别名、文件段）、
//!   面向重叠 I/O 的钉住窗口、引用计数所有权，以及可推迟到外部事件循环的长度变化回调。
//!
//! # 设计概要（How）
//! - `chain` 描述单条链及其内存来源的和类型；
//! - `buffer` 持有链序列与计数，并承载追加、抽干、扩容、搬移、别名、查找等全部算法；
//! - `segment` 是引用计数的文件段，按需映射或加载，也可以在写出时直接从文件传输；
//! - `callback` 与 `deferred` 实现回调注册表和推迟投递协议；
//! - `lock` 提供可在多个缓冲间共享的可重入串行化锁；
//! - `config` 与 `error` 分别收敛可调参数与错误域。
//!
//! # 命名约定（Consistency）
//! - “头部”指抽干一侧，“尾部”指追加一侧；
//! - 返回 `Result` 的操作失败时不留下任何部分修改。

mod buffer;
mod callback;
mod chain;
mod config;
mod deferred;
mod error;
mod lock;
mod segment;

pub use buffer::{
    BufferBuilder, BufferEnd, BufferFlags, BufferStats, ChainBuffer, EolStyle, IoVec,
    PendingRead, PendingWrite, WeakBuffer,
};
pub use callback::{CallbackFlags, CallbackHandle, CallbackInfo};
pub use chain::{
    CHAIN_MAX, ChainFlags, ChainInfo, ChainKind, DEFAULT_MAX_READ, MAX_AUTO_CHAIN,
    MAX_TO_COPY_IN_EXPAND, MAX_TO_REALIGN_IN_EXPAND, MIN_CHUNK, NUM_READ_IOVEC, NUM_WRITE_IOVEC,
};
pub use config::BufferConfig;
#[cfg(feature = "runtime-tokio")]
pub use deferred::TokioScheduler;
pub use deferred::{DeferredScheduler, DeferredTask, QueueScheduler};
pub use error::{BufferError, ErrorKind, Result, codes};
pub use lock::{BufferGuard, BufferLock};
pub use segment::{FileSegment, SegmentInfo, SegmentOptions};
