//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为链式缓冲引擎对外暴露的全部失败语义提供集中定义；
//! - 将分配失败、非法状态、长度溢出三类契约错误与参数/I/O 错误区分开，方便调用方决定是否重试。
//!
//! ## 设计要求（What）
//! - 所有错误均派生 [`thiserror::Error`]，满足 `Send + Sync + 'static`，可跨线程传播；
//! - 引擎内部从不自动重试，所有错误同步返回给直接调用者；
//! - 任何返回错误的操作都不会留下部分修改的可见状态。
//!
//! ## 扩展建议（How）
//! - 上层连接层可以基于 [`BufferError::kind`] 做分类告警，基于 [`BufferError::code`] 写入结构化日志。

use std::{borrow::Cow, io};

use thiserror::Error;

use crate::buffer::BufferEnd;

/// 稳定错误码，供日志与指标聚合使用。
pub mod codes {
    /// 链内存分配失败。
    pub const OUT_OF_MEMORY: &str = "chainbuf.out_of_memory";
    /// 在已冻结的一端修改缓冲。
    pub const FROZEN: &str = "chainbuf.frozen";
    /// 试图重排或释放被钉住的链。
    pub const PINNED: &str = "chainbuf.pinned";
    /// 缓冲已经销毁。
    pub const DESTROYED: &str = "chainbuf.destroyed";
    /// 请求长度超过链或缓冲可表示的上限。
    pub const OVERFLOW: &str = "chainbuf.overflow";
    /// 参数与当前缓冲状态不匹配。
    pub const INVALID_ARGUMENT: &str = "chainbuf.invalid_argument";
    /// 回调句柄未注册。
    pub const CALLBACK_NOT_FOUND: &str = "chainbuf.callback_not_found";
    /// 配置校验失败。
    pub const CONFIG: &str = "chainbuf.config";
    /// 底层 I/O 失败。
    pub const IO: &str = "chainbuf.io";
}

/// 错误分类。
///
/// - `Allocation`：无法获得新的链内存；
/// - `InvalidState`：编程契约被破坏（冻结端写入、钉住链重排、已销毁缓冲）；
/// - `Overflow`：长度超过可表示上限，在任何分配之前即被拒绝；
/// - `InvalidArgument`：参数与缓冲当前布局不一致；
/// - `Io`：文件段或读写适配器的底层错误。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Allocation,
    InvalidState,
    Overflow,
    InvalidArgument,
    Io,
}

/// 链式缓冲引擎的错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把分配、冻结、钉住、溢出等失败集中在一个枚举中，调用方只需一次 `match`
///   即可区分“可以换个参数重试”与“调用顺序写错了”。
/// - **契约 (What)**：每个变体都携带定位问题所需的最小上下文；`Io` 变体保留原始
///   [`io::Error`]，错误码与系统描述完整透传。
/// - **执行逻辑 (How)**：内部算法在改动任何链之前完成所有可能失败的步骤（分配、溢出检查、冻结检查），
///   因此只要拿到 `Err`，缓冲的长度与布局都与调用前一致。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BufferError {
    /// 新链内存分配失败。
    #[error("分配 {requested} 字节的链内存失败")]
    OutOfMemory { requested: usize },

    /// 目标端已冻结。
    #[error("缓冲{end}已冻结，拒绝修改")]
    Frozen { end: BufferEnd },

    /// 操作需要重排或释放一条仍被钉住的链。
    #[error("链 #{chain} 仍被钉住，无法重排或释放其内存")]
    Pinned { chain: u64 },

    /// 缓冲的引用计数已归零。
    #[error("缓冲已销毁")]
    Destroyed,

    /// 请求长度超过上限。
    #[error("请求长度 {requested} 超过上限 {max}")]
    Overflow { requested: usize, max: usize },

    /// 参数与缓冲当前状态不一致。
    #[error("参数非法: {reason}")]
    InvalidArgument { reason: Cow<'static, str> },

    /// 回调句柄不属于该缓冲或已被移除。
    #[error("回调未注册或已移除")]
    CallbackNotFound,

    /// 配置项校验失败。
    #[error("配置项 `{field}` 非法: {reason}")]
    Config {
        field: &'static str,
        reason: Cow<'static, str>,
    },

    /// 底层 I/O 失败。
    #[error("缓冲 I/O 失败: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl BufferError {
    /// 构造参数错误的便捷入口。
    pub(crate) fn invalid(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// 返回错误所属的分类。
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::OutOfMemory { .. } => ErrorKind::Allocation,
            Self::Frozen { .. } | Self::Pinned { .. } | Self::Destroyed => ErrorKind::InvalidState,
            Self::Overflow { .. } => ErrorKind::Overflow,
            Self::InvalidArgument { .. } | Self::CallbackNotFound | Self::Config { .. } => {
                ErrorKind::InvalidArgument
            }
            Self::Io { .. } => ErrorKind::Io,
        }
    }

    /// 返回稳定错误码，见 [`codes`]。
    pub fn code(&self) -> &'static str {
        match self {
            Self::OutOfMemory { .. } => codes::OUT_OF_MEMORY,
            Self::Frozen { .. } => codes::FROZEN,
            Self::Pinned { .. } => codes::PINNED,
            Self::Destroyed => codes::DESTROYED,
            Self::Overflow { .. } => codes::OVERFLOW,
            Self::InvalidArgument { .. } => codes::INVALID_ARGUMENT,
            Self::CallbackNotFound => codes::CALLBACK_NOT_FOUND,
            Self::Config { .. } => codes::CONFIG,
            Self::Io { .. } => codes::IO,
        }
    }
}

/// 引擎统一的返回类型。
pub type Result<T, E = BufferError> = std::result::Result<T, E>;
