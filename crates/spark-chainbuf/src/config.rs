//! 缓冲引擎的可调参数。
//!
//! # 模块定位（Why）
//! - 链分配策略里的阈值（最小块、自动扩容上限、重排/复制阈值）直接影响碎片率与拷贝成本，
//!   不同部署（嵌入式代理、大吞吐网关）需要不同取值；
//! - 统一收敛到 [`BufferConfig`]，宿主可以把它嵌入自己的 TOML/JSON 配置文件中整体下发。
//!
//! # 契约说明（What）
//! - 默认值与链分配算法的常量保持一致，见 [`crate::MIN_CHUNK`] 等；
//! - [`BufferConfig::validate`] 在构建缓冲前执行，拒绝会让算法退化或死循环的取值。

use serde::{Deserialize, Serialize};

use crate::{
    chain::{
        DEFAULT_MAX_READ, MAX_AUTO_CHAIN, MAX_TO_COPY_IN_EXPAND, MAX_TO_REALIGN_IN_EXPAND,
        MIN_CHUNK, NUM_READ_IOVEC, NUM_WRITE_IOVEC,
    },
    error::{BufferError, Result},
};

/// 最小块允许的下限，低于该值时链元数据开销占比过高。
const MIN_CHUNK_FLOOR: usize = 256;

/// 链分配与 I/O 适配器的参数集合。
///
/// # 教案式说明
/// - **意图 (Why)**：让分配阈值可以随部署调整，而不必改动算法本身。
/// - **契约 (What)**：
///   - `min_chunk`：新链的最小分配粒度（含元数据），必须是 2 的幂且不小于 256；
///   - `max_auto_chain`：追加写入时新链按上一条链容量翻倍增长的上限；
///   - `max_to_copy_in_expand`：单链扩容时愿意复制的最大已有字节数；
///   - `max_to_realign_in_expand`：把数据搬回链首以腾出空间时允许移动的最大字节数；
///   - `read_iovecs` / `write_iovecs`：单次向量读写最多使用的描述符数量；
///   - `max_read`：`read_from` 单次读取的默认上限。
/// - **执行逻辑 (How)**：`#[serde(default)]` 允许配置文件只覆盖部分字段。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub min_chunk: usize,
    pub max_auto_chain: usize,
    pub max_to_copy_in_expand: usize,
    pub max_to_realign_in_expand: usize,
    pub read_iovecs: usize,
    pub write_iovecs: usize,
    pub max_read: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            min_chunk: MIN_CHUNK,
            max_auto_chain: MAX_AUTO_CHAIN,
            max_to_copy_in_expand: MAX_TO_COPY_IN_EXPAND,
            max_to_realign_in_expand: MAX_TO_REALIGN_IN_EXPAND,
            read_iovecs: NUM_READ_IOVEC,
            write_iovecs: NUM_WRITE_IOVEC,
            max_read: DEFAULT_MAX_READ,
        }
    }
}

impl BufferConfig {
    /// 校验参数组合。
    ///
    /// - `min_chunk` 必须是 2 的幂且不小于 256，否则按幂次取整的分配算法无法收敛；
    /// - `read_iovecs` 至少为 2，非精确扩容至少要能跨两条链；
    /// - `write_iovecs` 与 `max_read` 必须大于 0。
    pub fn validate(&self) -> Result<()> {
        if !self.min_chunk.is_power_of_two() || self.min_chunk < MIN_CHUNK_FLOOR {
            return Err(BufferError::Config {
                field: "min_chunk",
                reason: format!("必须是不小于 {MIN_CHUNK_FLOOR} 的 2 的幂，实际为 {}", self.min_chunk)
                    .into(),
            });
        }
        if self.read_iovecs < 2 {
            return Err(BufferError::Config {
                field: "read_iovecs",
                reason: "至少需要 2 个描述符".into(),
            });
        }
        if self.write_iovecs == 0 {
            return Err(BufferError::Config {
                field: "write_iovecs",
                reason: "不能为 0".into(),
            });
        }
        if self.max_read == 0 {
            return Err(BufferError::Config {
                field: "max_read",
                reason: "不能为 0".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        BufferConfig::default().validate().expect("默认配置应合法");
    }

    #[test]
    fn rejects_non_power_of_two_chunk() {
        let config = BufferConfig {
            min_chunk: 1000,
            ..BufferConfig::default()
        };
        let err = config.validate().expect_err("1000 不是 2 的幂");
        assert!(matches!(err, BufferError::Config { field: "min_chunk", .. }));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: BufferConfig = toml::from_str("max_read = 65536\n").expect("解析部分配置");
        assert_eq!(config.max_read, 65536);
        assert_eq!(config.min_chunk, MIN_CHUNK);
        config.validate().expect("部分覆盖后仍合法");
    }
}
