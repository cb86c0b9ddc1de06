//! 机器人运行参数
//!
//! 所有字段都有默认值，配置文件里只写需要覆盖的项：
//!
//! ```toml
//! console_port = 5802
//! update_period_ms = 50
//! ```

use crate::RobotError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 机器人配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    /// 操作台 TCP 端口
    pub console_port: u16,
    /// 调度器更新周期，毫秒
    pub update_period_ms: u64,
    /// 操作台保活超时，超过后强制失能，毫秒
    pub console_timeout_ms: u64,
    /// 协处理器保活间隔，毫秒
    pub coproc_keepalive_ms: u64,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            console_port: 5802,
            update_period_ms: 50,
            console_timeout_ms: 2000,
            coproc_keepalive_ms: 500,
        }
    }
}

impl RobotConfig {
    /// 从 TOML 文件加载配置
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RobotError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub(crate) fn update_period(&self) -> Duration {
        Duration::from_millis(self.update_period_ms.max(1))
    }

    pub(crate) fn console_timeout(&self) -> Duration {
        Duration::from_millis(self.console_timeout_ms)
    }

    /// 每几个更新节拍发一次协处理器保活
    pub(crate) fn keepalive_ticks(&self) -> u64 {
        (self.coproc_keepalive_ms / self.update_period_ms.max(1)).max(1)
    }
}
