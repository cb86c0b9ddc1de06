//! # Rover Robot
//!
//! 机器人控制核心：生命周期状态机、固定周期调度器和操作台服务。
//!
//! ```no_run
//! use rover_hal::HardwareContext;
//! use rover_robot::{Robot, RobotConfig};
//! # fn context() -> std::sync::Arc<HardwareContext> { unimplemented!() }
//!
//! # fn main() -> Result<(), rover_robot::RobotError> {
//! let robot = Robot::spawn(context(), RobotConfig::default())?;
//! // 操作台连上 TCP 端口后即可使能、切模式、上报手柄
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod console;
pub mod joystick;
pub mod robot;

pub use config::RobotConfig;
pub use joystick::JoystickState;
pub use robot::{Robot, RobotMode};

use rover_hal::HalError;
use thiserror::Error;

/// 机器人层统一错误类型
#[derive(Error, Debug)]
pub enum RobotError {
    #[error("Hardware Error: {0}")]
    Hal(#[from] HalError),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config Error: {0}")]
    Config(#[from] toml::de::Error),
}
