//! 导航器资源
//!
//! 导航协处理器融合 IMU 与左右编码器，持续积分出机器人位姿。
//! 创建时执行阻塞式初始化握手：下发初始化命令后轮询状态，
//! 状态为正表示陀螺仪标定完成，为负表示标定失败需要重新初始化，
//! 为零继续等待。多轮重试仍失败则报错。
//!
//! 位姿中的坐标与速度按 `ticks_per_foot` 换算成英尺单位，
//! 航向角固件以百分之一度定点上报。

use crate::{Backend, Encoder, HalError, HardwareContext};
use parking_lot::Mutex;
use rover_protocol::{CommandFrame, ops};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// 初始化握手参数
#[derive(Debug, Clone, Copy)]
pub struct NavigatorOptions {
    /// 两次状态轮询的间隔
    pub poll_interval: Duration,
    /// 最多重发几轮初始化命令
    pub rounds: u32,
    /// 每轮初始化后轮询几次状态
    pub polls_per_round: u32,
}

impl Default for NavigatorOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            rounds: 5,
            polls_per_round: 10,
        }
    }
}

/// 机器人位姿快照
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Pose {
    /// 航向角，度，逆时针为正
    pub yaw: f64,
    /// 场地坐标，英尺
    pub x: f64,
    pub y: f64,
    /// 左右轮速度，英尺/秒
    pub left_speed: f64,
    pub right_speed: f64,
    /// 左右编码器原始计数
    pub left_pos: i32,
    pub right_pos: i32,
}

/// 位姿响应的载荷长度
const POSE_SIZE: usize = 24;

/// 导航器句柄
pub struct Navigator {
    ctx: Arc<HardwareContext>,
    addr: u8,
    ticks_per_foot: Mutex<f64>,
}

impl Navigator {
    pub(crate) fn new(
        ctx: Arc<HardwareContext>,
        left: Option<&Encoder>,
        right: Option<&Encoder>,
        options: NavigatorOptions,
    ) -> Result<Self, HalError> {
        let Backend::Bus(_) = ctx.backend() else {
            return Err(HalError::Unsupported);
        };

        let navigator = Self {
            ctx,
            addr: crate::DEFAULT_ADDR,
            ticks_per_foot: Mutex::new(1.0),
        };

        let left_index = left.map(Encoder::index).unwrap_or(0xff);
        let right_index = right.map(Encoder::index).unwrap_or(0xff);
        navigator.handshake(left_index, right_index, options)?;
        Ok(navigator)
    }

    /// 初始化握手：下发初始化并轮询标定状态
    fn handshake(&self, left: u8, right: u8, options: NavigatorOptions) -> Result<(), HalError> {
        let bus = self.bus();

        for round in 0..options.rounds {
            bus.send_command(
                self.addr,
                CommandFrame::new(ops::INIT_NAVIGATOR).u8(left).u8(right),
            )?;

            for _ in 0..options.polls_per_round {
                spin_sleep::sleep(options.poll_interval);
                let state =
                    bus.request_u8(self.addr, CommandFrame::new(ops::GET_NAVIGATOR_STATE))? as i8;
                if state > 0 {
                    debug!("Navigator ready after {} round(s)", round + 1);
                    return Ok(());
                }
                if state < 0 {
                    // 标定失败，重发初始化
                    warn!("Navigator calibration failed ({}), reinitializing", state);
                    break;
                }
            }
        }

        Err(HalError::NavigatorInitFailed {
            rounds: options.rounds,
        })
    }

    /// 设定每英尺对应的编码器计数，用于位姿换算
    pub fn set_ticks_per_foot(&self, ticks: f64) {
        *self.ticks_per_foot.lock() = ticks;
    }

    /// 当前位姿
    pub fn pose(&self) -> Result<Pose, HalError> {
        let response = self.bus().send_request(
            self.addr,
            CommandFrame::new(ops::GET_NAVIGATOR_DATA),
            POSE_SIZE,
        )?;
        let tpf = *self.ticks_per_foot.lock();

        let mut reader = response.reader();
        let yaw = reader.i32()?;
        let x = reader.i32()?;
        let y = reader.i32()?;
        let left_speed = reader.i16()?;
        let right_speed = reader.i16()?;
        let left_pos = reader.i32()?;
        let right_pos = reader.i32()?;

        Ok(Pose {
            yaw: f64::from(yaw) / 100.0,
            x: f64::from(x) / tpf,
            y: f64::from(y) / tpf,
            left_speed: f64::from(left_speed) / tpf,
            right_speed: f64::from(right_speed) / tpf,
            left_pos,
            right_pos,
        })
    }

    /// 当前航向角，度
    pub fn yaw(&self) -> Result<f64, HalError> {
        let raw = self
            .bus()
            .request_i32(self.addr, CommandFrame::new(ops::GET_NAVIGATOR_YAW))?;
        Ok(f64::from(raw) / 100.0)
    }

    /// 重置位姿，航向角归一化到 (-180, 180]
    pub fn reset(&self, yaw: f64, x: f64, y: f64) -> Result<(), HalError> {
        let mut y100 = ((yaw * 100.0) as i32) % 36000;
        if y100 <= -18000 {
            y100 += 36000;
        } else if y100 > 18000 {
            y100 -= 36000;
        }
        let tpf = *self.ticks_per_foot.lock();

        self.bus().send_command(
            self.addr,
            CommandFrame::new(ops::RESET_NAVIGATOR)
                .i32(y100)
                .i32((x * tpf) as i32)
                .i32((y * tpf) as i32),
        )?;
        Ok(())
    }

    /// 反转航向角方向
    pub fn invert(&self, invert: bool) -> Result<(), HalError> {
        self.bus().send_command(
            self.addr,
            CommandFrame::new(ops::INVERT_NAVIGATOR).u8(invert as u8),
        )?;
        Ok(())
    }

    fn bus(&self) -> &rover_bus::Bus {
        match self.ctx.backend() {
            Backend::Bus(bus) => bus,
            Backend::Legacy(_) => unreachable!("navigator requires the bus backend"),
        }
    }
}

impl fmt::Debug for Navigator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Navigator")
            .field("addr", &self.addr)
            .field("ticks_per_foot", &*self.ticks_per_foot.lock())
            .finish()
    }
}
