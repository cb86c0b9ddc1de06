//! # Rover HAL
//!
//! 硬件资源层。
//!
//! [`HardwareContext`] 持有与协处理器通信的后端（二线总线或遗留文本串口）
//! 以及每个地址的引脚登记表，是所有硬件资源对象的工厂：
//!
//! ```no_run
//! use rover_bus::{Bus, BusConfig};
//! use rover_hal::{EncoderKind, HardwareContext, MotorKind};
//! # fn transport() -> impl rover_bus::Transport { rover_bus::mock::SimCoprocessor::new() }
//!
//! # fn main() -> Result<(), rover_hal::HalError> {
//! let bus = Bus::spawn(transport(), BusConfig::default());
//! let ctx = std::sync::Arc::new(HardwareContext::with_bus(bus));
//!
//! let encoder = ctx.encoder(EncoderKind::Quadrature, 19, 15)?;
//! let motor = ctx.motor(MotorKind::Pwm, 1, 4)?;
//! motor.set_feedback(&encoder)?;
//! motor.set(0.5)?;
//! # Ok(())
//! # }
//! ```
//!
//! 资源对象只是轻量句柄，方法调用翻译成总线帧或文本行。
//! 引脚一经占用不再释放，重复占用视为配置错误并立即报告。

pub mod digital;
pub mod encoder;
pub mod legacy;
pub mod motor;
pub mod navigator;
pub mod registry;

pub use digital::{DigitalCounter, DigitalInput, DigitalOutput};
pub use encoder::{Encoder, EncoderKind};
pub use legacy::{IoLineTransport, LegacyLink, LineTransport};
pub use motor::{ControlMode, Motor, MotorKind};
pub use navigator::{Navigator, NavigatorOptions, Pose};
pub use registry::PinClass;

use parking_lot::Mutex;
use registry::Registry;
use rover_bus::{Bus, LinkError};
use rover_protocol::ops;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// 主协处理器的总线地址
pub const DEFAULT_ADDR: u8 = 5;

/// 硬件层统一错误类型
#[derive(Error, Debug)]
pub enum HalError {
    #[error("Link Error: {0}")]
    Link(#[from] LinkError),

    #[error("Protocol Error: {0}")]
    Protocol(#[from] rover_protocol::ProtocolError),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid {class:?} pin: {pin}")]
    InvalidPin { pin: u8, class: PinClass },

    #[error("Pin {pin} is in use")]
    PinInUse { pin: u8 },

    #[error("PWM pin and direction pin must be different")]
    SamePin,

    #[error("Too many motors: limit is {max}")]
    TooManyMotors { max: u8 },

    #[error("Navigator init failed after {rounds} rounds")]
    NavigatorInitFailed { rounds: u32 },

    #[error("Operation not supported on this backend")]
    Unsupported,
}

/// 协处理器型号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessorType {
    #[default]
    Unknown,
    Arduino,
    Stm32,
}

impl ProcessorType {
    fn from_wire(raw: u8) -> Self {
        match raw {
            1 => Self::Arduino,
            2 => Self::Stm32,
            other => {
                warn!("Unknown processor type: {}", other);
                Self::Unknown
            },
        }
    }
}

/// 通信后端
///
/// 在上下文构造时选定一次，之后所有资源共享同一个后端。
pub enum Backend {
    /// 帧式二线总线
    Bus(Bus),
    /// 遗留文本行协议（单片机串口固件）
    Legacy(LegacyLink),
}

/// 需要被固定周期调度的资源
///
/// 遗留后端的电机写入先暂存，由机器人调度器的更新节拍统一冲刷，
/// 同一节拍内的多次 `set` 只落一行。
pub trait Periodic: Send + Sync {
    fn update(&self) -> Result<(), HalError>;
}

/// 硬件上下文：后端 + 每地址引脚登记表
///
/// 在组合根构造一次，用 `Arc` 分发给资源对象和机器人控制器。
pub struct HardwareContext {
    backend: Backend,
    registries: Mutex<HashMap<u8, Registry>>,
}

impl HardwareContext {
    pub fn with_bus(bus: Bus) -> Self {
        Self {
            backend: Backend::Bus(bus),
            registries: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_legacy(link: LegacyLink) -> Self {
        Self {
            backend: Backend::Legacy(link),
            registries: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// 查询协处理器型号
    pub fn processor_type(&self, addr: u8) -> Result<ProcessorType, HalError> {
        match &self.backend {
            Backend::Bus(bus) => {
                let raw = bus.request_u8(addr, rover_protocol::CommandFrame::new(ops::GET_PROCESSOR_TYPE))?;
                Ok(ProcessorType::from_wire(raw))
            },
            Backend::Legacy(link) => Ok(link.processor_type()),
        }
    }

    /// 向所有协处理器发送保活
    pub fn keep_alive(&self) -> Result<(), HalError> {
        match &self.backend {
            Backend::Bus(bus) => {
                bus.send_to_all(rover_protocol::CommandFrame::new(ops::KEEP_ALIVE))?;
            },
            Backend::Legacy(link) => link.write_line("k")?,
        }
        Ok(())
    }

    /// 广播使能或失能
    pub fn set_enabled(&self, enabled: bool) -> Result<(), HalError> {
        match &self.backend {
            Backend::Bus(bus) => {
                let op = if enabled { ops::ENABLE } else { ops::DISABLE };
                bus.send_to_all(rover_protocol::CommandFrame::new(op))?;
            },
            Backend::Legacy(link) => {
                link.write_line(if enabled { "xe" } else { "xd" })?;
            },
        }
        Ok(())
    }

    /// 占用引脚
    ///
    /// 惰性拉取并缓存该地址的有效引脚掩码，越界、无效或重复占用
    /// 都是配置错误。遗留后端的固件不提供掩码，此时不做登记，
    /// 与其原始行为一致。
    pub(crate) fn claim(&self, addr: u8, pin: u8, class: PinClass) -> Result<(), HalError> {
        let Backend::Bus(bus) = &self.backend else {
            return Ok(());
        };

        let mut registries = self.registries.lock();
        let registry = registries.entry(addr).or_default();
        registry.claim(bus, addr, pin, class)
    }

    pub(crate) fn alloc_encoder(&self, addr: u8) -> u8 {
        let mut registries = self.registries.lock();
        registries.entry(addr).or_default().alloc_encoder()
    }

    pub(crate) fn alloc_digital(&self, addr: u8) -> u8 {
        let mut registries = self.registries.lock();
        registries.entry(addr).or_default().alloc_digital()
    }

    pub(crate) fn alloc_motor(&self, addr: u8) -> Result<u8, HalError> {
        let mut registries = self.registries.lock();
        let registry = registries.entry(addr).or_default();
        match &self.backend {
            Backend::Bus(bus) => registry.alloc_motor(Some((bus, addr))),
            Backend::Legacy(_) => registry.alloc_motor(None),
        }
    }

    /// 为引脚分配计数器索引；同一引脚的后续请求共享已有索引
    pub(crate) fn alloc_counter(&self, addr: u8, pin: u8) -> (u8, bool) {
        let mut registries = self.registries.lock();
        registries.entry(addr).or_default().alloc_counter(pin)
    }

    // === 资源工厂 ===

    /// 在主协处理器上创建编码器
    pub fn encoder(
        self: &Arc<Self>,
        kind: EncoderKind,
        pin1: u8,
        pin2: u8,
    ) -> Result<Encoder, HalError> {
        Encoder::new(self.clone(), kind, pin1, Some(pin2), DEFAULT_ADDR)
    }

    /// 在指定地址的协处理器上创建编码器
    pub fn encoder_at(
        self: &Arc<Self>,
        kind: EncoderKind,
        pin1: u8,
        pin2: u8,
        addr: u8,
    ) -> Result<Encoder, HalError> {
        Encoder::new(self.clone(), kind, pin1, Some(pin2), addr)
    }

    /// 创建单引脚简易编码器
    pub fn simple_encoder(self: &Arc<Self>, pin: u8) -> Result<Encoder, HalError> {
        Encoder::new(self.clone(), EncoderKind::Simple, pin, None, DEFAULT_ADDR)
    }

    /// 创建 PWM 电机
    pub fn motor(self: &Arc<Self>, kind: MotorKind, pwm_pin: u8, dir_pin: u8) -> Result<Motor, HalError> {
        Motor::new(self.clone(), kind, pwm_pin, dir_pin, motor::PulseRange::default(), DEFAULT_ADDR)
    }

    /// 在指定地址创建 PWM 电机
    pub fn motor_at(
        self: &Arc<Self>,
        kind: MotorKind,
        pwm_pin: u8,
        dir_pin: u8,
        addr: u8,
    ) -> Result<Motor, HalError> {
        Motor::new(self.clone(), kind, pwm_pin, dir_pin, motor::PulseRange::default(), addr)
    }

    /// 创建舵机式电机，脉宽单位为微秒
    pub fn servo_motor(self: &Arc<Self>, pin: u8, min: i16, zero: i16, max: i16) -> Result<Motor, HalError> {
        Motor::new(
            self.clone(),
            MotorKind::Servo,
            pin,
            0,
            motor::PulseRange { min, zero, max },
            DEFAULT_ADDR,
        )
    }

    pub fn digital_input(self: &Arc<Self>, pin: u8) -> Result<DigitalInput, HalError> {
        DigitalInput::new(self.clone(), pin, DEFAULT_ADDR)
    }

    pub fn digital_input_at(self: &Arc<Self>, pin: u8, addr: u8) -> Result<DigitalInput, HalError> {
        DigitalInput::new(self.clone(), pin, addr)
    }

    pub fn digital_output(self: &Arc<Self>, pin: u8) -> DigitalOutput {
        DigitalOutput::new(self.clone(), pin, DEFAULT_ADDR)
    }

    pub fn digital_counter(self: &Arc<Self>, pin: u8) -> Result<DigitalCounter, HalError> {
        DigitalCounter::new(self.clone(), pin, DEFAULT_ADDR)
    }

    /// 创建导航器并完成阻塞式初始化握手
    pub fn navigator(
        self: &Arc<Self>,
        left: Option<&Encoder>,
        right: Option<&Encoder>,
        options: NavigatorOptions,
    ) -> Result<Navigator, HalError> {
        Navigator::new(self.clone(), left, right, options)
    }
}
