//! 每地址引脚登记表与资源索引分配
//!
//! 协处理器固件按引脚类别公布有效掩码，登记表惰性拉取并缓存，
//! 之后的占用检查不再产生总线流量。引脚一经占用永不释放。

use crate::HalError;
use rover_bus::Bus;
use rover_protocol::{CommandFrame, ops};
use tracing::debug;

/// 引脚类别，决定用哪个有效掩码做校验
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinClass {
    Digital,
    Pwm,
    Analog,
}

/// 遗留固件的电机槽位数，固件不提供查询时使用
const LEGACY_MAX_MOTORS: u8 = 4;

/// 单个协处理器的登记状态
#[derive(Default)]
pub(crate) struct Registry {
    valid_pins: Option<u64>,
    valid_pwm_pins: Option<u64>,
    valid_analog_pins: Option<u64>,
    max_motors: Option<u8>,
    used_pins: u64,
    next_encoder: u8,
    next_motor: u8,
    next_counter: u8,
    next_digital: u8,
    /// 引脚到计数器索引的映射，同一引脚共享同一个硬件计数器
    counter_pins: Vec<(u8, u8)>,
}

impl Registry {
    /// 校验并占用引脚
    pub(crate) fn claim(&mut self, bus: &Bus, addr: u8, pin: u8, class: PinClass) -> Result<(), HalError> {
        let mask = self.valid_mask(bus, addr, class)?;

        if pin >= 64 || mask & (1u64 << pin) == 0 {
            return Err(HalError::InvalidPin { pin, class });
        }
        if self.used_pins & (1u64 << pin) != 0 {
            return Err(HalError::PinInUse { pin });
        }

        self.used_pins |= 1u64 << pin;
        Ok(())
    }

    fn valid_mask(&mut self, bus: &Bus, addr: u8, class: PinClass) -> Result<u64, HalError> {
        let slot = match class {
            PinClass::Digital => &mut self.valid_pins,
            PinClass::Pwm => &mut self.valid_pwm_pins,
            PinClass::Analog => &mut self.valid_analog_pins,
        };

        if let Some(mask) = *slot {
            return Ok(mask);
        }

        let mask = match class {
            PinClass::Digital => bus.request_u64(addr, CommandFrame::new(ops::GET_VALID_PINS))?,
            PinClass::Pwm => {
                bus.request_i32(addr, CommandFrame::new(ops::GET_VALID_PWM_PINS))? as u32 as u64
            },
            PinClass::Analog => {
                bus.request_i32(addr, CommandFrame::new(ops::GET_VALID_ANALOG_PINS))? as u32 as u64
            },
        };
        debug!("Valid {:?} pins for addr {}: {:#x}", class, addr, mask);

        *slot = Some(mask);
        Ok(mask)
    }

    pub(crate) fn alloc_encoder(&mut self) -> u8 {
        let index = self.next_encoder;
        self.next_encoder += 1;
        index
    }

    pub(crate) fn alloc_digital(&mut self) -> u8 {
        let index = self.next_digital;
        self.next_digital += 1;
        index
    }

    /// 分配电机索引，受固件公布的电机槽位数约束
    pub(crate) fn alloc_motor(&mut self, bus: Option<(&Bus, u8)>) -> Result<u8, HalError> {
        let max = match (self.max_motors, bus) {
            (Some(max), _) => max,
            (None, Some((bus, addr))) => {
                let max = bus.request_u8(addr, CommandFrame::new(ops::GET_MAX_MOTORS))?;
                self.max_motors = Some(max);
                max
            },
            (None, None) => {
                self.max_motors = Some(LEGACY_MAX_MOTORS);
                LEGACY_MAX_MOTORS
            },
        };

        if self.next_motor >= max {
            return Err(HalError::TooManyMotors { max });
        }

        let index = self.next_motor;
        self.next_motor += 1;
        Ok(index)
    }

    /// 返回 `(索引, 是否新建)`；同一引脚的重复请求共享已有索引
    pub(crate) fn alloc_counter(&mut self, pin: u8) -> (u8, bool) {
        if let Some(&(_, index)) = self.counter_pins.iter().find(|&&(p, _)| p == pin) {
            return (index, false);
        }

        let index = self.next_counter;
        self.next_counter += 1;
        self.counter_pins.push((pin, index));
        (index, true)
    }
}
