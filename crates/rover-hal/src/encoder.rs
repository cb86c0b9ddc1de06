//! 编码器资源
//!
//! 位置读数是相对值：`position() = 硬件原始值 - 本句柄的零点`。
//! [`Encoder::clone`] 产生共享同一物理通道但零点独立的新句柄，
//! 两个句柄可以各自 `reset()` 而互不干扰。

use crate::{Backend, HalError, HardwareContext, PinClass};
use rover_protocol::{CommandFrame, ops};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;
use tracing::warn;

/// 编码器类型，线上值与固件的枚举序号一致
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderKind {
    /// 连续旋转电位器
    Analog = 0,
    /// 双路正交编码器，pin1 必须是中断引脚
    Quadrature = 1,
    /// 单路编码器，只测速度和距离，不辨方向
    Simple = 2,
}

/// 遗留固件的订阅等待参数
const LEGACY_SUBSCRIBE_ATTEMPTS: u32 = 3;
const LEGACY_SUBSCRIBE_WAIT: Duration = Duration::from_millis(50);

struct EncoderChannel {
    ctx: Arc<HardwareContext>,
    addr: u8,
    index: u8,
}

/// 编码器句柄
pub struct Encoder {
    chan: Arc<EncoderChannel>,
    zero: AtomicI32,
}

impl Encoder {
    pub(crate) fn new(
        ctx: Arc<HardwareContext>,
        kind: EncoderKind,
        pin1: u8,
        pin2: Option<u8>,
        addr: u8,
    ) -> Result<Self, HalError> {
        let pin_class = if kind == EncoderKind::Analog {
            PinClass::Analog
        } else {
            PinClass::Digital
        };
        ctx.claim(addr, pin1, pin_class)?;
        if let Some(pin2) = pin2 {
            ctx.claim(addr, pin2, pin_class)?;
        }

        let index = ctx.alloc_encoder(addr);
        match ctx.backend() {
            Backend::Bus(bus) => {
                bus.send_command(
                    addr,
                    CommandFrame::new(ops::CONFIGURE_ENCODER)
                        .u8(index)
                        .u8(kind as u8)
                        .u8(pin1)
                        .u8(pin2.unwrap_or(0xff)),
                )?;
            },
            Backend::Legacy(link) => {
                link.write_line(&format!(
                    "e{}c{} {} {}",
                    index,
                    kind as u8,
                    pin1,
                    pin2.map_or(-1, i32::from)
                ))?;
            },
        }

        Ok(Self {
            chan: Arc::new(EncoderChannel { ctx, addr, index }),
            zero: AtomicI32::new(0),
        })
    }

    pub fn index(&self) -> u8 {
        self.chan.index
    }

    /// 相对当前零点的位置
    pub fn position(&self) -> Result<i32, HalError> {
        Ok(self.raw_position()? - self.zero.load(Ordering::Acquire))
    }

    /// 当前速度（ticks/秒），不受零点影响
    pub fn speed(&self) -> Result<i32, HalError> {
        let chan = &self.chan;
        match chan.ctx.backend() {
            Backend::Bus(bus) => Ok(bus.request_i16(
                chan.addr,
                CommandFrame::new(ops::GET_ENCODER_SPEED).u8(chan.index),
            )? as i32),
            Backend::Legacy(_) => Ok(self.legacy_feedback()?.1),
        }
    }

    /// 把零点移到当前位置
    pub fn reset(&self) -> Result<(), HalError> {
        let raw = self.raw_position()?;
        self.zero.store(raw, Ordering::Release);
        Ok(())
    }

    /// 反转计数和速度方向
    pub fn set_inverted(&self, invert: bool) -> Result<(), HalError> {
        let chan = &self.chan;
        match chan.ctx.backend() {
            Backend::Bus(bus) => {
                bus.send_command(
                    chan.addr,
                    CommandFrame::new(ops::SET_ENCODER_INVERTED)
                        .u8(chan.index)
                        .u8(invert as u8),
                )?;
            },
            Backend::Legacy(link) => {
                link.write_line(&format!("e{}i{}", chan.index, if invert { 't' } else { 'f' }))?;
            },
        }
        Ok(())
    }

    fn raw_position(&self) -> Result<i32, HalError> {
        let chan = &self.chan;
        match chan.ctx.backend() {
            Backend::Bus(bus) => Ok(bus.request_i32(
                chan.addr,
                CommandFrame::new(ops::GET_ENCODER_POS).u8(chan.index),
            )?),
            Backend::Legacy(_) => Ok(self.legacy_feedback()?.0),
        }
    }

    /// 遗留固件不应答查询，第一次读取前先订阅周期上报并等它到达
    fn legacy_feedback(&self) -> Result<(i32, i32), HalError> {
        let chan = &self.chan;
        let Backend::Legacy(link) = chan.ctx.backend() else {
            unreachable!("legacy_feedback on bus backend");
        };

        for _ in 0..LEGACY_SUBSCRIBE_ATTEMPTS {
            if let Some(feedback) = link.encoder_feedback(chan.index) {
                return Ok(feedback);
            }
            link.write_line(&format!("e{}s 25 0", chan.index))?;
            spin_sleep::sleep(LEGACY_SUBSCRIBE_WAIT);
        }

        match link.encoder_feedback(chan.index) {
            Some(feedback) => Ok(feedback),
            None => {
                warn!("Encoder {} never reported, returning zero", chan.index);
                Ok((0, 0))
            },
        }
    }
}

impl fmt::Debug for Encoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Encoder")
            .field("addr", &self.chan.addr)
            .field("index", &self.chan.index)
            .field("zero", &self.zero.load(Ordering::Relaxed))
            .finish()
    }
}

impl Clone for Encoder {
    /// 共享物理通道，零点独立（新句柄零点从 0 开始）
    fn clone(&self) -> Self {
        Self {
            chan: self.chan.clone(),
            zero: AtomicI32::new(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_ADDR;
    use rover_bus::mock::SimCoprocessor;
    use rover_bus::{Bus, BusConfig};

    fn sim_with_pins() -> SimCoprocessor {
        let mut sim = SimCoprocessor::new();
        sim.respond(ops::GET_VALID_PINS, |_| u64::MAX.to_le_bytes().to_vec());
        sim.respond(ops::GET_VALID_ANALOG_PINS, |_| 0x0Fi32.to_le_bytes().to_vec());
        sim.respond(ops::GET_PROCESSOR_TYPE, |_| vec![2]);
        sim
    }

    fn context(sim: SimCoprocessor) -> Arc<HardwareContext> {
        let bus = Bus::spawn(
            sim,
            BusConfig {
                write_backoff: Duration::from_millis(1),
                read_backoff: Duration::from_millis(1),
                ..BusConfig::default()
            },
        );
        Arc::new(HardwareContext::with_bus(bus))
    }

    #[test]
    fn test_configure_frame() {
        let sim = sim_with_pins();
        let log = sim.log();
        let ctx = context(sim);

        let encoder = ctx.encoder(EncoderKind::Quadrature, 19, 15).unwrap();
        assert_eq!(encoder.index(), 0);
        // 请求用于排空队列
        ctx.processor_type(DEFAULT_ADDR).unwrap();

        let log = log.lock();
        let configure = log
            .iter()
            .find(|w| w.opcode == ops::CONFIGURE_ENCODER)
            .unwrap();
        assert_eq!(configure.addr, DEFAULT_ADDR);
        assert_eq!(configure.payload, [0, 1, 19, 15]);
    }

    #[test]
    fn test_simple_encoder_single_pin() {
        let sim = sim_with_pins();
        let log = sim.log();
        let ctx = context(sim);

        ctx.simple_encoder(20).unwrap();
        ctx.processor_type(DEFAULT_ADDR).unwrap();
        let log = log.lock();
        let configure = log
            .iter()
            .find(|w| w.opcode == ops::CONFIGURE_ENCODER)
            .unwrap();
        assert_eq!(configure.payload, [0, 2, 20, 0xff]);
    }

    #[test]
    fn test_analog_encoder_uses_analog_mask() {
        // 模拟掩码只有低 4 位有效
        let sim = sim_with_pins();
        let ctx = context(sim);

        let err = ctx
            .encoder(EncoderKind::Analog, 10, 11)
            .expect_err("pin 10 is not a valid analog pin");
        assert!(matches!(
            err,
            HalError::InvalidPin {
                pin: 10,
                class: PinClass::Analog
            }
        ));

        ctx.encoder(EncoderKind::Analog, 2, 3).unwrap();
    }

    #[test]
    fn test_position_is_relative_to_zero() {
        let mut sim = sim_with_pins();
        let mut raw = 100i32;
        sim.respond(ops::GET_ENCODER_POS, move |_| {
            raw += 50;
            raw.to_le_bytes().to_vec()
        });
        let ctx = context(sim);

        let encoder = ctx.encoder(EncoderKind::Quadrature, 19, 15).unwrap();
        assert_eq!(encoder.position().unwrap(), 150);

        encoder.reset().unwrap(); // 零点 = 200
        assert_eq!(encoder.position().unwrap(), 50);
    }

    #[test]
    fn test_clone_shares_channel_with_independent_zero() {
        let mut sim = sim_with_pins();
        sim.respond(ops::GET_ENCODER_POS, |payload| {
            assert_eq!(payload, [0]);
            500i32.to_le_bytes().to_vec()
        });
        let ctx = context(sim);

        let encoder = ctx.encoder(EncoderKind::Quadrature, 19, 15).unwrap();
        encoder.reset().unwrap();
        assert_eq!(encoder.position().unwrap(), 0);

        // 克隆查询同一个索引，但零点从 0 开始
        let copy = encoder.clone();
        assert_eq!(copy.index(), encoder.index());
        assert_eq!(copy.position().unwrap(), 500);
    }

    #[test]
    fn test_speed_request() {
        let mut sim = sim_with_pins();
        sim.respond(ops::GET_ENCODER_SPEED, |_| (-300i16).to_le_bytes().to_vec());
        let ctx = context(sim);

        let encoder = ctx.encoder(EncoderKind::Quadrature, 19, 15).unwrap();
        assert_eq!(encoder.speed().unwrap(), -300);
    }

    #[test]
    fn test_duplicate_pin_is_a_fault() {
        let sim = sim_with_pins();
        let ctx = context(sim);

        ctx.encoder(EncoderKind::Quadrature, 19, 15).unwrap();
        let err = ctx.encoder(EncoderKind::Quadrature, 19, 16).unwrap_err();
        assert!(matches!(err, HalError::PinInUse { pin: 19 }));
    }

    #[test]
    fn test_out_of_range_pin_is_a_fault() {
        let sim = sim_with_pins();
        let ctx = context(sim);

        let err = ctx.encoder(EncoderKind::Quadrature, 64, 15).unwrap_err();
        assert!(matches!(err, HalError::InvalidPin { pin: 64, .. }));
    }

    #[test]
    fn test_valid_pin_mask_fetched_once() {
        let sim = sim_with_pins();
        let log = sim.log();
        let ctx = context(sim);

        ctx.encoder(EncoderKind::Quadrature, 19, 15).unwrap();
        ctx.encoder(EncoderKind::Quadrature, 20, 21).unwrap();

        let fetches = log
            .lock()
            .iter()
            .filter(|w| w.opcode == ops::GET_VALID_PINS)
            .count();
        assert_eq!(fetches, 1);
    }

    #[test]
    fn test_debug_names_channel() {
        let sim = sim_with_pins();
        let ctx = context(sim);

        let encoder = ctx.encoder(EncoderKind::Quadrature, 19, 15).unwrap();
        let rendered = format!("{:?}", encoder);
        assert!(rendered.contains("index: 0"), "got: {}", rendered);
    }

    #[test]
    fn test_set_inverted_frame() {
        let sim = sim_with_pins();
        let log = sim.log();
        let ctx = context(sim);

        let encoder = ctx.encoder(EncoderKind::Quadrature, 19, 15).unwrap();
        encoder.set_inverted(true).unwrap();
        // 请求用于排空队列
        ctx.processor_type(DEFAULT_ADDR).unwrap();

        let log = log.lock();
        let invert = log
            .iter()
            .find(|w| w.opcode == ops::SET_ENCODER_INVERTED)
            .unwrap();
        assert_eq!(invert.payload, [0, 1]);
    }
}
