//! 电机资源
//!
//! 功率模式下 `set` 的输入被截断到 [-1, 1]，放大 1000 倍后作为
//! 16 位定点数下发；速度模式下输入乘以 `max_speed`（若已设置）后
//! 直接作为目标速度。总线后端立即下发；遗留后端先暂存，
//! 由调度器的更新节拍冲刷，同一节拍内的多次写入合并为一条。

use crate::{Backend, HalError, HardwareContext, Periodic, PinClass};
use parking_lot::Mutex;
use rover_protocol::{CommandFrame, ops};
use std::fmt;
use std::sync::Arc;

/// 电机驱动方式，线上值与固件的枚举序号一致（0 保留给未知）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorKind {
    /// PWM 占空比 + 方向引脚
    Pwm = 1,
    /// 舵机式脉宽信号
    Servo = 2,
}

/// 控制模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    /// 直接功率控制，输入范围 [-1, 1]
    Power = 0,
    /// 固件 PID 速度闭环
    Speed = 1,
    /// 运动规划列表（固件尚未实现）
    MotionProfile = 2,
}

/// 舵机脉宽范围，单位微秒
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseRange {
    pub min: i16,
    pub zero: i16,
    pub max: i16,
}

impl Default for PulseRange {
    fn default() -> Self {
        Self {
            min: 1000,
            zero: 1500,
            max: 2000,
        }
    }
}

struct MotorInner {
    ctx: Arc<HardwareContext>,
    addr: u8,
    index: u8,
    mode: Mutex<ControlMode>,
    max_speed: Mutex<f64>,
    /// 遗留后端暂存的待下发值
    staged: Mutex<Option<i16>>,
}

/// 电机句柄，可克隆共享
#[derive(Clone)]
pub struct Motor {
    inner: Arc<MotorInner>,
}

impl Motor {
    pub(crate) fn new(
        ctx: Arc<HardwareContext>,
        kind: MotorKind,
        pwm_pin: u8,
        dir_pin: u8,
        pulse: PulseRange,
        addr: u8,
    ) -> Result<Self, HalError> {
        if pwm_pin == dir_pin {
            return Err(HalError::SamePin);
        }

        ctx.claim(addr, pwm_pin, PinClass::Pwm)?;
        if dir_pin != 0 {
            ctx.claim(addr, dir_pin, PinClass::Digital)?;
        }

        let index = ctx.alloc_motor(addr)?;
        match ctx.backend() {
            Backend::Bus(bus) => {
                // 舵机的脉宽范围由固件默认值决定，总线协议不传输
                bus.send_command(
                    addr,
                    CommandFrame::new(ops::CONFIGURE_MOTOR)
                        .u8(index)
                        .u8(kind as u8)
                        .u8(pwm_pin)
                        .u8(dir_pin),
                )?;
            },
            Backend::Legacy(link) => match kind {
                MotorKind::Pwm => {
                    link.write_line(&format!("m{}cp {} {}", index, pwm_pin, dir_pin))?;
                },
                MotorKind::Servo => {
                    link.write_line(&format!(
                        "m{}cs {} {} {} {}",
                        index, pwm_pin, pulse.min, pulse.zero, pulse.max
                    ))?;
                },
            },
        }

        Ok(Self {
            inner: Arc::new(MotorInner {
                ctx,
                addr,
                index,
                mode: Mutex::new(ControlMode::Power),
                max_speed: Mutex::new(0.0),
                staged: Mutex::new(None),
            }),
        })
    }

    pub fn index(&self) -> u8 {
        self.inner.index
    }

    /// 下发功率或目标速度，取决于当前控制模式
    pub fn set(&self, value: f64) -> Result<(), HalError> {
        let inner = &self.inner;
        let raw = match *inner.mode.lock() {
            ControlMode::Power => (value.clamp(-1.0, 1.0) * 1000.0) as i16,
            ControlMode::Speed => {
                let max_speed = *inner.max_speed.lock();
                let value = if max_speed != 0.0 { value * max_speed } else { value };
                value as i16
            },
            ControlMode::MotionProfile => return Ok(()),
        };

        match inner.ctx.backend() {
            Backend::Bus(bus) => {
                bus.send_command(
                    inner.addr,
                    CommandFrame::new(ops::SET_MOTOR).u8(inner.index).i16(raw),
                )?;
            },
            Backend::Legacy(_) => {
                *inner.staged.lock() = Some(raw);
            },
        }
        Ok(())
    }

    /// 设定速度模式下 `set(±1.0)` 对应的满量程速度
    pub fn set_max_speed(&self, max_speed: f64) {
        *self.inner.max_speed.lock() = max_speed;
    }

    /// 切换控制模式，重复设置同一模式不产生流量
    pub fn set_control_mode(&self, mode: ControlMode) -> Result<(), HalError> {
        let inner = &self.inner;
        let mut current = inner.mode.lock();
        if *current == mode {
            return Ok(());
        }
        *current = mode;

        match inner.ctx.backend() {
            Backend::Bus(bus) => {
                bus.send_command(
                    inner.addr,
                    CommandFrame::new(ops::SET_MOTOR_MODE)
                        .u8(inner.index)
                        .u8(mode as u8),
                )?;
            },
            Backend::Legacy(link) => {
                link.write_line(&format!("m{}m {}", inner.index, mode as u8))?;
            },
        }
        Ok(())
    }

    /// 绑定速度闭环的反馈编码器
    pub fn set_feedback(&self, encoder: &crate::Encoder) -> Result<(), HalError> {
        let inner = &self.inner;
        match inner.ctx.backend() {
            Backend::Bus(bus) => {
                bus.send_command(
                    inner.addr,
                    CommandFrame::new(ops::SET_FEEDBACK_DEVICE)
                        .u8(inner.index)
                        .u8(encoder.index()),
                )?;
            },
            Backend::Legacy(link) => {
                link.write_line(&format!("m{}d {}", inner.index, encoder.index()))?;
            },
        }
        Ok(())
    }

    pub fn set_p_term(&self, p: f64) -> Result<(), HalError> {
        self.pid_term(ops::SET_PID_P, 'p', p)
    }

    pub fn set_i_term(&self, i: f64) -> Result<(), HalError> {
        self.pid_term(ops::SET_PID_I, 'i', i)
    }

    /// 微分项，遗留固件不支持
    pub fn set_d_term(&self, d: f64) -> Result<(), HalError> {
        let inner = &self.inner;
        match inner.ctx.backend() {
            Backend::Bus(bus) => {
                bus.send_command(
                    inner.addr,
                    CommandFrame::new(ops::SET_PID_D).u8(inner.index).f32(d as f32),
                )?;
                Ok(())
            },
            Backend::Legacy(_) => Err(HalError::Unsupported),
        }
    }

    /// 前馈项
    pub fn set_f_term(&self, f: f64) -> Result<(), HalError> {
        self.pid_term(ops::SET_PID_F, 'f', f)
    }

    /// 积分生效区，误差超出该区间时积分项被忽略
    pub fn set_i_zone(&self, zone: f64) -> Result<(), HalError> {
        self.pid_term(ops::SET_PID_IZONE, 'z', zone)
    }

    pub fn set_inverted(&self, invert: bool) -> Result<(), HalError> {
        let inner = &self.inner;
        match inner.ctx.backend() {
            Backend::Bus(bus) => {
                bus.send_command(
                    inner.addr,
                    CommandFrame::new(ops::SET_MOTOR_INVERTED)
                        .u8(inner.index)
                        .u8(invert as u8),
                )?;
            },
            Backend::Legacy(link) => {
                link.write_line(&format!("m{}{}", inner.index, if invert { '-' } else { '+' }))?;
            },
        }
        Ok(())
    }

    /// 克服静摩擦的最小起动功率，范围 [0, 1]
    pub fn set_min_power(&self, value: f64) -> Result<(), HalError> {
        let inner = &self.inner;
        match inner.ctx.backend() {
            Backend::Bus(bus) => {
                bus.send_command(
                    inner.addr,
                    CommandFrame::new(ops::SET_MIN_MOTOR_POWER)
                        .u8(inner.index)
                        .i16((value * 1000.0) as i16),
                )?;
                Ok(())
            },
            Backend::Legacy(_) => Err(HalError::Unsupported),
        }
    }

    fn pid_term(&self, op: u8, legacy_key: char, value: f64) -> Result<(), HalError> {
        let inner = &self.inner;
        match inner.ctx.backend() {
            Backend::Bus(bus) => {
                bus.send_command(
                    inner.addr,
                    CommandFrame::new(op).u8(inner.index).f32(value as f32),
                )?;
            },
            Backend::Legacy(link) => {
                // 遗留固件用整数定点：值 ×1000，附除数
                link.write_line(&format!(
                    "m{}{} {} 1000",
                    inner.index,
                    legacy_key,
                    (value * 1000.0) as i32
                ))?;
            },
        }
        Ok(())
    }
}

impl fmt::Debug for Motor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Motor")
            .field("addr", &self.inner.addr)
            .field("index", &self.inner.index)
            .field("mode", &*self.inner.mode.lock())
            .finish()
    }
}

impl Periodic for Motor {
    /// 冲刷遗留后端暂存的写入；总线后端没有暂存，直接返回
    fn update(&self) -> Result<(), HalError> {
        let inner = &self.inner;
        let Backend::Legacy(link) = inner.ctx.backend() else {
            return Ok(());
        };

        let staged = inner.staged.lock().take();
        if let Some(value) = staged {
            link.write_line(&format!("m{}s {}", inner.index, value))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DEFAULT_ADDR, LegacyLink, LineTransport};
    use rover_bus::mock::SimCoprocessor;
    use rover_bus::{Bus, BusConfig};
    use std::io;
    use std::time::Duration;

    fn sim_with_pins() -> SimCoprocessor {
        let mut sim = SimCoprocessor::new();
        sim.respond(ops::GET_VALID_PINS, |_| u64::MAX.to_le_bytes().to_vec());
        sim.respond(ops::GET_VALID_PWM_PINS, |_| 0xFFi32.to_le_bytes().to_vec());
        sim.respond(ops::GET_MAX_MOTORS, |_| vec![2]);
        sim.respond(ops::GET_PROCESSOR_TYPE, |_| vec![1]);
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

    fn flush(ctx: &Arc<HardwareContext>) {
        ctx.processor_type(DEFAULT_ADDR).unwrap();
    }

    #[test]
    fn test_configure_frame() {
        let sim = sim_with_pins();
        let log = sim.log();
        let ctx = context(sim);

        let motor = ctx.motor(MotorKind::Pwm, 1, 4).unwrap();
        assert_eq!(motor.index(), 0);
        flush(&ctx);

        let log = log.lock();
        let configure = log.iter().find(|w| w.opcode == ops::CONFIGURE_MOTOR).unwrap();
        assert_eq!(configure.payload, [0, 1, 1, 4]);
    }

    #[test]
    fn test_power_clamp_and_scale() {
        let sim = sim_with_pins();
        let log = sim.log();
        let ctx = context(sim);

        let motor = ctx.motor(MotorKind::Pwm, 1, 4).unwrap();
        motor.set(0.5).unwrap();
        motor.set(1.7).unwrap();
        motor.set(-2.0).unwrap();
        flush(&ctx);

        let values: Vec<i16> = log
            .lock()
            .iter()
            .filter(|w| w.opcode == ops::SET_MOTOR)
            .map(|w| i16::from_le_bytes([w.payload[1], w.payload[2]]))
            .collect();
        assert_eq!(values, [500, 1000, -1000]);
    }

    #[test]
    fn test_speed_mode_scales_by_max_speed() {
        let sim = sim_with_pins();
        let log = sim.log();
        let ctx = context(sim);

        let motor = ctx.motor(MotorKind::Pwm, 1, 4).unwrap();
        motor.set_control_mode(ControlMode::Speed).unwrap();
        motor.set_max_speed(2400.0);
        motor.set(0.5).unwrap();
        flush(&ctx);

        let log = log.lock();
        let set = log.iter().find(|w| w.opcode == ops::SET_MOTOR).unwrap();
        assert_eq!(i16::from_le_bytes([set.payload[1], set.payload[2]]), 1200);
    }

    #[test]
    fn test_redundant_mode_change_is_skipped() {
        let sim = sim_with_pins();
        let log = sim.log();
        let ctx = context(sim);

        let motor = ctx.motor(MotorKind::Pwm, 1, 4).unwrap();
        motor.set_control_mode(ControlMode::Power).unwrap(); // 已是默认
        motor.set_control_mode(ControlMode::Speed).unwrap();
        motor.set_control_mode(ControlMode::Speed).unwrap();
        flush(&ctx);

        let changes: Vec<Vec<u8>> = log
            .lock()
            .iter()
            .filter(|w| w.opcode == ops::SET_MOTOR_MODE)
            .map(|w| w.payload.clone())
            .collect();
        assert_eq!(changes, [[0, 1]]);
    }

    #[test]
    fn test_pid_terms_as_f32() {
        let sim = sim_with_pins();
        let log = sim.log();
        let ctx = context(sim);

        let motor = ctx.motor(MotorKind::Pwm, 1, 4).unwrap();
        motor.set_p_term(0.25).unwrap();
        motor.set_i_zone(100.0).unwrap();
        flush(&ctx);

        let log = log.lock();
        let p = log.iter().find(|w| w.opcode == ops::SET_PID_P).unwrap();
        assert_eq!(p.payload[0], 0);
        assert_eq!(
            f32::from_le_bytes([p.payload[1], p.payload[2], p.payload[3], p.payload[4]]),
            0.25
        );
        let z = log.iter().find(|w| w.opcode == ops::SET_PID_IZONE).unwrap();
        assert_eq!(
            f32::from_le_bytes([z.payload[1], z.payload[2], z.payload[3], z.payload[4]]),
            100.0
        );
    }

    #[test]
    fn test_same_pin_is_a_fault() {
        let sim = sim_with_pins();
        let ctx = context(sim);
        assert!(matches!(
            ctx.motor(MotorKind::Pwm, 3, 3),
            Err(HalError::SamePin)
        ));
    }

    #[test]
    fn test_motor_limit_enforced() {
        let sim = sim_with_pins();
        let ctx = context(sim);

        ctx.motor(MotorKind::Pwm, 1, 4).unwrap();
        ctx.motor(MotorKind::Pwm, 2, 5).unwrap();
        let err = ctx.motor(MotorKind::Pwm, 6, 7).unwrap_err();
        assert!(matches!(err, HalError::TooManyMotors { max: 2 }));
    }

    #[test]
    fn test_motion_profile_mode_drops_set() {
        let sim = sim_with_pins();
        let log = sim.log();
        let ctx = context(sim);

        let motor = ctx.motor(MotorKind::Pwm, 1, 4).unwrap();
        motor.set_control_mode(ControlMode::MotionProfile).unwrap();
        motor.set(0.5).unwrap();
        flush(&ctx);

        assert!(log.lock().iter().all(|w| w.opcode != ops::SET_MOTOR));
    }

    // === 遗留后端 ===

    struct VecWriter(std::sync::Arc<parking_lot::Mutex<Vec<String>>>);

    impl LineTransport for VecWriter {
        fn write_line(&mut self, line: &str) -> io::Result<()> {
            self.0.lock().push(line.to_string());
            Ok(())
        }
    }

    fn legacy_context() -> (Arc<HardwareContext>, std::sync::Arc<parking_lot::Mutex<Vec<String>>>) {
        let lines = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let link = LegacyLink::new(VecWriter(lines.clone()));
        (Arc::new(HardwareContext::with_legacy(link)), lines)
    }

    #[test]
    fn test_legacy_servo_configure_line() {
        let (ctx, lines) = legacy_context();
        ctx.servo_motor(9, 1000, 1500, 2000).unwrap();
        assert_eq!(lines.lock().as_slice(), ["m0cs 9 1000 1500 2000"]);
    }

    #[test]
    fn test_legacy_set_staged_until_update() {
        let (ctx, lines) = legacy_context();
        let motor = ctx.motor(MotorKind::Pwm, 1, 4).unwrap();

        motor.set(0.25).unwrap();
        motor.set(0.5).unwrap();
        assert_eq!(lines.lock().len(), 1); // 只有配置行

        // 一个节拍只冲刷最后一次写入
        motor.update().unwrap();
        assert_eq!(lines.lock().last().unwrap(), "m0s 500");

        // 没有新写入时节拍不产生流量
        motor.update().unwrap();
        assert_eq!(lines.lock().len(), 2);
    }

    #[test]
    fn test_legacy_unsupported_operations() {
        let (ctx, _lines) = legacy_context();
        let motor = ctx.motor(MotorKind::Pwm, 1, 4).unwrap();
        assert!(matches!(motor.set_d_term(0.1), Err(HalError::Unsupported)));
        assert!(matches!(motor.set_min_power(0.1), Err(HalError::Unsupported)));
    }
}
