//! 数字输入、输出与脉冲计数器
//!
//! 计数器的读数与编码器一样是相对值：`get() = 硬件计数 - 零点`。
//! 同一引脚可以创建多个计数器句柄，它们共享同一个硬件计数通道，
//! 但零点各自独立：`copy()` 产生的新句柄以创建时刻的硬件计数为零点。

use crate::{Backend, HalError, HardwareContext, PinClass};
use rover_protocol::{CommandFrame, ops};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

/// 数字输入引脚
pub struct DigitalInput {
    ctx: Arc<HardwareContext>,
    addr: u8,
    pin: u8,
    /// 遗留固件按登记顺序在位图里上报，需要记录序号
    index: u8,
}

impl DigitalInput {
    pub(crate) fn new(ctx: Arc<HardwareContext>, pin: u8, addr: u8) -> Result<Self, HalError> {
        ctx.claim(addr, pin, PinClass::Digital)?;
        let index = ctx.alloc_digital(addr);

        if let Backend::Legacy(link) = ctx.backend() {
            link.write_line(&format!("d{}c {}", index, pin))?;
        }

        Ok(Self {
            ctx,
            addr,
            pin,
            index,
        })
    }

    /// 引脚当前电平
    pub fn get(&self) -> Result<bool, HalError> {
        match self.ctx.backend() {
            Backend::Bus(bus) => {
                let raw = bus.request_u8(
                    self.addr,
                    CommandFrame::new(ops::DIGITAL_READ).u8(self.pin),
                )?;
                Ok(raw == 1)
            },
            Backend::Legacy(link) => Ok(link.digital_bit(self.index)),
        }
    }
}

impl fmt::Debug for DigitalInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigitalInput")
            .field("addr", &self.addr)
            .field("pin", &self.pin)
            .field("index", &self.index)
            .finish()
    }
}

/// 数字输出引脚
///
/// 输出引脚不登记占用，固件侧允许任意引脚写出。
pub struct DigitalOutput {
    ctx: Arc<HardwareContext>,
    addr: u8,
    pin: u8,
}

impl DigitalOutput {
    pub(crate) fn new(ctx: Arc<HardwareContext>, pin: u8, addr: u8) -> Self {
        Self { ctx, addr, pin }
    }

    pub fn set(&self, high: bool) -> Result<(), HalError> {
        match self.ctx.backend() {
            Backend::Bus(bus) => {
                bus.send_command(
                    self.addr,
                    CommandFrame::new(ops::DIGITAL_WRITE).u8(self.pin).u8(high as u8),
                )?;
            },
            Backend::Legacy(link) => {
                link.write_line(&format!("wd {} {}", self.pin, high as u8))?;
            },
        }
        Ok(())
    }
}

impl fmt::Debug for DigitalOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigitalOutput")
            .field("addr", &self.addr)
            .field("pin", &self.pin)
            .finish()
    }
}

/// 脉冲计数器
pub struct DigitalCounter {
    ctx: Arc<HardwareContext>,
    addr: u8,
    pin: u8,
    index: u8,
    zero: AtomicI32,
}

impl DigitalCounter {
    pub(crate) fn new(ctx: Arc<HardwareContext>, pin: u8, addr: u8) -> Result<Self, HalError> {
        let (index, created) = ctx.alloc_counter(addr, pin);

        if created {
            ctx.claim(addr, pin, PinClass::Digital)?;
            match ctx.backend() {
                Backend::Bus(bus) => {
                    bus.send_command(
                        addr,
                        CommandFrame::new(ops::CREATE_COUNTER).u8(index).u8(pin),
                    )?;
                },
                Backend::Legacy(link) => {
                    link.write_line(&format!("c{}c {}", index, pin))?;
                },
            }
        }

        let counter = Self {
            ctx,
            addr,
            pin,
            index,
            zero: AtomicI32::new(0),
        };
        if !created {
            // 共享已有通道时以当前硬件计数为零点
            counter.reset()?;
        }
        Ok(counter)
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    /// 相对当前零点的计数
    pub fn get(&self) -> Result<i32, HalError> {
        Ok(self.raw_count()? - self.zero.load(Ordering::Acquire))
    }

    /// 把零点移到当前计数
    pub fn reset(&self) -> Result<(), HalError> {
        let raw = self.raw_count()?;
        self.zero.store(raw, Ordering::Release);
        Ok(())
    }

    /// 共享同一硬件通道的新句柄，零点取创建时刻的计数
    pub fn copy(&self) -> Result<Self, HalError> {
        Self::new(self.ctx.clone(), self.pin, self.addr)
    }

    fn raw_count(&self) -> Result<i32, HalError> {
        match self.ctx.backend() {
            Backend::Bus(bus) => Ok(bus.request_i32(
                self.addr,
                CommandFrame::new(ops::GET_DIGITAL_COUNT).u8(self.index),
            )?),
            Backend::Legacy(link) => Ok(link.counter_count(self.index)),
        }
    }
}

impl fmt::Debug for DigitalCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigitalCounter")
            .field("addr", &self.addr)
            .field("pin", &self.pin)
            .field("index", &self.index)
            .field("zero", &self.zero.load(Ordering::Relaxed))
            .finish()
    }
}
