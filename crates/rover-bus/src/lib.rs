//! # Rover Bus
//!
//! 协处理器总线引擎。
//!
//! 所有硬件资源通过同一条总线与协处理器通信，本 crate 提供：
//!
//! - [`Transport`]: 字节级传输抽象（I2C、串口或测试仿真）
//! - [`Bus`]: 命令队列 + 唯一消费线程，传输端完全由该线程独占
//! - [`LinkError`]: 链路层故障分类
//!
//! ## 并发模型
//!
//! 生产者（硬件资源对象，可能在任意线程）把命令投入有界队列，
//! 队列满时投递方阻塞，形成天然的背压。消费线程逐条取出命令，
//! 执行 写入 → 读响应 → 校验 → 重试 的完整序列，再通过每条命令
//! 自带的一次性通道把结果交还给等待方。
//!
//! 序列号按地址维护，仅在帧被确认后递增，同一条命令的所有重试
//! 共享同一个序列号，协处理器据此识别重复帧。

pub mod bus;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use bus::{Bus, BusConfig};

use thiserror::Error;

/// 字节级传输抽象
///
/// 实现者只负责把字节搬到指定地址的设备上，不理解帧格式。
/// [`Bus`](crate::Bus) 的消费线程是唯一的调用方，因此方法取 `&mut self`。
pub trait Transport: Send + 'static {
    /// 向指定地址写出一整帧
    fn write(&mut self, addr: u8, data: &[u8]) -> std::io::Result<()>;

    /// 从指定地址读满 `buf`
    ///
    /// 设备未就绪时固件也会填充应答码（`ACK_RETRY`），
    /// 因此这里不需要超时语义，读不满就是 IO 错误。
    fn read_exact(&mut self, addr: u8, buf: &mut [u8]) -> std::io::Result<()>;
}

/// 链路层统一错误类型
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol Error: {0}")]
    Protocol(#[from] rover_protocol::ProtocolError),

    /// 地址 0 是 I2C 广播地址，任何资源落在这里都是配置错误
    #[error("Bus address is zero")]
    ZeroAddress,

    /// 协处理器命令队列溢出，本条命令被丢弃且不再重试
    #[error("Command rejected by coprocessor (queue overflow): op={opcode}")]
    Rejected { opcode: u8 },

    #[error("Max write retries exceeded: op={opcode}")]
    MaxWriteRetries { opcode: u8 },

    #[error("Max read retries exceeded: op={opcode}")]
    MaxReadRetries { opcode: u8 },

    /// 总线引擎已停止（消费线程退出后所有调用都会得到此错误）
    #[error("Bus engine stopped")]
    Closed,
}
