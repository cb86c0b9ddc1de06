//! 总线引擎：命令队列与唯一消费线程
//!
//! 消费线程独占 [`Transport`]，逐条执行命令的
//! 写入 → 读响应 → 校验 → 重试 序列，并维护每个地址的序列号。

use crate::{LinkError, Transport};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use rover_protocol::{CommandFrame, Response, ResponseStatus, parse_response};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// 总线引擎配置
///
/// # Example
///
/// ```
/// use rover_bus::BusConfig;
///
/// // 默认配置（队列容量 10，写重试 10 次，读重试 20 次）
/// let config = BusConfig::default();
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// 命令队列容量，队列满时投递方阻塞
    pub queue_capacity: usize,
    /// 单条命令的最大写入尝试次数
    pub max_write_retries: u32,
    /// 单次写入后对 `ACK_RETRY` 的最大重读次数
    pub max_read_retries: u32,
    /// 写入失败后的退避时间
    pub write_backoff: Duration,
    /// `ACK_RETRY` 后的重读间隔
    pub read_backoff: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10,
            max_write_retries: 10,
            max_read_retries: 20,
            write_backoff: Duration::from_millis(5),
            read_backoff: Duration::from_millis(5),
        }
    }
}

/// 响应头（3 字节）加校验和
const RESPONSE_OVERHEAD: usize = 4;

/// 消费线程空闲时检查停止标志的间隔
const IDLE_POLL: Duration = Duration::from_millis(50);

struct Command {
    addr: u8,
    frame: CommandFrame,
    response_size: usize,
    reply: Option<Sender<Result<Response, LinkError>>>,
}

/// 总线句柄
///
/// 通过 [`Bus::spawn`] 创建，内部只是队列发送端和地址表，
/// 可以放进 `Arc` 在资源对象之间共享。Drop 时停止消费线程并等待其退出。
pub struct Bus {
    cmd_tx: Sender<Command>,
    addrs: Arc<Mutex<Vec<u8>>>,
    is_running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Bus {
    /// 启动总线引擎，消费线程取得传输端所有权
    pub fn spawn<T: Transport>(transport: T, config: BusConfig) -> Self {
        let (cmd_tx, cmd_rx) = bounded(config.queue_capacity);
        let is_running = Arc::new(AtomicBool::new(true));

        let flag = is_running.clone();
        let handle = std::thread::Builder::new()
            .name("rover-bus".into())
            .spawn(move || consumer_loop(transport, cmd_rx, config, flag))
            .expect("failed to spawn bus thread");

        Self {
            cmd_tx,
            addrs: Arc::new(Mutex::new(Vec::new())),
            is_running,
            handle: Some(handle),
        }
    }

    /// 投递 fire-and-forget 命令
    ///
    /// 排队成功即返回；链路层故障由消费线程记录日志，不回传给调用方。
    pub fn send_command(&self, addr: u8, frame: CommandFrame) -> Result<(), LinkError> {
        self.record_addr(addr)?;
        self.cmd_tx
            .send(Command {
                addr,
                frame,
                response_size: 0,
                reply: None,
            })
            .map_err(|_| LinkError::Closed)
    }

    /// 向所有已知地址广播同一条 fire-and-forget 命令
    pub fn send_to_all(&self, frame: CommandFrame) -> Result<(), LinkError> {
        let addrs: Vec<u8> = self.addrs.lock().clone();
        for addr in addrs {
            self.cmd_tx
                .send(Command {
                    addr,
                    frame: frame.clone(),
                    response_size: 0,
                    reply: None,
                })
                .map_err(|_| LinkError::Closed)?;
        }
        Ok(())
    }

    /// 投递请求命令并阻塞等待响应载荷
    pub fn send_request(
        &self,
        addr: u8,
        frame: CommandFrame,
        response_size: usize,
    ) -> Result<Response, LinkError> {
        self.record_addr(addr)?;

        // 一次性回传通道，消费线程完成后投递唯一一条结果
        let (reply_tx, reply_rx) = bounded(1);
        self.cmd_tx
            .send(Command {
                addr,
                frame,
                response_size,
                reply: Some(reply_tx),
            })
            .map_err(|_| LinkError::Closed)?;

        reply_rx.recv().map_err(|_| LinkError::Closed)?
    }

    /// 请求单字节响应
    pub fn request_u8(&self, addr: u8, frame: CommandFrame) -> Result<u8, LinkError> {
        Ok(self.send_request(addr, frame, 1)?.reader().u8()?)
    }

    /// 请求 16 位响应
    pub fn request_i16(&self, addr: u8, frame: CommandFrame) -> Result<i16, LinkError> {
        Ok(self.send_request(addr, frame, 2)?.reader().i16()?)
    }

    /// 请求 32 位响应
    pub fn request_i32(&self, addr: u8, frame: CommandFrame) -> Result<i32, LinkError> {
        Ok(self.send_request(addr, frame, 4)?.reader().i32()?)
    }

    /// 请求 64 位响应
    pub fn request_u64(&self, addr: u8, frame: CommandFrame) -> Result<u64, LinkError> {
        Ok(self.send_request(addr, frame, 8)?.reader().u64()?)
    }

    /// 目前已经通信过的地址列表（按首次出现顺序）
    pub fn seen_addrs(&self) -> Vec<u8> {
        self.addrs.lock().clone()
    }

    fn record_addr(&self, addr: u8) -> Result<(), LinkError> {
        if addr == 0 {
            return Err(LinkError::ZeroAddress);
        }
        let mut addrs = self.addrs.lock();
        if !addrs.contains(&addr) {
            addrs.push(addr);
        }
        Ok(())
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        self.is_running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// 消费线程主循环
fn consumer_loop<T: Transport>(
    mut transport: T,
    cmd_rx: Receiver<Command>,
    config: BusConfig,
    is_running: Arc<AtomicBool>,
) {
    // 每个地址的下一个序列号，仅在帧被确认后递增
    let mut seqs: HashMap<u8, u8> = HashMap::new();

    loop {
        if !is_running.load(Ordering::Acquire) {
            trace!("Bus thread: is_running flag is false, exiting");
            break;
        }

        let command = match cmd_rx.recv_timeout(IDLE_POLL) {
            Ok(command) => command,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                trace!("Bus thread: command channel disconnected");
                break;
            },
        };

        let seq = seqs.entry(command.addr).or_insert(0);
        let opcode = command.frame.opcode();
        let result = execute(&mut transport, &command, *seq, &config);

        if result.is_ok() {
            *seq = seq.wrapping_add(1);
        }

        match command.reply {
            Some(reply) => {
                // 等待方可能已经放弃（超时或线程退出），投递失败无需处理
                let _ = reply.send(result);
            },
            None => {
                if let Err(e) = result {
                    error!("Bus command failed: op={}, error={}", opcode, e);
                }
            },
        }
    }

    trace!("Bus thread: loop exited");
}

/// 执行单条命令的完整 写入 → 读响应 → 重试 序列
///
/// 软失败（IO 错误、帧损坏、序列号不符）消耗一次写入重试；
/// `ACK_RETRY` 只消耗内层读重试；`NAK_OVERFLOW` 立即放弃。
/// 所有重试共享同一个序列号。
fn execute<T: Transport>(
    transport: &mut T,
    command: &Command,
    seq: u8,
    config: &BusConfig,
) -> Result<Response, LinkError> {
    let opcode = command.frame.opcode();
    let bytes = command.frame.encode(seq)?;
    let mut buf = vec![0u8; command.response_size + RESPONSE_OVERHEAD];

    for attempt in 0..config.max_write_retries {
        if attempt > 0 {
            debug!(
                "Write retry {}/{}: addr={}, op={}",
                attempt, config.max_write_retries, command.addr, opcode
            );
            spin_sleep::sleep(config.write_backoff);
        }

        if let Err(e) = transport.write(command.addr, &bytes) {
            warn!("Bus write failed: addr={}, op={}, error={}", command.addr, opcode, e);
            continue;
        }

        match read_response(transport, command, seq, &mut buf, config)? {
            ReadOutcome::Done(response) => return Ok(response),
            ReadOutcome::Soft => continue,
        }
    }

    Err(LinkError::MaxWriteRetries { opcode })
}

enum ReadOutcome {
    Done(Response),
    /// 响应损坏或读取失败，由外层重新写入
    Soft,
}

fn read_response<T: Transport>(
    transport: &mut T,
    command: &Command,
    seq: u8,
    buf: &mut [u8],
    config: &BusConfig,
) -> Result<ReadOutcome, LinkError> {
    let opcode = command.frame.opcode();

    for retry in 0..config.max_read_retries {
        if retry > 0 {
            spin_sleep::sleep(config.read_backoff);
        }

        if let Err(e) = transport.read_exact(command.addr, buf) {
            warn!("Bus read failed: addr={}, op={}, error={}", command.addr, opcode, e);
            return Ok(ReadOutcome::Soft);
        }

        match parse_response(buf, seq) {
            Ok(ResponseStatus::Ready(response)) => return Ok(ReadOutcome::Done(response)),
            Ok(ResponseStatus::Busy) => {
                trace!("Coprocessor busy: addr={}, op={}, retry={}", command.addr, opcode, retry);
            },
            Ok(ResponseStatus::Rejected) => {
                warn!("Coprocessor queue overflow: addr={}, op={}", command.addr, opcode);
                return Err(LinkError::Rejected { opcode });
            },
            Err(e) => {
                warn!("Invalid response: addr={}, op={}, error={}", command.addr, opcode, e);
                return Ok(ReadOutcome::Soft);
            },
        }
    }

    Err(LinkError::MaxReadRetries { opcode })
}
