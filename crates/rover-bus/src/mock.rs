//! 进程内协处理器仿真
//!
//! [`SimCoprocessor`] 实现 [`Transport`]，在内存里扮演固件：
//! 校验命令帧、按操作码生成响应载荷，并可注入忙碌、溢出、
//! 帧损坏和写入失败等故障，供总线引擎和上层资源的测试使用。

use crate::Transport;
use parking_lot::Mutex;
use rover_protocol::{ACK, ACK_RETRY, NAK_OVERFLOW, RESPONSE_HEADER_LEN, checksum};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// 一次成功写入的记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub addr: u8,
    pub seq: u8,
    pub opcode: u8,
    pub payload: Vec<u8>,
}

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

/// 仿真协处理器传输端
///
/// 默认对所有命令回 `ACK`，请求命令的载荷由 [`respond`](Self::respond)
/// 注册的闭包生成，未注册的操作码回空载荷。
pub struct SimCoprocessor {
    responders: HashMap<u8, Responder>,
    log: Arc<Mutex<Vec<WriteRecord>>>,
    write_attempts: Arc<AtomicU32>,
    read_count: Arc<AtomicU32>,
    pending: Vec<u8>,
    busy_per_command: u32,
    busy_left: u32,
    reject: bool,
    scramble_budget: u32,
    write_fail_budget: u32,
}

impl SimCoprocessor {
    pub fn new() -> Self {
        Self {
            responders: HashMap::new(),
            log: Arc::new(Mutex::new(Vec::new())),
            write_attempts: Arc::new(AtomicU32::new(0)),
            read_count: Arc::new(AtomicU32::new(0)),
            pending: Vec::new(),
            busy_per_command: 0,
            busy_left: 0,
            reject: false,
            scramble_budget: 0,
            write_fail_budget: 0,
        }
    }

    /// 注册操作码的响应载荷生成器，入参是命令载荷
    pub fn respond(&mut self, opcode: u8, f: impl FnMut(&[u8]) -> Vec<u8> + Send + 'static) {
        self.responders.insert(opcode, Box::new(f));
    }

    /// 每条命令先回 `n` 次 `ACK_RETRY` 再给出真实响应
    pub fn busy_for(&mut self, n: u32) {
        self.busy_per_command = n;
    }

    /// 对所有读回 `NAK_OVERFLOW`
    pub fn reject_all(&mut self) {
        self.reject = true;
    }

    /// 前 `n` 次读取的响应帧序列号被破坏
    pub fn scramble_seq(&mut self, n: u32) {
        self.scramble_budget = n;
    }

    /// 前 `n` 次写入返回 IO 错误
    pub fn fail_writes(&mut self, n: u32) {
        self.write_fail_budget = n;
    }

    /// 成功写入的帧记录（在传输端移交给总线前克隆句柄）
    pub fn log(&self) -> Arc<Mutex<Vec<WriteRecord>>> {
        self.log.clone()
    }

    /// 写入尝试总数，含失败的
    pub fn write_attempts(&self) -> Arc<AtomicU32> {
        self.write_attempts.clone()
    }

    /// 读取尝试总数
    pub fn read_count(&self) -> Arc<AtomicU32> {
        self.read_count.clone()
    }
}

impl Default for SimCoprocessor {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SimCoprocessor {
    fn write(&mut self, addr: u8, data: &[u8]) -> io::Result<()> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);

        if self.write_fail_budget > 0 {
            self.write_fail_budget -= 1;
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "simulated write failure",
            ));
        }

        // 固件的入口校验：长度字节和校验和必须一致
        let len = data[0] as usize;
        if len != data.len() || len < 4 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad frame length"));
        }
        if checksum(&data[..len - 1]) != data[len - 1] {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad frame checksum"));
        }

        let seq = data[1];
        let opcode = data[2];
        let payload = &data[3..len - 1];

        self.log.lock().push(WriteRecord {
            addr,
            seq,
            opcode,
            payload: payload.to_vec(),
        });

        let body = match self.responders.get_mut(&opcode) {
            Some(f) => f(payload),
            None => Vec::new(),
        };

        // 响应帧：载荷为空时长度为 3 且不带校验和
        let mut response = vec![ACK, RESPONSE_HEADER_LEN as u8, seq];
        if !body.is_empty() {
            response[1] = (RESPONSE_HEADER_LEN + body.len() + 1) as u8;
            response.extend_from_slice(&body);
            response.push(checksum(&response));
        }
        self.pending = response;
        self.busy_left = self.busy_per_command;
        Ok(())
    }

    fn read_exact(&mut self, _addr: u8, buf: &mut [u8]) -> io::Result<()> {
        self.read_count.fetch_add(1, Ordering::SeqCst);
        buf.fill(0);

        if self.reject {
            buf[0] = NAK_OVERFLOW;
            return Ok(());
        }

        if self.busy_left > 0 {
            self.busy_left = self.busy_left.saturating_sub(1);
            buf[0] = ACK_RETRY;
            return Ok(());
        }

        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);

        if self.scramble_budget > 0 {
            self.scramble_budget -= 1;
            buf[2] ^= 0x80;
        }

        Ok(())
    }
}
