//! 遗留文本行协议后端
//!
//! 早期固件走串口文本协议：出站是短命令行（`m0s 500`、`xe`、`k`），
//! 入站是固件主动推送的状态行。[`LegacyLink`] 持有行写入端，
//! 后台读线程把推送行解析进共享状态，资源对象从状态里取读数，
//! 不产生一问一答的往返。
//!
//! 入站行格式：
//!
//! - `e<no> <pos> <speed>`: 编码器位置与速度
//! - `d <bits>`: 数字输入位图
//! - `c<no> <count>`: 计数器读数
//! - `i<key> ...`: 固件信息（处理器型号、各类资源上限）
//! - `x<e|d>`: 使能状态回显

use crate::ProcessorType;
use parking_lot::Mutex;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::{debug, trace, warn};

/// 行级传输抽象
pub trait LineTransport: Send + 'static {
    /// 写出一行（不含换行符，由实现补齐）
    fn write_line(&mut self, line: &str) -> io::Result<()>;
}

/// 把任意 `Write` 包装成行传输（串口、TCP 等）
pub struct IoLineTransport<W>(pub W);

impl<W: Write + Send + 'static> LineTransport for IoLineTransport<W> {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.0.write_all(line.as_bytes())?;
        self.0.write_all(b"\n")?;
        self.0.flush()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct EncoderFeedback {
    position: i32,
    speed: i32,
    updated: bool,
}

/// 固件上报的静态信息
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkInfo {
    pub processor: ProcessorType,
    pub max_analog_inputs: u8,
    pub max_digital_inputs: u8,
    pub max_motors: u8,
    pub max_analog_encoders: u8,
    pub max_quad_encoders: u8,
}

#[derive(Default)]
struct LinkState {
    encoders: Mutex<Vec<EncoderFeedback>>,
    digital_bits: AtomicU32,
    counters: Mutex<Vec<i32>>,
    info: Mutex<LinkInfo>,
}

/// 遗留串口链路
pub struct LegacyLink {
    writer: Mutex<Box<dyn LineTransport>>,
    state: Arc<LinkState>,
    is_running: Arc<AtomicBool>,
}

impl LegacyLink {
    pub fn new(writer: impl LineTransport) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
            state: Arc::new(LinkState::default()),
            is_running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// 启动后台读线程，读到 EOF 或链路关闭后退出
    pub fn spawn_reader(&self, reader: impl BufRead + Send + 'static) {
        let state = self.state.clone();
        let is_running = self.is_running.clone();

        std::thread::Builder::new()
            .name("rover-legacy-rx".into())
            .spawn(move || {
                for line in reader.lines() {
                    if !is_running.load(Ordering::Acquire) {
                        break;
                    }
                    match line {
                        Ok(line) => state.handle_line(&line),
                        Err(e) => {
                            warn!("Legacy read failed: {}", e);
                            break;
                        },
                    }
                }
                trace!("Legacy reader exited");
            })
            .expect("failed to spawn legacy reader thread");
    }

    pub fn write_line(&self, line: &str) -> io::Result<()> {
        self.writer.lock().write_line(line)
    }

    /// 解析一条入站行（读线程调用，测试也可直接注入）
    pub fn handle_line(&self, line: &str) {
        self.state.handle_line(line);
    }

    pub fn processor_type(&self) -> ProcessorType {
        self.state.info.lock().processor
    }

    pub fn info(&self) -> LinkInfo {
        *self.state.info.lock()
    }

    /// 编码器读数，尚无上报时返回 None
    pub(crate) fn encoder_feedback(&self, index: u8) -> Option<(i32, i32)> {
        let encoders = self.state.encoders.lock();
        let fb = encoders.get(index as usize)?;
        fb.updated.then_some((fb.position, fb.speed))
    }

    pub(crate) fn digital_bit(&self, index: u8) -> bool {
        self.state.digital_bits.load(Ordering::Acquire) >> index & 1 != 0
    }

    pub(crate) fn counter_count(&self, index: u8) -> i32 {
        self.state
            .counters
            .lock()
            .get(index as usize)
            .copied()
            .unwrap_or(0)
    }
}

impl Drop for LegacyLink {
    fn drop(&mut self) {
        self.is_running.store(false, Ordering::Release);
    }
}

fn parse_ints<const N: usize>(args: &str) -> Option<[i32; N]> {
    let mut out = [0i32; N];
    let mut parts = args.split_whitespace();
    for slot in &mut out {
        *slot = parts.next()?.parse().ok()?;
    }
    Some(out)
}

impl LinkState {
    fn handle_line(&self, line: &str) {
        let line = line.trim();
        let Some(kind) = line.chars().next() else {
            return;
        };
        // 首字符可能是多字节，按其实际宽度切分
        let args = &line[kind.len_utf8()..];

        match kind {
            'e' => self.encoder_line(args),
            'd' => self.digital_line(args),
            'c' => self.counter_line(args),
            'i' => self.info_line(args),
            'x' => {
                debug!("Firmware reports {}", if args.starts_with('e') { "enabled" } else { "disabled" });
            },
            '.' => {},
            other => {
                trace!("Unhandled legacy line: '{}' ({})", line, other);
            },
        }
    }

    fn encoder_line(&self, args: &str) {
        let Some([index, position, speed]) = parse_ints::<3>(args) else {
            warn!("Bad encoder line: '{}'", args);
            return;
        };
        if !(0..=255).contains(&index) {
            return;
        }

        let mut encoders = self.encoders.lock();
        let index = index as usize;
        if encoders.len() <= index {
            encoders.resize(index + 1, EncoderFeedback::default());
        }
        encoders[index] = EncoderFeedback {
            position,
            speed,
            updated: true,
        };
    }

    fn digital_line(&self, args: &str) {
        let Some([bits]) = parse_ints::<1>(args) else {
            warn!("Bad digital line: '{}'", args);
            return;
        };
        self.digital_bits.store(bits as u32, Ordering::Release);
    }

    fn counter_line(&self, args: &str) {
        let Some([index, count]) = parse_ints::<2>(args) else {
            warn!("Bad counter line: '{}'", args);
            return;
        };
        if !(0..=255).contains(&index) {
            return;
        }

        let mut counters = self.counters.lock();
        let index = index as usize;
        if counters.len() <= index {
            counters.resize(index + 1, 0);
        }
        counters[index] = count;
    }

    fn info_line(&self, args: &str) {
        let Some(key) = args.chars().next() else {
            return;
        };
        let rest = args[key.len_utf8()..].trim();
        let mut info = self.info.lock();

        match key {
            't' => {
                info.processor = match rest.chars().next() {
                    Some('a') => ProcessorType::Arduino,
                    Some('s') => ProcessorType::Stm32,
                    other => {
                        warn!("Invalid processor type line: {:?}", other);
                        ProcessorType::Unknown
                    },
                };
                debug!("Firmware processor: {:?}", info.processor);
            },
            'a' => info.max_analog_inputs = parse_max(rest),
            'd' => info.max_digital_inputs = parse_max(rest),
            'm' => info.max_motors = parse_max(rest),
            'e' => match rest.chars().next() {
                Some('a') => info.max_analog_encoders = parse_max(rest[1..].trim()),
                Some('q') => info.max_quad_encoders = parse_max(rest[1..].trim()),
                _ => {},
            },
            other => {
                trace!("Unhandled info line: '{}' ({})", args, other);
            },
        }
    }
}

fn parse_max(args: &str) -> u8 {
    parse_ints::<1>(args).map(|[v]| v as u8).unwrap_or(0)
}
