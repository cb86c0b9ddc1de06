//! 操作台 TCP 服务
//!
//! 行协议，一次只接待一个连接：
//!
//! - `E` / `D`: 使能 / 失能
//! - `A` / `O` / `T`: 切换运行模式
//! - `j<g> <x> <y> <rx> <ry> <throttle> <pov> <buttons>`: 手柄上报，
//!   轴值 ×1000
//! - `k`: 纯保活
//!
//! 机器人到操作台方向是服务端推送：连接建立时先推 `!C` 再推当前
//! 模式字母（`!A`/`!O`/`!T`），之后每次状态变化都会推对应的
//! `!E`/`!D`/模式行，无论变化来自操作台命令、程序调用还是保活
//! 看门狗。命令间隔超过阈值时推送 `Lag:<毫秒>`。
//!
//! 任何命令都会刷新保活时限，时限由调度线程监视。连接断开视同
//! 操作手离场，机器人立即失能，然后回到接受下一个连接。

use crate::joystick::JoystickState;
use crate::robot::{RobotMode, Shared};
use std::io::{BufRead, BufReader};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// 空闲时轮询停止标志的间隔
const ACCEPT_POLL: Duration = Duration::from_millis(20);

/// 读超时，决定停止标志的响应速度
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// 命令间隔超过此值向操作台推送延迟告警
const LAG_WARNING: Duration = Duration::from_millis(250);

pub(crate) fn serve(listener: TcpListener, shared: Arc<Shared>) {
    if let Err(e) = listener.set_nonblocking(true) {
        error!("Console listener setup failed: {}", e);
        return;
    }

    while shared.is_running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("Operator console connected from {}", peer);
                if let Err(e) = serve_connection(stream, &shared) {
                    warn!("Console connection failed: {}", e);
                }
                shared.console_connected.store(false, Ordering::Release);
                *shared.console_tx.lock() = None;

                // 操作手离场，立即失能
                debug!("Operator console disconnected");
                if let Err(e) = shared.disable() {
                    error!("Disable on disconnect failed: {}", e);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            },
            Err(e) => {
                error!("Console accept failed: {}", e);
                std::thread::sleep(ACCEPT_POLL);
            },
        }
    }
}

fn serve_connection(stream: TcpStream, shared: &Shared) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    *shared.console_tx.lock() = Some(stream.try_clone()?);
    let mut reader = BufReader::new(stream);

    // 连接应答分两行：先连接确认，再当前模式
    shared.push("!C");
    shared.push(&format!("!{}", shared.mode().letter()));
    *shared.last_console.lock() = Instant::now();
    shared.console_connected.store(true, Ordering::Release);

    let mut last_command = Instant::now();
    let mut line = String::new();
    loop {
        if !shared.is_running.load(Ordering::Acquire) {
            return Ok(());
        }

        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => return Ok(()), // EOF
            Ok(_) => {
                let gap = last_command.elapsed();
                if gap > LAG_WARNING {
                    warn!("Console lagging: {} ms since last command", gap.as_millis());
                    shared.push(&format!("Lag:{}", gap.as_millis()));
                }
                last_command = Instant::now();

                handle_command(line.trim(), shared);
            },
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            },
            Err(e) => return Err(e),
        }
    }
}

/// 状态类命令的应答由 [`Shared`] 的生命周期方法统一推送
fn handle_command(line: &str, shared: &Shared) {
    // 任何命令都算保活
    *shared.last_console.lock() = Instant::now();

    let Some(kind) = line.chars().next() else {
        return;
    };
    match kind {
        'E' => {
            if let Err(e) = shared.enable() {
                error!("Enable from console failed: {}", e);
            }
        },
        'D' => {
            if let Err(e) = shared.disable() {
                error!("Disable from console failed: {}", e);
            }
        },
        'A' => shared.set_mode(RobotMode::Autonomous),
        'O' => shared.set_mode(RobotMode::OperatorControl),
        'T' => shared.set_mode(RobotMode::Test),
        'j' => match JoystickState::parse(&line[1..]) {
            Some(state) => shared.joystick.store(state),
            None => warn!("Bad joystick report: '{}'", line),
        },
        'k' => {},
        _ => {
            trace!("Unknown console command: '{}'", line);
        },
    }
}
