//! 机器人生命周期与固定周期调度器
//!
//! [`Robot::spawn`] 启动两个后台线程：
//!
//! - `rover-scheduler`: 以固定周期执行注册的 [`Periodic`] 资源，
//!   定期向协处理器发送保活，并监视操作台的保活超时
//! - `rover-console`: 操作台 TCP 服务，见 [`crate::console`]
//!
//! 使能状态的变更是幂等的：只有真正发生转换时才向协处理器广播，
//! 重复调用不产生总线流量。任何 [`Periodic::update`] 返回错误
//! 都会使机器人立即失能，而不是让调度线程崩溃。

use crate::console;
use crate::joystick::JoystickState;
use crate::{RobotConfig, RobotError};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rover_hal::{HardwareContext, Periodic};
use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, error, warn};

/// 运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RobotMode {
    /// 自主程序控制
    #[default]
    Autonomous,
    /// 操作手遥控
    OperatorControl,
    /// 检修测试
    Test,
}

impl RobotMode {
    pub(crate) fn letter(self) -> char {
        match self {
            Self::Autonomous => 'A',
            Self::OperatorControl => 'O',
            Self::Test => 'T',
        }
    }
}

/// 调度线程与操作台线程共享的状态
pub(crate) struct Shared {
    pub(crate) ctx: Arc<HardwareContext>,
    pub(crate) config: RobotConfig,
    mode: Mutex<RobotMode>,
    enabled: Mutex<bool>,
    periodics: Mutex<Vec<Arc<dyn Periodic>>>,
    pub(crate) joystick: ArcSwap<JoystickState>,
    /// 最近一次收到操作台命令的时刻
    pub(crate) last_console: Mutex<Instant>,
    pub(crate) console_connected: AtomicBool,
    /// 当前连接的写入端，状态变化和延迟告警经此推送给操作台
    pub(crate) console_tx: Mutex<Option<TcpStream>>,
    pub(crate) is_running: AtomicBool,
}

impl Shared {
    /// 使能，幂等；无论是否发生转换都向操作台回报当前状态
    pub(crate) fn enable(&self) -> Result<(), RobotError> {
        {
            let mut enabled = self.enabled.lock();
            if !*enabled {
                self.ctx.set_enabled(true)?;
                *enabled = true;
                debug!("Robot enabled");
            }
        }
        self.push("!E");
        Ok(())
    }

    /// 失能，幂等；看门狗或程序触发时操作台同样会收到 `!D`
    pub(crate) fn disable(&self) -> Result<(), RobotError> {
        {
            let mut enabled = self.enabled.lock();
            if *enabled {
                self.ctx.set_enabled(false)?;
                *enabled = false;
                debug!("Robot disabled");
            }
        }
        self.push("!D");
        Ok(())
    }

    pub(crate) fn is_enabled(&self) -> bool {
        *self.enabled.lock()
    }

    pub(crate) fn mode(&self) -> RobotMode {
        *self.mode.lock()
    }

    pub(crate) fn set_mode(&self, mode: RobotMode) {
        {
            let mut current = self.mode.lock();
            if *current != mode {
                debug!("Robot mode: {:?} -> {:?}", *current, mode);
                *current = mode;
            }
        }
        self.push(&format!("!{}", mode.letter()));
    }

    /// 向当前操作台连接推送一行；没有连接时静默丢弃
    pub(crate) fn push(&self, line: &str) {
        let mut tx = self.console_tx.lock();
        if let Some(stream) = tx.as_mut()
            && let Err(e) = stream.write_all(format!("{}\n", line).as_bytes())
        {
            warn!("Console push failed: {}", e);
            *tx = None;
        }
    }
}

/// 机器人控制器
///
/// Drop 时停止调度并等待后台线程退出，机器人保持失能状态。
pub struct Robot {
    shared: Arc<Shared>,
    console_addr: SocketAddr,
    scheduler: Option<JoinHandle<()>>,
    console: Option<JoinHandle<()>>,
}

impl Robot {
    /// 启动调度器和操作台服务
    pub fn spawn(ctx: Arc<HardwareContext>, config: RobotConfig) -> Result<Self, RobotError> {
        let listener = TcpListener::bind(("0.0.0.0", config.console_port))?;
        let console_addr = listener.local_addr()?;
        debug!("Operator console listening on {}", console_addr);

        let shared = Arc::new(Shared {
            ctx,
            config,
            mode: Mutex::new(RobotMode::default()),
            enabled: Mutex::new(false),
            periodics: Mutex::new(Vec::new()),
            joystick: ArcSwap::from_pointee(JoystickState::default()),
            last_console: Mutex::new(Instant::now()),
            console_connected: AtomicBool::new(false),
            console_tx: Mutex::new(None),
            is_running: AtomicBool::new(true),
        });

        let scheduler = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("rover-scheduler".into())
                .spawn(move || scheduler_loop(shared))
                .expect("failed to spawn scheduler thread")
        };
        let console = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("rover-console".into())
                .spawn(move || console::serve(listener, shared))
                .expect("failed to spawn console thread")
        };

        Ok(Self {
            shared,
            console_addr,
            scheduler: Some(scheduler),
            console: Some(console),
        })
    }

    /// 操作台实际监听地址（端口 0 时由系统分配）
    pub fn console_addr(&self) -> SocketAddr {
        self.console_addr
    }

    /// 注册需要周期调度的资源
    pub fn register(&self, periodic: Arc<dyn Periodic>) {
        self.shared.periodics.lock().push(periodic);
    }

    pub fn enable(&self) -> Result<(), RobotError> {
        self.shared.enable()
    }

    pub fn disable(&self) -> Result<(), RobotError> {
        self.shared.disable()
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.is_enabled()
    }

    pub fn mode(&self) -> RobotMode {
        self.shared.mode()
    }

    pub fn set_mode(&self, mode: RobotMode) {
        self.shared.set_mode(mode)
    }

    /// 最近一次完整的手柄快照
    pub fn joystick(&self) -> Arc<JoystickState> {
        self.shared.joystick.load_full()
    }
}

impl Drop for Robot {
    fn drop(&mut self) {
        self.shared.is_running.store(false, Ordering::Release);
        if let Some(handle) = self.scheduler.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.console.take() {
            let _ = handle.join();
        }
    }
}

fn scheduler_loop(shared: Arc<Shared>) {
    let period = shared.config.update_period();
    let keepalive_ticks = shared.config.keepalive_ticks();
    let console_timeout = shared.config.console_timeout();
    let mut tick: u64 = 0;

    while shared.is_running.load(Ordering::Acquire) {
        spin_sleep::sleep(period);
        tick += 1;

        if tick % keepalive_ticks == 0
            && let Err(e) = shared.ctx.keep_alive()
        {
            error!("Coprocessor keep-alive failed: {}", e);
        }

        // 操作台保活超时监视，只在有连接时生效
        if shared.console_connected.load(Ordering::Acquire)
            && shared.is_enabled()
            && shared.last_console.lock().elapsed() > console_timeout
        {
            warn!("Operator console timed out, disabling");
            if let Err(e) = shared.disable() {
                error!("Disable failed: {}", e);
            }
        }

        // 克隆句柄列表，避免更新期间持有注册锁
        let periodics: Vec<Arc<dyn Periodic>> = shared.periodics.lock().clone();
        for periodic in &periodics {
            if let Err(e) = periodic.update() {
                error!("Periodic update failed, disabling: {}", e);
                if let Err(e) = shared.disable() {
                    error!("Disable failed: {}", e);
                }
                break;
            }
        }
    }

    // 退出前确保机器人失能
    if let Err(e) = shared.disable() {
        error!("Disable on shutdown failed: {}", e);
    }
}
