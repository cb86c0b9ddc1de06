//! # Rover CLI
//!
//! 机器人操作台命令行客户端，通过 TCP 连接机器人的操作台端口。
//!
//! ```bash
//! # 使能并保持连接（断开即失能）
//! rover-cli --host 10.0.0.2 enable --hold
//!
//! # 切换运行模式
//! rover-cli mode teleop
//!
//! # 以固定速度行驶 2 秒
//! rover-cli drive --x 0.0 --y 0.5 --duration 2
//!
//! # 观察机器人应答
//! rover-cli watch
//! ```

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use rover_robot::RobotConfig;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// 手柄上报周期
const REPORT_PERIOD: Duration = Duration::from_millis(50);

/// 保活发送周期
const KEEPALIVE_PERIOD: Duration = Duration::from_millis(500);

/// Rover CLI - 操作台客户端
#[derive(Parser, Debug)]
#[command(name = "rover-cli")]
#[command(about = "Operator console client for rover robots", long_about = None)]
#[command(version)]
struct Cli {
    /// 机器人主机名或 IP
    #[arg(long, global = true, default_value = "127.0.0.1")]
    host: String,

    /// 操作台端口
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum ModeArg {
    Auto,
    Teleop,
    Test,
}

impl ModeArg {
    fn command(self) -> &'static str {
        match self {
            Self::Auto => "A",
            Self::Teleop => "O",
            Self::Test => "T",
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 使能机器人
    Enable {
        /// 使能后保持连接并持续保活，Ctrl-C 退出（退出即失能）
        #[arg(long)]
        hold: bool,
    },

    /// 失能机器人
    Disable,

    /// 切换运行模式
    Mode {
        #[arg(value_enum)]
        mode: ModeArg,
    },

    /// 以固定摇杆值行驶一段时间，结束后失能
    Drive {
        /// 横轴，[-1, 1]
        #[arg(long, default_value_t = 0.0)]
        x: f64,

        /// 纵轴，[-1, 1]
        #[arg(long, default_value_t = 0.0)]
        y: f64,

        /// 持续时间，秒
        #[arg(long, default_value_t = 2.0)]
        duration: f64,
    },

    /// 只维持保活，不改变机器人状态，Ctrl-C 退出
    Keepalive,

    /// 打印机器人发来的每一行应答，Ctrl-C 退出
    Watch,
}

/// 操作台连接
struct Console {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Console {
    fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port))
            .with_context(|| format!("failed to connect to {}:{}", host, port))?;
        stream.set_read_timeout(Some(Duration::from_millis(200)))?;
        let writer = stream.try_clone()?;
        let mut console = Self {
            reader: BufReader::new(stream),
            writer,
        };

        // 连接应答分两行：先连接确认，再当前运行模式
        let ack = console.read_line_blocking()?;
        if ack != "!C" {
            warn!("Unexpected connect ack: '{}'", ack);
        }
        let mode = console.read_line_blocking()?;
        info!("Connected, robot mode: {}", describe_mode(&mode));
        Ok(console)
    }

    fn send(&mut self, line: &str) -> Result<()> {
        debug!("-> {}", line);
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    /// 阻塞读一行，容忍读超时
    fn read_line_blocking(&mut self) -> Result<String> {
        let mut line = String::new();
        loop {
            match self.reader.read_line(&mut line) {
                Ok(0) => bail!("robot closed the connection"),
                Ok(_) => return Ok(line.trim().to_string()),
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    continue;
                },
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// 非阻塞尝试读一行
    fn try_read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => bail!("robot closed the connection"),
            Ok(_) => Ok(Some(line.trim().to_string())),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                Ok(None)
            },
            Err(e) => Err(e.into()),
        }
    }

    fn expect_ack(&mut self, expected: &str) -> Result<()> {
        let ack = self.read_line_blocking()?;
        if ack != expected {
            warn!("Unexpected ack: '{}' (wanted '{}')", ack, expected);
        }
        Ok(())
    }
}

fn describe_mode(ack: &str) -> &'static str {
    match ack {
        "!A" => "autonomous",
        "!O" => "operator control",
        "!T" => "test",
        _ => "unknown",
    }
}

/// 注册 Ctrl-C 处理，返回运行标志
fn run_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(true));
    let handler_flag = flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(false, Ordering::Release);
    })
    .context("failed to install Ctrl-C handler")?;
    Ok(flag)
}

fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rover_cli=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let port = cli.port.unwrap_or(RobotConfig::default().console_port);
    let mut console = Console::connect(&cli.host, port)?;

    match cli.command {
        Commands::Enable { hold } => {
            console.send("E")?;
            console.expect_ack("!E")?;
            info!("Robot enabled");

            if hold {
                info!("Holding connection, Ctrl-C to disable and exit");
                let running = run_flag()?;
                while running.load(Ordering::Acquire) {
                    console.send("k")?;
                    std::thread::sleep(KEEPALIVE_PERIOD);
                }
                console.send("D")?;
                console.expect_ack("!D")?;
                info!("Robot disabled");
            }
            Ok(())
        },

        Commands::Disable => {
            console.send("D")?;
            console.expect_ack("!D")?;
            info!("Robot disabled");
            Ok(())
        },

        Commands::Mode { mode } => {
            console.send(mode.command())?;
            console.expect_ack(&format!("!{}", mode.command()))?;
            info!("Robot mode set to {:?}", mode);
            Ok(())
        },

        Commands::Drive { x, y, duration } => {
            console.send("E")?;
            console.expect_ack("!E")?;

            let x = (x.clamp(-1.0, 1.0) * 1000.0) as i32;
            let y = (y.clamp(-1.0, 1.0) * 1000.0) as i32;
            let reports = (duration.max(0.0) / REPORT_PERIOD.as_secs_f64()) as u64;
            info!("Driving for {:.1}s", duration);

            let running = run_flag()?;
            for _ in 0..reports {
                if !running.load(Ordering::Acquire) {
                    break;
                }
                console.send(&format!("j0 {} {} 0 0 0 -1 0", x, y))?;
                std::thread::sleep(REPORT_PERIOD);
            }

            console.send("j0 0 0 0 0 0 -1 0")?;
            console.send("D")?;
            console.expect_ack("!D")?;
            info!("Done, robot disabled");
            Ok(())
        },

        Commands::Keepalive => {
            info!("Sending keep-alives, Ctrl-C to exit");
            let running = run_flag()?;
            while running.load(Ordering::Acquire) {
                console.send("k")?;
                std::thread::sleep(KEEPALIVE_PERIOD);
            }
            Ok(())
        },

        Commands::Watch => {
            info!("Watching robot acks, Ctrl-C to exit");
            let running = run_flag()?;
            while running.load(Ordering::Acquire) {
                // 读超时当作空闲，顺便发保活防止看门狗误判
                if let Some(line) = console.try_read_line()? {
                    println!("{}", line);
                }
                console.send("k")?;
            }
            Ok(())
        },
    }
}
