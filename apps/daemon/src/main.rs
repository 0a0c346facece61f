//! fcp-server 主入口
//!
//! 每张 FCP 声卡一个进程：打开 hwdep 设备、检查能力、加载 devmap，
//! 然后在 `fcp-{card}.sock` 上服务 fcp-tool 的固件和配置请求。

mod config;
mod connection;
mod control_sync;
mod error;
mod handlers;
mod logging;
mod server;
mod singleton;
mod status;

use clap::Parser;
use config::{ServerConfig, default_socket_dir};
use control_sync::LoggingControlSync;
use error::ServerError;
use fcp_driver::card::{PROC_ASOUND, read_usb_id};
use fcp_driver::{EspDfuConfig, FcpDevice, Transport, TransportError, load_devmap};
use fcp_protocol::Category;
use handlers::ServerContext;
use server::Server;
use singleton::SingletonLock;
use std::path::{Path, PathBuf};
use std::process;
use tracing::{debug, error, info, warn};

/// FCP 控制服务端
///
/// 为一张 Focusrite FCP 声卡提供控制 socket（固件更新、配置擦除、重启）
#[derive(Parser, Debug)]
#[command(name = "fcp-server")]
#[command(version, about = "FCP Server - per-card control daemon for Focusrite interfaces", long_about = None)]
struct Args {
    /// ALSA 声卡号
    card: u32,

    /// devmap JSON 文件
    ///
    /// 默认: 当前目录下的 fcp-devmap-{pid}.json，不存在时从设备读取
    #[arg(long)]
    devmap: Option<PathBuf>,

    /// socket 目录
    ///
    /// 默认: $RUNTIME_DIRECTORY，其次 $XDG_RUNTIME_DIR，最后 /tmp
    #[arg(long)]
    socket_dir: Option<PathBuf>,

    /// 锁文件路径
    ///
    /// 默认: socket 目录下的 fcp-server-{card}.lock
    #[arg(long)]
    lock_file: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            card: self.card,
            socket_dir: self.socket_dir.unwrap_or_else(default_socket_dir),
            devmap_path: self.devmap,
            lock_file: self.lock_file,
        }
    }
}

/// 检查必需的能力并记录可选能力
fn check_capabilities<T: Transport>(device: &mut FcpDevice<T>) -> Result<(), ServerError> {
    for (category, name) in [(Category::Init, "INIT"), (Category::Data, "DATA")] {
        if !device.cap_read(category)? {
            return Err(ServerError::MissingCapability(name));
        }
    }
    for (category, name) in [
        (Category::Meter, "METER"),
        (Category::Mix, "MIX"),
        (Category::Mux, "MUX"),
        (Category::Flash, "FLASH"),
        (Category::Sync, "SYNC"),
        (Category::EspDfu, "ESP_DFU"),
    ] {
        let supported = device.cap_read(category)?;
        debug!("Capability {}: {}", name, if supported { "yes" } else { "no" });
    }
    Ok(())
}

/// 加载 ESP DFU 配置；失败时只影响 ESP 更新请求
fn load_esp_config<T: Transport>(
    ctx: &mut ServerContext<T>,
    devmap_path: &Path,
) -> Option<EspDfuConfig> {
    let devmap = match load_devmap(&mut ctx.device, Some(devmap_path), ctx.usb_id.pid) {
        Ok(devmap) => devmap,
        Err(e) => {
            warn!("No devmap available, ESP firmware updates disabled: {}", e);
            return None;
        },
    };
    match EspDfuConfig::from_devmap(&devmap) {
        Ok(config) => Some(config),
        Err(e) => {
            warn!("Devmap has no ESP DFU configuration: {}", e);
            None
        },
    }
}

/// 打开声卡的 hwdep 设备，返回传输和固件构建号
#[cfg(target_os = "linux")]
fn open_transport(card: u32) -> Result<(Box<dyn Transport>, u32), ServerError> {
    let transport = fcp_driver::HwdepTransport::open(card)?;
    let firmware_build = transport.firmware_build();
    Ok((Box::new(transport), firmware_build))
}

#[cfg(not(target_os = "linux"))]
fn open_transport(_card: u32) -> Result<(Box<dyn Transport>, u32), ServerError> {
    Err(ServerError::Io(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "fcp-server requires the Linux ALSA hwdep interface",
    )))
}

fn start(config: &ServerConfig) -> Result<Server<Box<dyn Transport>>, ServerError> {
    let (transport, firmware_build) = open_transport(config.card)?;
    let mut device = FcpDevice::new(transport);
    check_capabilities(&mut device)?;

    let usb_id = read_usb_id(Path::new(PROC_ASOUND), config.card).map_err(|source| {
        ServerError::UsbId {
            card: config.card,
            source,
        }
    })?;
    info!(
        "Card {}: USB ID {}, firmware build {}",
        config.card, usb_id, firmware_build
    );

    let mut ctx = ServerContext::new(device, usb_id, firmware_build);
    ctx.esp_config = load_esp_config(&mut ctx, &config.devmap_path(usb_id.pid));

    let server = Server::bind(ctx, config, Box::new(LoggingControlSync::default()))?;
    server.publish_status()?;
    Ok(server)
}

fn main() {
    let config = Args::parse().into_config();
    logging::init();

    if let Err(e) = std::fs::create_dir_all(&config.socket_dir) {
        eprintln!(
            "Cannot create socket directory {}: {}",
            config.socket_dir.display(),
            e
        );
        process::exit(1);
    }

    // 1. 单例锁
    let lock_path = config.lock_path();
    let _lock = match SingletonLock::try_lock(&lock_path) {
        Ok(lock) => lock,
        Err(e) => {
            eprintln!("Failed to acquire singleton lock: {}", e);
            eprintln!("Another fcp-server may be running for card {}.", config.card);
            eprintln!("Lock file: {}", lock_path.display());
            process::exit(1);
        },
    };

    // 2. 设备初始化
    let mut server = match start(&config) {
        Ok(server) => server,
        Err(ServerError::Device(
            e @ (TransportError::NotFcpDevice(_) | TransportError::LegacyProtocol { .. }),
        )) => {
            // 不是本服务端管理的设备
            info!("{}", e);
            process::exit(0);
        },
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        },
    };

    // 3. 信号处理（Ctrl+C / SIGTERM）
    let socket_path = config.socket_path();
    let status_path = config.status_path();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\nReceived interrupt signal. Shutting down...");
        status::remove(&status_path);
        status::remove(&socket_path);
        process::exit(0);
    }) {
        error!("Failed to set signal handler: {}", e);
        process::exit(1);
    }

    eprintln!("FCP Server started.");
    eprintln!("  Card: {}", config.card);
    eprintln!("  Socket: {}", server.socket_path().display());
    eprintln!("  Lock file: {}", lock_path.display());

    // 4. 主循环（阻塞直到出错）
    if let Err(e) = server.run() {
        error!("Server error: {}", e);
        drop(server);
        process::exit(1);
    }
}
