//! # FCP Tool
//!
//! Focusrite FCP 声卡的固件管理工具，通过 fcp-server 的控制 socket 工作。
//!
//! ```bash
//! # 列出连接的设备以及是否有可用更新
//! fcp-tool list
//!
//! # 更新固件（自动选择最新版本）
//! fcp-tool update
//!
//! # 多台设备时指定声卡号
//! fcp-tool -c 1 update
//! ```

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use fcp_firmware::{FirmwareType, SYSTEM_FIRMWARE_DIR};
use std::path::PathBuf;

mod cards;
mod commands;
mod devices;
mod firmware;
mod session;

use cards::Discovery;
use commands::{Tool, about, device, list, upload};

/// FCP Tool - Focusrite 声卡固件管理
#[derive(Parser, Debug)]
#[command(name = "fcp-tool")]
#[command(about = "Firmware management for Focusrite USB audio interfaces", long_about = None)]
#[command(version)]
#[command(after_help = "Support: https://github.com/geoffreybennett/fcp-support\n\
                        Configuration GUI: https://github.com/geoffreybennett/alsa-scarlett-gui\n\
                        Firmware: https://github.com/geoffreybennett/fcp-firmware")]
struct Cli {
    /// 选择声卡号
    #[arg(short, long, global = true)]
    card: Option<u32>,

    /// 指定固件文件
    #[arg(short, long, global = true)]
    firmware: Option<PathBuf>,

    /// fcp-server 状态记录目录（默认: $XDG_RUNTIME_DIR，其次 /tmp）
    #[arg(long, global = true)]
    socket_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Commands {
    /// List currently connected devices and if a firmware update is available
    #[command(short_flag = 'l')]
    List,

    /// List all supported products and available firmware versions
    ListAll,

    /// Update firmware on the device
    #[command(short_flag = 'u')]
    Update,

    /// Display more information
    About,

    /// Reboot the device
    Reboot,

    /// Reset to default configuration
    EraseConfig,

    /// Erase the App firmware
    EraseApp,

    /// Upload Leapfrog firmware
    UploadLeapfrog,

    /// Upload ESP firmware
    UploadEsp,

    /// Upload App firmware
    UploadApp,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志（用户输出走 stdout/stderr，日志默认只显示警告）
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let command = match cli.command {
        Some(command) => command,
        None if cli.card.is_some() => bail!("Card specified but no command"),
        None => Commands::List,
    };

    let mut discovery = Discovery::default();
    if let Some(dir) = cli.socket_dir {
        discovery.socket_dirs = vec![dir];
    }
    let tool = Tool {
        discovery,
        firmware_dir: PathBuf::from(SYSTEM_FIRMWARE_DIR),
        card: cli.card,
        firmware: cli.firmware,
    };

    match command {
        Commands::List => list::list(&tool),
        Commands::ListAll => list::list_all(&tool),
        Commands::About => {
            about::about();
            Ok(())
        },
        Commands::Update => upload::update(&tool).await,
        Commands::Reboot => device::reboot(&tool).await,
        Commands::EraseConfig => device::erase_config(&tool).await,
        Commands::EraseApp => device::erase_app(&tool).await,
        Commands::UploadLeapfrog => upload::upload(&tool, FirmwareType::Leapfrog).await,
        Commands::UploadEsp => {
            println!("Uploading ESP firmware...");
            upload::upload(&tool, FirmwareType::Esp).await
        },
        Commands::UploadApp => upload::upload(&tool, FirmwareType::App).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_short_commands() {
        let cli = Cli::try_parse_from(["fcp-tool", "-l"]).unwrap();
        assert_eq!(cli.command, Some(Commands::List));

        let cli = Cli::try_parse_from(["fcp-tool", "-c", "2", "-u"]).unwrap();
        assert_eq!(cli.card, Some(2));
        assert_eq!(cli.command, Some(Commands::Update));
    }

    #[test]
    fn test_options_after_command() {
        let cli =
            Cli::try_parse_from(["fcp-tool", "upload-app", "--firmware", "fw.bin", "-c3"]).unwrap();
        assert_eq!(cli.command, Some(Commands::UploadApp));
        assert_eq!(cli.card, Some(3));
        assert_eq!(cli.firmware, Some(PathBuf::from("fw.bin")));
    }

    #[test]
    fn test_default_command() {
        let cli = Cli::try_parse_from(["fcp-tool"]).unwrap();
        assert!(cli.command.is_none());
        assert!(Cli::try_parse_from(["fcp-tool", "bogus"]).is_err());
    }
}
