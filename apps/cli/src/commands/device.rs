//! 设备命令：reboot / erase-config / erase-app

use super::Tool;
use anyhow::Result;
use fcp_protocol::RequestType;
use std::io::Write as _;

pub async fn reboot(tool: &Tool) -> Result<()> {
    let (_card, mut session) = tool.open_card().await?;
    print!("Rebooting...");
    let _ = std::io::stdout().flush();
    session.send_simple(RequestType::Reboot, false).await?;
    Ok(())
}

pub async fn erase_config(tool: &Tool) -> Result<()> {
    let (_card, mut session) = tool.open_card().await?;
    println!("Erasing configuration...");
    session.send_simple(RequestType::ConfigErase, false).await?;
    Ok(())
}

pub async fn erase_app(tool: &Tool) -> Result<()> {
    let (_card, mut session) = tool.open_card().await?;
    println!("Erasing App firmware...");
    session
        .send_simple(RequestType::AppFirmwareErase, false)
        .await?;
    Ok(())
}
