//! 固件上传与更新流程
//!
//! App / Leapfrog 上传前先擦除 App segment；ESP 直接上传。`update` 在每个
//! 非 ESP section 之后重启设备，等待同一序列号的设备重新出现再继续。

use super::{Tool, connect};
use crate::cards::{Discovery, SoundCard};
use crate::firmware::update_plan;
use crate::session::Session;
use anyhow::{Context, Result, bail};
use fcp_firmware::{FirmwareContainer, FirmwareType};
use fcp_protocol::RequestType;
use std::io::Write as _;
use std::time::Duration;
use tokio::time::{Instant, sleep};

/// 重启请求后等待服务端断开的时间
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// 等待设备重新出现的时间
pub const REAPPEAR_TIMEOUT: Duration = Duration::from_secs(20);

const REAPPEAR_POLL: Duration = Duration::from_secs(1);

fn section_of(
    container: &FirmwareContainer,
    firmware_type: FirmwareType,
) -> Result<&fcp_firmware::FirmwareSection> {
    container
        .section(firmware_type)
        .with_context(|| format!("No {firmware_type} firmware found in the firmware file"))
}

/// 上传一个 section（App / Leapfrog 先擦除）
async fn erase_and_upload(
    session: &mut Session,
    container: &FirmwareContainer,
    firmware_type: FirmwareType,
) -> Result<()> {
    let section = section_of(container, firmware_type)?;
    if firmware_type != FirmwareType::Esp {
        println!("Erasing App firmware...");
        session
            .send_simple(RequestType::AppFirmwareErase, false)
            .await?;
    }
    println!("Uploading {firmware_type} firmware...");
    session.send_firmware(section).await?;
    Ok(())
}

/// upload-leapfrog / upload-esp / upload-app
pub async fn upload(tool: &Tool, firmware_type: FirmwareType) -> Result<()> {
    let (card, mut session) = tool.open_card().await?;
    let selected = tool.select_firmware(&card)?;
    erase_and_upload(&mut session, &selected.container, firmware_type).await
}

/// update：按需上传 Leapfrog / ESP，最后上传 App
pub async fn update(tool: &Tool) -> Result<()> {
    let (mut card, mut session) = tool.open_card().await?;
    let selected = tool.select_firmware(&card)?;

    let plan = update_plan(
        &selected.container,
        card.firmware_version(),
        card.esp_firmware_version(),
    );
    for firmware_type in plan {
        erase_and_upload(&mut session, &selected.container, firmware_type).await?;
        if firmware_type != FirmwareType::Esp {
            (card, session) = reboot_and_wait(&tool.discovery, &card, session).await?;
        }
    }
    Ok(())
}

/// 重启设备并重新连接
async fn reboot_and_wait(
    discovery: &Discovery,
    card: &SoundCard,
    mut session: Session,
) -> Result<(SoundCard, Session)> {
    let Some(serial) = card.serial.clone() else {
        bail!("Cannot follow device across reboot: serial number unknown");
    };

    session.send_simple(RequestType::Reboot, true).await?;
    print!("Rebooting");
    let _ = std::io::stdout().flush();

    session
        .wait_for_disconnect(DISCONNECT_TIMEOUT)
        .await
        .context("fcp-server did not disconnect after reboot request")?;
    drop(session);

    let reconnected = wait_for_device(discovery, &serial, REAPPEAR_TIMEOUT).await;
    println!();
    reconnected.context("Device did not reappear after reboot")
}

/// 轮询直到同一序列号的设备重新出现且它的 fcp-server 可以连接
async fn wait_for_device(
    discovery: &Discovery,
    serial: &str,
    timeout: Duration,
) -> Result<(SoundCard, Session)> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(card) = discovery.find_by_serial(serial) {
            if card.socket_path().is_some() {
                if let Ok(session) = connect(&card).await {
                    return Ok((card, session));
                }
            }
        }
        if Instant::now() >= deadline {
            bail!("device with serial {serial} not found");
        }
        sleep(REAPPEAR_POLL).await;
        print!(".");
        let _ = std::io::stdout().flush();
    }
}
