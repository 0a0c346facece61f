//! list / list-all 命令

use super::Tool;
use crate::cards::SoundCard;
use crate::devices::SUPPORTED_DEVICES;
use crate::firmware::{FIRMWARE_URL, UpdateStatus, version_string};
use anyhow::{Result, bail};
use fcp_firmware::{FoundFirmware, latest_for_pid};
use std::fmt::Write as _;

/// 单张声卡的描述
pub fn describe_card(card: &SoundCard, found: &[FoundFirmware]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "ALSA Card {}:", card.card_num);
    let _ = writeln!(out, "  USB ID: {}", card.usb_id);
    let _ = writeln!(out, "  Product: {}", card.product_name);
    let _ = writeln!(out, "  Serial: {}", card.serial_or_unknown());
    let _ = writeln!(
        out,
        "  Firmware: {}",
        version_string(card.firmware_version(), card.esp_firmware_version())
    );
    if card.status.is_none() {
        let _ = writeln!(out, "  (fcp-server not running)");
    }

    match latest_for_pid(found, card.usb_id.pid) {
        Some(latest) => {
            let status = UpdateStatus::compare(card.firmware_version(), latest.header.version);
            let _ = writeln!(out, "  ({}: {})", status.label(), latest.header.version);
        },
        None => {
            let _ = writeln!(out, "  (no update firmware available)");
        },
    }
    out
}

/// 支持的产品、可用固件版本和正在运行的版本
pub fn describe_all(cards: &[SoundCard], found: &[FoundFirmware], firmware_dir: &str) -> String {
    let mut out = String::new();
    if found.is_empty() {
        let _ = writeln!(out, "No firmware found.\n");
        let _ = writeln!(out, "Firmware files should be placed in:\n  {firmware_dir}\n");
        let _ = writeln!(out, "Obtain firmware from:\n  {FIRMWARE_URL}\n");
    }

    let _ = writeln!(
        out,
        "USB Product ID, Product Name, and Firmware versions available (* = connected)"
    );
    for device in SUPPORTED_DEVICES {
        let running: Vec<&SoundCard> = cards
            .iter()
            .filter(|c| c.usb_id.pid == device.pid)
            .collect();
        let versions: Vec<String> = found
            .iter()
            .filter(|f| f.header.usb_pid == device.pid)
            .map(|f| f.header.version.to_string())
            .collect();

        let _ = write!(
            out,
            "{}{:04x} {:<25} {}",
            if running.is_empty() { ' ' } else { '*' },
            device.pid,
            device.name,
            versions.join(", ")
        );
        if !running.is_empty() {
            let running: Vec<String> = running
                .iter()
                .map(|c| version_string(c.firmware_version(), None))
                .collect();
            let _ = write!(out, " (running: {})", running.join(", "));
        }
        out.push('\n');
    }
    out
}

pub fn list(tool: &Tool) -> Result<()> {
    let cards = tool.discovery.enumerate();
    let found = tool.firmwares();
    if cards.is_empty() {
        bail!("No supported devices found");
    }

    println!(
        "Found {} supported device{}\n",
        cards.len(),
        if cards.len() == 1 { "" } else { "s" }
    );
    for card in &cards {
        println!("{}", describe_card(card, &found));
    }
    Ok(())
}

pub fn list_all(tool: &Tool) -> Result<()> {
    let cards = tool.discovery.enumerate();
    let found = tool.firmwares();
    print!(
        "{}",
        describe_all(&cards, &found, &tool.firmware_dir.display().to_string())
    );
    Ok(())
}
