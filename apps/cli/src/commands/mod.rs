//! 命令定义和实现

pub mod about;
pub mod device;
pub mod list;
pub mod upload;

use crate::cards::{Discovery, SoundCard};
use crate::firmware::{SelectedFirmware, enumerate_firmwares, select_firmware};
use crate::session::Session;
use anyhow::{Context, Result, bail};
use fcp_firmware::FoundFirmware;
use std::path::PathBuf;

/// 命令共享的上下文
#[derive(Debug, Clone)]
pub struct Tool {
    pub discovery: Discovery,
    pub firmware_dir: PathBuf,
    /// `-c/--card`
    pub card: Option<u32>,
    /// `-f/--firmware`
    pub firmware: Option<PathBuf>,
}

impl Tool {
    pub fn firmwares(&self) -> Vec<FoundFirmware> {
        enumerate_firmwares(&self.firmware_dir)
    }

    /// 选择目标声卡：指定卡号，或唯一的支持设备
    pub fn select_card(&self, cards: &[SoundCard]) -> Result<SoundCard> {
        if cards.is_empty() {
            bail!("No supported devices found");
        }
        let card = match self.card {
            Some(num) => cards
                .iter()
                .find(|c| c.card_num == num)
                .with_context(|| {
                    format!("Selected card {num} not found\nUse 'fcp-tool list' to list supported devices")
                })?,
            None if cards.len() > 1 => bail!(
                "More than one supported device found\n\
                 Use 'fcp-tool list' and 'fcp-tool -c <card_num> ...' to select a device"
            ),
            None => &cards[0],
        };
        println!(
            "Selected device {} ({})",
            card.product_name,
            card.serial_or_unknown()
        );
        Ok(card.clone())
    }

    /// 选择声卡并连接它的 fcp-server
    pub async fn open_card(&self) -> Result<(SoundCard, Session)> {
        let card = self.select_card(&self.discovery.enumerate())?;
        let session = connect(&card).await?;
        Ok((card, session))
    }

    /// 选择要上传的固件
    pub fn select_firmware(&self, card: &SoundCard) -> Result<SelectedFirmware> {
        let found = if self.firmware.is_some() {
            Vec::new()
        } else {
            self.firmwares()
        };
        select_firmware(card, self.firmware.as_deref(), &found)
    }
}

/// 连接声卡的 fcp-server
pub async fn connect(card: &SoundCard) -> Result<Session> {
    let Some(path) = card.socket_path() else {
        bail!("fcp-server not running for card {}", card.card_num);
    };
    Session::connect(path)
        .await
        .with_context(|| format!("Failed to connect to fcp-server for card {}", card.card_num))
}
