//! 固件发现与选择

use crate::cards::SoundCard;
use crate::devices::{VENDOR_VID, device_order};
use anyhow::{Context, Result, bail};
use fcp_firmware::{
    FirmwareContainer, FirmwareError, FirmwareType, FirmwareVersion, FoundFirmware,
    latest_for_pid, read_firmware_file, read_firmware_header, scan_firmware_dir, sort_firmwares,
};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};

pub const FIRMWARE_URL: &str = "https://github.com/geoffreybennett/fcp-firmware";

/// 枚举固件目录（只读头部），按设备顺序和版本排序
pub fn enumerate_firmwares(dir: &Path) -> Vec<FoundFirmware> {
    let mut found = match scan_firmware_dir(dir, VENDOR_VID) {
        Ok(found) => found,
        Err(FirmwareError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            eprintln!("Firmware directory {} not found", dir.display());
            eprintln!("Please install the firmware package from:");
            eprintln!("  {}\n", FIRMWARE_URL);
            return Vec::new();
        },
        Err(e) => {
            eprintln!("Unable to open directory {}: {}", dir.display(), e);
            return Vec::new();
        },
    };
    sort_firmwares(&mut found, &device_order());
    found
}

/// 设备版本与可用固件的比较结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    Available,
    UpToDate,
    Newer,
    /// 设备版本未知
    Unknown,
}

impl UpdateStatus {
    pub fn compare(running: Option<FirmwareVersion>, latest: FirmwareVersion) -> Self {
        match running.map(|v| v.cmp(&latest)) {
            Some(Ordering::Less) => UpdateStatus::Available,
            Some(Ordering::Equal) => UpdateStatus::UpToDate,
            Some(Ordering::Greater) => UpdateStatus::Newer,
            None => UpdateStatus::Unknown,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            UpdateStatus::Available => "update available",
            UpdateStatus::UpToDate => "up to date",
            UpdateStatus::Newer => "newer than",
            UpdateStatus::Unknown => "available",
        }
    }
}

/// 版本显示：`App a.b.c.d, ESP e.f.g.h` 或单个版本
pub fn version_string(app: Option<FirmwareVersion>, esp: Option<FirmwareVersion>) -> String {
    let app = app.map_or_else(|| "unknown".to_string(), |v| v.to_string());
    match esp {
        Some(esp) => format!("App {app}, ESP {esp}"),
        None => app,
    }
}

/// 选中的固件（完整读取并校验）
#[derive(Debug)]
pub struct SelectedFirmware {
    pub path: PathBuf,
    pub container: FirmwareContainer,
}

/// 选择要上传的固件
///
/// 未指定文件时使用该设备的最新固件，设备已是最新（或更新）时报错。
pub fn select_firmware(
    card: &SoundCard,
    file: Option<&Path>,
    found: &[FoundFirmware],
) -> Result<SelectedFirmware> {
    let path = match file {
        Some(file) => {
            read_firmware_header(file)
                .with_context(|| format!("Failed to read firmware file: {}", file.display()))?;
            file.to_path_buf()
        },
        None => {
            let Some(latest) = latest_for_pid(found, card.usb_id.pid) else {
                bail!("No firmware available for {}", card.product_name);
            };
            if let Some(running) = card.firmware_version() {
                if running >= latest.header.version {
                    bail!(
                        "Firmware {} for {} is already up to date",
                        running,
                        card.product_name
                    );
                }
            }
            latest.path.clone()
        },
    };

    let container = read_firmware_file(&path).context("Unable to load firmware")?;
    if container.usb_pid != card.usb_id.pid {
        bail!(
            "Firmware file is for a different device (PID {:04x} != {:04x})",
            container.usb_pid,
            card.usb_id.pid
        );
    }

    println!(
        "Found firmware version {} for {}\n  {}",
        container.version,
        card.product_name,
        path.display()
    );
    Ok(SelectedFirmware { path, container })
}

/// `update` 需要上传的 section（保持容器内顺序）
///
/// - ESP：设备 ESP 版本与文件不同（或未知）时需要
/// - Leapfrog：只在需要 ESP 且设备 App 版本与 Leapfrog 不同时需要
/// - App：总是需要
pub fn update_plan(
    container: &FirmwareContainer,
    app_version: Option<FirmwareVersion>,
    esp_version: Option<FirmwareVersion>,
) -> Vec<FirmwareType> {
    let need_esp = container
        .section(FirmwareType::Esp)
        .is_some_and(|esp| esp_version != Some(esp.version));
    let need_leapfrog = need_esp
        && container
            .section(FirmwareType::Leapfrog)
            .is_some_and(|leapfrog| app_version != Some(leapfrog.version));

    container
        .sections
        .iter()
        .map(|section| section.firmware_type)
        .filter(|t| match t {
            FirmwareType::Esp => need_esp,
            FirmwareType::Leapfrog => need_leapfrog,
            _ => true,
        })
        .collect()
}
