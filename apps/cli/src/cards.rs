//! 声卡发现
//!
//! 从 procfs 枚举支持的声卡，从 sysfs 读取 USB 序列号，从 fcp-server
//! 发布的状态记录得到 socket 路径和固件版本。

use crate::devices::{VENDOR_VID, supported_device};
use fcp_driver::UsbId;
use fcp_driver::card::{PROC_ASOUND, list_cards, read_usb_bus, read_usb_id};
use fcp_firmware::FirmwareVersion;
use fcp_protocol::status::{ServerStatus, status_file_name};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// sysfs 中的 USB 设备目录
pub const SYS_USB_DEVICES: &str = "/sys/bus/usb/devices";

/// 找到的声卡
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoundCard {
    pub card_num: u32,
    pub usb_id: UsbId,
    pub product_name: &'static str,
    pub serial: Option<String>,
    /// fcp-server 状态记录（服务端未运行时为 None）
    pub status: Option<ServerStatus>,
}

impl SoundCard {
    pub fn firmware_version(&self) -> Option<FirmwareVersion> {
        self.status
            .as_ref()
            .and_then(|s| s.firmware_version)
            .map(FirmwareVersion)
    }

    pub fn esp_firmware_version(&self) -> Option<FirmwareVersion> {
        self.status
            .as_ref()
            .and_then(|s| s.esp_firmware_version)
            .map(FirmwareVersion)
    }

    pub fn socket_path(&self) -> Option<&Path> {
        self.status.as_ref().map(|s| Path::new(&s.socket_path))
    }

    pub fn serial_or_unknown(&self) -> &str {
        self.serial.as_deref().unwrap_or("unknown")
    }
}

/// 发现声卡时使用的文件系统位置
#[derive(Debug, Clone)]
pub struct Discovery {
    pub proc_root: PathBuf,
    pub sys_root: PathBuf,
    /// 按顺序查找状态记录的目录
    pub socket_dirs: Vec<PathBuf>,
}

impl Default for Discovery {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from(PROC_ASOUND),
            sys_root: PathBuf::from(SYS_USB_DEVICES),
            socket_dirs: default_socket_dirs(),
        }
    }
}

/// 默认状态记录目录：XDG_RUNTIME_DIR，其次 /tmp
pub fn default_socket_dirs() -> Vec<PathBuf> {
    let mut dirs_list: Vec<PathBuf> = dirs::runtime_dir().into_iter().collect();
    dirs_list.push(PathBuf::from("/tmp"));
    dirs_list
}

impl Discovery {
    /// 枚举支持的声卡（按卡号升序）
    pub fn enumerate(&self) -> Vec<SoundCard> {
        let card_nums = match list_cards(&self.proc_root) {
            Ok(cards) => cards,
            Err(e) => {
                warn!("Cannot list {}: {}", self.proc_root.display(), e);
                return Vec::new();
            },
        };
        card_nums
            .into_iter()
            .filter_map(|card_num| self.probe(card_num))
            .collect()
    }

    /// 检查单张声卡；不是支持的设备时返回 None
    pub fn probe(&self, card_num: u32) -> Option<SoundCard> {
        let usb_id = read_usb_id(&self.proc_root, card_num).ok()?;
        if usb_id.vid != VENDOR_VID {
            return None;
        }
        let device = supported_device(usb_id.pid)?;
        let serial = self.device_serial(card_num);
        if serial.is_none() {
            warn!("Failed to get serial number for card {}", card_num);
        }
        Some(SoundCard {
            card_num,
            usb_id,
            product_name: device.name,
            serial,
            status: self.find_status(card_num),
        })
    }

    /// 按序列号查找声卡
    pub fn find_by_serial(&self, serial: &str) -> Option<SoundCard> {
        self.enumerate()
            .into_iter()
            .find(|card| card.serial.as_deref() == Some(serial))
    }

    /// USB 序列号：procfs 的 `bus/dev` 定位 sysfs 端口目录
    pub fn device_serial(&self, card_num: u32) -> Option<String> {
        let (bus, dev) = read_usb_bus(&self.proc_root, card_num).ok()?;
        let bus_path = self.sys_root.join(format!("usb{bus}"));
        let port = find_device_port(&bus_path, bus, dev)?;
        let serial = std::fs::read_to_string(port.join("serial")).ok()?;
        let serial = serial.split_whitespace().next()?;
        Some(serial.to_string())
    }

    /// 读取 fcp-server 状态记录
    pub fn find_status(&self, card_num: u32) -> Option<ServerStatus> {
        let name = status_file_name(card_num);
        self.socket_dirs.iter().find_map(|dir| {
            let path = dir.join(&name);
            let bytes = std::fs::read(&path).ok()?;
            match serde_json::from_slice::<ServerStatus>(&bytes) {
                Ok(status) if status.card == card_num => Some(status),
                Ok(_) => None,
                Err(e) => {
                    warn!("Ignoring invalid status record {}: {}", path.display(), e);
                    None
                },
            }
        })
    }
}

fn read_devnum(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path.join("devnum"))
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// 在总线目录下递归查找 devnum 匹配的端口目录
fn find_device_port(path: &Path, bus: u32, dev: u32) -> Option<PathBuf> {
    if read_devnum(path) == Some(dev) {
        return Some(path.to_path_buf());
    }

    let prefix = format!("{bus}-");
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Cannot read {}: {}", path.display(), e);
            return None;
        },
    };
    let mut children: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry.file_name().to_str().is_some_and(|n| n.starts_with(&prefix))
                && entry.path().is_dir()
        })
        .map(|entry| entry.path())
        .collect();
    children.sort();

    children
        .iter()
        .find_map(|child| find_device_port(child, bus, dev))
}
