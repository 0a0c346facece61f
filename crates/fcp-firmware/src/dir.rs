//! 固件目录枚举
//!
//! 扫描目录中的 `*.bin` 文件，只读取头部，按 (vid, pid, version) 去重。

use crate::{FirmwareContainer, FirmwareError, read_firmware_header};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// 系统固件目录
pub const SYSTEM_FIRMWARE_DIR: &str = "/usr/lib/firmware/scarlett4";

/// 目录中找到的固件（只包含头部）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundFirmware {
    pub path: PathBuf,
    pub header: FirmwareContainer,
}

/// 扫描固件目录
///
/// 只保留 `vendor_vid` 的固件；无法解析的文件记录警告后跳过。
/// 目录不存在时返回 `FirmwareError::Io`（`NotFound`）。
pub fn scan_firmware_dir(
    dir: impl AsRef<Path>,
    vendor_vid: u16,
) -> Result<Vec<FoundFirmware>, FirmwareError> {
    let dir = dir.as_ref();
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "bin"))
        .collect();
    paths.sort();

    let mut found: Vec<FoundFirmware> = Vec::new();
    for path in paths {
        let header = match read_firmware_header(&path) {
            Ok(header) => header,
            Err(e) => {
                warn!("Failed to read firmware file {}: {}", path.display(), e);
                continue;
            },
        };
        if header.usb_vid != vendor_vid {
            debug!("Skipping {}: vendor 0x{:04x}", path.display(), header.usb_vid);
            continue;
        }
        let duplicate = found.iter().any(|f| {
            f.header.usb_pid == header.usb_pid && f.header.version == header.version
        });
        if duplicate {
            debug!("Skipping duplicate firmware {}", path.display());
            continue;
        }
        found.push(FoundFirmware { path, header });
    }

    Ok(found)
}

/// 按设备顺序排序，同一设备内新版本在前
///
/// 不在 `device_order` 中的 pid 排在最后。
pub fn sort_firmwares(found: &mut [FoundFirmware], device_order: &[u16]) {
    let rank = |pid: u16| {
        device_order
            .iter()
            .position(|&p| p == pid)
            .unwrap_or(device_order.len())
    };
    found.sort_by(|a, b| {
        rank(a.header.usb_pid)
            .cmp(&rank(b.header.usb_pid))
            .then_with(|| b.header.version.cmp(&a.header.version))
    });
}

/// 指定 pid 的最新固件（要求已排序）
pub fn latest_for_pid(found: &[FoundFirmware], usb_pid: u16) -> Option<&FoundFirmware> {
    found.iter().find(|f| f.header.usb_pid == usb_pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FirmwareSection, FirmwareType, FirmwareVersion};

    fn write_fw(dir: &Path, name: &str, vid: u16, pid: u16, version: [u32; 4]) {
        let section = FirmwareSection::new(
            FirmwareType::App,
            vid,
            pid,
            FirmwareVersion(version),
            vec![0u8; 16],
        );
        let container = FirmwareContainer::new(vid, pid, FirmwareVersion(version), vec![section]);
        std::fs::write(dir.join(name), container.encode()).unwrap();
    }

    #[test]
    fn test_scan_filters_and_dedups() {
        let dir = tempfile::tempdir().unwrap();
        write_fw(dir.path(), "a.bin", 0x1235, 0x821d, [1, 0, 0, 1]);
        write_fw(dir.path(), "b.bin", 0x1235, 0x821d, [1, 0, 0, 1]);
        write_fw(dir.path(), "c.bin", 0x0001, 0x821d, [1, 0, 0, 2]);
        write_fw(dir.path(), "d.txt", 0x1235, 0x821d, [1, 0, 0, 3]);
        std::fs::write(dir.path().join("junk.bin"), b"garbage").unwrap();

        let found = scan_firmware_dir(dir.path(), 0x1235).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].path.ends_with("a.bin"));
    }

    #[test]
    fn test_sort_device_order_then_newest() {
        let dir = tempfile::tempdir().unwrap();
        write_fw(dir.path(), "18i20-old.bin", 0x1235, 0x821d, [1, 0, 0, 1]);
        write_fw(dir.path(), "18i20-new.bin", 0x1235, 0x821d, [1, 0, 0, 5]);
        write_fw(dir.path(), "16i16.bin", 0x1235, 0x821b, [1, 0, 0, 3]);

        let mut found = scan_firmware_dir(dir.path(), 0x1235).unwrap();
        sort_firmwares(&mut found, &[0x821b, 0x821c, 0x821d]);

        let order: Vec<_> = found
            .iter()
            .map(|f| (f.header.usb_pid, f.header.version.0[3]))
            .collect();
        assert_eq!(order, vec![(0x821b, 3), (0x821d, 5), (0x821d, 1)]);
        assert_eq!(latest_for_pid(&found, 0x821d).unwrap().header.version.0[3], 5);
        assert!(latest_for_pid(&found, 0x821c).is_none());
    }

    #[test]
    fn test_missing_dir() {
        let err = scan_firmware_dir("/nonexistent/fcp-firmware", 0x1235).unwrap_err();
        assert!(matches!(err, FirmwareError::Io(ref e) if e.kind() == std::io::ErrorKind::NotFound));
    }
}
