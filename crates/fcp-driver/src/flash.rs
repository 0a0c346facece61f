//! flash segment 目录与擦除 / 写入编排

use crate::{
    DirectoryError, DriverError, FcpDevice, ProgressSink, ProgressTracker, Transport,
};
use fcp_protocol::{ERASE_DONE, FLASH_WRITE_MAX, FirmwarePayload};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

// ============================================================================
// Constants
// ============================================================================

/// 擦除块大小
pub const FLASH_BLOCK_SIZE: u32 = 4096;

/// App 固件最小长度
pub const APP_FIRMWARE_MIN_SIZE: usize = 65536;

/// 目录允许的最大 segment 数量，也是擦除目标的最大编号
pub const SEGMENT_COUNT_MAX: u32 = 15;

/// 擦除允许的最大块数
pub const ERASE_BLOCKS_MAX: u32 = 255;

/// flash 操作时序
#[derive(Debug, Clone)]
pub struct FlashTimings {
    /// 擦除进度轮询间隔
    pub erase_poll_interval: Duration,
    /// 单次擦除的最长时间，超出后返回超时
    pub erase_timeout: Duration,
}

impl Default for FlashTimings {
    fn default() -> Self {
        Self {
            erase_poll_interval: Duration::from_millis(50),
            erase_timeout: Duration::from_secs(60),
        }
    }
}

// ============================================================================
// Segment Directory
// ============================================================================

/// segment 角色（按名称精确匹配）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentRole {
    Upgrade,
    Settings,
    Disk,
    Env,
}

impl SegmentRole {
    pub const ALL: [SegmentRole; 4] = [
        SegmentRole::Upgrade,
        SegmentRole::Settings,
        SegmentRole::Disk,
        SegmentRole::Env,
    ];

    pub fn segment_name(self) -> &'static str {
        match self {
            SegmentRole::Upgrade => "App_Upgrade",
            SegmentRole::Settings => "App_Settings",
            SegmentRole::Disk => "App_Disk",
            SegmentRole::Env => "App_Env",
        }
    }

    fn from_segment_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.segment_name() == name)
    }
}

impl fmt::Display for SegmentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.segment_name())
    }
}

/// flash segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub index: u32,
    pub size: u32,
}

impl Segment {
    /// 擦除块数
    pub fn erase_blocks(&self) -> u32 {
        self.size / FLASH_BLOCK_SIZE
    }
}

/// flash segment 目录
///
/// 首次读取成功后在进程生命周期内保持不变。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashDirectory {
    pub flash_size: u32,
    pub upgrade: Segment,
    pub settings: Segment,
    pub disk: Segment,
    pub env: Segment,
}

impl FlashDirectory {
    /// 从设备读取 segment 目录
    pub fn discover<T: Transport>(device: &mut FcpDevice<T>) -> Result<Self, DirectoryError> {
        let info = device.flash_info()?;
        debug!("Flash size: {}", info.size);
        debug!("Segment count: {}", info.count);

        if !(1..=SEGMENT_COUNT_MAX).contains(&info.count) {
            error!("Invalid segment count: {} (expected 1-15)", info.count);
            return Err(DirectoryError::SegmentCount(info.count));
        }

        let mut found: [Option<Segment>; 4] = [None; 4];
        for index in 0..info.count {
            let segment = device.flash_segment_info(index)?;
            debug!(
                "Segment {}: size {} flags 0x{:08x} name {:?}",
                index, segment.size, segment.flags, segment.name
            );
            if let Some(role) = SegmentRole::from_segment_name(&segment.name) {
                found[role as usize] = Some(Segment {
                    index,
                    size: segment.size,
                });
            }
        }

        let mut segments = [Segment { index: 0, size: 0 }; 4];
        for role in SegmentRole::ALL {
            let segment = found[role as usize].ok_or(DirectoryError::MissingSegment(role.segment_name()))?;
            if segment.index == 0 {
                error!("Invalid {} segment number 0", role);
                return Err(DirectoryError::ReservedIndex(role.segment_name()));
            }
            segments[role as usize] = segment;
        }

        let directory = Self {
            flash_size: info.size,
            upgrade: segments[SegmentRole::Upgrade as usize],
            settings: segments[SegmentRole::Settings as usize],
            disk: segments[SegmentRole::Disk as usize],
            env: segments[SegmentRole::Env as usize],
        };
        debug!(
            "Flash segments: upgrade {} settings {} disk {} env {}",
            directory.upgrade.index,
            directory.settings.index,
            directory.disk.index,
            directory.env.index
        );
        Ok(directory)
    }

    pub fn segment(&self, role: SegmentRole) -> Segment {
        match role {
            SegmentRole::Upgrade => self.upgrade,
            SegmentRole::Settings => self.settings,
            SegmentRole::Disk => self.disk,
            SegmentRole::Env => self.env,
        }
    }
}

// ============================================================================
// Erase / Write
// ============================================================================

/// 擦除 segment 并上报进度
///
/// 设备返回 255 前一直按固定间隔轮询，超过 `erase_timeout` 返回超时；
/// 百分比 = 原始值 * 100 / 块数。
pub fn erase_segment<T, P>(
    device: &mut FcpDevice<T>,
    segment: Segment,
    timings: &FlashTimings,
    sink: &mut P,
) -> Result<(), DriverError>
where
    T: Transport,
    P: ProgressSink + ?Sized,
{
    let blocks = segment.erase_blocks();
    if !(1..=SEGMENT_COUNT_MAX).contains(&segment.index) || !(1..=ERASE_BLOCKS_MAX).contains(&blocks) {
        error!("Invalid erase target: segment {} ({} blocks)", segment.index, blocks);
        return Err(DriverError::InvalidEraseTarget {
            segment: segment.index,
            blocks,
        });
    }

    info!("Erasing segment {} ({} blocks)", segment.index, blocks);
    device
        .flash_erase(segment.index as u8)
        .map_err(DriverError::Write)?;

    let deadline = Instant::now() + timings.erase_timeout;
    let mut tracker = ProgressTracker::new(sink);
    loop {
        let raw = device
            .flash_erase_progress(segment.index)
            .map_err(DriverError::Read)?;
        if raw == ERASE_DONE {
            break;
        }
        if Instant::now() >= deadline {
            error!(
                "Erase of segment {} not complete after {:?} (progress {})",
                segment.index, timings.erase_timeout, raw
            );
            return Err(DriverError::EraseTimeout {
                segment: segment.index,
            });
        }
        tracker.update_ratio(u64::from(raw), u64::from(blocks));
        tracker.tick();
        std::thread::sleep(timings.erase_poll_interval);
    }
    tracker.finish();

    debug!("Erase of segment {} complete", segment.index);
    Ok(())
}

/// 分块写入 segment 并上报进度
pub fn write_segment<T, P>(
    device: &mut FcpDevice<T>,
    segment: Segment,
    data: &[u8],
    sink: &mut P,
) -> Result<(), DriverError>
where
    T: Transport,
    P: ProgressSink + ?Sized,
{
    info!("Writing {} bytes to segment {}", data.len(), segment.index);
    let total = data.len() as u64;
    let mut tracker = ProgressTracker::new(sink);

    for (i, chunk) in data.chunks(FLASH_WRITE_MAX).enumerate() {
        let offset = i * FLASH_WRITE_MAX;
        device
            .flash_write(segment.index, offset as u32, chunk)
            .map_err(|e| {
                error!("Error writing flash segment at offset {}", offset);
                DriverError::Write(e)
            })?;
        tracker.update_ratio((offset + chunk.len()) as u64, total);
        tracker.tick();
    }
    tracker.finish();
    Ok(())
}

// ============================================================================
// Pre-flight checks
// ============================================================================

/// sha256 校验
pub fn verify_sha256(data: &[u8], expected: &[u8; 32]) -> bool {
    let computed: [u8; 32] = Sha256::digest(data).into();
    &computed == expected
}

/// USB ID 校验
pub fn check_usb_id(
    payload: &FirmwarePayload<'_>,
    usb_vid: u16,
    usb_pid: u16,
) -> Result<(), DriverError> {
    if payload.usb_vid != usb_vid || payload.usb_pid != usb_pid {
        error!(
            "Expected VID:PID {:04x}:{:04x}, got {:04x}:{:04x}",
            usb_vid, usb_pid, payload.usb_vid, payload.usb_pid
        );
        return Err(DriverError::InvalidUsbId {
            expected_vid: usb_vid,
            expected_pid: usb_pid,
            vid: payload.usb_vid,
            pid: payload.usb_pid,
        });
    }
    Ok(())
}

/// App 固件写入前检查（不进行任何设备 IO）
///
/// 顺序：长度、sha256、USB ID。
pub fn check_app_firmware(
    payload: &FirmwarePayload<'_>,
    upgrade: Segment,
    usb_vid: u16,
    usb_pid: u16,
) -> Result<(), DriverError> {
    let size = payload.data.len();
    let max = upgrade.size as usize;
    if size < APP_FIRMWARE_MIN_SIZE || size > max {
        error!("Firmware data size {} outside {}..={}", size, APP_FIRMWARE_MIN_SIZE, max);
        return Err(DriverError::InvalidLength {
            size,
            min: APP_FIRMWARE_MIN_SIZE,
            max,
        });
    }
    if !verify_sha256(payload.data, &payload.sha256) {
        error!("Firmware sha256 mismatch");
        return Err(DriverError::InvalidHash);
    }
    check_usb_id(payload, usb_vid, usb_pid)
}

/// 校验并写入 App 固件到升级 segment
pub fn update_app_firmware<T, P>(
    device: &mut FcpDevice<T>,
    directory: &FlashDirectory,
    payload: &FirmwarePayload<'_>,
    usb_id: (u16, u16),
    sink: &mut P,
) -> Result<(), DriverError>
where
    T: Transport,
    P: ProgressSink + ?Sized,
{
    check_app_firmware(payload, directory.upgrade, usb_id.0, usb_id.1)?;

    let data = payload.data;
    if data.len() >= 32 {
        debug!(
            "Firmware data (length {}): {:02x?} ... {:02x?}",
            data.len(),
            &data[..16],
            &data[data.len() - 16..]
        );
    }
    write_segment(device, directory.upgrade, data, sink)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(data: &[u8], vid: u16, pid: u16) -> FirmwarePayload<'_> {
        FirmwarePayload {
            usb_vid: vid,
            usb_pid: pid,
            sha256: Sha256::digest(data).into(),
            md5: [0; 16],
            data,
        }
    }

    #[test]
    fn test_segment_erase_blocks() {
        let seg = Segment {
            index: 2,
            size: 0x10000,
        };
        assert_eq!(seg.erase_blocks(), 16);
    }

    #[test]
    fn test_role_names() {
        assert_eq!(SegmentRole::from_segment_name("App_Env"), Some(SegmentRole::Env));
        assert_eq!(SegmentRole::from_segment_name("App_env"), None);
        assert_eq!(SegmentRole::Upgrade.to_string(), "App_Upgrade");
    }

    #[test]
    fn test_app_preflight_order() {
        let upgrade = Segment {
            index: 1,
            size: 0x80000,
        };
        let small = vec![0u8; APP_FIRMWARE_MIN_SIZE - 1];
        let err = check_app_firmware(&payload(&small, 0, 0), upgrade, 0x1235, 0x821d).unwrap_err();
        assert!(matches!(err, DriverError::InvalidLength { .. }));

        let large = vec![0u8; 0x80001];
        let err = check_app_firmware(&payload(&large, 0x1235, 0x821d), upgrade, 0x1235, 0x821d)
            .unwrap_err();
        assert!(matches!(err, DriverError::InvalidLength { .. }));

        let data = vec![1u8; APP_FIRMWARE_MIN_SIZE];
        let mut bad_hash = payload(&data, 0x1235, 0x821b);
        bad_hash.sha256[0] ^= 1;
        let err = check_app_firmware(&bad_hash, upgrade, 0x1235, 0x821d).unwrap_err();
        assert!(matches!(err, DriverError::InvalidHash));

        let err = check_app_firmware(&payload(&data, 0x1235, 0x821b), upgrade, 0x1235, 0x821d)
            .unwrap_err();
        assert!(matches!(err, DriverError::InvalidUsbId { pid: 0x821b, .. }));

        assert!(check_app_firmware(&payload(&data, 0x1235, 0x821d), upgrade, 0x1235, 0x821d).is_ok());
    }

    #[test]
    fn test_verify_sha256() {
        let digest: [u8; 32] = Sha256::digest(b"abc").into();
        assert!(verify_sha256(b"abc", &digest));
        assert!(!verify_sha256(b"abd", &digest));
    }
}
