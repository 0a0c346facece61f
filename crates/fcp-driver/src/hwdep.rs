//! ALSA hwdep 传输实现（Linux）
//!
//! 设备节点 `/dev/snd/hwC{card}D0`，通过三个 ioctl 通信：
//!
//! - `PVERSION`: 协议版本（必须为 2.0.x）
//! - `INIT`: 初始化握手，返回 step-0 / step-2 响应
//! - `CMD`: 执行一条命令 `{u32 opcode, u16 req_size, u16 resp_size, data[]}`
//!
//! 通知通过 `read()` 读取，每条 4 字节。

use crate::{Transport, TransportError};
use fcp_protocol::{Opcode, init1_opcode, init2_opcode};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

// ============================================================================
// ioctl definitions
// ============================================================================

/// ioctl 类型字符
const FCP_IOCTL_TYPE: u8 = b'S';

/// `struct fcp_init` 头部大小（不含柔性数组）
const FCP_INIT_HEADER_LEN: usize = 2 + 2 + 4 + 4;

/// `struct fcp_cmd` 头部大小（不含柔性数组）
const FCP_CMD_HEADER_LEN: usize = 4 + 2 + 2;

/// step-0 响应长度
pub const FCP_STEP0_SIZE: usize = 24;

/// step-2 响应长度
pub const FCP_STEP2_SIZE: usize = 84;

nix::ioctl_read!(fcp_ioctl_pversion, FCP_IOCTL_TYPE, 0x60, libc::c_int);
nix::ioctl_readwrite_bad!(
    fcp_ioctl_init,
    nix::request_code_readwrite!(FCP_IOCTL_TYPE, 0x64, FCP_INIT_HEADER_LEN),
    u8
);
nix::ioctl_readwrite_bad!(
    fcp_ioctl_cmd,
    nix::request_code_readwrite!(FCP_IOCTL_TYPE, 0x65, FCP_CMD_HEADER_LEN),
    u8
);

/// 协议版本
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
    pub subminor: u8,
}

impl ProtocolVersion {
    pub fn from_raw(raw: i32) -> Self {
        Self {
            major: ((raw >> 16) & 0xFF) as u8,
            minor: ((raw >> 8) & 0xFF) as u8,
            subminor: (raw & 0xFF) as u8,
        }
    }

    /// 检查版本：2.0.x 通过，1.x 为 scarlett2 驱动
    pub fn check(self) -> Result<(), TransportError> {
        let Self {
            major,
            minor,
            subminor,
        } = self;
        match (major, minor) {
            (2, 0) => Ok(()),
            (1, _) => Err(TransportError::LegacyProtocol {
                major,
                minor,
                subminor,
            }),
            _ => Err(TransportError::UnsupportedProtocol {
                major,
                minor,
                subminor,
            }),
        }
    }
}

/// hwdep 设备节点路径
pub fn hwdep_path(card: u32) -> PathBuf {
    PathBuf::from(format!("/dev/snd/hwC{card}D0"))
}

// ============================================================================
// HwdepTransport
// ============================================================================

/// ALSA hwdep 传输
pub struct HwdepTransport {
    file: File,
    firmware_build: u32,
}

impl HwdepTransport {
    /// 打开设备、检查协议版本并完成初始化握手
    pub fn open(card: u32) -> Result<Self, TransportError> {
        let path = hwdep_path(card);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    TransportError::NotFcpDevice(path.clone())
                } else {
                    TransportError::Io {
                        command: "open",
                        source: e,
                    }
                }
            })?;

        let mut raw_version: libc::c_int = 0;
        // SAFETY: fd 有效，输出指针指向本地变量
        unsafe { fcp_ioctl_pversion(file.as_raw_fd(), &mut raw_version) }
            .map_err(|e| ioctl_error("pversion", e))?;
        let version = ProtocolVersion::from_raw(raw_version);
        debug!(
            "Protocol version: {}.{}.{}",
            version.major, version.minor, version.subminor
        );
        version.check()?;

        let mut transport = Self {
            file,
            firmware_build: 0,
        };
        transport.firmware_build = transport.init()?;
        debug!("Firmware version: {}", transport.firmware_build);
        Ok(transport)
    }

    /// 设备报告的固件构建号（step-2 响应偏移 8）
    pub fn firmware_build(&self) -> u32 {
        self.firmware_build
    }

    fn init(&mut self) -> Result<u32, TransportError> {
        let mut buf = vec![0u8; FCP_INIT_HEADER_LEN + FCP_STEP0_SIZE + FCP_STEP2_SIZE];
        buf[0..2].copy_from_slice(&(FCP_STEP0_SIZE as u16).to_ne_bytes());
        buf[2..4].copy_from_slice(&(FCP_STEP2_SIZE as u16).to_ne_bytes());
        buf[4..8].copy_from_slice(&init1_opcode().raw().to_ne_bytes());
        buf[8..12].copy_from_slice(&init2_opcode().raw().to_ne_bytes());

        // SAFETY: 缓冲区包含头部和两个响应区，长度与头部声明一致
        unsafe { fcp_ioctl_init(self.file.as_raw_fd(), buf.as_mut_ptr()) }.map_err(|e| {
            if e == Errno::ENOTTY {
                debug!("FCP init returned ENOTTY (check the kernel FCP driver version)");
            }
            ioctl_error("init", e)
        })?;

        let step2 = &buf[FCP_INIT_HEADER_LEN + FCP_STEP0_SIZE..];
        Ok(u32::from_le_bytes([step2[8], step2[9], step2[10], step2[11]]))
    }
}

fn ioctl_error(command: &'static str, errno: Errno) -> TransportError {
    TransportError::Io {
        command,
        source: std::io::Error::from(errno),
    }
}

impl Transport for HwdepTransport {
    fn transact(
        &mut self,
        opcode: Opcode,
        request: &[u8],
        response_len: usize,
    ) -> Result<Vec<u8>, TransportError> {
        let data_len = request.len().max(response_len);
        let mut buf = vec![0u8; FCP_CMD_HEADER_LEN + data_len];
        buf[0..4].copy_from_slice(&opcode.raw().to_ne_bytes());
        buf[4..6].copy_from_slice(&(request.len() as u16).to_ne_bytes());
        buf[6..8].copy_from_slice(&(response_len as u16).to_ne_bytes());
        buf[FCP_CMD_HEADER_LEN..FCP_CMD_HEADER_LEN + request.len()].copy_from_slice(request);

        // SAFETY: 数据区长度为 max(req_size, resp_size)
        unsafe { fcp_ioctl_cmd(self.file.as_raw_fd(), buf.as_mut_ptr()) }
            .map_err(|e| ioctl_error("cmd", e))?;

        buf.truncate(FCP_CMD_HEADER_LEN + response_len);
        Ok(buf.split_off(FCP_CMD_HEADER_LEN))
    }

    fn read_notification(&mut self, timeout: Duration) -> Result<Option<u32>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let ms = remaining.as_millis().min(u128::from(u16::MAX)) as u16;
            let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(ms)) {
                Ok(0) => return Ok(None),
                Ok(_) => break,
                Err(Errno::EINTR) => {
                    trace!("poll interrupted, retrying");
                    continue;
                },
                Err(e) => return Err(ioctl_error("poll", e)),
            }
        }

        let mut buf = [0u8; 4];
        let n = self.file.read(&mut buf).map_err(|e| TransportError::Io {
            command: "read notification",
            source: e,
        })?;
        if n != buf.len() {
            return Err(TransportError::ShortNotification(n));
        }
        let notification = u32::from_ne_bytes(buf);
        trace!("Notification: 0x{:08x}", notification);
        Ok(Some(notification))
    }

    fn notification_fd(&self) -> Option<BorrowedFd<'_>> {
        Some(self.file.as_fd())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_version_check() {
        assert!(ProtocolVersion::from_raw(0x0002_0000).check().is_ok());
        assert!(ProtocolVersion::from_raw(0x0002_0003).check().is_ok());
        assert!(matches!(
            ProtocolVersion::from_raw(0x0001_0002).check(),
            Err(TransportError::LegacyProtocol { major: 1, .. })
        ));
        assert!(matches!(
            ProtocolVersion::from_raw(0x0002_0100).check(),
            Err(TransportError::UnsupportedProtocol { minor: 1, .. })
        ));
    }

    #[test]
    fn test_hwdep_path() {
        assert_eq!(hwdep_path(2), PathBuf::from("/dev/snd/hwC2D0"));
    }

    #[test]
    fn test_open_missing_card() {
        // 卡号 99 在测试机上不存在
        assert!(matches!(
            HwdepTransport::open(99),
            Err(TransportError::NotFcpDevice(_))
        ));
    }
}
