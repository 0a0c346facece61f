//! # FCP Protocol
//!
//! FCP（Focusrite Control Protocol）协议定义（无硬件依赖）
//!
//! ## 模块
//!
//! - `opcode`: 32 位操作码（类别 + 子操作）
//! - `command`: 设备命令的封闭集合（请求编码 / 响应长度）
//! - `response`: 设备响应解析
//! - `socket`: 控制 socket 的消息帧格式、错误码、固件负载
//! - `status`: 服务端发布的状态记录（需要 `serde` feature）
//!
//! ## 字节序
//!
//! 设备命令和控制 socket 的多字节字段均为小端字节序。
//! 固件文件（见 `fcp-firmware`）使用大端字节序。

pub mod command;
pub mod opcode;
pub mod response;
pub mod socket;

#[cfg(feature = "serde")]
pub mod status;

pub use command::*;
pub use opcode::*;
pub use response::*;
pub use socket::*;

use thiserror::Error;

/// 协议解析错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid response length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Message too short: need {needed} bytes, got {actual}")]
    TooShort { needed: usize, actual: usize },

    #[error("Invalid magic: 0x{0:02X}")]
    InvalidMagic(u8),

    #[error("Unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("Payload too large: {length} bytes (max {max})")]
    PayloadTooLarge { length: u32, max: u32 },

    #[error("Value out of range for {field}: {value}")]
    OutOfRange { field: &'static str, value: u64 },
}

/// 从切片中读取小端 u16（调用方保证长度）
pub(crate) fn le_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

/// 从切片中读取小端 u32（调用方保证长度）
pub(crate) fn le_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// 检查切片长度是否正好为 `expected`
pub(crate) fn expect_len(buf: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if buf.len() != expected {
        return Err(ProtocolError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_le_helpers() {
        let buf = [0x34, 0x12, 0x78, 0x56, 0x34, 0x12];
        assert_eq!(le_u16(&buf, 0), 0x1234);
        assert_eq!(le_u32(&buf, 2), 0x12345678);
    }

    #[test]
    fn test_expect_len() {
        assert!(expect_len(&[0u8; 4], 4).is_ok());
        assert_eq!(
            expect_len(&[0u8; 3], 4),
            Err(ProtocolError::InvalidLength {
                expected: 4,
                actual: 3
            })
        );
    }
}
