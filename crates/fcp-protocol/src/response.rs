//! 设备响应解析
//!
//! 响应长度总是由 [`Command::response_len`](crate::Command::response_len)
//! 显式给出，这里只负责按固定布局解码。

use crate::command::{DataWidth, FLASH_COUNT_MAX, FLASH_SIZE_MAX};
use crate::{ProtocolError, expect_len, le_u16, le_u32};

/// flash 信息（FLASH_INFO 响应）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashInfo {
    pub size: u32,
    pub count: u32,
}

impl FlashInfo {
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        expect_len(buf, 16)?;
        let size = le_u32(buf, 0);
        let count = le_u32(buf, 4);
        if size > FLASH_SIZE_MAX {
            return Err(ProtocolError::OutOfRange {
                field: "flash size",
                value: u64::from(size),
            });
        }
        if count > FLASH_COUNT_MAX {
            return Err(ProtocolError::OutOfRange {
                field: "flash segment count",
                value: u64::from(count),
            });
        }
        Ok(Self { size, count })
    }
}

/// segment 信息（FLASH_SEGMENT_INFO 响应）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub size: u32,
    pub flags: u32,
    pub name: String,
}

impl SegmentInfo {
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        expect_len(buf, 24)?;
        let size = le_u32(buf, 0);
        let flags = le_u32(buf, 4);
        if size > FLASH_SIZE_MAX {
            return Err(ProtocolError::OutOfRange {
                field: "segment size",
                value: u64::from(size),
            });
        }

        // 名称字段 16 字节，第 16 字节强制作为终止符
        let raw = &buf[8..23];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let name = String::from_utf8_lossy(&raw[..end]).into_owned();

        Ok(Self { size, flags, name })
    }
}

/// mix 信息（MIX_INFO 响应）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MixInfo {
    pub outputs: u8,
    pub inputs: u8,
}

impl MixInfo {
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        expect_len(buf, 8)?;
        Ok(Self {
            outputs: buf[0],
            inputs: buf[1],
        })
    }
}

/// mux 信息（MUX_INFO 响应，只使用前 3 个值）
pub fn decode_mux_info(buf: &[u8]) -> Result<[u16; 3], ProtocolError> {
    expect_len(buf, 12)?;
    Ok([le_u16(buf, 0), le_u16(buf, 2), le_u16(buf, 4)])
}

/// meter 信息（METER_INFO 响应，返回 meter slot 数量）
pub fn decode_meter_info(buf: &[u8]) -> Result<u8, ProtocolError> {
    expect_len(buf, 4)?;
    Ok(buf[0])
}

/// 解码 u16 数组（MIX_READ 响应）
pub fn decode_u16_array(buf: &[u8]) -> Vec<u16> {
    buf.chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// 解码 u32 数组（METER_READ / MUX_READ 响应）
pub fn decode_u32_array(buf: &[u8]) -> Vec<u32> {
    buf.chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// 单字节响应（CAP_READ / FLASH_ERASE_PROGRESS）
pub fn decode_u8(buf: &[u8]) -> Result<u8, ProtocolError> {
    expect_len(buf, 1)?;
    Ok(buf[0])
}

/// 同步状态（SYNC_READ 响应，非零即锁定）
pub fn decode_sync(buf: &[u8]) -> Result<bool, ProtocolError> {
    expect_len(buf, 4)?;
    Ok(le_u32(buf, 0) != 0)
}

/// devmap 大小（DEVMAP_INFO 响应第二个 u16）
pub fn decode_devmap_size(buf: &[u8]) -> Result<u16, ProtocolError> {
    expect_len(buf, 4)?;
    Ok(le_u16(buf, 2))
}

/// 数据读取响应（1/2/4 字节，可选符号扩展）
pub fn decode_data(buf: &[u8], width: DataWidth, signed: bool) -> Result<i32, ProtocolError> {
    expect_len(buf, width.bytes())?;
    let value = match (width, signed) {
        (DataWidth::U8, false) => i32::from(buf[0]),
        (DataWidth::U8, true) => i32::from(buf[0] as i8),
        (DataWidth::U16, false) => i32::from(le_u16(buf, 0)),
        (DataWidth::U16, true) => i32::from(le_u16(buf, 0) as i16),
        (DataWidth::U32, _) => le_u32(buf, 0) as i32,
    };
    Ok(value)
}
