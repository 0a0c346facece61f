//! 设备命令定义
//!
//! 每个操作码对应 [`Command`] 的一个变体：请求字段、请求编码和响应长度
//! 都由变体本身决定，调用方不再手工计算缓冲区大小。

use crate::opcode::*;
use crate::ProtocolError;

// ============================================================================
// Protocol Limits
// ============================================================================

/// 单次命令传输的页大小
pub const FCP_PAGE_SIZE: usize = 1024;

/// 单次 flash 写入的最大数据量（页大小减去 3 个 u32 头部）
pub const FLASH_WRITE_MAX: usize = FCP_PAGE_SIZE - 3 * 4;

/// devmap 读取块大小
pub const DEVMAP_BLOCK_SIZE: usize = 1024;

/// flash 擦除进度完成哨兵值
pub const ERASE_DONE: u8 = 255;

/// flash/segment 报告的最大容量（16 MiB）
pub const FLASH_SIZE_MAX: u32 = 16 * 1024 * 1024;

/// flash info 报告的最大 segment 数量
pub const FLASH_COUNT_MAX: u32 = 16;

/// flash erase / write 允许的 segment 编号范围
pub const SEGMENT_NUM_MIN: u32 = 1;
pub const SEGMENT_NUM_MAX: u32 = 16;

/// 数据读写宽度（1/2/4 字节）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataWidth {
    U8 = 1,
    U16 = 2,
    U32 = 4,
}

impl DataWidth {
    pub fn bytes(self) -> usize {
        self as usize
    }

    pub fn from_bytes(size: usize) -> Option<Self> {
        match size {
            1 => Some(DataWidth::U8),
            2 => Some(DataWidth::U16),
            4 => Some(DataWidth::U32),
            _ => None,
        }
    }
}

// ============================================================================
// Command
// ============================================================================

/// 设备命令（一个变体对应一个操作码）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    CapRead { category: u16 },
    Reboot,
    MeterInfo,
    MeterRead { count: u16 },
    MixInfo,
    MixRead { mix_num: u16, count: u16 },
    MixWrite { mix_num: u16, values: &'a [u16] },
    MuxInfo,
    MuxRead { mux_num: u8, count: u8 },
    MuxWrite { mux_num: u16, values: &'a [u32] },
    FlashInfo,
    FlashSegmentInfo { segment: u32 },
    FlashErase { segment: u8 },
    FlashEraseProgress { segment: u32 },
    FlashWrite { segment: u32, offset: u32, data: &'a [u8] },
    SyncRead,
    EspDfuStart { length: u32, md5: [u8; 16] },
    EspDfuWrite { data: &'a [u8] },
    DataRead { offset: u32, width: DataWidth },
    DataWrite { offset: u32, width: DataWidth, value: i32 },
    DataNotify { event: u32 },
    DevmapInfo,
    DevmapRead { block: u32, len: usize },
}

impl Command<'_> {
    /// 该命令的操作码
    pub fn opcode(&self) -> Opcode {
        let (category, sub_op) = match self {
            Command::CapRead { .. } => (Category::Init, SUB_CAP_READ),
            Command::Reboot => (Category::Init, SUB_REBOOT),
            Command::MeterInfo => (Category::Meter, SUB_METER_INFO),
            Command::MeterRead { .. } => (Category::Meter, SUB_METER_READ),
            Command::MixInfo => (Category::Mix, SUB_MIX_INFO),
            Command::MixRead { .. } => (Category::Mix, SUB_MIX_READ),
            Command::MixWrite { .. } => (Category::Mix, SUB_MIX_WRITE),
            Command::MuxInfo => (Category::Mux, SUB_MUX_INFO),
            Command::MuxRead { .. } => (Category::Mux, SUB_MUX_READ),
            Command::MuxWrite { .. } => (Category::Mux, SUB_MUX_WRITE),
            Command::FlashInfo => (Category::Flash, SUB_FLASH_INFO),
            Command::FlashSegmentInfo { .. } => (Category::Flash, SUB_FLASH_SEGMENT_INFO),
            Command::FlashErase { .. } => (Category::Flash, SUB_FLASH_ERASE),
            Command::FlashEraseProgress { .. } => (Category::Flash, SUB_FLASH_ERASE_PROGRESS),
            Command::FlashWrite { .. } => (Category::Flash, SUB_FLASH_WRITE),
            Command::SyncRead => (Category::Sync, SUB_SYNC_READ),
            Command::EspDfuStart { .. } => (Category::EspDfu, SUB_ESP_DFU_START),
            Command::EspDfuWrite { .. } => (Category::EspDfu, SUB_ESP_DFU_WRITE),
            Command::DataRead { .. } => (Category::Data, SUB_DATA_READ),
            Command::DataWrite { .. } => (Category::Data, SUB_DATA_WRITE),
            Command::DataNotify { .. } => (Category::Data, SUB_DATA_NOTIFY),
            Command::DevmapInfo => (Category::Data, SUB_DEVMAP_INFO),
            Command::DevmapRead { .. } => (Category::Data, SUB_DEVMAP_READ),
        };
        Opcode::compose(category, sub_op)
    }

    /// 响应长度（字节），由命令本身决定
    pub fn response_len(&self) -> usize {
        match self {
            Command::CapRead { .. } => 1,
            Command::MeterInfo => 4,
            Command::MeterRead { count } => 4 * *count as usize,
            Command::MixInfo => 8,
            Command::MixRead { count, .. } => 2 * *count as usize,
            Command::MuxInfo => 12,
            Command::MuxRead { count, .. } => 4 * *count as usize,
            Command::FlashInfo => 16,
            Command::FlashSegmentInfo { .. } => 24,
            Command::FlashEraseProgress { .. } => 1,
            Command::SyncRead => 4,
            Command::DataRead { width, .. } => width.bytes(),
            Command::DevmapInfo => 4,
            Command::DevmapRead { len, .. } => *len,
            Command::Reboot
            | Command::MixWrite { .. }
            | Command::MuxWrite { .. }
            | Command::FlashErase { .. }
            | Command::FlashWrite { .. }
            | Command::EspDfuStart { .. }
            | Command::EspDfuWrite { .. }
            | Command::DataWrite { .. }
            | Command::DataNotify { .. } => 0,
        }
    }

    /// 检查命令参数是否在协议允许的范围内
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Command::FlashErase { segment } => {
                check_segment(u32::from(*segment))?;
            },
            Command::FlashWrite { segment, data, .. } => {
                check_segment(*segment)?;
                if data.len() > FLASH_WRITE_MAX {
                    return Err(ProtocolError::OutOfRange {
                        field: "flash write size",
                        value: data.len() as u64,
                    });
                }
            },
            Command::EspDfuWrite { data } if data.len() > FCP_PAGE_SIZE => {
                return Err(ProtocolError::OutOfRange {
                    field: "esp dfu write size",
                    value: data.len() as u64,
                });
            },
            Command::DevmapRead { len, .. } if *len > DEVMAP_BLOCK_SIZE => {
                return Err(ProtocolError::OutOfRange {
                    field: "devmap block size",
                    value: *len as u64,
                });
            },
            _ => {},
        }
        Ok(())
    }

    /// 编码请求数据（小端）
    pub fn encode_request(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Command::CapRead { category } => {
                buf.extend_from_slice(&category.to_le_bytes());
            },
            Command::Reboot
            | Command::MeterInfo
            | Command::MixInfo
            | Command::MuxInfo
            | Command::FlashInfo
            | Command::SyncRead
            | Command::DevmapInfo => {},
            Command::MeterRead { count } => {
                buf.extend_from_slice(&0u16.to_le_bytes());
                buf.extend_from_slice(&count.to_le_bytes());
                buf.extend_from_slice(&0u32.to_le_bytes());
            },
            Command::MixRead { mix_num, count } => {
                buf.extend_from_slice(&mix_num.to_le_bytes());
                buf.extend_from_slice(&count.to_le_bytes());
            },
            Command::MixWrite { mix_num, values } => {
                buf.reserve(2 + values.len() * 2);
                buf.extend_from_slice(&mix_num.to_le_bytes());
                for value in values.iter() {
                    buf.extend_from_slice(&value.to_le_bytes());
                }
            },
            Command::MuxRead { mux_num, count } => {
                // offset, pad, count, mux_num
                buf.extend_from_slice(&[0, 0, *count, *mux_num]);
            },
            Command::MuxWrite { mux_num, values } => {
                buf.reserve(4 + values.len() * 4);
                buf.extend_from_slice(&0u16.to_le_bytes());
                buf.extend_from_slice(&mux_num.to_le_bytes());
                for value in values.iter() {
                    buf.extend_from_slice(&value.to_le_bytes());
                }
            },
            Command::FlashSegmentInfo { segment } => {
                buf.extend_from_slice(&segment.to_le_bytes());
            },
            Command::FlashErase { segment } => {
                buf.extend_from_slice(&[*segment, 0, 0, 0, 0, 0, 0, 0]);
            },
            Command::FlashEraseProgress { segment } => {
                buf.extend_from_slice(&segment.to_le_bytes());
                buf.extend_from_slice(&0u32.to_le_bytes());
            },
            Command::FlashWrite {
                segment,
                offset,
                data,
            } => {
                buf.reserve(12 + data.len());
                buf.extend_from_slice(&segment.to_le_bytes());
                buf.extend_from_slice(&offset.to_le_bytes());
                buf.extend_from_slice(&0u32.to_le_bytes());
                buf.extend_from_slice(data);
            },
            Command::EspDfuStart { length, md5 } => {
                buf.extend_from_slice(&0u32.to_le_bytes());
                buf.extend_from_slice(&length.to_le_bytes());
                buf.extend_from_slice(md5);
            },
            Command::EspDfuWrite { data } => {
                buf.extend_from_slice(data);
            },
            Command::DataRead { offset, width } => {
                buf.extend_from_slice(&offset.to_le_bytes());
                buf.extend_from_slice(&(width.bytes() as u32).to_le_bytes());
            },
            Command::DataWrite {
                offset,
                width,
                value,
            } => {
                // 请求长度 = 8 + width，value 只发送低 width 字节
                buf.extend_from_slice(&offset.to_le_bytes());
                buf.extend_from_slice(&(width.bytes() as u32).to_le_bytes());
                buf.extend_from_slice(&value.to_le_bytes()[..width.bytes()]);
            },
            Command::DataNotify { event } => {
                buf.extend_from_slice(&event.to_le_bytes());
            },
            Command::DevmapRead { block, .. } => {
                buf.extend_from_slice(&block.to_le_bytes());
            },
        }
        buf
    }

    /// 简短名称（用于日志）
    pub fn name(&self) -> &'static str {
        match self {
            Command::CapRead { .. } => "cap-read",
            Command::Reboot => "reboot",
            Command::MeterInfo => "meter-info",
            Command::MeterRead { .. } => "meter-read",
            Command::MixInfo => "mix-info",
            Command::MixRead { .. } => "mix-read",
            Command::MixWrite { .. } => "mix-write",
            Command::MuxInfo => "mux-info",
            Command::MuxRead { .. } => "mux-read",
            Command::MuxWrite { .. } => "mux-write",
            Command::FlashInfo => "flash-info",
            Command::FlashSegmentInfo { .. } => "flash-segment-info",
            Command::FlashErase { .. } => "flash-erase",
            Command::FlashEraseProgress { .. } => "flash-erase-progress",
            Command::FlashWrite { .. } => "flash-write",
            Command::SyncRead => "sync-read",
            Command::EspDfuStart { .. } => "esp-dfu-start",
            Command::EspDfuWrite { .. } => "esp-dfu-write",
            Command::DataRead { .. } => "data-read",
            Command::DataWrite { .. } => "data-write",
            Command::DataNotify { .. } => "data-notify",
            Command::DevmapInfo => "devmap-info",
            Command::DevmapRead { .. } => "devmap-read",
        }
    }
}

fn check_segment(segment: u32) -> Result<(), ProtocolError> {
    if !(SEGMENT_NUM_MIN..=SEGMENT_NUM_MAX).contains(&segment) {
        return Err(ProtocolError::OutOfRange {
            field: "segment number",
            value: u64::from(segment),
        });
    }
    Ok(())
}
