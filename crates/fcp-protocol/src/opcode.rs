//! 操作码定义
//!
//! 32 位操作码 = 类别（12 位）<< 12 | 子操作（12 位），高 8 位保留为 0。

use bilge::prelude::*;
use num_enum::TryFromPrimitive;

// ============================================================================
// Opcode Categories
// ============================================================================

/// 操作码类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
pub enum Category {
    Init = 0x000,
    Meter = 0x001,
    Mix = 0x002,
    Mux = 0x003,
    Flash = 0x004,
    Sync = 0x006,
    EspDfu = 0x009,
    Data = 0x800,
}

// ============================================================================
// Sub-operations
// ============================================================================

pub const SUB_INIT_1: u16 = 0x000;
pub const SUB_CAP_READ: u16 = 0x001;
pub const SUB_INIT_2: u16 = 0x002;
pub const SUB_REBOOT: u16 = 0x003;

pub const SUB_METER_INFO: u16 = 0x000;
pub const SUB_METER_READ: u16 = 0x001;

pub const SUB_MIX_INFO: u16 = 0x000;
pub const SUB_MIX_READ: u16 = 0x001;
pub const SUB_MIX_WRITE: u16 = 0x002;

pub const SUB_MUX_INFO: u16 = 0x000;
pub const SUB_MUX_READ: u16 = 0x001;
pub const SUB_MUX_WRITE: u16 = 0x002;

pub const SUB_FLASH_INFO: u16 = 0x000;
pub const SUB_FLASH_SEGMENT_INFO: u16 = 0x001;
pub const SUB_FLASH_ERASE: u16 = 0x002;
pub const SUB_FLASH_ERASE_PROGRESS: u16 = 0x003;
pub const SUB_FLASH_WRITE: u16 = 0x004;

pub const SUB_SYNC_READ: u16 = 0x004;

pub const SUB_ESP_DFU_START: u16 = 0x000;
pub const SUB_ESP_DFU_WRITE: u16 = 0x001;

pub const SUB_DATA_READ: u16 = 0x000;
pub const SUB_DATA_WRITE: u16 = 0x001;
pub const SUB_DATA_NOTIFY: u16 = 0x002;
pub const SUB_DEVMAP_INFO: u16 = 0x00c;
pub const SUB_DEVMAP_READ: u16 = 0x00d;

// ============================================================================
// Opcode
// ============================================================================

/// 32 位操作码位域
///
/// bilge 默认 LSB first：Bit 0-11 为子操作，Bit 12-23 为类别。
#[bitsize(32)]
#[derive(FromBits, DebugBits, Clone, Copy, PartialEq, Eq)]
pub struct Opcode {
    pub sub_op: u12,   // Bit 0-11: 子操作
    pub category: u12, // Bit 12-23: 类别
    pub reserved: u8,  // Bit 24-31: 保留
}

impl Opcode {
    /// 由类别和子操作组合操作码
    pub fn compose(category: Category, sub_op: u16) -> Self {
        Self::from(((category as u32) << 12) | (u32::from(sub_op) & 0xFFF))
    }

    /// 原始 32 位值（写入 ioctl 结构）
    pub fn raw(self) -> u32 {
        u32::from(self)
    }

    /// 解析类别（未知类别返回 None）
    pub fn known_category(self) -> Option<Category> {
        Category::try_from(self.category().value()).ok()
    }
}

/// INIT_1 操作码（用于初始化 ioctl）
pub fn init1_opcode() -> Opcode {
    Opcode::compose(Category::Init, SUB_INIT_1)
}

/// INIT_2 操作码（用于初始化 ioctl）
pub fn init2_opcode() -> Opcode {
    Opcode::compose(Category::Init, SUB_INIT_2)
}
