//! 固件解析错误类型定义

use thiserror::Error;

/// 固件解析错误类型
#[derive(Error, Debug)]
pub enum FirmwareError {
    /// 文件 IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 文件提前结束
    #[error("Truncated firmware file: need {expected} bytes, got {actual}")]
    TruncatedFile { expected: usize, actual: usize },

    /// sha256 校验失败
    #[error("Corrupt firmware (failed checksum) in section {section}")]
    CorruptFirmware { section: usize },

    /// 容器 section 数量不在 1..=3
    #[error("Invalid number of sections: {0}")]
    WrongSectionCount(u32),

    /// 未知魔数，或 section 中出现容器魔数
    #[error("Invalid firmware type {magic:?} in section {section}")]
    InvalidFirmwareType { section: usize, magic: String },
}
