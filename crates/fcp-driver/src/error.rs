//! 驱动层错误类型定义
//!
//! 每个错误都通过 `code()` 映射到唯一的控制 socket 错误码。

use fcp_protocol::{ErrorCode, ProtocolError};
use std::path::PathBuf;
use thiserror::Error;

/// 命令传输错误
#[derive(Error, Debug)]
pub enum TransportError {
    /// 设备节点不存在（不是 FCP 设备或驱动未加载）
    #[error("Not an FCP device: {} not found", .0.display())]
    NotFcpDevice(PathBuf),

    /// 协议版本 1.x（scarlett2 驱动）
    #[error("Protocol version {major}.{minor}.{subminor} is the scarlett2 driver")]
    LegacyProtocol { major: u8, minor: u8, subminor: u8 },

    /// 不支持的协议版本
    #[error("Unsupported protocol version (2.0.x expected, got {major}.{minor}.{subminor})")]
    UnsupportedProtocol { major: u8, minor: u8, subminor: u8 },

    /// 设备调用失败
    #[error("{command} failed: {source}")]
    Io {
        command: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// 响应长度与命令声明不一致
    #[error("{command}: expected {expected} response bytes, got {actual}")]
    ResponseLength {
        command: &'static str,
        expected: usize,
        actual: usize,
    },

    /// 通知长度错误
    #[error("Short notification read: {0} bytes")]
    ShortNotification(usize),

    /// 请求参数或响应内容不合法
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// flash segment 目录错误
#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("Cannot read flash directory: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid segment count: {0} (expected 1-15)")]
    SegmentCount(u32),

    #[error("Required flash segment {0} not found")]
    MissingSegment(&'static str),

    #[error("Invalid segment number 0 for {0}")]
    ReservedIndex(&'static str),
}

/// ESP DFU 错误
#[derive(Error, Debug)]
pub enum DfuError {
    /// devmap 中缺少 DFU 配置
    #[error("ESP DFU configuration unavailable: {0}")]
    Config(String),

    /// ESP 状态为 0（未运行 Leapfrog 固件）
    #[error("ESP state (0) invalid (not running leapfrog firmware?)")]
    NotLeapfrog,

    #[error("ESP state invalid: expected {expected}, got {actual}")]
    InvalidState { expected: u8, actual: u8 },

    #[error("Timeout waiting for {0}")]
    Timeout(&'static str),

    /// 寄存器读写、通知或 DFU 启动失败
    #[error("ESP command failed: {0}")]
    Fcp(#[source] TransportError),

    /// 固件块写入失败
    #[error("ESP block write failed: {0}")]
    Write(#[source] TransportError),
}

/// 驱动层错误类型（请求处理器的统一错误）
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Device read failed: {0}")]
    Read(#[source] TransportError),

    #[error("Device write failed: {0}")]
    Write(#[source] TransportError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Dfu(#[from] DfuError),

    #[error("Invalid erase target: segment {segment}, {blocks} blocks")]
    InvalidEraseTarget { segment: u32, blocks: u32 },

    #[error("Timeout waiting for erase of segment {segment}")]
    EraseTimeout { segment: u32 },

    #[error("Invalid firmware length {size} (allowed {min}..={max})")]
    InvalidLength { size: usize, min: usize, max: usize },

    #[error("Firmware sha256 mismatch")]
    InvalidHash,

    #[error(
        "Expected VID:PID {expected_vid:04x}:{expected_pid:04x}, got {vid:04x}:{pid:04x}"
    )]
    InvalidUsbId {
        expected_vid: u16,
        expected_pid: u16,
        vid: u16,
        pid: u16,
    },
}

impl DfuError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DfuError::Config(_) => ErrorCode::Config,
            DfuError::NotLeapfrog => ErrorCode::NotLeapfrog,
            DfuError::InvalidState { .. } => ErrorCode::InvalidState,
            DfuError::Timeout(_) => ErrorCode::Timeout,
            DfuError::Fcp(_) => ErrorCode::Fcp,
            DfuError::Write(_) => ErrorCode::Write,
        }
    }
}

impl DirectoryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DirectoryError::Transport(_) => ErrorCode::Read,
            DirectoryError::SegmentCount(_)
            | DirectoryError::MissingSegment(_)
            | DirectoryError::ReservedIndex(_) => ErrorCode::Config,
        }
    }
}

impl DriverError {
    /// 返回给客户端的错误码
    pub fn code(&self) -> ErrorCode {
        match self {
            DriverError::Read(_) | DriverError::InvalidEraseTarget { .. } => ErrorCode::Read,
            DriverError::Write(_) => ErrorCode::Write,
            DriverError::EraseTimeout { .. } => ErrorCode::Timeout,
            DriverError::Directory(e) => e.code(),
            DriverError::Dfu(e) => e.code(),
            DriverError::InvalidLength { .. } => ErrorCode::InvalidLength,
            DriverError::InvalidHash => ErrorCode::InvalidHash,
            DriverError::InvalidUsbId { .. } => ErrorCode::InvalidUsbId,
        }
    }
}
