//! 守护进程错误类型

use fcp_driver::{DriverError, TransportError};
use fcp_protocol::{ErrorCode, ProtocolError};
use std::path::PathBuf;
use thiserror::Error;

/// 启动和主循环错误
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Device init error: {0}")]
    Device(#[from] TransportError),

    #[error("Device does not support required {0} commands")]
    MissingCapability(&'static str),

    #[error("Cannot read USB ID for card {card}: {source}")]
    UsbId {
        card: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Socket init error at {}: {source}", path.display())]
    Socket {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot write status file {}: {source}", path.display())]
    Status {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("poll failed: {0}")]
    Poll(#[source] nix::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// 单个请求的处理错误（作为 error 帧返回给客户端）
#[derive(Error, Debug)]
pub enum RequestError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl RequestError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RequestError::Protocol(e) => e.error_code(),
            RequestError::Driver(e) => e.code(),
        }
    }
}

impl From<fcp_driver::DirectoryError> for RequestError {
    fn from(e: fcp_driver::DirectoryError) -> Self {
        RequestError::Driver(e.into())
    }
}
