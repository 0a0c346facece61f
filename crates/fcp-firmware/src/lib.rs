//! # FCP Firmware
//!
//! Focusrite 固件文件解析（纯函数，无设备依赖）
//!
//! - `container`: 容器 / section 编解码、sha256 校验、ESP md5
//! - `dir`: 固件目录扫描（只读头部）

mod container;
mod dir;
mod error;

pub use container::*;
pub use dir::*;
pub use error::FirmwareError;
