//! 服务端状态记录
//!
//! fcp-server 启动后在 socket 旁写入 `fcp-{card}.json`，fcp-tool 通过它
//! 找到 socket 路径和设备固件版本。

use serde::{Deserialize, Serialize};

/// 状态记录文件名
pub fn status_file_name(card: u32) -> String {
    format!("fcp-{card}.json")
}

/// 控制 socket 文件名
pub fn socket_file_name(card: u32) -> String {
    format!("fcp-{card}.sock")
}

/// 服务端发布的状态记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub socket_path: String,
    pub card: u32,
    pub usb_vid: u16,
    pub usb_pid: u16,
    pub firmware_build: u32,
    /// App 固件版本（4 个字），未知时缺省
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<[u32; 4]>,
    /// ESP 固件版本（4 个字），未知时缺省
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub esp_firmware_version: Option<[u32; 4]>,
}
