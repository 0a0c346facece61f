//! 设备映射表（devmap）加载
//!
//! devmap 是描述设备寄存器布局的 JSON 文档。优先从当前目录的
//! `fcp-devmap-{pid}.json` 读取；不存在时从设备读取（base64 + zlib）。

use crate::{FcpDevice, Transport, TransportError};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// devmap 加载错误
#[derive(Error, Debug)]
pub enum DevmapError {
    #[error("Cannot read devmap file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot read devmap from device: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid devmap base64 encoding: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Invalid devmap compression: {0}")]
    Inflate(String),

    #[error("Invalid devmap JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// 默认 devmap 文件名
pub fn default_devmap_file(usb_pid: u16) -> PathBuf {
    PathBuf::from(format!("fcp-devmap-{usb_pid:04x}.json"))
}

/// 读取 devmap 文件；文件不存在时返回 `Ok(None)`
pub fn load_devmap_file(path: &Path) -> Result<Option<Value>, DevmapError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(DevmapError::Io {
                path: path.to_path_buf(),
                source,
            });
        },
    };
    debug!("Loaded devmap from {}", path.display());
    Ok(Some(serde_json::from_str(&text)?))
}

/// 解码设备返回的 devmap 文本
pub fn decode_devmap(encoded: &[u8]) -> Result<Value, DevmapError> {
    let cleaned: Vec<u8> = encoded
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace() && *b != 0)
        .collect();
    let compressed = STANDARD.decode(&cleaned)?;
    let json = miniz_oxide::inflate::decompress_to_vec_zlib(&compressed)
        .map_err(|e| DevmapError::Inflate(format!("{e:?}")))?;
    debug!(
        "Devmap: {} encoded, {} compressed, {} JSON bytes",
        encoded.len(),
        compressed.len(),
        json.len()
    );
    Ok(serde_json::from_slice(&json)?)
}

/// 从设备读取 devmap
pub fn read_device_devmap<T: Transport>(device: &mut FcpDevice<T>) -> Result<Value, DevmapError> {
    let encoded = device.devmap_read()?;
    decode_devmap(&encoded)
}

/// 加载 devmap：指定文件（或默认文件）优先，其次从设备读取
pub fn load_devmap<T: Transport>(
    device: &mut FcpDevice<T>,
    path: Option<&Path>,
    usb_pid: u16,
) -> Result<Value, DevmapError> {
    let path = path.map_or_else(|| default_devmap_file(usb_pid), Path::to_path_buf);
    if let Some(devmap) = load_devmap_file(&path)? {
        info!("Using devmap file {}", path.display());
        return Ok(devmap);
    }
    info!("Reading devmap from device");
    read_device_devmap(device)
}
