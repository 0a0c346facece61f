//! 状态记录发布

use crate::error::ServerError;
use fcp_protocol::status::ServerStatus;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// 写入状态记录（先写临时文件再 rename）
pub fn publish(path: &Path, status: &ServerStatus) -> Result<(), ServerError> {
    let to_status_error = |source: std::io::Error| ServerError::Status {
        path: path.to_path_buf(),
        source,
    };
    let json = serde_json::to_vec_pretty(status)
        .map_err(|e| to_status_error(std::io::Error::other(e)))?;

    let tmp = tmp_path(path);
    std::fs::write(&tmp, json).map_err(to_status_error)?;
    std::fs::rename(&tmp, path).map_err(to_status_error)?;
    debug!("Published status to {}", path.display());
    Ok(())
}

/// 删除状态记录（文件不存在时忽略）
pub fn remove(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {},
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
