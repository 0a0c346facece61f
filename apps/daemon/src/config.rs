//! 服务端配置

use crate::singleton::lock_file_name;
use fcp_driver::devmap::default_devmap_file;
use fcp_protocol::status::{socket_file_name, status_file_name};
use std::path::{Path, PathBuf};

/// 服务端配置
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// ALSA 声卡号
    pub card: u32,
    /// socket、状态记录和锁文件所在目录
    pub socket_dir: PathBuf,
    /// devmap JSON 路径（None 时按 PID 取默认文件名）
    pub devmap_path: Option<PathBuf>,
    /// 锁文件路径（None 时放在 socket 目录）
    pub lock_file: Option<PathBuf>,
}

impl ServerConfig {
    pub fn new(card: u32) -> Self {
        Self {
            card,
            socket_dir: default_socket_dir(),
            devmap_path: None,
            lock_file: None,
        }
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket_dir.join(socket_file_name(self.card))
    }

    pub fn status_path(&self) -> PathBuf {
        self.socket_dir.join(status_file_name(self.card))
    }

    pub fn lock_path(&self) -> PathBuf {
        self.lock_file
            .clone()
            .unwrap_or_else(|| self.socket_dir.join(lock_file_name(self.card)))
    }

    /// devmap 文件路径
    pub fn devmap_path(&self, pid: u16) -> PathBuf {
        self.devmap_path
            .clone()
            .unwrap_or_else(|| default_devmap_file(pid))
    }
}

/// 默认 socket 目录
///
/// 1. `RUNTIME_DIRECTORY`（systemd `RuntimeDirectory=`）
/// 2. `XDG_RUNTIME_DIR`
/// 3. `/tmp`
pub fn default_socket_dir() -> PathBuf {
    socket_dir_from(std::env::var_os("RUNTIME_DIRECTORY").map(PathBuf::from))
}

fn socket_dir_from(runtime_directory: Option<PathBuf>) -> PathBuf {
    runtime_directory
        .filter(|dir| !dir.as_os_str().is_empty())
        .or_else(dirs::runtime_dir)
        .unwrap_or_else(|| Path::new("/tmp").to_path_buf())
}
