//! 单例文件锁
//!
//! 每张声卡只允许一个 fcp-server 实例，避免两个进程绑定同一个 socket。

use fs4::fs_std::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// 锁文件名
pub fn lock_file_name(card: u32) -> String {
    format!("fcp-server-{card}.lock")
}

/// 单例文件锁（进程退出或崩溃时由内核释放）
pub struct SingletonLock {
    file: File,
    path: PathBuf,
}

impl SingletonLock {
    /// 尝试获取排他锁（非阻塞），成功后写入当前 PID
    pub fn try_lock(lock_path: impl AsRef<Path>) -> Result<Self, io::Error> {
        let path = lock_path.as_ref();

        // 拿到锁之前不能截断
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .read(true)
            .open(path)?;

        if !file.try_lock_exclusive()? {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "fcp-server is already running for this card (locked)",
            ));
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(&file, "{}", std::process::id())?;
        file.sync_all()?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SingletonLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_writes_pid() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join(lock_file_name(1));

        let lock = SingletonLock::try_lock(&lock_path).unwrap();
        assert_eq!(lock.path(), lock_path);
        drop(lock);

        let content = std::fs::read_to_string(&lock_path).unwrap();
        assert!(content.contains(&std::process::id().to_string()));

        // 释放后可以再次获取
        let lock = SingletonLock::try_lock(&lock_path).unwrap();
        drop(lock);
    }

    #[test]
    fn test_lock_file_name() {
        assert_eq!(lock_file_name(2), "fcp-server-2.lock");
    }
}
