//! Cell 写锁（文件系统锁文件）
//!
//! 每个 cell 一个锁文件，位于主 cgroup 的 cell 目录下
//! （`<table>.lock`），以原子创建实现互斥。读取不加锁。

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use log::debug;

use crate::common::{Result, TableError};

/// 已持有的 cell 锁；`release` 删除锁文件
#[derive(Debug)]
pub struct CellLock {
    path: PathBuf,
}

/// 获取锁文件。
///
/// `retries < 0` 表示按 1 秒间隔无限等待；`0` 只尝试一次；`n > 0`
/// 失败后最多再重试 n 次（同样按 1 秒间隔）。
pub fn acquire(path: &Path, retries: i32) -> Result<CellLock> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut left = retries;
    loop {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(_) => {
                debug!("acquired lockfile {}", path.display());
                return Ok(CellLock { path: path.to_path_buf() });
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if left == 0 {
                    return Err(TableError::LockContention(format!(
                        "lockfile {} is held by another writer", path.display()
                    )));
                }
                if left > 0 {
                    left -= 1;
                }
                thread::sleep(Duration::from_secs(1));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

impl CellLock {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(self) -> Result<()> {
        fs::remove_file(&self.path)?;
        debug!("released lockfile {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_and_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cells/042/064/static/stars.lock");

        let lock = acquire(&path, 0).unwrap();
        assert!(path.is_file());
        // 已被持有：retries=0 立即失败
        assert!(matches!(acquire(&path, 0), Err(TableError::LockContention(_))));

        lock.release().unwrap();
        assert!(!path.exists());
        // 释放后可再次获取
        acquire(&path, 0).unwrap().release().unwrap();
    }

    #[test]
    fn retry_count_is_bounded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stars.lock");
        let _held = acquire(&path, 0).unwrap();

        let started = std::time::Instant::now();
        assert!(acquire(&path, 1).is_err());
        // 一次重试 ≈ 1 秒轮询
        assert!(started.elapsed() >= Duration::from_secs(1));
    }
}
