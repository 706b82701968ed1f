//! 临时写入与原子替换的辅助方法。

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

/// 可用于原子替换的临时文件封装。
///
/// 未调用 [`AtomicFile::finalize`] 就被丢弃时（写入出错或请求被取消），
/// 临时文件会在 `Drop` 中被删除，目标路径上不会出现半截文件。
pub struct AtomicFile {
    target: PathBuf,
    temp_path: PathBuf,
    file: Option<File>,
    committed: bool,
}

impl AtomicFile {
    /// 在目标路径同目录创建临时文件。
    pub async fn new(target: &Path) -> io::Result<Self> {
        let parent = target.parent().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "invalid target path")
        })?;
        let base = target
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| "file".into());
        let temp_name = format!(".{base}.tmp.{}", Uuid::new_v4());
        let temp_path = parent.join(temp_name);
        let file = File::create(&temp_path).await?;
        Ok(Self {
            target: target.to_path_buf(),
            temp_path,
            file: Some(file),
            committed: false,
        })
    }

    /// 返回临时文件的可写句柄。
    pub fn file_mut(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("temp file already closed"))
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// 同步数据并关闭句柄，之后仍可调整临时文件权限。
    pub async fn sync(&mut self) -> io::Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all().await?;
        }
        Ok(())
    }

    /// 原子替换目标文件（目标已存在时覆盖）。
    pub async fn finalize(mut self) -> io::Result<PathBuf> {
        self.sync().await?;

        if let Err(err) = fs::rename(&self.temp_path, &self.target).await {
            #[cfg(windows)]
            {
                if fs::remove_file(&self.target).await.is_ok() {
                    fs::rename(&self.temp_path, &self.target).await?;
                } else {
                    return Err(err);
                }
            }
            #[cfg(not(windows))]
            {
                return Err(err);
            }
        }
        self.committed = true;

        if let Some(parent) = self.target.parent() {
            let _ = sync_dir(parent).await;
        }

        Ok(self.target.clone())
    }
}

impl Drop for AtomicFile {
    fn drop(&mut self) {
        if !self.committed {
            drop(self.file.take());
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

/// 接收请求体时使用的暂存文件，丢弃时删除。
///
/// 上传内容先逐块写入这里以得到实际长度，再交给准入流程读取。
pub struct SpoolFile {
    path: PathBuf,
    file: Option<File>,
}

impl SpoolFile {
    /// 在 `dir` 下创建隐藏的暂存文件（可读写）。
    pub async fn create_in(dir: &Path) -> io::Result<Self> {
        let path = dir.join(format!(".spool.{}", Uuid::new_v4()));
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    pub fn file_mut(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("spool file already closed"))
    }

    /// 刷新写入并回到文件开头，准备读取。
    pub async fn rewind(&mut self) -> io::Result<()> {
        let file = self.file_mut()?;
        file.flush().await?;
        file.seek(SeekFrom::Start(0)).await?;
        Ok(())
    }
}

impl Drop for SpoolFile {
    fn drop(&mut self) {
        drop(self.file.take());
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}

#[cfg(not(unix))]
async fn sync_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}
