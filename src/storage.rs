//! 上传暂存目录：初始化、流式落盘与权限收紧。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::atomic::{AtomicFile, SpoolFile};

#[derive(Clone, Debug)]
pub struct UploadStore {
    root: PathBuf,
}

impl UploadStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// 确保暂存目录存在（递归创建）。
    pub async fn ensure_root(&self) -> io::Result<()> {
        if fs::metadata(&self.root).await.is_err() {
            info!(path = ?self.root, "creating staging directory");
        }
        fs::create_dir_all(&self.root).await
    }

    /// 在暂存目录下创建接收请求体用的暂存文件。
    pub async fn spool(&self) -> io::Result<SpoolFile> {
        SpoolFile::create_in(&self.root).await
    }

    /// 将输入流写入暂存目录下的 `name`，已存在则覆盖。
    ///
    /// `name` 必须是单一文件名，调用方负责排除路径分隔符。
    pub async fn persist<R>(&self, name: &str, reader: &mut R) -> io::Result<PathBuf>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.persist_with(name, reader, harden_permissions).await
    }

    /// 同 [`UploadStore::persist`]，权限收紧步骤由 `harden` 提供。
    ///
    /// `harden` 失败只记录告警，不影响写入结果。
    async fn persist_with<R, H, Fut>(
        &self,
        name: &str,
        reader: &mut R,
        harden: H,
    ) -> io::Result<PathBuf>
    where
        R: AsyncRead + Unpin + ?Sized,
        H: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = io::Result<()>>,
    {
        let target = self.root.join(name);
        let mut atomic = AtomicFile::new(&target).await?;
        let file = atomic.file_mut()?;
        let written = tokio::io::copy(reader, file).await?;
        file.flush().await?;
        atomic.sync().await?;

        if let Err(err) = harden(atomic.temp_path().to_path_buf()).await {
            warn!(path = ?target, error = %err, "failed to restrict upload permissions");
        }

        let path = atomic.finalize().await?;
        debug!(path = ?path, bytes = written, "upload persisted");
        Ok(path)
    }
}

/// 将文件权限收紧为仅属主可读。
#[cfg(unix)]
async fn harden_permissions(path: PathBuf) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(&path, std::fs::Permissions::from_mode(0o400)).await
}

#[cfg(not(unix))]
async fn harden_permissions(_path: PathBuf) -> io::Result<()> {
    Ok(())
}
