use spark_socket_core::{FileMode, GroupId, Operation, Result, SocketError};
use std::fs::{self, Permissions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// 套接字文件守卫：认领路径、应用权限与属组，被丢弃时删除文件。
///
/// # 教案级注释
///
/// ## 逻辑（How）
/// 1. [`SocketFile::claim`] 删除路径上遗留的旧文件（上次异常退出留下的套接字文件会导致 `EADDRINUSE`）；
/// 2. 绑定由调用方完成，随后 [`SocketFile::configure`] 设置权限位并（可选）修改属组；
/// 3. 守卫随监听器或客户端 IO 一起释放，`Drop` 中删除文件，删除失败只记录日志。
///
/// ## 契约（What）
/// - 权限或属组设置失败时返回 `Operation::CONFIGURE` 错误，守卫被丢弃时文件随之删除；
/// - 组 ID 的上限已在配置构造期校验，此处不再重复。
#[derive(Debug)]
pub(crate) struct SocketFile {
    path: PathBuf,
}

impl SocketFile {
    pub(crate) fn claim(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(
                    target: "spark_socket::unix",
                    path = %path.display(),
                    "removed stale socket file"
                );
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(SocketError::io(Operation::BIND, err)),
        }
        Ok(Self { path })
    }

    pub(crate) fn configure(&self, mode: FileMode, group: Option<GroupId>) -> Result<()> {
        fs::set_permissions(&self.path, Permissions::from_mode(mode.bits()))
            .map_err(|err| SocketError::io(Operation::CONFIGURE, err))?;
        if let Some(group) = group {
            std::os::unix::fs::chown(&self.path, None, Some(group.get()))
                .map_err(|err| SocketError::io(Operation::CONFIGURE, err))?;
        }
        Ok(())
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SocketFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(
                target: "spark_socket::unix",
                path = %self.path.display(),
                %err,
                "failed to remove socket file"
            ),
        }
    }
}

/// 在系统临时目录下生成进程内唯一的套接字路径。
pub(crate) fn unique_temp_path(tag: &str) -> PathBuf {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    let sequence = NEXT.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "spark-socket-{tag}-{}-{sequence}.sock",
        std::process::id()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;

    #[test]
    fn claim_removes_stale_file_and_drop_cleans_up() {
        let path = unique_temp_path("file-test");
        fs::write(&path, b"stale").unwrap();
        let guard = SocketFile::claim(&path).unwrap();
        assert!(!path.exists(), "认领时必须删除遗留文件");

        fs::write(&path, b"bound").unwrap();
        guard
            .configure(FileMode::new(0o600), None)
            .expect("文件所有者可以设置权限");
        assert_eq!(fs::metadata(&path).unwrap().mode() & 0o777, 0o600);
        drop(guard);
        assert!(!path.exists(), "守卫释放后文件必须被删除");
    }

    #[test]
    fn paths_are_unique() {
        assert_ne!(unique_temp_path("a"), unique_temp_path("a"));
    }
}
