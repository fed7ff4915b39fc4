use crate::backend::CommandRunner;
use crate::error::{Error, Result};
use async_trait::async_trait;
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub const DEFAULT_FS_TYPE: &str = "ext4";

/// Filesystem operations on the node.
#[cfg_attr(any(test, feature = "mockall"), automock)]
#[async_trait]
pub trait Mounter: Send + Sync {
    async fn is_mount_point(&self, path: &Path) -> Result<bool>;
    /// Create a filesystem on `device` unless it has one, then mount it.
    async fn format_and_mount(&self, device: &str, target: &Path, fs_type: &str, options: &[String]) -> Result<()>;
    async fn unmount(&self, target: &Path) -> Result<()>;
}

/// [`Mounter`] backed by util-linux tools.
pub struct SystemMounter {
    runner: Arc<dyn CommandRunner>,
}

impl SystemMounter {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Filesystem type on `device`, `None` when blank.
    async fn probe(&self, device: &str) -> Result<Option<String>> {
        let args = ["-p", "-s", "TYPE", "-o", "value", device].map(String::from);
        match self.runner.run("blkid", &args).await {
            Ok(out) => Ok(Some(out.trim().to_string()).filter(|t| !t.is_empty())),
            // blkid exits 2 when it finds nothing to report.
            Err(Error::Backend(msg)) if msg.contains("exit status: 2") => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[async_trait]
impl Mounter for SystemMounter {
    async fn is_mount_point(&self, path: &Path) -> Result<bool> {
        match self.runner.run("mountpoint", &["-q".to_string(), path_arg(path)]).await {
            Ok(_) => Ok(true),
            Err(Error::Backend(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn format_and_mount(&self, device: &str, target: &Path, fs_type: &str, options: &[String]) -> Result<()> {
        let fs_type = if fs_type.is_empty() { DEFAULT_FS_TYPE } else { fs_type };
        match self.probe(device).await? {
            Some(existing) if existing != fs_type => {
                info!("{} already carries {}, mounting as is", device, existing);
            }
            Some(_) => {}
            None => {
                info!("Formatting {} as {}", device, fs_type);
                self.runner.run(&format!("mkfs.{}", fs_type), &[device.to_string()]).await?;
            }
        }

        let mut args = vec!["-t".to_string(), fs_type.to_string()];
        if !options.is_empty() {
            args.push("-o".to_string());
            args.push(options.join(","));
        }
        args.push(device.to_string());
        args.push(path_arg(target));
        self.runner.run("mount", &args).await?;
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        self.runner.run("umount", &[path_arg(target)]).await?;
        Ok(())
    }
}
