//! Per-attempt scratch directories.

use std::io;
use std::path::{Path, PathBuf};

use tempfile::{Builder, TempDir};
use tracing::debug;

/// Uniquely named working directory, removed when dropped.
#[derive(Debug)]
pub struct ScratchDir {
    dir: TempDir,
}

impl ScratchDir {
    /// Create `<root>/<label>-XXXXXX`, creating `root` if needed.
    pub fn create(root: &Path, label: &str) -> io::Result<Self> {
        std::fs::create_dir_all(root)?;
        let dir = Builder::new()
            .prefix(&format!("{}-", label))
            .tempdir_in(root)?;
        debug!("Created scratch dir {}", dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `contents` to `name` inside the directory.
    pub async fn write_file(&self, name: &str, contents: &[u8]) -> io::Result<PathBuf> {
        let path = self.dir.path().join(name);
        tokio::fs::write(&path, contents).await?;
        Ok(path)
    }

    /// Hand the directory over to the unprivileged sandbox user.
    pub fn grant(&self, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
        if uid.is_none() && gid.is_none() {
            return Ok(());
        }
        let chown = |path: &Path| std::os::unix::fs::chown(path, uid, gid);
        chown(self.dir.path())?;
        for entry in std::fs::read_dir(self.dir.path())? {
            chown(&entry?.path())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scratch_dir_is_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::create(&root.path().join("nested"), "job-1").unwrap();
        let path = scratch.path().to_path_buf();

        let file = scratch.write_file("main.sh", b"echo hi\n").await.unwrap();
        assert!(file.exists());
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("job-1-"));

        drop(scratch);
        assert!(!path.exists());
    }

    #[test]
    fn test_scratch_dirs_are_unique() {
        let root = tempfile::tempdir().unwrap();
        let a = ScratchDir::create(root.path(), "job-7").unwrap();
        let b = ScratchDir::create(root.path(), "job-7").unwrap();
        assert_ne!(a.path(), b.path());
    }
}
