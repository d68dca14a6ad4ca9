//! Private root filesystem for one execution
//!
//! The jail is an ordinary directory tree of empty mount points built by
//! the judge. The child binds the host directories onto it inside its own
//! mount namespace and pivots into it, so the host never sees the mounts.
//! Work directories are mirrored at their host paths, which keeps resolved
//! toolchain commands valid inside the jail.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use themis_common::{AppError, AppResult};

use crate::constants::{JAIL_DEVICES, JAIL_SYSTEM_PATHS};

/// One bind mount performed inside the child
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BindMount {
    pub source: CString,
    /// Mount point under the jail, as seen before the pivot
    pub target: CString,
    pub writable: bool,
}

/// A host directory the program works in
#[derive(Debug, Clone, Copy)]
pub(crate) struct WorkDir<'a> {
    pub path: &'a Path,
    pub writable: bool,
}

#[derive(Debug)]
pub(crate) struct Jail {
    dir: TempDir,
    mounts: Vec<BindMount>,
}

impl Jail {
    /// Lay out a jail under `parent` for the given work directories.
    pub fn build(parent: &Path, work_dirs: &[WorkDir<'_>]) -> AppResult<Self> {
        let dir = tempfile::Builder::new()
            .prefix("jail-")
            .tempdir_in(parent)
            .map_err(|e| AppError::SandboxError(format!("Failed to create jail: {e}")))?;
        // Pooled uids must be able to traverse the root
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755))?;

        let mut jail = Self {
            dir,
            mounts: Vec::new(),
        };
        for path in JAIL_SYSTEM_PATHS {
            jail.mirror_system(Path::new(path))?;
        }
        for device in JAIL_DEVICES {
            let device = Path::new(device);
            if device.exists() {
                jail.mirror_file(device)?;
            }
        }
        std::fs::create_dir_all(jail.dir.path().join("tmp"))?;
        for work in work_dirs {
            let target = jail.inside(work.path);
            std::fs::create_dir_all(&target)?;
            jail.mounts.push(BindMount {
                source: c_path(work.path)?,
                target: c_path(&target)?,
                writable: work.writable,
            });
        }

        Ok(jail)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn mounts(&self) -> &[BindMount] {
        &self.mounts
    }

    /// Where an absolute host path lives under the jail.
    fn inside(&self, host: &Path) -> PathBuf {
        self.dir.path().join(host.strip_prefix("/").unwrap_or(host))
    }

    fn mirror_system(&mut self, host: &Path) -> AppResult<()> {
        let Ok(metadata) = std::fs::symlink_metadata(host) else {
            return Ok(());
        };
        let target = self.inside(host);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if metadata.file_type().is_symlink() {
            // Merged-usr layouts: /bin -> usr/bin
            std::os::unix::fs::symlink(std::fs::read_link(host)?, &target)?;
            return Ok(());
        }
        if metadata.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::File::create(&target)?;
        }
        self.mounts.push(BindMount {
            source: c_path(host)?,
            target: c_path(&target)?,
            writable: false,
        });
        Ok(())
    }

    fn mirror_file(&mut self, host: &Path) -> AppResult<()> {
        let target = self.inside(host);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::File::create(&target)?;
        self.mounts.push(BindMount {
            source: c_path(host)?,
            target: c_path(&target)?,
            writable: true,
        });
        Ok(())
    }
}

pub(crate) fn c_path(path: &Path) -> AppResult<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| AppError::SandboxError(format!("Path contains NUL: {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_dirs_are_mirrored_at_host_paths() {
        let parent = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir_in(parent.path()).unwrap();

        let jail = Jail::build(
            parent.path(),
            &[WorkDir {
                path: work.path(),
                writable: true,
            }],
        )
        .unwrap();

        let mirrored = jail.inside(work.path());
        assert!(mirrored.is_dir());
        assert!(mirrored.starts_with(jail.root()));
        assert!(jail.root().join("tmp").is_dir());

        let last = jail.mounts().last().unwrap();
        assert_eq!(last.source, c_path(work.path()).unwrap());
        assert_eq!(last.target, c_path(&mirrored).unwrap());
        assert!(last.writable);
    }

    #[test]
    fn test_system_paths_are_read_only() {
        let parent = tempfile::tempdir().unwrap();
        let jail = Jail::build(parent.path(), &[]).unwrap();

        let usr = jail
            .mounts()
            .iter()
            .find(|mount| mount.source.as_bytes() == b"/usr")
            .unwrap();
        assert!(!usr.writable);
        assert!(jail.root().join("usr").is_dir());

        let null = jail
            .mounts()
            .iter()
            .find(|mount| mount.source.as_bytes() == b"/dev/null")
            .unwrap();
        assert!(null.writable);
        assert!(jail.root().join("dev/null").is_file());
    }

    #[test]
    fn test_jail_is_removed_on_drop() {
        let parent = tempfile::tempdir().unwrap();
        let jail = Jail::build(parent.path(), &[]).unwrap();
        let root = jail.root().to_path_buf();
        drop(jail);
        assert!(!root.exists());
    }
}
