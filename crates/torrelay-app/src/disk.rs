//! Free-space probing for the download volume.

use std::path::{Path, PathBuf};

use sysinfo::Disks;
use torrelay_core::{DiskSpaceProbe, EngineError, EngineResult};

/// Probe backed by the mounted-disk table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SysinfoDiskProbe;

impl DiskSpaceProbe for SysinfoDiskProbe {
    fn available_space(&self, path: &Path) -> EngineResult<u64> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|err| EngineError::storage("disk.current_dir", err.to_string()))?
                .join(path)
        };
        let disks = Disks::new_with_refreshed_list();
        let mounts: Vec<(PathBuf, u64)> = disks
            .list()
            .iter()
            .map(|disk| (disk.mount_point().to_path_buf(), disk.available_space()))
            .collect();
        available_on(&mounts, &absolute).ok_or_else(|| {
            EngineError::storage(
                "disk.available_space",
                format!("no mounted volume backs {}", absolute.display()),
            )
        })
    }
}

/// Available bytes of the mount whose point is the longest prefix of `path`.
fn available_on(mounts: &[(PathBuf, u64)], path: &Path) -> Option<u64> {
    mounts
        .iter()
        .filter(|(mount, _)| path.starts_with(mount))
        .max_by_key(|(mount, _)| mount.components().count())
        .map(|(_, available)| *available)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_mount_prefix_wins() {
        let mounts = vec![
            (PathBuf::from("/"), 10),
            (PathBuf::from("/data"), 500),
            (PathBuf::from("/data/fast"), 7),
            (PathBuf::from("/database"), 1),
        ];
        assert_eq!(available_on(&mounts, Path::new("/data/movies")), Some(500));
        assert_eq!(available_on(&mounts, Path::new("/data/fast/x")), Some(7));
        assert_eq!(available_on(&mounts, Path::new("/srv")), Some(10));
        assert_eq!(available_on(&mounts[1..], Path::new("/srv")), None);
    }
}
