//! Disk usage for the volume holding the hosted root.

use std::path::Path;

use anyhow::{bail, Result};
use sysinfo::Disks;

/// Returns `(free_bytes, total_bytes)` for the mounted volume whose mount
/// point is the longest prefix of `root`. `root` must be absolute.
pub fn volume_space(root: &Path) -> Result<(u64, u64)> {
    let disks = Disks::new_with_refreshed_list();
    let mut best: Option<(usize, u64, u64)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if !root.starts_with(mount) {
            continue;
        }
        let depth = mount.components().count();
        if best.map_or(true, |(current, _, _)| depth >= current) {
            best = Some((depth, disk.available_space(), disk.total_space()));
        }
    }
    match best {
        Some((_, free, total)) => Ok((free, total)),
        None => bail!("no mounted volume found for {}", root.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_the_volume_for_an_existing_directory() {
        let cwd = std::env::current_dir().unwrap();
        let (free, total) = volume_space(&cwd).unwrap();
        assert!(total > 0);
        assert!(free <= total);
    }
}
