// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Filesystem usage of the disk queue directory.
//!
//! The disk queue polls [`DiskUsageProbe::used_percent`] on its probe interval and
//! stops accepting records once the filesystem holding its directory is fuller
//! than the configured threshold.
//!
//! - **Unix/Linux/macOS**: `statfs(2)` via `nix::sys::statfs`
//! - **Windows**: not supported (returns an error, the queue keeps accepting)

use std::io;
use std::path::Path;

/// Source of the used-space percentage for a path.
pub trait DiskUsageProbe: Send + Sync {
    /// Percentage (0.0 to 100.0) of the filesystem holding `path` that is in use.
    fn used_percent(&self, path: &Path) -> io::Result<f64>;
}

/// Probe backed by the `statfs` system call.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatfsProbe;

impl DiskUsageProbe for StatfsProbe {
    fn used_percent(&self, path: &Path) -> io::Result<f64> {
        let (_, blocks, bavail) = statfs_info(path)?;
        if blocks <= 0.0 {
            return Ok(0.0);
        }
        // Available blocks (not free blocks): root-reserved space counts as used
        Ok((blocks - bavail) / blocks * 100.0)
    }
}

/// Returns `(block_size, total_blocks, available_blocks)` for the filesystem at `path`.
#[cfg(not(target_os = "windows"))]
#[allow(clippy::cast_lossless, clippy::cast_precision_loss)]
pub fn statfs_info(path: &Path) -> io::Result<(f64, f64, f64)> {
    let stat = nix::sys::statfs::statfs(path).map_err(io::Error::from)?;
    Ok((
        stat.block_size() as f64,
        stat.blocks() as f64,
        stat.blocks_available() as f64,
    ))
}

#[cfg(target_os = "windows")]
pub fn statfs_info(_path: &Path) -> io::Result<(f64, f64, f64)> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Cannot get filesystem usage on Windows",
    ))
}
