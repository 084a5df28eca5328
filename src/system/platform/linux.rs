use std::path::PathBuf;

use super::PlatformExtensions;

pub struct Platform;

impl PlatformExtensions for Platform {
    fn connection_table_root() -> Option<PathBuf> {
        // HOST_PROC lets a containerized agent read the host's procfs.
        let root = std::env::var_os("HOST_PROC")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/proc"));
        Some(root)
    }

    fn load_average_supported() -> bool {
        true
    }
}
