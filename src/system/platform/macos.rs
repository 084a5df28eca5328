use std::path::PathBuf;

use super::PlatformExtensions;

pub struct Platform;

impl PlatformExtensions for Platform {
    fn connection_table_root() -> Option<PathBuf> {
        // No procfs; connection tables live behind sysctl.
        None
    }

    fn load_average_supported() -> bool {
        true
    }
}
