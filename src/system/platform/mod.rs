use std::path::PathBuf;

pub trait PlatformExtensions {
    /// procfs root holding `net/tcp`, `net/udp` and their v6 twins.
    fn connection_table_root() -> Option<PathBuf>;
    fn load_average_supported() -> bool;
}

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
mod other;
#[cfg(target_os = "windows")]
mod windows;

#[cfg(target_os = "linux")]
use linux as platform_impl;
#[cfg(target_os = "macos")]
use macos as platform_impl;
#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
use other as platform_impl;
#[cfg(target_os = "windows")]
use windows as platform_impl;

pub fn connection_table_root() -> Option<PathBuf> {
    platform_impl::Platform::connection_table_root()
}

pub fn load_average_supported() -> bool {
    platform_impl::Platform::load_average_supported()
}

fn release_os(os: &str) -> Option<&'static str> {
    Some(match os {
        "linux" => "linux",
        "macos" => "macos",
        "windows" => "windows",
        "freebsd" => "freebsd",
        "openbsd" => "openbsd",
        _ => return None,
    })
}

fn release_arch(arch: &str) -> Option<&'static str> {
    Some(match arch {
        "x86_64" => "64",
        "x86" => "32",
        "aarch64" => "arm64-v8a",
        "arm" => "arm32-v7a",
        "riscv64" => "riscv64",
        "s390x" => "s390x",
        "mips64" => "mips64",
        _ => return None,
    })
}

/// Release archive published for an OS/arch pair, using the names from
/// `std::env::consts`. `None` when no archive is published for it.
pub fn release_asset_name(os: &str, arch: &str) -> Option<String> {
    let os = release_os(os)?;
    let arch = release_arch(arch)?;
    Some(format!("Xray-{os}-{arch}.zip"))
}

pub fn current_release_asset_name() -> Option<String> {
    release_asset_name(std::env::consts::OS, std::env::consts::ARCH)
}
