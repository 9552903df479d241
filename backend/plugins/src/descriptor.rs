//! Plugin file names, platform matching and discovery filters.
//!
//! Supported names:
//! - `sample-plugin-1.2.0-linux-x64`, `sample-plugin-linux-x64.so`
//! - `sample-plugin-1.2.0.exe` (no platform segment; `.exe`/`.dll` imply `win`)
//! - `Sample.Plugin.1.2.0.nupkg` (platform-neutral package)
//!
//! Anything else is accepted as `unknown/unknown` and skips the platform check.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::proxy_file::PROXY_BASE_NAME;

pub const PLATFORM_UNKNOWN: &str = "unknown";
pub const PLATFORM_MULTI: &str = "multi";
pub const PLATFORM_WINDOWS: &str = "win";
pub const ARCH_UNKNOWN: &str = "unknown";
pub const ARCH_MSIL: &str = "msil";

static UNIVERSAL_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<name>.+?)(?:-(?P<version>\d+\.\d+\.\d+))?-(?P<platform>multi|linux|freebsd|win|android|macos|browser)-(?P<arch>msil|arm64|arm|x86|x64|wasm)(?:\.(?:so|dll|exe|dylib))?$",
    )
    .expect("static regex")
});

static VERSIONED_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<name>.+)-(?P<version>\d+\.\d+\.\d+)(?:\.(?:so|dll|exe|dylib))?$")
        .expect("static regex")
});

static PACKAGE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<name>[A-Za-z.]+)\.(?P<version>\d+\.\d+\.\d+)\.(?:so|dll|nupkg)$")
        .expect("static regex")
});

/// How a plugin file gets started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    /// Shared library loaded into the host process.
    Library,
    /// Standalone executable started as a child process.
    Executable,
    /// Package run through the plugins proxy executable.
    Package,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginDescriptor {
    pub path: PathBuf,
    pub name: String,
    pub version: Option<String>,
    pub platform: String,
    pub arch: String,
    pub kind: PluginKind,
}

impl PluginDescriptor {
    pub fn from_path(path: &Path) -> Self {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let extension = extension_of(&file_name);
        let kind = kind_for_extension(&extension);

        let (name, version, platform, arch) = if let Some(caps) = UNIVERSAL_NAME.captures(&file_name) {
            (
                caps["name"].to_string(),
                caps.name("version").map(|v| v.as_str().to_string()),
                caps["platform"].to_string(),
                caps["arch"].to_string(),
            )
        } else if let Some(caps) = PACKAGE_NAME.captures(&file_name) {
            (
                caps["name"].to_string(),
                Some(caps["version"].to_string()),
                PLATFORM_MULTI.to_string(),
                ARCH_MSIL.to_string(),
            )
        } else if let Some(caps) = VERSIONED_NAME.captures(&file_name) {
            let platform = if matches!(extension.as_str(), "exe" | "dll") {
                PLATFORM_WINDOWS
            } else {
                PLATFORM_UNKNOWN
            };
            (
                caps["name"].to_string(),
                Some(caps["version"].to_string()),
                platform.to_string(),
                ARCH_UNKNOWN.to_string(),
            )
        } else {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| file_name.clone());
            (stem, None, PLATFORM_UNKNOWN.to_string(), ARCH_UNKNOWN.to_string())
        };

        Self {
            path: path.to_path_buf(),
            name,
            version,
            platform,
            arch,
            kind,
        }
    }

    /// Whether the plugin can run on `platform`/`arch`. The check is skipped
    /// only when neither is known; otherwise both must match exactly.
    pub fn matches(&self, platform: &str, arch: &str) -> bool {
        if self.platform == PLATFORM_UNKNOWN && self.arch == ARCH_UNKNOWN {
            return true;
        }
        if self.platform == PLATFORM_MULTI {
            return true;
        }
        self.platform == platform && self.arch == arch
    }

    pub fn matches_current(&self) -> bool {
        self.matches(current_platform(), current_arch())
    }

    /// File name used as the cache key and for de-duplication.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

fn extension_of(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

fn kind_for_extension(extension: &str) -> PluginKind {
    match extension {
        "so" | "dylib" | "dll" => PluginKind::Library,
        "nupkg" => PluginKind::Package,
        _ => PluginKind::Executable,
    }
}

pub fn current_platform() -> &'static str {
    if cfg!(target_os = "windows") {
        "win"
    } else if cfg!(target_os = "linux") {
        "linux"
    } else if cfg!(target_os = "macos") {
        "macos"
    } else if cfg!(target_os = "freebsd") {
        "freebsd"
    } else if cfg!(target_os = "android") {
        "android"
    } else if cfg!(target_family = "wasm") {
        "browser"
    } else {
        PLATFORM_UNKNOWN
    }
}

pub fn current_arch() -> &'static str {
    if cfg!(target_arch = "x86_64") {
        "x64"
    } else if cfg!(target_arch = "x86") {
        "x86"
    } else if cfg!(target_arch = "aarch64") {
        "arm64"
    } else if cfg!(target_arch = "arm") {
        "arm"
    } else if cfg!(target_arch = "wasm32") {
        "wasm"
    } else {
        ARCH_UNKNOWN
    }
}

/// Name-only part of the plugin file check.
pub fn is_plugin_file_name(file_name: &str) -> bool {
    let lower = file_name.to_ascii_lowercase();
    lower.contains("plugin") && !lower.starts_with(PROXY_BASE_NAME)
}

/// Whether `path` is a plugin file this host can start.
pub fn is_plugin_file(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if !is_plugin_file_name(&file_name) {
        return false;
    }
    match kind_for_extension(&extension_of(&file_name)) {
        PluginKind::Library | PluginKind::Package => true,
        PluginKind::Executable => is_executable(path, &metadata),
    }
}

#[cfg(unix)]
fn is_executable(_path: &Path, metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o100 != 0
}

#[cfg(not(unix))]
fn is_executable(path: &Path, _metadata: &std::fs::Metadata) -> bool {
    extension_of(&path.to_string_lossy()) == "exe"
}

/// Walk the configured locations and return matching plugins.
///
/// An entry may be a plugin file itself or a directory whose direct children
/// are scanned. The first file with a given name wins.
pub fn discover(locations: &[PathBuf], platform: &str, arch: &str) -> Vec<PluginDescriptor> {
    let mut seen = HashSet::new();
    let mut found = Vec::new();
    let mut consider = |path: PathBuf| {
        if !is_plugin_file(&path) {
            return;
        }
        let descriptor = PluginDescriptor::from_path(&path);
        if !descriptor.matches(platform, arch) {
            debug!(
                file = %path.display(),
                platform = %descriptor.platform,
                arch = %descriptor.arch,
                "Skipping plugin built for another platform"
            );
            return;
        }
        if seen.insert(descriptor.file_name()) {
            found.push(descriptor);
        } else {
            debug!(file = %path.display(), "Skipping duplicate plugin file");
        }
    };

    for location in locations {
        if location.is_file() {
            consider(location.clone());
            continue;
        }
        let entries = match std::fs::read_dir(location) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(directory = %location.display(), error = %e, "Plugins directory not readable");
                continue;
            }
        };
        let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
        paths.sort();
        for path in paths {
            consider(path);
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(name: &str) -> PluginDescriptor {
        PluginDescriptor::from_path(Path::new(name))
    }

    #[test]
    fn parses_universal_names() {
        let d = parse("/opt/sample-plugin-1.2.0-linux-x64");
        assert_eq!(d.name, "sample-plugin");
        assert_eq!(d.version.as_deref(), Some("1.2.0"));
        assert_eq!((d.platform.as_str(), d.arch.as_str()), ("linux", "x64"));
        assert_eq!(d.kind, PluginKind::Executable);

        let d = parse("myplugin-linux-arm64.so");
        assert_eq!(d.name, "myplugin");
        assert_eq!(d.version, None);
        assert_eq!(d.arch, "arm64");
        assert_eq!(d.kind, PluginKind::Library);
    }

    #[test]
    fn windows_extension_implies_platform() {
        let d = parse("sample-plugin-0.3.1.exe");
        assert_eq!(d.platform, "win");
        assert_eq!(d.arch, ARCH_UNKNOWN);
        // The platform is known but the arch is not, so nothing matches.
        assert!(!d.matches("linux", "x64"));
        assert!(!d.matches("win", "x64"));
        assert!(!d.matches("win", ARCH_UNKNOWN));
    }

    #[test]
    fn packages_are_platform_neutral() {
        let d = parse("Sample.Plugin.1.0.0.nupkg");
        assert_eq!(d.name, "Sample.Plugin");
        assert_eq!((d.platform.as_str(), d.arch.as_str()), (PLATFORM_MULTI, ARCH_MSIL));
        assert_eq!(d.kind, PluginKind::Package);
        assert!(d.matches("linux", "arm64"));
    }

    #[test]
    fn unparseable_names_skip_platform_check() {
        let d = parse("weird_plugin");
        assert_eq!(d.name, "weird_plugin");
        assert!(d.matches("freebsd", "x86"));
    }

    #[test]
    fn platform_filter() {
        let d = parse("myplugin-linux-x64.so");
        assert!(d.matches("linux", "x64"));
        assert!(!d.matches("win", "x64"));
        assert!(!d.matches("linux", "arm64"));
    }

    #[test]
    fn half_known_target_is_compared_strictly() {
        let mut d = parse("myplugin-linux-x64.so");
        d.arch = ARCH_UNKNOWN.to_string();
        assert!(!d.matches("linux", "x64"));

        d.platform = PLATFORM_UNKNOWN.to_string();
        d.arch = "x64".to_string();
        assert!(!d.matches("linux", "x64"));

        d.arch = ARCH_UNKNOWN.to_string();
        assert!(d.matches("linux", "x64"));
    }

    #[test]
    fn file_name_filter() {
        assert!(is_plugin_file_name("Sample-Plugin-linux-x64"));
        assert!(!is_plugin_file_name("sample-linux-x64"));
        assert!(!is_plugin_file_name("tether-plugins-proxy-linux-x64"));
    }

    #[cfg(unix)]
    #[test]
    fn discovery_requires_exec_bit_and_dedupes() {
        use std::os::unix::fs::PermissionsExt;

        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let write = |dir: &Path, name: &str, mode: u32| {
            let path = dir.join(name);
            std::fs::write(&path, b"#!/bin/sh\n").unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
            path
        };
        write(first.path(), "alpha-plugin-linux-x64", 0o755);
        write(first.path(), "beta-plugin-linux-x64", 0o644);
        write(first.path(), "readme.txt", 0o755);
        write(second.path(), "alpha-plugin-linux-x64", 0o755);
        let gamma = write(second.path(), "gamma-plugin-win-x64.exe", 0o755);

        let found = discover(
            &[first.path().to_path_buf(), second.path().to_path_buf(), gamma],
            "linux",
            "x64",
        );
        let names: Vec<_> = found.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["alpha-plugin"]);
        assert!(found[0].path.starts_with(first.path()));
    }
}
