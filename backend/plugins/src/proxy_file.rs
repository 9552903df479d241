//! Locating the plugins proxy executable that hosts packaged plugins.

use std::path::{Path, PathBuf};

use tether_core::{HostError, HostResult};
use tracing::debug;

/// File name prefix of the proxy executable.
pub const PROXY_BASE_NAME: &str = "tether-plugins-proxy";

/// Proxy protocol version this host speaks.
pub const PROXY_LATEST_VERSION: u32 = 1;

/// Executable name, optionally with the version suffix (`tether-plugins-proxy1`).
pub fn proxy_file_name(version: Option<u32>) -> String {
    let base = match version {
        Some(v) => format!("{PROXY_BASE_NAME}{v}"),
        None => PROXY_BASE_NAME.to_string(),
    };
    if cfg!(windows) { format!("{base}.exe") } else { base }
}

/// Directories searched, in order: the application directory, `extra`, the
/// working directory and then `PATH`.
pub fn search_dirs(application_dir: Option<&Path>, extra: &[PathBuf]) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    match application_dir {
        Some(dir) => dirs.push(dir.to_path_buf()),
        None => {
            if let Some(dir) = std::env::current_exe().ok().and_then(|p| p.parent().map(Path::to_path_buf)) {
                dirs.push(dir);
            }
        }
    }
    dirs.extend(extra.iter().cloned());
    if let Ok(cwd) = std::env::current_dir() {
        dirs.push(cwd);
    }
    if let Some(path) = std::env::var_os("PATH") {
        dirs.extend(std::env::split_paths(&path));
    }
    dirs
}

/// The versioned name is searched everywhere before the plain one.
pub fn find_proxy_in(dirs: &[PathBuf], version: u32) -> Option<PathBuf> {
    [Some(version), None].into_iter().find_map(|v| {
        let name = proxy_file_name(v);
        dirs.iter().map(|dir| dir.join(&name)).find(|p| p.is_file())
    })
}

pub fn resolve_proxy(application_dir: Option<&Path>, extra: &[PathBuf]) -> HostResult<PathBuf> {
    let dirs = search_dirs(application_dir, extra);
    match find_proxy_in(&dirs, PROXY_LATEST_VERSION) {
        Some(path) => {
            debug!(proxy = %path.display(), "Resolved plugins proxy");
            Ok(path)
        }
        None => Err(HostError::ProxyNotFound(proxy_file_name(Some(PROXY_LATEST_VERSION)))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versioned_name_wins_over_plain() {
        let app = tempfile::tempdir().unwrap();
        let extra = tempfile::tempdir().unwrap();
        std::fs::write(app.path().join(proxy_file_name(None)), b"").unwrap();
        std::fs::write(extra.path().join(proxy_file_name(Some(3))), b"").unwrap();

        let dirs = vec![app.path().to_path_buf(), extra.path().to_path_buf()];
        let found = find_proxy_in(&dirs, 3).unwrap();
        assert_eq!(found, extra.path().join(proxy_file_name(Some(3))));

        let found = find_proxy_in(&dirs, 4).unwrap();
        assert_eq!(found, app.path().join(proxy_file_name(None)));
    }

    #[test]
    fn missing_proxy_is_reported() {
        let empty = tempfile::tempdir().unwrap();
        assert!(find_proxy_in(&[empty.path().to_path_buf()], 1).is_none());
    }

    #[test]
    fn application_dir_is_searched_first() {
        let app = tempfile::tempdir().unwrap();
        let dirs = search_dirs(Some(app.path()), &[PathBuf::from("/extra")]);
        assert_eq!(dirs[0], app.path());
        assert_eq!(dirs[1], PathBuf::from("/extra"));
    }

    #[test]
    fn file_name_carries_version() {
        let name = proxy_file_name(Some(PROXY_LATEST_VERSION));
        assert!(name.starts_with("tether-plugins-proxy1"));
    }
}
