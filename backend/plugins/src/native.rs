//! In-process plugins shipped as shared libraries.
//!
//! A library exports [`ENTRY_SYMBOL`] with the C signature
//! `int32_t tether_plugin_main(const TetherEntryArgs *args)`. The struct holds
//! the server endpoint, the token, the host pid (`uint32_t`) and the minimum
//! log level. The library is expected to connect back to the host and
//! register, exactly like an executable plugin. The entry point runs on its own thread because it usually does not
//! return until the plugin shuts down.

use std::ffi::{CString, c_char};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use tether_core::protocol::LogLevel;
use tether_core::{HostError, HostResult};
use tracing::{debug, info, warn};

use crate::descriptor::current_platform;

/// Exported entry point every native plugin provides.
pub const ENTRY_SYMBOL: &[u8] = b"tether_plugin_main\0";

/// What the entry point receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryArgs {
    pub server_endpoint: String,
    pub token: String,
    /// Pid of the host. Libraries share it, but the entry point receives it
    /// the same way executables do.
    pub parent_pid: u32,
    pub min_log_level: LogLevel,
}

impl EntryArgs {
    pub fn new(server_endpoint: String, token: String, min_log_level: LogLevel) -> Self {
        Self {
            server_endpoint,
            token,
            parent_pid: std::process::id(),
            min_log_level,
        }
    }
}

#[repr(C)]
struct RawEntryArgs {
    server_endpoint: *const c_char,
    token: *const c_char,
    parent_pid: u32,
    min_log_level: *const c_char,
}

type EntryFn = unsafe extern "C" fn(*const RawEntryArgs) -> i32;

/// A loaded library whose entry point can be started.
pub trait NativeLibrary: Send + Sync {
    fn path(&self) -> &Path;

    /// Invoke the entry point on a dedicated thread.
    fn start(&self, args: &EntryArgs) -> HostResult<JoinHandle<()>>;
}

/// Platform capability for loading and unloading plugin libraries.
pub trait PlatformLibraryLoader: Send + Sync {
    fn load(&self, path: &Path) -> HostResult<Box<dyn NativeLibrary>>;

    /// Whether freeing a library handle is safe on this platform.
    fn supports_unload(&self) -> bool;

    /// Free `library`, or leak it where unloading is unsafe.
    fn unload(&self, library: Box<dyn NativeLibrary>) {
        if self.supports_unload() {
            debug!(library = %library.path().display(), "Unloading plugin library");
            drop(library);
        } else {
            debug!(library = %library.path().display(), "Keeping plugin library mapped");
            std::mem::forget(library);
        }
    }
}

/// Unloading is only done where it is known not to crash the host. Plugin
/// threads may still run code from the library after shutdown on the other
/// platforms.
pub fn unload_supported(platform: &str) -> bool {
    matches!(platform, "win")
}

/// [`PlatformLibraryLoader`] backed by `libloading`.
pub struct DynamicLibraryLoader {
    unload: bool,
}

impl DynamicLibraryLoader {
    pub fn new() -> Self {
        Self::for_platform(current_platform())
    }

    pub fn for_platform(platform: &str) -> Self {
        Self {
            unload: unload_supported(platform),
        }
    }
}

impl Default for DynamicLibraryLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformLibraryLoader for DynamicLibraryLoader {
    fn load(&self, path: &Path) -> HostResult<Box<dyn NativeLibrary>> {
        // SAFETY: loading a shared library runs its initialisers. Only files
        // from the configured plugin directories reach this point.
        let library = unsafe { libloading::Library::new(path) }.map_err(|e| HostError::PluginLoad {
            plugin: path.display().to_string(),
            message: format!("cannot load library: {e}"),
        })?;
        info!(library = %path.display(), "Loaded plugin library");
        Ok(Box::new(LoadedLibrary {
            path: path.to_path_buf(),
            library: Arc::new(library),
        }))
    }

    fn supports_unload(&self) -> bool {
        self.unload
    }
}

struct LoadedLibrary {
    path: PathBuf,
    library: Arc<libloading::Library>,
}

fn c_string(what: &str, value: &str) -> HostResult<CString> {
    CString::new(value).map_err(|_| HostError::Internal(format!("{what} contains a NUL byte")))
}

impl NativeLibrary for LoadedLibrary {
    fn path(&self) -> &Path {
        &self.path
    }

    fn start(&self, args: &EntryArgs) -> HostResult<JoinHandle<()>> {
        // SAFETY: the symbol type matches the documented entry signature.
        let entry: EntryFn = unsafe {
            let symbol = self
                .library
                .get::<EntryFn>(ENTRY_SYMBOL)
                .map_err(|e| HostError::PluginLoad {
                    plugin: self.path.display().to_string(),
                    message: format!("entry point not found: {e}"),
                })?;
            *symbol
        };

        let endpoint = c_string("server endpoint", &args.server_endpoint)?;
        let token = c_string("token", &args.token)?;
        let level = c_string("log level", args.min_log_level.as_arg())?;
        let parent_pid = args.parent_pid;
        let library = Arc::clone(&self.library);
        let label = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        std::thread::Builder::new()
            .name(format!("plugin-{label}"))
            .spawn(move || {
                let raw = RawEntryArgs {
                    server_endpoint: endpoint.as_ptr(),
                    token: token.as_ptr(),
                    parent_pid,
                    min_log_level: level.as_ptr(),
                };
                // SAFETY: `raw` and the strings it points to outlive the call,
                // and `library` keeps the code mapped.
                let code = unsafe { entry(&raw) };
                if code == 0 {
                    debug!(plugin = %label, "Plugin entry point returned");
                } else {
                    warn!(plugin = %label, code, "Plugin entry point failed");
                }
                drop(library);
            })
            .map_err(HostError::Transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn unload_decision_table() {
        let table = [
            ("win", true),
            ("linux", false),
            ("macos", false),
            ("freebsd", false),
            ("android", false),
            ("multi", false),
            ("unknown", false),
        ];
        for (platform, expected) in table {
            assert_eq!(unload_supported(platform), expected, "{platform}");
            assert_eq!(DynamicLibraryLoader::for_platform(platform).supports_unload(), expected);
        }
    }

    #[test]
    fn entry_args_carry_the_host_pid() {
        let args = EntryArgs::new("tcp://127.0.0.1:1".into(), "tok".into(), LogLevel::Debug);
        assert_eq!(args.parent_pid, std::process::id());
        assert_eq!(args.token, "tok");
        assert_eq!(args.min_log_level, LogLevel::Debug);
    }

    #[test]
    fn missing_library_is_a_load_failure() {
        let loader = DynamicLibraryLoader::new();
        let err = loader
            .load(Path::new("/definitely/not/here/libplugin.so"))
            .err()
            .unwrap();
        assert_eq!(err.kind(), tether_core::ErrorKind::PluginLoadFailure);
    }

    struct Tracked {
        dropped: Arc<AtomicBool>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    impl NativeLibrary for Tracked {
        fn path(&self) -> &Path {
            Path::new("tracked")
        }

        fn start(&self, _args: &EntryArgs) -> HostResult<JoinHandle<()>> {
            Ok(std::thread::spawn(|| {}))
        }
    }

    struct FixedLoader(bool);

    impl PlatformLibraryLoader for FixedLoader {
        fn load(&self, _path: &Path) -> HostResult<Box<dyn NativeLibrary>> {
            Err(HostError::Internal("unused".into()))
        }

        fn supports_unload(&self) -> bool {
            self.0
        }
    }

    #[test]
    fn unload_is_noop_where_unsupported() {
        let dropped = Arc::new(AtomicBool::new(false));
        FixedLoader(false).unload(Box::new(Tracked { dropped: Arc::clone(&dropped) }));
        assert!(!dropped.load(Ordering::SeqCst));

        FixedLoader(true).unload(Box::new(Tracked { dropped: Arc::clone(&dropped) }));
        assert!(dropped.load(Ordering::SeqCst));
    }
}
