//! Starting executable and packaged plugins as child processes.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tether_core::protocol::LogLevel;
use tether_core::{HostError, HostResult};
use tether_logging::{OutputStream, forward_output_line, redact_command_line};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::info;

use crate::descriptor::{PluginDescriptor, PluginKind};

/// Everything needed to start one plugin process.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub server_endpoint: String,
    pub token: String,
    pub min_log_level: LogLevel,
    /// Proxy executable, required for packaged plugins.
    pub proxy: Option<PathBuf>,
}

/// Program and arguments for `descriptor`.
pub fn command_line(
    descriptor: &PluginDescriptor,
    request: &LaunchRequest,
) -> HostResult<(PathBuf, Vec<String>)> {
    let mut args = vec![
        format!("--server-endpoint={}", request.server_endpoint),
        format!("--token={}", request.token),
        format!("--parent-pid={}", std::process::id()),
        format!("--log-level={}", request.min_log_level.as_arg()),
    ];
    let program = match descriptor.kind {
        PluginKind::Executable => descriptor.path.clone(),
        PluginKind::Package => {
            let proxy = request.proxy.clone().ok_or_else(|| {
                HostError::ProxyNotFound(crate::proxy_file::proxy_file_name(Some(
                    crate::proxy_file::PROXY_LATEST_VERSION,
                )))
            })?;
            args.push(format!("--package={}", descriptor.path.display()));
            proxy
        }
        PluginKind::Library => {
            return Err(HostError::PluginLoad {
                plugin: descriptor.name.clone(),
                message: "libraries are loaded in-process, not launched".into(),
            });
        }
    };
    Ok((program, args))
}

/// Spawn the plugin, forwarding its stdout and stderr into the host log.
pub fn launch(descriptor: &PluginDescriptor, request: &LaunchRequest) -> HostResult<Child> {
    let (program, args) = command_line(descriptor, request)?;
    info!(
        plugin = %descriptor.name,
        command = %redact_command_line(&format!("{} {}", program.display(), args.join(" "))),
        "Starting plugin process"
    );

    let mut child = Command::new(&program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| HostError::PluginLoad {
            plugin: descriptor.name.clone(),
            message: format!("cannot start {}: {e}", program.display()),
        })?;

    let label = file_label(&descriptor.path);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump_lines(label.clone(), OutputStream::Stdout, stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump_lines(label, OutputStream::Stderr, stderr));
    }
    Ok(child)
}

fn file_label(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

async fn pump_lines<R: AsyncRead + Unpin>(label: String, stream: OutputStream, reader: R) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        forward_output_line(&label, stream, &line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(proxy: Option<PathBuf>) -> LaunchRequest {
        LaunchRequest {
            server_endpoint: "unix:///tmp/host.sock".into(),
            token: "abcdef".into(),
            min_log_level: LogLevel::Warning,
            proxy,
        }
    }

    #[test]
    fn executable_gets_connection_arguments() {
        let descriptor = PluginDescriptor::from_path(Path::new("/p/sample-plugin-linux-x64"));
        let (program, args) = command_line(&descriptor, &request(None)).unwrap();
        assert_eq!(program, PathBuf::from("/p/sample-plugin-linux-x64"));
        assert_eq!(args[0], "--server-endpoint=unix:///tmp/host.sock");
        assert_eq!(args[1], "--token=abcdef");
        assert!(args[2].starts_with("--parent-pid="));
        assert_eq!(args[3], "--log-level=warning");
    }

    #[test]
    fn package_runs_through_proxy() {
        let descriptor = PluginDescriptor::from_path(Path::new("/p/Sample.Plugin.1.0.0.nupkg"));
        let err = command_line(&descriptor, &request(None)).unwrap_err();
        assert!(matches!(err, HostError::ProxyNotFound(_)));

        let (program, args) =
            command_line(&descriptor, &request(Some(PathBuf::from("/bin/proxy")))).unwrap();
        assert_eq!(program, PathBuf::from("/bin/proxy"));
        assert_eq!(args.last().unwrap(), "--package=/p/Sample.Plugin.1.0.0.nupkg");
    }

    #[tokio::test]
    async fn missing_executable_is_a_load_failure() {
        let descriptor = PluginDescriptor::from_path(Path::new("/nonexistent/ghost-plugin"));
        let err = launch(&descriptor, &request(None)).unwrap_err();
        assert_eq!(err.kind(), tether_core::ErrorKind::PluginLoadFailure);
    }
}
