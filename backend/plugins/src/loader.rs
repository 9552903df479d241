//! Plugins Loader
//!
//! Turns plugin files into host functions. Each file is discovered, matched
//! against the current platform and either registered lazily from its
//! functions cache or started right away. Starting a plugin means handing it
//! the server endpoint and a one-time token, then waiting until it registers
//! back with that token.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::FutureExt;
use tether_config::{DebugConfig, PluginsConfig};
use tether_core::protocol::{LogLevel, PluginFunction};
use tether_core::{
    ExecutionContext, FunctionCall, FunctionDelegate, FunctionRegistry, HostError, HostResult,
};
use tether_logging::redact_token;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::FunctionsCache;
use crate::context::PluginContext;
use crate::descriptor::{PluginDescriptor, PluginKind, current_arch, current_platform, discover};
use crate::function::{metadata_of, register_forwarding};
use crate::launcher::{LaunchRequest, launch};
use crate::native::{DynamicLibraryLoader, EntryArgs, NativeLibrary, PlatformLibraryLoader};
use crate::proxy_file::resolve_proxy;
use crate::server::{PluginsServer, ServerOptions};
use crate::transport::Endpoint;

/// Outcome of [`PluginsLoader::load_all`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    /// Plugins started and registered.
    pub loaded: Vec<String>,
    /// Plugins registered from the functions cache without starting them.
    pub deferred: Vec<String>,
    pub failed: Vec<(PathBuf, String)>,
}

/// Knobs that are not part of the configuration file.
pub struct LoaderOptions {
    /// Lowest log level plugins should forward.
    pub min_log_level: LogLevel,
    pub libraries: Arc<dyn PlatformLibraryLoader>,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            min_log_level: LogLevel::Information,
            libraries: Arc::new(DynamicLibraryLoader::new()),
        }
    }
}

pub struct PluginsLoader {
    inner: Arc<LoaderInner>,
}

struct LoaderInner {
    config: PluginsConfig,
    options: LoaderOptions,
    functions: Arc<dyn FunctionRegistry>,
    execution: Arc<dyn ExecutionContext>,
    server: tokio::sync::OnceCell<PluginsServer>,
    cache: Option<FunctionsCache>,
    loaded: Mutex<HashMap<String, Arc<PluginContext>>>,
    load_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    registered_files: Mutex<HashSet<PathBuf>>,
    shutdown: CancellationToken,
}

/// What was started for a plugin that has not registered yet.
enum Started {
    /// Debug mode: the developer starts the plugin by hand.
    Nothing,
    Library(Box<dyn NativeLibrary>),
    Process(Child),
}

impl PluginsLoader {
    pub fn new(
        config: PluginsConfig,
        functions: Arc<dyn FunctionRegistry>,
        execution: Arc<dyn ExecutionContext>,
    ) -> Self {
        Self::with_options(config, functions, execution, LoaderOptions::default())
    }

    pub fn with_options(
        config: PluginsConfig,
        functions: Arc<dyn FunctionRegistry>,
        execution: Arc<dyn ExecutionContext>,
        options: LoaderOptions,
    ) -> Self {
        let cache = config.cache_dir.clone().map(FunctionsCache::new);
        Self {
            inner: Arc::new(LoaderInner {
                config,
                options,
                functions,
                execution,
                server: tokio::sync::OnceCell::new(),
                cache,
                loaded: Mutex::new(HashMap::new()),
                load_locks: Mutex::new(HashMap::new()),
                registered_files: Mutex::new(HashSet::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Plugin files in the configured directories runnable on this machine.
    pub fn discover(&self) -> Vec<PluginDescriptor> {
        discover(&self.inner.config.directories, current_platform(), current_arch())
    }

    /// Endpoint plugins register with, once the server is running.
    pub fn server_endpoint(&self) -> Option<String> {
        self.inner.server.get().map(|s| s.endpoint().uri())
    }

    /// Register every discovered plugin. Plugins with a valid functions cache
    /// are only started when one of their functions is first called. A
    /// failing plugin is reported and does not stop the others.
    pub async fn load_all(&self, cancel: &CancellationToken) -> HostResult<LoadReport> {
        let mut report = LoadReport::default();
        for descriptor in self.discover() {
            if let Some(functions) = self.cached_functions(&descriptor).await {
                self.register_deferred(&descriptor, &functions);
                report.deferred.push(descriptor.name.clone());
                continue;
            }
            match self.inner.load_plugin(&descriptor, cancel).await {
                Ok(context) => report.loaded.push(context.name().to_string()),
                Err(HostError::Cancelled) => return Err(HostError::Cancelled),
                Err(e) => {
                    error!(plugin = %descriptor.name, file = %descriptor.path.display(), error = %e, "Cannot load plugin");
                    report.failed.push((descriptor.path.clone(), e.to_string()));
                }
            }
        }
        info!(
            loaded = report.loaded.len(),
            deferred = report.deferred.len(),
            failed = report.failed.len(),
            "Plugins loaded"
        );
        Ok(report)
    }

    /// Start `descriptor` and register its functions, or return the context
    /// of the already running plugin.
    pub async fn load_plugin(
        &self,
        descriptor: &PluginDescriptor,
        cancel: &CancellationToken,
    ) -> HostResult<Arc<PluginContext>> {
        self.inner.load_plugin(descriptor, cancel).await
    }

    /// Names of running plugins, sorted.
    pub fn loaded_plugins(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.loaded().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn context(&self, name: &str) -> Option<Arc<PluginContext>> {
        self.inner.loaded_context(name)
    }

    /// Shut every plugin down, then stop the server. Best effort: a plugin
    /// that fails to stop does not keep the others running.
    pub async fn shutdown(&self, cancel: &CancellationToken) {
        self.inner.shutdown.cancel();
        let contexts: Vec<Arc<PluginContext>> =
            self.inner.loaded().drain().map(|(_, context)| context).collect();
        for context in contexts {
            context.shutdown(cancel).await;
        }
        if let Some(server) = self.inner.server.get() {
            server.stop().await;
        }
    }

    async fn cached_functions(&self, descriptor: &PluginDescriptor) -> Option<Vec<PluginFunction>> {
        let cache = self.inner.cache.as_ref()?;
        cache.load_valid(&descriptor.path).await
    }

    fn register_deferred(&self, descriptor: &PluginDescriptor, functions: &[PluginFunction]) {
        if !self.inner.mark_registered(descriptor) {
            return;
        }
        let target = Arc::new(descriptor.clone());
        for function in functions {
            let delegate = deferred_delegate(Arc::downgrade(&self.inner), Arc::clone(&target));
            if let Err(e) = self
                .inner
                .functions
                .register(&function.signature, delegate, metadata_of(function))
            {
                warn!(plugin = %descriptor.name, function = %function.signature, error = %e, "Cannot register cached function");
            }
        }
        debug!(plugin = %descriptor.name, functions = functions.len(), "Registered plugin functions from cache");
    }
}

impl Drop for PluginsLoader {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

/// Delegate that starts the plugin on first use and then forwards the call.
fn deferred_delegate(loader: Weak<LoaderInner>, descriptor: Arc<PluginDescriptor>) -> FunctionDelegate {
    Arc::new(move |call: FunctionCall| {
        let loader = loader.clone();
        let descriptor = Arc::clone(&descriptor);
        async move {
            let loader = loader.upgrade().ok_or(HostError::Disposed("plugins loader"))?;
            let cancel = loader.shutdown.child_token();
            let context = loader.load_plugin(&descriptor, &cancel).await?;
            let cancel = context.cancel_token();
            context
                .call_function(&call.function_name, &call.args, &cancel)
                .await
        }
        .boxed()
    })
}

impl LoaderInner {
    fn loaded(&self) -> MutexGuard<'_, HashMap<String, Arc<PluginContext>>> {
        self.loaded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn loaded_context(&self, name: &str) -> Option<Arc<PluginContext>> {
        self.loaded().get(name).cloned()
    }

    fn load_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.load_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    /// True the first time `descriptor`'s functions are registered.
    fn mark_registered(&self, descriptor: &PluginDescriptor) -> bool {
        self.registered_files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(descriptor.path.clone())
    }

    fn debug(&self) -> Option<&DebugConfig> {
        self.config.active_debug()
    }

    async fn server(&self) -> HostResult<&PluginsServer> {
        self.server
            .get_or_try_init(|| async {
                let endpoint = match &self.config.server_endpoint {
                    Some(uri) => Some(uri.parse::<Endpoint>()?),
                    None => None,
                };
                let options = ServerOptions {
                    endpoint,
                    verify_tokens: self.debug().is_none(),
                    max_sessions: self.config.max_connections(),
                    log_remote_calls: self.config.log_remote_calls(),
                    min_log_level: self.options.min_log_level,
                };
                PluginsServer::start(options, Arc::clone(&self.functions), Arc::clone(&self.execution))
                    .await
            })
            .await
    }

    async fn load_plugin(
        &self,
        descriptor: &PluginDescriptor,
        cancel: &CancellationToken,
    ) -> HostResult<Arc<PluginContext>> {
        if self.shutdown.is_cancelled() {
            return Err(HostError::Disposed("plugins loader"));
        }
        if let Some(context) = self.loaded_context(&descriptor.name) {
            return Ok(context);
        }
        let lock = self.load_lock(&descriptor.name);
        let _guard = lock.lock().await;
        if let Some(context) = self.loaded_context(&descriptor.name) {
            return Ok(context);
        }

        let server = self.server().await?;
        let tokens = server.tokens();
        let token = match self.debug().and_then(|d| d.token.clone()) {
            Some(token) => token,
            None => tokens.next_token(),
        };
        tokens.set_token(&token, &descriptor.name)?;

        let started = match self.start(descriptor, server, &token) {
            Ok(started) => started,
            Err(e) => {
                tokens.remove(&token);
                return Err(e);
            }
        };

        let timeout = match self.debug() {
            Some(debug) => debug.registration_timeout(),
            None => Some(self.config.registration_timeout()),
        };
        let waited = tokio::select! {
            waited = tokens.wait_for(&token, timeout, cancel) => waited,
            _ = self.shutdown.cancelled() => {
                tokens.remove(&token);
                Err(HostError::Cancelled)
            }
        };
        if let Err(e) = waited {
            warn!(plugin = %descriptor.name, error = %e, "Plugin did not register");
            self.abandon(started).await;
            if let Some(context) = server.take_registration(&token) {
                context.shutdown(cancel).await;
            }
            return Err(e);
        }

        let context = server.take_registration(&token).ok_or_else(|| {
            HostError::Internal(format!("no context for registered plugin '{}'", descriptor.name))
        })?;
        match started {
            Started::Nothing => {}
            Started::Library(library) => {
                context.attach_library(Arc::clone(&self.options.libraries), library)
            }
            Started::Process(child) => context.attach_process(child).await,
        }
        self.loaded().insert(descriptor.name.clone(), Arc::clone(&context));
        info!(
            plugin = %context.name(),
            version = %context.version(),
            functions = context.functions().len(),
            "Plugin registered"
        );

        if self.mark_registered(descriptor) {
            let count = register_forwarding(self.functions.as_ref(), &context);
            debug!(plugin = %context.name(), functions = count, "Registered plugin functions");
            if let Some(cache) = &self.cache {
                if let Err(e) = cache.store(&descriptor.path, context.functions()).await {
                    warn!(plugin = %context.name(), error = %e, "Cannot store functions cache");
                }
            }
        }
        Ok(context)
    }

    fn start(
        &self,
        descriptor: &PluginDescriptor,
        server: &PluginsServer,
        token: &str,
    ) -> HostResult<Started> {
        if self.debug().is_some_and(DebugConfig::skip_execution) {
            info!(
                plugin = %descriptor.name,
                endpoint = %server.endpoint(),
                token = %redact_token(token),
                "Waiting for an externally started plugin"
            );
            return Ok(Started::Nothing);
        }
        match descriptor.kind {
            PluginKind::Library => {
                let library = self.options.libraries.load(&descriptor.path)?;
                let args = EntryArgs::new(
                    server.endpoint().uri(),
                    token.to_string(),
                    self.options.min_log_level,
                );
                // The entry thread runs detached; it talks to the host only
                // through the server.
                if let Err(e) = library.start(&args) {
                    self.options.libraries.unload(library);
                    return Err(e);
                }
                Ok(Started::Library(library))
            }
            PluginKind::Executable | PluginKind::Package => {
                let proxy = match descriptor.kind {
                    PluginKind::Package => Some(resolve_proxy(
                        self.config.application_dir.as_deref(),
                        &self.config.proxy_search_paths,
                    )?),
                    _ => None,
                };
                let request = LaunchRequest {
                    server_endpoint: server.endpoint().uri(),
                    token: token.to_string(),
                    min_log_level: self.options.min_log_level,
                    proxy,
                };
                Ok(Started::Process(launch(descriptor, &request)?))
            }
        }
    }

    async fn abandon(&self, started: Started) {
        match started {
            Started::Nothing => {}
            Started::Library(library) => self.options.libraries.unload(library),
            Started::Process(mut child) => {
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Cannot kill plugin process");
                }
            }
        }
    }
}
