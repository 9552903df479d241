//! Pending plugin registrations.
//!
//! The loader creates a token before starting a plugin and waits on it; the
//! plugins server confirms it when the plugin calls back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tether_core::{HostError, HostResult};
use tether_logging::redact_token;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

struct Pending {
    plugin: String,
    signal: Arc<Semaphore>,
}

/// Tracks registration tokens and their completion signals.
#[derive(Default)]
pub struct TokenRegistry {
    pending: Mutex<HashMap<String, Pending>>,
    issued: AtomicU64,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A fresh single-use token.
    pub fn next_token(&self) -> String {
        let n = self.issued.fetch_add(1, Ordering::Relaxed);
        format!("{n:04x}{}", Uuid::new_v4().simple())
    }

    /// Start tracking `token` for the plugin expected to register with it.
    pub fn set_token(&self, token: &str, plugin: &str) -> HostResult<()> {
        let mut pending = self.lock();
        if pending.contains_key(token) {
            return Err(HostError::TokenInUse(redact_token(token)));
        }
        pending.insert(
            token.to_string(),
            Pending {
                plugin: plugin.to_string(),
                signal: Arc::new(Semaphore::new(0)),
            },
        );
        debug!(token = %redact_token(token), plugin = %plugin, "Registration token created");
        Ok(())
    }

    pub fn verify(&self, token: &str) -> bool {
        self.lock().contains_key(token)
    }

    /// Plugin name the token was issued for.
    pub fn expected_plugin(&self, token: &str) -> Option<String> {
        self.lock().get(token).map(|p| p.plugin.clone())
    }

    /// Signal that the plugin registered. Unknown tokens are ignored.
    pub fn confirm(&self, token: &str) -> bool {
        let pending = self.lock();
        match pending.get(token) {
            Some(p) => {
                if p.signal.available_permits() == 0 {
                    p.signal.add_permits(1);
                }
                true
            }
            None => false,
        }
    }

    /// Wait until the token is confirmed. `None` waits without a deadline.
    /// The token is removed whatever the outcome.
    pub async fn wait_for(
        &self,
        token: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> HostResult<()> {
        let signal = match self.lock().get(token) {
            Some(p) => Arc::clone(&p.signal),
            None => return Err(HostError::InvalidAuthToken),
        };

        let deadline = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };

        let outcome = tokio::select! {
            permit = signal.acquire() => match permit {
                Ok(permit) => {
                    permit.forget();
                    Ok(())
                }
                Err(_) => Err(HostError::Internal("registration signal closed".into())),
            },
            _ = cancel.cancelled() => Err(HostError::Cancelled),
            _ = deadline => Err(HostError::RegistrationTimeout {
                token: redact_token(token),
                timeout: timeout.unwrap_or_default(),
            }),
        };
        self.remove(token);
        outcome
    }

    /// Drop a token without waiting on it.
    pub fn remove(&self, token: &str) -> bool {
        self.lock().remove(token).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }
}
