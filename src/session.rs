use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, Notify, Semaphore};
use tracing::{debug, info, warn};

use crate::backend::{self, Backend};
use crate::config::BackendConfig;
use crate::registry::{ServerDescriptor, ToolRegistry};

/// Errors surfaced by the session manager's connection paths.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("backend '{0}' is not registered")]
    NotRegistered(String),
    #[error("connecting to backend '{0}' timed out after {1:?}")]
    ConnectTimeout(String, std::time::Duration),
    #[error("connecting to backend '{0}' failed: {1}")]
    ConnectFailed(String, #[source] anyhow::Error),
}

/// A backend not currently connected: known to the gateway (from config or
/// the state cache) but without a live session.
#[derive(Clone)]
struct PendingBackend {
    config: BackendConfig,
}

/// A live, connected backend session.
struct LiveSession {
    backend: Arc<dyn Backend>,
    last_used: Arc<AtomicI64>,
}

/// Owns the lifecycle of every backend connection: pending registration,
/// lazy connect-on-demand, always-on eager connect + watchdog reconnection,
/// and idle disconnection of lazy sessions.
///
/// `on_server_disconnected` is a plain callback (not a back-reference to the
/// registry) so the session manager has no compile-time dependency on any
/// single consumer of disconnect events — router and registry both register
/// interest through it independently.
pub struct SessionManager {
    pending: DashMap<String, PendingBackend>,
    sessions: DashMap<String, LiveSession>,
    creation_locks: DashMap<String, Arc<Mutex<()>>>,
    connection_semaphore: Arc<Semaphore>,
    connect_deadline: std::time::Duration,
    shutdown: Arc<Notify>,
    on_server_disconnected: Box<dyn Fn(&str) + Send + Sync>,
}

impl SessionManager {
    pub fn new(
        connection_semaphore_permits: usize,
        connect_deadline: std::time::Duration,
        on_server_disconnected: impl Fn(&str) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            pending: DashMap::new(),
            sessions: DashMap::new(),
            creation_locks: DashMap::new(),
            connection_semaphore: Arc::new(Semaphore::new(connection_semaphore_permits.max(1))),
            connect_deadline,
            shutdown: Arc::new(Notify::new()),
            on_server_disconnected: Box::new(on_server_disconnected),
        })
    }

    pub fn shutdown_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Register a backend as known but not connected. Idempotent — does not
    /// overwrite an existing pending entry's config (a redundant
    /// registration from multiple discovery passes must not reset state).
    pub fn register_pending(&self, name: &str, config: BackendConfig) {
        self.pending
            .entry(name.to_string())
            .or_insert_with(|| PendingBackend { config });
    }

    /// Remove a backend entirely: tears down any live session and forgets
    /// its pending registration. Used when a backend is deleted from config.
    pub async fn unregister(&self, name: &str) {
        if let Some((_, session)) = self.sessions.remove(name) {
            if let Err(e) = session.backend.stop().await {
                warn!(backend = %name, error = %e, "error stopping backend during unregister");
            }
        }
        self.pending.remove(name);
        self.creation_locks.remove(name);
    }

    fn config_for(&self, name: &str) -> Option<BackendConfig> {
        if let Some(session) = self.sessions.get(name) {
            let _ = session;
        }
        self.pending.get(name).map(|p| p.config.clone())
    }

    /// Return an existing live session, or connect one, subject to a
    /// per-backend creation lock (preventing duplicate concurrent connects
    /// to the same backend) and a global semaphore bounding total in-flight
    /// connection attempts across all backends.
    pub async fn get_or_create(&self, name: &str) -> Result<Arc<dyn Backend>, SessionError> {
        if let Some(session) = self.sessions.get(name) {
            return Ok(Arc::clone(&session.backend));
        }

        let config = self
            .config_for(name)
            .ok_or_else(|| SessionError::NotRegistered(name.to_string()))?;

        let lock = Arc::clone(
            self.creation_locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        );
        let _guard = lock.lock().await;

        // Double-check: another task may have connected while we waited.
        if let Some(session) = self.sessions.get(name) {
            return Ok(Arc::clone(&session.backend));
        }

        let permit = self
            .connection_semaphore
            .acquire()
            .await
            .expect("connection semaphore never closed");

        let result = tokio::time::timeout(self.connect_deadline, backend::connect(name, &config)).await;
        drop(permit);

        match result {
            Ok(Ok(backend)) => {
                self.sessions.insert(
                    name.to_string(),
                    LiveSession {
                        backend: Arc::clone(&backend),
                        last_used: Arc::new(AtomicI64::new(now_unix())),
                    },
                );
                info!(backend = %name, "backend session connected");
                Ok(backend)
            }
            Ok(Err(e)) => {
                // Connect failed — the backend remains pending (descriptor
                // was never moved out of `pending`, so nothing to restore).
                Err(SessionError::ConnectFailed(name.to_string(), e))
            }
            Err(_) => Err(SessionError::ConnectTimeout(name.to_string(), self.connect_deadline)),
        }
    }

    /// Record that a session was just used, for the idle sweep to measure
    /// against. A single atomic store — no synchronization beyond that is
    /// needed since only monotonic recency matters.
    pub fn record_usage(&self, name: &str) {
        if let Some(session) = self.sessions.get(name) {
            session.last_used.store(now_unix(), Ordering::Relaxed);
        }
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.sessions.contains_key(name)
    }

    pub fn pending_names(&self) -> Vec<String> {
        self.pending
            .iter()
            .filter(|e| !self.sessions.contains_key(e.key()))
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn active_names(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn backend_config(&self, name: &str) -> Option<BackendConfig> {
        self.config_for(name)
    }

    pub fn all_pending_configs(&self) -> HashMap<String, BackendConfig> {
        self.pending.iter().map(|e| (e.key().clone(), e.value().config.clone())).collect()
    }

    /// Sweep every live session and disconnect ones idle longer than their
    /// configured `idle_timeout`, in this exact order so a concurrent
    /// `get_or_create` observes the pending state and reconnects rather than
    /// racing a half-torn-down session:
    ///   1. remove from the session map
    ///   2. restore the descriptor to pending
    ///   3. drop the last-used/creation-lock bookkeeping
    ///   4. close the underlying transport
    ///   5. fire `on_server_disconnected`
    pub async fn disconnect_idle(&self, registry: &ToolRegistry) {
        let now = now_unix();
        let mut to_disconnect = Vec::new();

        for entry in self.sessions.iter() {
            let name = entry.key().clone();
            let idle_timeout = self
                .config_for(&name)
                .map(|c| c.idle_timeout)
                .unwrap_or(std::time::Duration::from_secs(600));
            if idle_timeout.is_zero() {
                continue; // always_on or explicitly disabled idle timeout
            }
            let last_used = entry.value().last_used.load(Ordering::Relaxed);
            if now - last_used >= idle_timeout.as_secs() as i64 {
                to_disconnect.push(name);
            }
        }

        for name in to_disconnect {
            // Never idle-disconnect an always_on backend — the watchdog owns it.
            if self.config_for(&name).map(|c| c.always_on).unwrap_or(false) {
                continue;
            }

            let Some((_, session)) = self.sessions.remove(&name) else {
                continue;
            };
            // (2) descriptor is still present in `pending` — registration is
            // additive and was never removed by get_or_create, so no restore
            // step is needed here beyond leaving it untouched.
            self.creation_locks.remove(&name);

            if let Err(e) = session.backend.stop().await {
                warn!(backend = %name, error = %e, "error stopping idle backend");
            }

            registry.mark_backend_stale(&name);
            (self.on_server_disconnected)(&name);

            debug!(backend = %name, "idle session disconnected");
        }
    }

    /// Reconnect every always-on backend that is not currently connected.
    pub async fn watchdog(self: &Arc<Self>) {
        let always_on: Vec<String> = self
            .pending
            .iter()
            .filter(|e| e.value().config.always_on && !self.sessions.contains_key(e.key()))
            .map(|e| e.key().clone())
            .collect();

        for name in always_on {
            match self.get_or_create(&name).await {
                Ok(_) => info!(backend = %name, "watchdog reconnected always-on backend"),
                Err(e) => warn!(backend = %name, error = %e, "watchdog failed to reconnect"),
            }
        }
    }

    /// Background per-session liveness checker: watches a session's child
    /// process (or equivalent) for unexpected termination and tears it down
    /// the same way an idle timeout would, so the catalog never serves stale
    /// entries as if the backend were still live.
    pub async fn supervise(self: Arc<Self>, name: String, registry: Arc<ToolRegistry>) {
        loop {
            let backend = match self.sessions.get(&name) {
                Some(s) => Arc::clone(&s.backend),
                None => return,
            };

            tokio::select! {
                status = backend.wait_for_exit() => {
                    if status.is_none() {
                        // No child process to monitor (HTTP/SSE) — nothing
                        // to supervise; exit the loop quietly.
                        return;
                    }
                    warn!(backend = %name, "backend process exited unexpectedly");
                    self.sessions.remove(&name);
                    self.creation_locks.remove(&name);
                    registry.mark_backend_stale(&name);
                    (self.on_server_disconnected)(&name);
                    return;
                }
                _ = self.shutdown.notified() => {
                    return;
                }
            }
        }
    }

    /// Spawn the periodic idle-sweep and watchdog background tasks.
    pub fn spawn_background_tasks(
        self: &Arc<Self>,
        registry: Arc<ToolRegistry>,
        idle_sweep_interval: std::time::Duration,
        watchdog_interval: std::time::Duration,
    ) {
        let manager = Arc::clone(self);
        let shutdown = self.shutdown_signal();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(idle_sweep_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.disconnect_idle(&registry).await,
                    _ = shutdown.notified() => return,
                }
            }
        });

        let manager = Arc::clone(self);
        let shutdown = self.shutdown_signal();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(watchdog_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.watchdog().await,
                    _ = shutdown.notified() => return,
                }
            }
        });
    }

    pub async fn stop_all(&self) {
        self.shutdown.notify_waiters();
        let names: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, session)) = self.sessions.remove(&name)
                && let Err(e) = session.backend.stop().await
            {
                warn!(backend = %name, error = %e, "error stopping backend during shutdown");
            }
        }
    }

    pub fn descriptor_for(&self, name: &str) -> Option<ServerDescriptor> {
        self.config_for(name).map(|c| ServerDescriptor {
            command: c.command,
            args: c.args,
            env: c.env,
            url: c.url,
            transport: c.transport.map(|t| format!("{t:?}").to_lowercase()),
            always_on: c.always_on,
            idle_timeout_minutes: Some(c.idle_timeout.as_secs() / 60),
        })
    }
}

fn now_unix() -> i64 {
    // `SystemTime` rather than `Instant`, so the value is comparable across
    // process restarts when loaded back from the state cache in the future.
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn base_config() -> BackendConfig {
        BackendConfig {
            transport: None,
            namespace: None,
            command: None,
            args: vec![],
            env: HashMap::new(),
            cwd: None,
            url: None,
            headers: HashMap::new(),
            timeout: Duration::from_secs(30),
            tools: None,
            always_on: false,
            idle_timeout: Duration::from_secs(600),
            triggers: vec![],
            retry: Default::default(),
            rate_limit: None,
            quarantine_threshold: None,
        }
    }

    #[test]
    fn test_register_pending_idempotent() {
        let manager = SessionManager::new(10, Duration::from_secs(30), |_| {});
        manager.register_pending("a", base_config());
        let mut cfg2 = base_config();
        cfg2.always_on = true;
        manager.register_pending("a", cfg2);
        // First registration wins — idempotent re-registration must not
        // silently flip always_on underneath an in-flight connect.
        assert!(!manager.backend_config("a").unwrap().always_on);
    }

    #[tokio::test]
    async fn test_get_or_create_unregistered_errors() {
        let manager = SessionManager::new(10, Duration::from_secs(1), |_| {});
        let result = manager.get_or_create("missing").await;
        assert!(matches!(result, Err(SessionError::NotRegistered(_))));
    }

    #[tokio::test]
    async fn test_get_or_create_connect_failure_stays_pending() {
        let manager = SessionManager::new(10, Duration::from_secs(1), |_| {});
        // No command and no url -> connect() bails immediately.
        manager.register_pending("broken", base_config());
        let result = manager.get_or_create("broken").await;
        assert!(result.is_err());
        assert!(manager.pending_names().contains(&"broken".to_string()));
        assert!(!manager.is_connected("broken"));
    }

    #[tokio::test]
    async fn test_on_server_disconnected_callback_fires() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let manager = SessionManager::new(10, Duration::from_secs(1), move |_name| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        manager.register_pending("x", base_config());
        // No live session exists, so disconnect_idle has nothing to do —
        // verifies the sweep is a no-op rather than panicking on an
        // unregistered/never-connected backend.
        let registry = ToolRegistry::new();
        manager.disconnect_idle(&registry).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
