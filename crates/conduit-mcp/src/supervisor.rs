//! Crash recovery and health checking.
//!
//! The supervisor never touches servers itself. It decides when a restart or
//! health check is due and calls back through [`SupervisorHooks`].

use crate::error::McpResult;
use crate::settings::SupervisorConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Operations the supervisor asks its owner to perform.
#[async_trait]
pub trait SupervisorHooks: Send + Sync {
    async fn restart(&self, server_id: &str) -> McpResult<()>;
    async fn health_check(&self, server_id: &str) -> McpResult<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorEvent {
    RestartScheduled {
        server_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    RestartAttempted {
        server_id: String,
        attempt: u32,
    },
    RestartSucceeded {
        server_id: String,
        attempt: u32,
    },
    RestartFailed {
        server_id: String,
        attempt: u32,
        error: String,
    },
    RestartAbandoned {
        server_id: String,
        attempts: u32,
    },
    HealthCheckStarted {
        server_id: String,
    },
    HealthCheckPassed {
        server_id: String,
    },
    HealthCheckFailed {
        server_id: String,
        error: String,
    },
}

impl SupervisorEvent {
    pub fn server_id(&self) -> &str {
        match self {
            SupervisorEvent::RestartScheduled { server_id, .. }
            | SupervisorEvent::RestartAttempted { server_id, .. }
            | SupervisorEvent::RestartSucceeded { server_id, .. }
            | SupervisorEvent::RestartFailed { server_id, .. }
            | SupervisorEvent::RestartAbandoned { server_id, .. }
            | SupervisorEvent::HealthCheckStarted { server_id }
            | SupervisorEvent::HealthCheckPassed { server_id }
            | SupervisorEvent::HealthCheckFailed { server_id, .. } => server_id,
        }
    }
}

/// Supervision bookkeeping for one server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SupervisionRecord {
    pub server_id: String,
    pub restart_attempts: u32,
    pub last_restart_at: Option<DateTime<Utc>>,
    pub last_exit_code: Option<i32>,
    pub running: bool,
    pub healthy: bool,
    pub restart_pending: bool,
    pub restarting: bool,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl SupervisionRecord {
    fn new(server_id: &str) -> Self {
        Self {
            server_id: server_id.to_string(),
            restart_attempts: 0,
            last_restart_at: None,
            last_exit_code: None,
            running: false,
            healthy: true,
            restart_pending: false,
            restarting: false,
            last_health_check: None,
        }
    }
}

struct Timer {
    id: u64,
    cancel: CancellationToken,
}

struct Entry {
    record: SupervisionRecord,
    timer: Option<Timer>,
    crashed_during_restart: bool,
}

impl Entry {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel.cancel();
        }
        self.record.restart_pending = false;
    }
}

struct SupervisorInner {
    config: SupervisorConfig,
    hooks: Arc<dyn SupervisorHooks>,
    entries: Mutex<HashMap<String, Entry>>,
    next_timer: AtomicU64,
    health: Mutex<Option<CancellationToken>>,
    events: broadcast::Sender<SupervisorEvent>,
    disposed: AtomicBool,
}

impl SupervisorInner {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: SupervisorEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, hooks: Arc<dyn SupervisorHooks>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(SupervisorInner {
                config,
                hooks,
                entries: Mutex::new(HashMap::new()),
                next_timer: AtomicU64::new(1),
                health: Mutex::new(None),
                events,
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn supervise(&self, server_id: &str) {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return;
        }
        self.inner
            .entries()
            .entry(server_id.to_string())
            .or_insert_with(|| Entry {
                record: SupervisionRecord::new(server_id),
                timer: None,
                crashed_during_restart: false,
            });
        debug!(server = %server_id, "Supervising server");
    }

    pub fn unsupervise(&self, server_id: &str) {
        if let Some(mut entry) = self.inner.entries().remove(server_id) {
            entry.cancel_timer();
            debug!(server = %server_id, "Stopped supervising server");
        }
    }

    pub fn is_supervised(&self, server_id: &str) -> bool {
        self.inner.entries().contains_key(server_id)
    }

    pub fn record(&self, server_id: &str) -> Option<SupervisionRecord> {
        self.inner.entries().get(server_id).map(|e| e.record.clone())
    }

    /// Schedule a restart, unless one is already running.
    pub fn on_server_crashed(&self, server_id: &str, exit_code: Option<i32>) {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return;
        }
        let mut entries = self.inner.entries();
        let Some(entry) = entries.get_mut(server_id) else {
            return;
        };
        entry.record.last_exit_code = exit_code;
        entry.record.running = false;
        entry.record.healthy = false;

        if !self.inner.config.auto_restart {
            return;
        }
        if entry.record.restarting {
            entry.crashed_during_restart = true;
            return;
        }
        schedule_restart(&self.inner, entry);
    }

    pub fn on_server_started(&self, server_id: &str) {
        if let Some(entry) = self.inner.entries().get_mut(server_id) {
            entry.record.restart_attempts = 0;
            entry.record.running = true;
            entry.record.healthy = true;
        }
    }

    pub fn on_server_stopped(&self, server_id: &str) {
        if let Some(entry) = self.inner.entries().get_mut(server_id) {
            entry.cancel_timer();
            entry.record.restart_attempts = 0;
            entry.record.running = false;
        }
    }

    /// Start the periodic health check loop. Does nothing when disabled or
    /// already running. A zero interval disables the loop.
    pub fn start_health_checks(&self) {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return;
        }
        if !self.inner.config.health_checks_enabled() {
            if self.inner.config.health_checks {
                info!("Health check interval is 0, health checks disabled");
            }
            return;
        }
        let mut health = self.inner.health.lock().unwrap_or_else(|e| e.into_inner());
        if health.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        *health = Some(cancel.clone());

        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.health_check_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                run_health_checks(&inner).await;
            }
            debug!("Health checks stopped");
        });
    }

    pub fn health_checks_running(&self) -> bool {
        self.inner
            .health
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn stop_health_checks(&self) {
        if let Some(cancel) = self
            .inner
            .health
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            cancel.cancel();
        }
    }

    /// Cancel every timer. Nothing fires afterwards.
    pub fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::SeqCst);
        self.stop_health_checks();
        for (_, mut entry) in self.inner.entries().drain() {
            entry.cancel_timer();
        }
    }
}

fn schedule_restart(inner: &Arc<SupervisorInner>, entry: &mut Entry) {
    let server_id = entry.record.server_id.clone();
    let attempts = entry.record.restart_attempts;

    if attempts >= inner.config.max_restart_attempts {
        entry.cancel_timer();
        warn!(server = %server_id, attempts, "Giving up restarting server");
        inner.emit(SupervisorEvent::RestartAbandoned {
            server_id,
            attempts,
        });
        return;
    }

    let delay = inner.config.backoff_delay(attempts);
    entry.record.restart_attempts = attempts + 1;
    let attempt = entry.record.restart_attempts;

    let id = inner.next_timer.fetch_add(1, Ordering::SeqCst);
    let cancel = CancellationToken::new();
    entry.cancel_timer();
    entry.timer = Some(Timer {
        id,
        cancel: cancel.clone(),
    });
    entry.record.restart_pending = true;

    info!(
        server = %server_id,
        attempt,
        delay_ms = delay.as_millis() as u64,
        "Scheduling restart"
    );
    inner.emit(SupervisorEvent::RestartScheduled {
        server_id: server_id.clone(),
        attempt,
        delay_ms: delay.as_millis() as u64,
    });

    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => perform_restart(weak, server_id, id).await,
        }
    });
}

async fn perform_restart(weak: Weak<SupervisorInner>, server_id: String, timer_id: u64) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    if inner.disposed.load(Ordering::SeqCst) {
        return;
    }

    let attempt = {
        let mut entries = inner.entries();
        let Some(entry) = entries.get_mut(&server_id) else {
            return;
        };
        if !entry.timer.as_ref().is_some_and(|t| t.id == timer_id) {
            return;
        }
        entry.timer = None;
        entry.record.restart_pending = false;
        entry.record.restarting = true;
        entry.record.last_restart_at = Some(Utc::now());
        entry.crashed_during_restart = false;
        entry.record.restart_attempts
    };

    inner.emit(SupervisorEvent::RestartAttempted {
        server_id: server_id.clone(),
        attempt,
    });
    let result = inner.hooks.restart(&server_id).await;

    if inner.disposed.load(Ordering::SeqCst) {
        return;
    }
    let mut entries = inner.entries();
    let Some(entry) = entries.get_mut(&server_id) else {
        return;
    };
    entry.record.restarting = false;
    let crashed = std::mem::take(&mut entry.crashed_during_restart);

    match result {
        Ok(()) if !crashed => {
            info!(server = %server_id, attempt, "Restart succeeded");
            inner.emit(SupervisorEvent::RestartSucceeded {
                server_id: server_id.clone(),
                attempt,
            });
        }
        outcome => {
            let error = match outcome {
                Err(e) => e.to_string(),
                Ok(()) => "server crashed again during restart".to_string(),
            };
            warn!(server = %server_id, attempt, error = %error, "Restart failed");
            inner.emit(SupervisorEvent::RestartFailed {
                server_id: server_id.clone(),
                attempt,
                error,
            });
            entry.record.running = false;
            schedule_restart(&inner, entry);
        }
    }
}

async fn run_health_checks(inner: &Arc<SupervisorInner>) {
    let due: Vec<String> = inner
        .entries()
        .values()
        .filter(|e| e.record.running && !e.record.restarting && e.timer.is_none())
        .map(|e| e.record.server_id.clone())
        .collect();

    let timeout = inner.config.health_check_timeout();
    let checks = due.into_iter().map(|server_id| {
        let inner = inner.clone();
        async move {
            inner.emit(SupervisorEvent::HealthCheckStarted {
                server_id: server_id.clone(),
            });
            let outcome = match tokio::time::timeout(timeout, inner.hooks.health_check(&server_id)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("no response within {}ms", timeout.as_millis())),
            };

            let healthy = outcome.is_ok();
            if let Some(entry) = inner.entries().get_mut(&server_id) {
                entry.record.healthy = healthy;
                entry.record.last_health_check = Some(Utc::now());
            }
            match outcome {
                Ok(()) => inner.emit(SupervisorEvent::HealthCheckPassed { server_id }),
                Err(error) => {
                    warn!(server = %server_id, error = %error, "Health check failed");
                    inner.emit(SupervisorEvent::HealthCheckFailed { server_id, error });
                }
            }
        }
    });
    futures::future::join_all(checks).await;
}
