//! Per-server lifecycle state machine.
//!
//! A [`StateMachine`] owns one server's current [`ServerState`], its
//! [`StateMetadata`] and a bounded transition history. It performs no I/O:
//! callers drive it with [`StateEvent`]s and observe it through listeners.
//!
//! Transitions on one machine are serialized. Listeners run synchronously
//! while the transition is still being applied, so they may read the machine
//! but must not call [`StateMachine::transition`] on it.

use crate::error::{McpError, McpResult};
use crate::listener::{Listeners, Subscription};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, error, warn};

/// Default number of transitions kept in history.
pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

/// Lifecycle state of one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerState {
    Idle,
    Validating,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
    AuthRequired,
    Authenticating,
    TokenRefreshing,
    ConfigError,
    RuntimeError,
    Crashed,
}

impl ServerState {
    pub const ALL: [ServerState; 13] = [
        ServerState::Idle,
        ServerState::Validating,
        ServerState::Starting,
        ServerState::Running,
        ServerState::Stopping,
        ServerState::Stopped,
        ServerState::Error,
        ServerState::AuthRequired,
        ServerState::Authenticating,
        ServerState::TokenRefreshing,
        ServerState::ConfigError,
        ServerState::RuntimeError,
        ServerState::Crashed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Idle => "IDLE",
            ServerState::Validating => "VALIDATING",
            ServerState::Starting => "STARTING",
            ServerState::Running => "RUNNING",
            ServerState::Stopping => "STOPPING",
            ServerState::Stopped => "STOPPED",
            ServerState::Error => "ERROR",
            ServerState::AuthRequired => "AUTH_REQUIRED",
            ServerState::Authenticating => "AUTHENTICATING",
            ServerState::TokenRefreshing => "TOKEN_REFRESHING",
            ServerState::ConfigError => "CONFIG_ERROR",
            ServerState::RuntimeError => "RUNTIME_ERROR",
            ServerState::Crashed => "CRASHED",
        }
    }

    /// Failure states that accept RESET, START and STOP.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            ServerState::Error
                | ServerState::ConfigError
                | ServerState::RuntimeError
                | ServerState::Crashed
        )
    }

    /// States only ever held while an operation is in flight.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ServerState::Validating
                | ServerState::Starting
                | ServerState::Stopping
                | ServerState::Authenticating
                | ServerState::TokenRefreshing
        )
    }

    /// States in which a transport handle is expected to be live.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ServerState::Starting | ServerState::Running | ServerState::TokenRefreshing
        )
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input driving a [`StateMachine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateEvent {
    Validate,
    Valid,
    Invalid,
    Start,
    Started,
    Stop,
    Stopped,
    Crashed,
    Error,
    Reset,
    AuthRequired,
    Authenticate,
    AuthSuccess,
    AuthFailed,
    RefreshToken,
    TokenRefreshed,
    RefreshFailed,
}

impl StateEvent {
    pub const ALL: [StateEvent; 17] = [
        StateEvent::Validate,
        StateEvent::Valid,
        StateEvent::Invalid,
        StateEvent::Start,
        StateEvent::Started,
        StateEvent::Stop,
        StateEvent::Stopped,
        StateEvent::Crashed,
        StateEvent::Error,
        StateEvent::Reset,
        StateEvent::AuthRequired,
        StateEvent::Authenticate,
        StateEvent::AuthSuccess,
        StateEvent::AuthFailed,
        StateEvent::RefreshToken,
        StateEvent::TokenRefreshed,
        StateEvent::RefreshFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StateEvent::Validate => "VALIDATE",
            StateEvent::Valid => "VALID",
            StateEvent::Invalid => "INVALID",
            StateEvent::Start => "START",
            StateEvent::Started => "STARTED",
            StateEvent::Stop => "STOP",
            StateEvent::Stopped => "STOPPED",
            StateEvent::Crashed => "CRASHED",
            StateEvent::Error => "ERROR",
            StateEvent::Reset => "RESET",
            StateEvent::AuthRequired => "AUTH_REQUIRED",
            StateEvent::Authenticate => "AUTHENTICATE",
            StateEvent::AuthSuccess => "AUTH_SUCCESS",
            StateEvent::AuthFailed => "AUTH_FAILED",
            StateEvent::RefreshToken => "REFRESH_TOKEN",
            StateEvent::TokenRefreshed => "TOKEN_REFRESHED",
            StateEvent::RefreshFailed => "REFRESH_FAILED",
        }
    }
}

impl fmt::Display for StateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The transition table. `None` means the event is not accepted in `from`.
pub fn next_state(from: ServerState, event: StateEvent) -> Option<ServerState> {
    use ServerState as S;
    use StateEvent as E;

    let to = match (from, event) {
        (S::Idle, E::Validate | E::Start) => S::Validating,
        (S::Idle, E::Authenticate) => S::Authenticating,

        (S::Validating, E::Valid) => S::Starting,
        (S::Validating, E::Invalid) => S::ConfigError,
        (S::Validating, E::AuthRequired) => S::AuthRequired,
        (S::Validating, E::Error) => S::Error,
        (S::Validating, E::Stop) => S::Stopping,

        (S::Starting, E::Started) => S::Running,
        (S::Starting, E::Crashed) => S::Crashed,
        (S::Starting, E::Error) => S::Error,
        (S::Starting, E::Stopped) => S::Stopped,
        (S::Starting, E::Stop) => S::Stopping,

        (S::Running, E::Stop) => S::Stopping,
        (S::Running, E::Crashed) => S::Crashed,
        (S::Running, E::Stopped) => S::Stopped,
        (S::Running, E::RefreshToken) => S::TokenRefreshing,
        (S::Running, E::Error) => S::RuntimeError,
        (S::Running, E::AuthRequired) => S::AuthRequired,

        (S::Stopping, E::Stopped) => S::Stopped,
        (S::Stopping, E::Error) => S::Error,

        (S::Stopped, E::Validate | E::Start) => S::Validating,
        (S::Stopped, E::Reset) => S::Idle,
        (S::Stopped, E::Authenticate) => S::Authenticating,

        (S::Error | S::ConfigError | S::RuntimeError | S::Crashed, E::Reset) => S::Idle,
        (S::Error | S::ConfigError | S::RuntimeError | S::Crashed, E::Start) => S::Validating,
        (S::Error | S::ConfigError | S::RuntimeError | S::Crashed, E::Stop) => S::Stopped,

        (S::AuthRequired, E::Authenticate) => S::Authenticating,
        (S::AuthRequired, E::Reset) => S::Idle,
        (S::AuthRequired, E::Start) => S::Validating,
        (S::AuthRequired, E::Stop) => S::Stopped,

        (S::Authenticating, E::AuthSuccess) => S::Idle,
        (S::Authenticating, E::AuthFailed) => S::AuthRequired,
        (S::Authenticating, E::Reset) => S::Idle,
        (S::Authenticating, E::Start) => S::Validating,
        (S::Authenticating, E::Stop) => S::Stopped,

        (S::TokenRefreshing, E::TokenRefreshed) => S::Running,
        (S::TokenRefreshing, E::RefreshFailed) => S::AuthRequired,
        (S::TokenRefreshing, E::Crashed) => S::Crashed,
        (S::TokenRefreshing, E::Stop) => S::Stopping,
        (S::TokenRefreshing, E::Reset) => S::Idle,
        (S::TokenRefreshing, E::Start) => S::Validating,

        _ => return None,
    };
    Some(to)
}

/// Metadata carried alongside the current state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMetadata {
    pub entered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_state: Option<ServerState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub restart_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_restart_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, Value>,
}

impl Default for StateMetadata {
    fn default() -> Self {
        Self {
            entered_at: Utc::now(),
            previous_state: None,
            error_message: None,
            error_code: None,
            exit_code: None,
            restart_attempts: 0,
            last_restart_at: None,
            extra: HashMap::new(),
        }
    }
}

/// Partial metadata applied by a transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataPatch {
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub exit_code: Option<i32>,
    pub restart_attempts: Option<u32>,
    pub last_restart_at: Option<DateTime<Utc>>,
    pub extra: HashMap<String, Value>,
}

impl MetadataPatch {
    /// Record an error message and code.
    pub fn error(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            error_code: Some(code.into()),
            ..Default::default()
        }
    }

    /// Record an [`McpError`].
    pub fn from_error(err: &McpError) -> Self {
        Self::error(err.to_string(), err.code())
    }

    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Merge onto `base` for a machine entering `to` from `from`.
    ///
    /// Error details survive only into error-like states unless re-supplied.
    fn apply(self, base: &StateMetadata, from: ServerState, to: ServerState) -> StateMetadata {
        let keeps_error = to.is_error() || to == ServerState::AuthRequired;
        let mut extra = base.extra.clone();
        extra.extend(self.extra);

        StateMetadata {
            entered_at: Utc::now(),
            previous_state: Some(from),
            error_message: self
                .error_message
                .or_else(|| keeps_error.then(|| base.error_message.clone()).flatten()),
            error_code: self
                .error_code
                .or_else(|| keeps_error.then(|| base.error_code.clone()).flatten()),
            exit_code: self
                .exit_code
                .or_else(|| keeps_error.then_some(base.exit_code).flatten()),
            restart_attempts: self.restart_attempts.unwrap_or(base.restart_attempts),
            last_restart_at: self.last_restart_at.or(base.last_restart_at),
            extra,
        }
    }
}

/// One recorded transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub from: ServerState,
    pub to: ServerState,
    pub event: StateEvent,
    pub at: DateTime<Utc>,
    /// Set for [`StateMachine::force_state`], which bypasses the table.
    #[serde(default)]
    pub forced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// A transition, as seen by hooks and listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub server_id: String,
    pub from: ServerState,
    pub to: ServerState,
    pub event: StateEvent,
    pub forced: bool,
    pub metadata: StateMetadata,
}

/// Runs before a transition applies. Returning `false` vetoes it.
pub type BeforeHook = Box<dyn Fn(&StateChange) -> bool + Send + Sync>;

/// Runs after a transition applied and listeners were notified.
pub type AfterHook = Box<dyn Fn(&StateChange) + Send + Sync>;

struct Current {
    state: ServerState,
    metadata: StateMetadata,
    history: VecDeque<HistoryEntry>,
}

/// State machine for one server.
pub struct StateMachine {
    server_id: String,
    capacity: usize,
    gate: Mutex<()>,
    current: Mutex<Current>,
    before: RwLock<Vec<BeforeHook>>,
    after: RwLock<Vec<AfterHook>>,
    listeners: Listeners<StateChange>,
}

impl StateMachine {
    /// A machine in `IDLE` with the default history capacity.
    pub fn new(server_id: impl Into<String>) -> Self {
        Self::with_capacity(server_id, DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_capacity(server_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            server_id: server_id.into(),
            capacity: capacity.max(1),
            gate: Mutex::new(()),
            current: Mutex::new(Current {
                state: ServerState::Idle,
                metadata: StateMetadata::default(),
                history: VecDeque::new(),
            }),
            before: RwLock::new(Vec::new()),
            after: RwLock::new(Vec::new()),
            listeners: Listeners::new(),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn state(&self) -> ServerState {
        self.current().state
    }

    pub fn metadata(&self) -> StateMetadata {
        self.current().metadata.clone()
    }

    /// Recorded transitions, oldest first.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.current().history.iter().cloned().collect()
    }

    pub fn can_transition(&self, event: StateEvent) -> bool {
        next_state(self.state(), event).is_some()
    }

    /// Events accepted in the current state.
    pub fn allowed_events(&self) -> Vec<StateEvent> {
        let state = self.state();
        StateEvent::ALL
            .into_iter()
            .filter(|event| next_state(state, *event).is_some())
            .collect()
    }

    /// Apply `event`.
    ///
    /// Returns `Ok(false)` when a before-hook vetoed the transition and
    /// `InvalidTransition` when the current state does not accept `event`.
    /// Either way the state is unchanged.
    pub fn transition(&self, event: StateEvent, patch: MetadataPatch) -> McpResult<bool> {
        let _gate = lock(&self.gate);

        let (from, base) = {
            let current = self.current();
            (current.state, current.metadata.clone())
        };
        let Some(to) = next_state(from, event) else {
            debug!(server = %self.server_id, %from, %event, "Rejected transition");
            return Err(McpError::InvalidTransition {
                server: self.server_id.clone(),
                from,
                event,
            });
        };

        let change = StateChange {
            server_id: self.server_id.clone(),
            from,
            to,
            event,
            forced: false,
            metadata: patch.apply(&base, from, to),
        };

        if !self.run_before_hooks(&change) {
            debug!(server = %self.server_id, %from, %to, %event, "Transition vetoed");
            return Ok(false);
        }

        self.apply(&change);
        debug!(server = %self.server_id, %from, %to, %event, "State transition");

        self.listeners.notify(&change);
        self.run_after_hooks(&change);
        Ok(true)
    }

    /// Set the state without consulting the table.
    ///
    /// Used for recovery. Recorded in history as a forced `RESET`; hooks are
    /// skipped but listeners are notified.
    pub fn force_state(&self, state: ServerState, patch: MetadataPatch) {
        let _gate = lock(&self.gate);

        let (from, base) = {
            let current = self.current();
            (current.state, current.metadata.clone())
        };
        let change = StateChange {
            server_id: self.server_id.clone(),
            from,
            to: state,
            event: StateEvent::Reset,
            forced: true,
            metadata: patch.apply(&base, from, state),
        };

        self.apply(&change);
        warn!(server = %self.server_id, %from, to = %state, "Forced state change");
        self.listeners.notify(&change);
    }

    /// Listen to every applied transition, including forced ones.
    pub fn subscribe(&self, listener: impl Fn(&StateChange) + Send + Sync + 'static) -> Subscription {
        self.listeners.subscribe(listener)
    }

    pub fn add_before_hook(&self, hook: impl Fn(&StateChange) -> bool + Send + Sync + 'static) {
        self.before
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(hook));
    }

    pub fn add_after_hook(&self, hook: impl Fn(&StateChange) + Send + Sync + 'static) {
        self.after
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(hook));
    }

    fn apply(&self, change: &StateChange) {
        let mut current = self.current();
        current.state = change.to;
        current.metadata = change.metadata.clone();
        if current.history.len() >= self.capacity {
            current.history.pop_front();
        }
        current.history.push_back(HistoryEntry {
            from: change.from,
            to: change.to,
            event: change.event,
            at: change.metadata.entered_at,
            forced: change.forced,
            error_message: change.metadata.error_message.clone(),
        });
    }

    fn run_before_hooks(&self, change: &StateChange) -> bool {
        let hooks = self.before.read().unwrap_or_else(|e| e.into_inner());
        for hook in hooks.iter() {
            match catch_unwind(AssertUnwindSafe(|| hook(change))) {
                Ok(true) => {}
                Ok(false) => return false,
                Err(_) => {
                    error!(server = %self.server_id, "Before-hook panicked; vetoing transition");
                    return false;
                }
            }
        }
        true
    }

    fn run_after_hooks(&self, change: &StateChange) {
        let hooks = self.after.read().unwrap_or_else(|e| e.into_inner());
        for hook in hooks.iter() {
            if catch_unwind(AssertUnwindSafe(|| hook(change))).is_err() {
                error!(server = %self.server_id, "After-hook panicked");
            }
        }
    }

    fn current(&self) -> MutexGuard<'_, Current> {
        lock(&self.current)
    }
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("server_id", &self.server_id)
            .field("state", &self.state())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn machine_in(state: ServerState) -> StateMachine {
        let machine = StateMachine::new("test");
        machine.force_state(state, MetadataPatch::default());
        machine
    }

    #[test]
    fn test_starts_idle() {
        let machine = StateMachine::new("fs");
        assert_eq!(machine.state(), ServerState::Idle);
        assert!(machine.history().is_empty());
        assert_eq!(
            machine.allowed_events(),
            vec![StateEvent::Validate, StateEvent::Start, StateEvent::Authenticate]
        );
    }

    #[test]
    fn test_happy_path() {
        let machine = StateMachine::new("fs");
        for event in [StateEvent::Validate, StateEvent::Valid, StateEvent::Started] {
            assert!(machine.transition(event, MetadataPatch::default()).unwrap());
        }
        assert_eq!(machine.state(), ServerState::Running);

        let history = machine.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].from, ServerState::Starting);
        assert_eq!(history[2].to, ServerState::Running);
        assert_eq!(machine.metadata().previous_state, Some(ServerState::Starting));
    }

    #[test]
    fn test_every_unlisted_pair_is_rejected_without_change() {
        for state in ServerState::ALL {
            for event in StateEvent::ALL {
                let machine = machine_in(state);
                let before = machine.history().len();
                let result = machine.transition(event, MetadataPatch::default());
                match next_state(state, event) {
                    Some(to) => {
                        assert!(result.unwrap());
                        assert_eq!(machine.state(), to);
                    }
                    None => {
                        assert!(matches!(
                            result,
                            Err(McpError::InvalidTransition { from, event: e, .. })
                                if from == state && e == event
                        ));
                        assert_eq!(machine.state(), state);
                        assert_eq!(machine.history().len(), before);
                    }
                }
            }
        }
    }

    #[test]
    fn test_every_state_is_reachable_from_idle() {
        let mut seen = HashSet::from([ServerState::Idle]);
        let mut frontier = vec![ServerState::Idle];
        while let Some(state) = frontier.pop() {
            for event in StateEvent::ALL {
                if let Some(to) = next_state(state, event) {
                    if seen.insert(to) {
                        frontier.push(to);
                    }
                }
            }
        }
        assert_eq!(seen.len(), ServerState::ALL.len());
    }

    #[test]
    fn test_every_state_can_get_back_to_idle() {
        for start in ServerState::ALL {
            let mut seen = HashSet::from([start]);
            let mut frontier = vec![start];
            while let Some(state) = frontier.pop() {
                for event in StateEvent::ALL {
                    if let Some(to) = next_state(state, event) {
                        if seen.insert(to) {
                            frontier.push(to);
                        }
                    }
                }
            }
            assert!(seen.contains(&ServerState::Idle), "{start} is a dead end");
        }
    }

    #[test]
    fn test_history_is_bounded() {
        let machine = StateMachine::with_capacity("fs", 4);
        for _ in 0..5 {
            machine.transition(StateEvent::Start, MetadataPatch::default()).unwrap();
            machine.transition(StateEvent::Stop, MetadataPatch::default()).unwrap();
            machine.transition(StateEvent::Stopped, MetadataPatch::default()).unwrap();
        }
        let history = machine.history();
        assert_eq!(history.len(), 4);
        assert_eq!(history.last().unwrap().to, ServerState::Stopped);
    }

    #[test]
    fn test_before_hook_can_veto() {
        let machine = StateMachine::new("fs");
        machine.add_before_hook(|change| change.event != StateEvent::Start);

        assert!(!machine.transition(StateEvent::Start, MetadataPatch::default()).unwrap());
        assert_eq!(machine.state(), ServerState::Idle);
        assert!(machine.history().is_empty());

        assert!(machine.transition(StateEvent::Validate, MetadataPatch::default()).unwrap());
        assert_eq!(machine.state(), ServerState::Validating);
    }

    #[test]
    fn test_listeners_and_after_hooks_see_the_change() {
        let machine = StateMachine::new("fs");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let after_calls = Arc::new(AtomicUsize::new(0));

        let sink = seen.clone();
        let _sub = machine.subscribe(move |change| sink.lock().unwrap().push((change.from, change.to)));
        let counter = after_calls.clone();
        machine.add_after_hook(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        machine.transition(StateEvent::Validate, MetadataPatch::default()).unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(ServerState::Idle, ServerState::Validating)]
        );
        assert_eq!(after_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_can_read_machine_state() {
        let machine = Arc::new(StateMachine::new("fs"));
        let observed = Arc::new(Mutex::new(None));

        let reader = Arc::downgrade(&machine);
        let sink = observed.clone();
        let _sub = machine.subscribe(move |_| {
            if let Some(machine) = reader.upgrade() {
                *sink.lock().unwrap() = Some(machine.state());
            }
        });

        machine.transition(StateEvent::Start, MetadataPatch::default()).unwrap();
        assert_eq!(*observed.lock().unwrap(), Some(ServerState::Validating));
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let machine = StateMachine::new("fs");
        let calls = Arc::new(AtomicUsize::new(0));

        let _bad = machine.subscribe(|_| panic!("boom"));
        let counter = calls.clone();
        let _good = machine.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        machine.transition(StateEvent::Start, MetadataPatch::default()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(machine.state(), ServerState::Validating);
    }

    #[test]
    fn test_force_state_is_recorded_as_forced_reset() {
        let machine = StateMachine::new("fs");
        machine.force_state(
            ServerState::Crashed,
            MetadataPatch::default().with_extra("recovered_from", "RUNNING"),
        );
        let history = machine.history();
        assert_eq!(history.len(), 1);
        assert!(history[0].forced);
        assert_eq!(history[0].event, StateEvent::Reset);
        assert_eq!(machine.state(), ServerState::Crashed);
        assert_eq!(
            machine.metadata().extra.get("recovered_from"),
            Some(&Value::from("RUNNING"))
        );
    }

    #[test]
    fn test_error_metadata_clears_on_recovery() {
        let machine = StateMachine::new("fs");
        machine.transition(StateEvent::Start, MetadataPatch::default()).unwrap();
        machine
            .transition(StateEvent::Invalid, MetadataPatch::error("bad command", "INVALID_CONFIG"))
            .unwrap();
        assert_eq!(machine.metadata().error_code.as_deref(), Some("INVALID_CONFIG"));
        assert_eq!(
            machine.history().last().unwrap().error_message.as_deref(),
            Some("bad command")
        );

        machine.transition(StateEvent::Reset, MetadataPatch::default()).unwrap();
        let metadata = machine.metadata();
        assert_eq!(metadata.error_message, None);
        assert_eq!(metadata.error_code, None);
        assert_eq!(metadata.previous_state, Some(ServerState::ConfigError));
    }

    #[test]
    fn test_serialized_names() {
        assert_eq!(
            serde_json::to_string(&ServerState::TokenRefreshing).unwrap(),
            "\"TOKEN_REFRESHING\""
        );
        assert_eq!(
            serde_json::from_str::<StateEvent>("\"AUTH_SUCCESS\"").unwrap(),
            StateEvent::AuthSuccess
        );
        assert_eq!(ServerState::ConfigError.to_string(), "CONFIG_ERROR");
    }
}
