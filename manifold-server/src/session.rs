//! Downstream session state.
//!
//! A session binds a transport (SSE stream or streamable-HTTP exchange) to a
//! routing scope and a principal, and remembers the tool view it last showed
//! its client so change notifications fire only when that view would differ.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use manifold_config::SettingsStore;
use manifold_hub::resolver::{self, RouteScope};
use manifold_hub::{HubError, HubResult, Principal};
use manifold_mcp::protocol::ToolDescriptor;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

const OUTBOUND_QUEUE: usize = 256;
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// How the downstream client is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTransport {
    Sse,
    HttpStream,
}

/// The tool view a session last published, plus the reverse map used by
/// `tools/call`.
#[derive(Debug, Clone, Default)]
pub struct SessionView {
    pub catalog_version: u64,
    pub tools: Vec<ToolDescriptor>,
    /// effective name → (upstream, tool)
    pub name_map: HashMap<String, (String, String)>,
}

/// One downstream session.
pub struct Session {
    pub id: String,
    pub scope: RouteScope,
    pub principal: Principal,
    pub transport: SessionTransport,
    pub created_at: DateTime<Utc>,

    last_activity: RwLock<DateTime<Utc>>,
    view: RwLock<Option<SessionView>>,
    catalog_version: AtomicU64,

    /// Outbound frames for SSE sessions; `None` for streamable HTTP.
    outbound: Option<mpsc::Sender<Value>>,
    cancel: watch::Sender<bool>,
}

impl Session {
    fn new(
        scope: RouteScope,
        principal: Principal,
        transport: SessionTransport,
        outbound: Option<mpsc::Sender<Value>>,
    ) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4().to_string(),
            scope,
            principal,
            transport,
            created_at: Utc::now(),
            last_activity: RwLock::new(Utc::now()),
            view: RwLock::new(None),
            catalog_version: AtomicU64::new(0),
            outbound,
            cancel,
        }
    }

    pub fn touch(&self) {
        *self.last_activity.write().expect("session lock poisoned") = Utc::now();
    }

    pub fn idle_for(&self) -> Duration {
        let last = *self.last_activity.read().expect("session lock poisoned");
        (Utc::now() - last).to_std().unwrap_or(Duration::ZERO)
    }

    /// Watch that flips to `true` when the session closes; in-flight calls
    /// select on this.
    pub fn cancelled(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    pub fn catalog_version(&self) -> u64 {
        self.catalog_version.load(Ordering::SeqCst)
    }

    /// The current view, if `tools/list` has run at this catalog version.
    pub fn view(&self) -> Option<SessionView> {
        self.view.read().expect("session lock poisoned").clone()
    }

    pub fn set_view(&self, view: SessionView) {
        self.catalog_version.store(view.catalog_version, Ordering::SeqCst);
        *self.view.write().expect("session lock poisoned") = Some(view);
    }

    /// Push a frame to an SSE client. Returns false when the client is gone.
    pub fn send(&self, frame: Value) -> bool {
        match &self.outbound {
            Some(tx) => tx.try_send(frame).is_ok(),
            None => false,
        }
    }

    pub fn has_outbound(&self) -> bool {
        self.outbound.is_some()
    }

    fn close(&self) {
        let _ = self.cancel.send(true);
    }
}

/// Owns every live session; enforces scope checks at creation and idle
/// expiry afterwards.
pub struct SessionManager {
    settings: Arc<SettingsStore>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionManager {
    pub fn new(settings: Arc<SettingsStore>) -> Arc<Self> {
        Arc::new(Self {
            settings,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Reject creation when the scope resolves to nothing. The global scope
    /// is exempt: an empty hub still accepts sessions and lists no tools.
    fn check_scope(&self, scope: &RouteScope, principal: &Principal) -> HubResult<()> {
        let settings = self.settings.snapshot();
        let resolved = resolver::resolve(scope, principal, &settings)?;
        if resolved.is_empty() && *scope != RouteScope::Global {
            return Err(HubError::scope_not_found(scope.label()));
        }
        Ok(())
    }

    /// Create an SSE session; the receiver feeds the event stream.
    pub fn create_sse(
        &self,
        scope: RouteScope,
        principal: Principal,
    ) -> HubResult<(Arc<Session>, mpsc::Receiver<Value>)> {
        self.check_scope(&scope, &principal)?;
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let session = Arc::new(Session::new(scope, principal, SessionTransport::Sse, Some(tx)));
        self.insert(&session);
        Ok((session, rx))
    }

    /// Create a streamable-HTTP session (stateful POST exchanges).
    pub fn create_http(&self, scope: RouteScope, principal: Principal) -> HubResult<Arc<Session>> {
        self.check_scope(&scope, &principal)?;
        let session = Arc::new(Session::new(scope, principal, SessionTransport::HttpStream, None));
        self.insert(&session);
        Ok(session)
    }

    fn insert(&self, session: &Arc<Session>) {
        tracing::info!(session = %session.id, scope = %session.scope.label(),
            principal = %session.principal.id, "session opened");
        self.sessions
            .write()
            .expect("session map lock poisoned")
            .insert(session.id.clone(), Arc::clone(session));
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .expect("session map lock poisoned")
            .get(id)
            .cloned()
    }

    /// Close and drop a session. Idempotent.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self
            .sessions
            .write()
            .expect("session map lock poisoned")
            .remove(id);
        match removed {
            Some(session) => {
                session.close();
                tracing::info!(session = %id, "session closed");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().expect("session map lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .expect("session map lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Close every session (shutdown path).
    pub fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut map = self.sessions.write().expect("session map lock poisoned");
            map.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.close();
        }
    }

    /// Periodically drop sessions idle past the configured timeout.
    pub fn spawn_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(CLEANUP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let timeout = manager.settings.snapshot().flags.idle_session_timeout;
                if timeout.is_zero() {
                    continue;
                }
                let expired: Vec<String> = manager
                    .snapshot()
                    .iter()
                    .filter(|s| s.idle_for() >= timeout)
                    .map(|s| s.id.clone())
                    .collect();
                for id in expired {
                    tracing::info!(session = %id, "session idle timeout");
                    manager.remove(&id);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_config::{Settings, SettingsStore};
    use manifold_config::UpstreamSpec;
    use manifold_mcp::transport::TransportKind;

    fn manager_with_upstream() -> Arc<SessionManager> {
        let settings = Settings {
            upstreams: vec![UpstreamSpec::new(
                "echo",
                TransportKind::Stdio {
                    command: "/bin/cat".into(),
                    args: vec![],
                    env: Default::default(),
                    cwd: None,
                },
            )],
            ..Default::default()
        };
        SessionManager::new(Arc::new(SettingsStore::new(settings)))
    }

    #[tokio::test]
    async fn sse_session_lifecycle() {
        let manager = manager_with_upstream();
        let (session, _rx) = manager
            .create_sse(RouteScope::Global, Principal::anonymous())
            .unwrap();
        assert_eq!(manager.len(), 1);
        assert!(manager.get(&session.id).is_some());

        let mut cancelled = session.cancelled();
        assert!(!*cancelled.borrow());

        assert!(manager.remove(&session.id));
        assert!(manager.get(&session.id).is_none());
        cancelled.changed().await.unwrap();
        assert!(*cancelled.borrow());

        // Removal is idempotent.
        assert!(!manager.remove(&session.id));
    }

    #[tokio::test]
    async fn unknown_scope_is_rejected_at_creation() {
        let manager = manager_with_upstream();
        let result = manager.create_http(
            RouteScope::Upstream("ghost".into()),
            Principal::anonymous(),
        );
        assert!(matches!(result, Err(HubError::ScopeNotFound { .. })));
    }

    #[tokio::test]
    async fn empty_global_scope_is_allowed() {
        let manager = SessionManager::new(Arc::new(SettingsStore::new(Settings::default())));
        let session = manager
            .create_http(RouteScope::Global, Principal::anonymous())
            .unwrap();
        assert_eq!(session.transport, SessionTransport::HttpStream);
    }

    #[tokio::test]
    async fn smart_scope_rejected_while_disabled() {
        let manager = manager_with_upstream();
        let result = manager.create_http(RouteScope::Smart, Principal::anonymous());
        assert!(matches!(result, Err(HubError::ScopeNotFound { .. })));
    }

    #[tokio::test]
    async fn view_tracking() {
        let manager = manager_with_upstream();
        let session = manager
            .create_http(RouteScope::Global, Principal::anonymous())
            .unwrap();
        assert!(session.view().is_none());

        session.set_view(SessionView {
            catalog_version: 3,
            tools: vec![],
            name_map: HashMap::new(),
        });
        assert_eq!(session.catalog_version(), 3);
        assert!(session.view().is_some());
    }
}
