//! Per-upstream supervision: connection lifecycle, keep-alive, backoff
//! reconnect, and settings reconciliation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use manifold_config::{SettingsChange, Settings, SettingsStore, UpstreamChange, UpstreamSpec};
use manifold_mcp::protocol::ClientInfo;
use manifold_mcp::transport::{connect_upstream, TransportEvent, UpstreamClient};
use manifold_mcp::{McpResult, ToolCallResult, ToolDescriptor};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::backoff::BackoffSchedule;
use crate::catalog::{apply_overlay, ToolCatalog};
use crate::error::{HubError, HubResult};
use crate::runtime::{UpstreamState, UpstreamStatus};

const PING_TIMEOUT: Duration = Duration::from_secs(10);
const COMMAND_QUEUE: usize = 64;

/// Builds connected clients from specs; swapped out in tests.
#[async_trait::async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(&self, spec: &UpstreamSpec) -> McpResult<Arc<dyn UpstreamClient>>;
}

/// The production factory: dispatch on the spec's transport kind.
pub struct TransportClientFactory;

#[async_trait::async_trait]
impl ClientFactory for TransportClientFactory {
    async fn connect(&self, spec: &UpstreamSpec) -> McpResult<Arc<dyn UpstreamClient>> {
        connect_upstream(&spec.name, &spec.transport).await
    }
}

enum Command {
    CallTool {
        tool: String,
        arguments: Value,
        reply: oneshot::Sender<HubResult<ToolCallResult>>,
    },
    UpdateSpec {
        spec: Box<UpstreamSpec>,
        keep_alive: Duration,
    },
    Refresh,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap, cloneable handle to one supervisor task.
#[derive(Clone)]
pub struct UpstreamHandle {
    name: String,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<UpstreamStatus>,
}

impl UpstreamHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> UpstreamStatus {
        self.status.borrow().clone()
    }

    /// Dispatch a tool call. The supervisor hands the call to a worker task,
    /// so a slow upstream never blocks its own state machine.
    pub async fn call_tool(&self, tool: &str, arguments: Value) -> HubResult<ToolCallResult> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::CallTool {
                tool: tool.to_string(),
                arguments,
                reply,
            })
            .await
            .map_err(|_| HubError::upstream_unavailable(&self.name))?;
        rx.await
            .map_err(|_| HubError::upstream_unavailable(&self.name))?
    }

    pub async fn update_spec(&self, spec: UpstreamSpec, keep_alive: Duration) {
        let _ = self
            .commands
            .send(Command::UpdateSpec {
                spec: Box::new(spec),
                keep_alive,
            })
            .await;
    }

    pub async fn refresh(&self) {
        let _ = self.commands.send(Command::Refresh).await;
    }

    async fn shutdown(&self, grace: Duration) {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Shutdown { reply })
            .await
            .is_ok()
        {
            let _ = tokio::time::timeout(grace, rx).await;
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

/// The per-upstream state machine. Owns the client; every transition runs on
/// the supervisor task, so transitions are serialized per upstream while
/// different upstreams run in parallel.
struct Supervisor {
    name: String,
    spec: UpstreamSpec,
    keep_alive: Duration,
    factory: Arc<dyn ClientFactory>,
    catalog: Arc<ToolCatalog>,
    client_info: ClientInfo,
    schedule: BackoffSchedule,

    state: UpstreamState,
    client: Option<Arc<dyn UpstreamClient>>,
    events: Option<broadcast::Receiver<TransportEvent>>,
    raw_tools: Vec<ToolDescriptor>,
    consecutive_failures: u32,
    ping_failures: u32,
    next_retry_at: Option<Instant>,
    next_ping_at: Option<Instant>,
    status: watch::Sender<UpstreamStatus>,
    published: UpstreamStatus,
}

impl Supervisor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        // First connect attempt fires immediately.
        self.next_retry_at = Some(Instant::now());

        loop {
            let retry_at = self.next_retry_at;
            let ping_at = self.next_ping_at;
            let mut events = self.events.take();

            enum Wake {
                Cmd(Option<Command>),
                Retry,
                Ping,
                Event(Option<TransportEvent>),
                EventsClosed,
            }

            let wake = tokio::select! {
                cmd = commands.recv() => Wake::Cmd(cmd),
                _ = sleep_until_opt(retry_at) => Wake::Retry,
                _ = sleep_until_opt(ping_at) => Wake::Ping,
                ev = recv_opt(&mut events) => match ev {
                    Some(ev) => Wake::Event(Some(ev)),
                    None => Wake::EventsClosed,
                },
            };
            self.events = events;

            match wake {
                Wake::Cmd(None) => {
                    // Handle dropped; treat like shutdown.
                    self.close_client().await;
                    self.set_state(UpstreamState::Closed);
                    break;
                }
                Wake::Cmd(Some(command)) => {
                    if let Flow::Stop = self.handle_command(command).await {
                        break;
                    }
                }
                Wake::Retry => {
                    self.next_retry_at = None;
                    if self.state.can_retry() || self.state == UpstreamState::Disconnected {
                        self.attempt_connect().await;
                    }
                }
                Wake::Ping => {
                    self.next_ping_at = None;
                    self.keep_alive_ping().await;
                }
                Wake::Event(Some(TransportEvent::Broken { reason })) => {
                    if self.state.is_ready() {
                        tracing::warn!(upstream = %self.name, "transport broken: {}", reason);
                        self.record_failure(reason).await;
                    }
                }
                Wake::Event(Some(TransportEvent::ListChanged)) => {
                    tracing::debug!(upstream = %self.name, "upstream announced tool list change");
                    self.refresh_tools().await;
                }
                Wake::Event(None) | Wake::EventsClosed => {
                    self.events = None;
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) -> Flow {
        match command {
            Command::CallTool {
                tool,
                arguments,
                reply,
            } => {
                let Some(client) = self.client.clone().filter(|_| self.state.is_ready()) else {
                    let _ = reply.send(Err(HubError::upstream_unavailable(&self.name)));
                    return Flow::Continue;
                };
                let upstream = self.name.clone();
                tokio::spawn(async move {
                    let result = client
                        .call_tool(&tool, arguments)
                        .await
                        .map_err(|e| HubError::from_upstream(&upstream, e));
                    let _ = reply.send(result);
                });
                Flow::Continue
            }

            Command::UpdateSpec { spec, keep_alive } => {
                self.spec = *spec;
                self.keep_alive = keep_alive;
                if self.state.is_ready() {
                    self.publish_tools();
                    self.schedule_ping();
                }
                Flow::Continue
            }

            Command::Refresh => {
                self.refresh_tools().await;
                Flow::Continue
            }

            Command::Shutdown { reply } => {
                self.close_client().await;
                self.set_state(UpstreamState::Closed);
                self.catalog.remove_upstream(&self.name);
                let _ = reply.send(());
                Flow::Stop
            }
        }
    }

    async fn attempt_connect(&mut self) {
        self.set_state(UpstreamState::Connecting);
        match self.try_connect().await {
            Ok(()) => {
                self.consecutive_failures = 0;
                self.ping_failures = 0;
                self.published.last_error = None;
                self.published.connected_at = Some(Utc::now());
                self.set_state(UpstreamState::Ready);
                self.schedule_ping();
                tracing::info!(upstream = %self.name, kind = %self.spec.transport.type_name(),
                    tools = self.raw_tools.len(), "upstream ready");
            }
            Err(e) => {
                tracing::warn!(upstream = %self.name, "connect failed: {}", e);
                self.record_failure(e.to_string()).await;
            }
        }
    }

    async fn try_connect(&mut self) -> McpResult<()> {
        self.close_client().await;

        let client = self.factory.connect(&self.spec).await?;
        let init = client.initialize(self.client_info.clone()).await?;
        let tools = client.list_tools().await?;

        self.published.server_info = Some(init.server_info);
        self.published.last_tools_refresh = Some(Utc::now());
        self.raw_tools = tools;
        self.events = Some(client.subscribe_events());
        self.client = Some(client);
        self.publish_tools();
        Ok(())
    }

    async fn record_failure(&mut self, reason: String) {
        self.consecutive_failures += 1;
        self.published.last_error = Some(reason);
        self.close_client().await;
        self.set_state(UpstreamState::Degraded);

        let delay = self.schedule.delay(self.consecutive_failures);
        self.next_retry_at = Some(Instant::now() + delay);
        tracing::debug!(upstream = %self.name, failures = self.consecutive_failures,
            "retry scheduled in {:?}", delay);
    }

    async fn keep_alive_ping(&mut self) {
        if !self.state.is_ready() || !self.spec.transport.has_persistent_channel() {
            return;
        }
        let Some(client) = self.client.clone() else {
            return;
        };

        // A ping that runs out the clock counts as a failure.
        let outcome = tokio::time::timeout(PING_TIMEOUT, client.ping()).await;
        match outcome {
            Ok(Ok(())) => {
                self.ping_failures = 0;
                self.schedule_ping();
            }
            Ok(Err(e)) => self.ping_failed(e.to_string()).await,
            Err(_) => self.ping_failed(format!("ping timed out after {:?}", PING_TIMEOUT)).await,
        }
    }

    async fn ping_failed(&mut self, reason: String) {
        self.ping_failures += 1;
        tracing::warn!(upstream = %self.name, failures = self.ping_failures,
            "keep-alive failed: {}", reason);
        if self.ping_failures >= 2 {
            self.record_failure(format!("keep-alive failed twice: {}", reason)).await;
        } else {
            self.schedule_ping();
        }
    }

    async fn refresh_tools(&mut self) {
        if !self.state.is_ready() {
            return;
        }
        let Some(client) = self.client.clone() else {
            return;
        };
        match client.list_tools().await {
            Ok(tools) => {
                self.raw_tools = tools;
                self.published.last_tools_refresh = Some(Utc::now());
                self.publish_tools();
            }
            Err(e) if e.is_connection_fault() => {
                self.record_failure(format!("tools/list failed: {}", e)).await;
            }
            Err(e) => {
                // Refresh failures retry silently on the next trigger.
                tracing::warn!(upstream = %self.name, "tools/list failed: {}", e);
            }
        }
    }

    fn publish_tools(&mut self) {
        let effective = apply_overlay(&self.name, &self.spec.tools, &self.raw_tools);
        self.published.tool_count = effective.iter().filter(|t| t.enabled).count();
        self.catalog.set_upstream_tools(&self.name, effective);
        self.publish_status();
    }

    fn schedule_ping(&mut self) {
        self.next_ping_at = self
            .spec
            .transport
            .has_persistent_channel()
            .then(|| Instant::now() + self.keep_alive);
    }

    async fn close_client(&mut self) {
        self.events = None;
        self.next_ping_at = None;
        if let Some(client) = self.client.take() {
            if let Err(e) = client.close().await {
                tracing::debug!(upstream = %self.name, "close failed: {}", e);
            }
        }
    }

    fn set_state(&mut self, state: UpstreamState) {
        if self.state != state {
            tracing::debug!(upstream = %self.name, from = ?self.state, to = ?state, "state transition");
        }
        self.state = state;
        self.publish_status();
    }

    fn publish_status(&mut self) {
        self.published.state = self.state;
        self.published.consecutive_failures = self.consecutive_failures;
        let _ = self.status.send(self.published.clone());
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn recv_opt(
    events: &mut Option<broadcast::Receiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match events {
        Some(rx) => match rx.recv().await {
            Ok(event) => Some(event),
            // Missing a few events at worst means a missed refresh; resync.
            Err(broadcast::error::RecvError::Lagged(_)) => Some(TransportEvent::ListChanged),
            Err(broadcast::error::RecvError::Closed) => None,
        },
        None => std::future::pending().await,
    }
}

/// The set of supervised upstreams, reconciled against the settings store.
pub struct UpstreamSet {
    factory: Arc<dyn ClientFactory>,
    catalog: Arc<ToolCatalog>,
    client_info: ClientInfo,
    inner: RwLock<HashMap<String, (UpstreamHandle, JoinHandle<()>)>>,
}

impl UpstreamSet {
    pub fn new(factory: Arc<dyn ClientFactory>, catalog: Arc<ToolCatalog>) -> Self {
        Self {
            factory,
            catalog,
            client_info: ClientInfo::new("manifold", env!("CARGO_PKG_VERSION")),
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Bring the set in line with a full settings snapshot (startup path).
    pub async fn sync(&self, settings: &Settings) {
        for spec in settings.upstreams.iter().filter(|s| s.enabled) {
            self.spawn_upstream(spec.clone(), settings.keep_alive_for(spec));
        }
    }

    /// Apply one settings diff (hot-reload path).
    pub async fn apply_change(&self, change: &SettingsChange) {
        for diff in &change.diff.upstreams {
            match diff.change {
                UpstreamChange::Added => {
                    if let Some(spec) = change.settings.upstream(&diff.name) {
                        self.spawn_upstream(spec.clone(), change.settings.keep_alive_for(spec));
                    }
                }
                UpstreamChange::Removed => {
                    self.remove_upstream(&diff.name).await;
                }
                UpstreamChange::Reconnect => {
                    self.remove_upstream(&diff.name).await;
                    if let Some(spec) = change.settings.upstream(&diff.name) {
                        self.spawn_upstream(spec.clone(), change.settings.keep_alive_for(spec));
                    }
                }
                UpstreamChange::Overlay => {
                    let handle = self.handle(&diff.name);
                    if let (Some(handle), Some(spec)) =
                        (handle, change.settings.upstream(&diff.name))
                    {
                        handle
                            .update_spec(spec.clone(), change.settings.keep_alive_for(spec))
                            .await;
                    }
                }
            }
        }

        if change.diff.flags_changed {
            // The keep-alive default may have moved; push it everywhere.
            let handles: Vec<UpstreamHandle> = self.handles();
            for handle in handles {
                if let Some(spec) = change.settings.upstream(handle.name()) {
                    handle
                        .update_spec(spec.clone(), change.settings.keep_alive_for(spec))
                        .await;
                }
            }
        }
    }

    /// Subscribe to the settings store and reconcile until it goes away.
    pub fn run(self: &Arc<Self>, store: &SettingsStore) -> JoinHandle<()> {
        let set = Arc::clone(self);
        let mut changes = store.subscribe();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => set.apply_change(&change).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("settings reconciler lagged by {} changes", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_upstream(&self, spec: UpstreamSpec, keep_alive: Duration) {
        let name = spec.name.clone();
        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (status_tx, status_rx) = watch::channel(UpstreamStatus::new(&name));

        let supervisor = Supervisor {
            name: name.clone(),
            keep_alive,
            factory: Arc::clone(&self.factory),
            catalog: Arc::clone(&self.catalog),
            client_info: self.client_info.clone(),
            schedule: BackoffSchedule::default(),
            state: UpstreamState::Disconnected,
            client: None,
            events: None,
            raw_tools: Vec::new(),
            consecutive_failures: 0,
            ping_failures: 0,
            next_retry_at: None,
            next_ping_at: None,
            status: status_tx,
            published: UpstreamStatus::new(&name),
            spec,
        };

        let task = tokio::spawn(supervisor.run(command_rx));
        let handle = UpstreamHandle {
            name: name.clone(),
            commands,
            status: status_rx,
        };

        let mut inner = self.inner.write().expect("upstream set lock poisoned");
        if let Some((_, old_task)) = inner.insert(name.clone(), (handle, task)) {
            old_task.abort();
        }
    }

    async fn remove_upstream(&self, name: &str) {
        let entry = self
            .inner
            .write()
            .expect("upstream set lock poisoned")
            .remove(name);
        if let Some((handle, task)) = entry {
            handle.shutdown(Duration::from_secs(5)).await;
            task.abort();
        }
        self.catalog.remove_upstream(name);
    }

    pub fn handle(&self, name: &str) -> Option<UpstreamHandle> {
        self.inner
            .read()
            .expect("upstream set lock poisoned")
            .get(name)
            .map(|(handle, _)| handle.clone())
    }

    fn handles(&self) -> Vec<UpstreamHandle> {
        self.inner
            .read()
            .expect("upstream set lock poisoned")
            .values()
            .map(|(handle, _)| handle.clone())
            .collect()
    }

    /// Dispatch a call to a named upstream.
    pub async fn call_tool(
        &self,
        upstream: &str,
        tool: &str,
        arguments: Value,
    ) -> HubResult<ToolCallResult> {
        let handle = self
            .handle(upstream)
            .ok_or_else(|| HubError::upstream_unavailable(upstream))?;
        handle.call_tool(tool, arguments).await
    }

    pub fn status(&self, name: &str) -> Option<UpstreamStatus> {
        self.handle(name).map(|h| h.status())
    }

    /// Statuses of every supervised upstream, ordered by name.
    pub fn statuses(&self) -> Vec<UpstreamStatus> {
        let mut statuses: Vec<UpstreamStatus> =
            self.handles().iter().map(|h| h.status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Close every supervisor, waiting up to `grace` for each.
    pub async fn shutdown_all(&self, grace: Duration) {
        let entries: Vec<(UpstreamHandle, JoinHandle<()>)> = {
            let mut inner = self.inner.write().expect("upstream set lock poisoned");
            inner.drain().map(|(_, entry)| entry).collect()
        };
        for (handle, task) in entries {
            handle.shutdown(grace).await;
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_mcp::protocol::{
        InitializeResult, ServerCapabilities, ServerInfo, ToolDescriptor,
        LATEST_PROTOCOL_VERSION,
    };
    use manifold_mcp::transport::TransportKind;
    use manifold_mcp::McpError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockClient {
        tools: Vec<ToolDescriptor>,
        events: broadcast::Sender<TransportEvent>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl UpstreamClient for MockClient {
        async fn initialize(&self, _info: ClientInfo) -> McpResult<InitializeResult> {
            Ok(InitializeResult {
                protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
                capabilities: ServerCapabilities::tools_only(),
                server_info: ServerInfo {
                    name: "mock".into(),
                    version: "1.0".into(),
                },
            })
        }

        async fn list_tools(&self) -> McpResult<Vec<ToolDescriptor>> {
            Ok(self.tools.clone())
        }

        async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<ToolCallResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ToolCallResult::text(format!("{}:{}", name, arguments)))
        }

        async fn ping(&self) -> McpResult<()> {
            Ok(())
        }

        async fn close(&self) -> McpResult<()> {
            Ok(())
        }

        fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
            self.events.subscribe()
        }

        fn kind(&self) -> &'static str {
            "mock"
        }
    }

    struct MockFactory {
        tools: Vec<ToolDescriptor>,
        fail: bool,
        calls: Arc<AtomicUsize>,
        connects: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl ClientFactory for MockFactory {
        async fn connect(&self, _spec: &UpstreamSpec) -> McpResult<Arc<dyn UpstreamClient>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(McpError::connection_failed("mock refuses"));
            }
            let (events, _) = broadcast::channel(4);
            Ok(Arc::new(MockClient {
                tools: self.tools.clone(),
                events,
                calls: Arc::clone(&self.calls),
            }))
        }
    }

    fn stdio_spec(name: &str) -> UpstreamSpec {
        UpstreamSpec::new(
            name,
            TransportKind::Stdio {
                command: "/bin/cat".into(),
                args: vec![],
                env: Default::default(),
                cwd: None,
            },
        )
    }

    async fn wait_for_state(set: &UpstreamSet, name: &str, state: UpstreamState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if set.status(name).map(|s| s.state) == Some(state) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("upstream '{}' never reached {:?}", name, state));
    }

    #[tokio::test]
    async fn upstream_reaches_ready_and_publishes_tools() {
        let catalog = Arc::new(ToolCatalog::new());
        let factory = Arc::new(MockFactory {
            tools: vec![ToolDescriptor::new("echo", "echoes input", json!({"type": "object"}))],
            fail: false,
            calls: Arc::new(AtomicUsize::new(0)),
            connects: Arc::new(AtomicUsize::new(0)),
        });
        let set = UpstreamSet::new(factory, Arc::clone(&catalog));

        let settings = Settings {
            upstreams: vec![stdio_spec("echo")],
            ..Default::default()
        };
        set.sync(&settings).await;
        wait_for_state(&set, "echo", UpstreamState::Ready).await;

        assert_eq!(catalog.version(), 1);
        let snapshot = catalog.snapshot();
        assert_eq!(snapshot.tools.len(), 1);
        assert_eq!(snapshot.tools[0].name, "echo");

        let result = set.call_tool("echo", "echo", json!({"text": "hi"})).await.unwrap();
        assert!(!result.is_error);

        set.shutdown_all(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn failed_connect_degrades_and_schedules_retry() {
        let catalog = Arc::new(ToolCatalog::new());
        let connects = Arc::new(AtomicUsize::new(0));
        let factory = Arc::new(MockFactory {
            tools: vec![],
            fail: true,
            calls: Arc::new(AtomicUsize::new(0)),
            connects: Arc::clone(&connects),
        });
        let set = UpstreamSet::new(factory, catalog);

        let settings = Settings {
            upstreams: vec![stdio_spec("flaky")],
            ..Default::default()
        };
        set.sync(&settings).await;
        wait_for_state(&set, "flaky", UpstreamState::Degraded).await;

        let status = set.status("flaky").unwrap();
        assert!(status.consecutive_failures >= 1);
        assert!(status.last_error.is_some());
        assert!(connects.load(Ordering::SeqCst) >= 1);

        let result = set.call_tool("flaky", "anything", json!({})).await;
        assert!(matches!(result, Err(HubError::UpstreamUnavailable { .. })));

        set.shutdown_all(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn removal_clears_catalog_entries() {
        let catalog = Arc::new(ToolCatalog::new());
        let factory = Arc::new(MockFactory {
            tools: vec![ToolDescriptor::new("t", "", json!({"type": "object"}))],
            fail: false,
            calls: Arc::new(AtomicUsize::new(0)),
            connects: Arc::new(AtomicUsize::new(0)),
        });
        let set = UpstreamSet::new(factory, Arc::clone(&catalog));

        let settings = Settings {
            upstreams: vec![stdio_spec("gone")],
            ..Default::default()
        };
        set.sync(&settings).await;
        wait_for_state(&set, "gone", UpstreamState::Ready).await;
        assert_eq!(catalog.snapshot().tools.len(), 1);

        set.remove_upstream("gone").await;
        assert!(catalog.snapshot().tools.is_empty());
        assert!(set.status("gone").is_none());
    }

    #[tokio::test]
    async fn overlay_update_republishes_without_reconnect() {
        let catalog = Arc::new(ToolCatalog::new());
        let connects = Arc::new(AtomicUsize::new(0));
        let factory = Arc::new(MockFactory {
            tools: vec![ToolDescriptor::new("weather", "Get current weather", json!({"type": "object"}))],
            fail: false,
            calls: Arc::new(AtomicUsize::new(0)),
            connects: Arc::clone(&connects),
        });
        let set = UpstreamSet::new(factory, Arc::clone(&catalog));

        let settings = Settings {
            upstreams: vec![stdio_spec("a")],
            ..Default::default()
        };
        set.sync(&settings).await;
        wait_for_state(&set, "a", UpstreamState::Ready).await;
        let connects_before = connects.load(Ordering::SeqCst);

        let mut spec = stdio_spec("a");
        spec.tools.insert(
            "weather".into(),
            manifold_config::ToolOverride {
                enabled: None,
                description: Some("Forecast service".into()),
            },
        );
        let handle = set.handle("a").unwrap();
        handle.update_spec(spec, Duration::from_secs(60)).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = catalog.snapshot();
                if snapshot.get("a", "weather").map(|t| t.description.as_str())
                    == Some("Forecast service")
                {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("override should surface in the catalog");

        assert_eq!(connects.load(Ordering::SeqCst), connects_before);
        set.shutdown_all(Duration::from_secs(1)).await;
    }
}
