//! Composition root: wires settings, supervisors, catalog, vector index, and
//! sessions into one running hub.

use std::sync::Arc;
use std::time::Duration;

use manifold_config::{ManifoldConfig, SettingsStore};
use manifold_hub::{
    ClientFactory, HubError, HubResult, ToolCatalog, TransportClientFactory, UpstreamSet,
};
use manifold_mcp::protocol::ServerInfo;
use manifold_vector::{Embedder, EmbeddingStore, HttpEmbedder, VectorIndex};
use tokio::task::JoinHandle;

use crate::router::spawn_change_notifier;
use crate::session::SessionManager;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Shared state behind every handler.
#[derive(Clone)]
pub struct HubState {
    pub settings: Arc<SettingsStore>,
    pub upstreams: Arc<UpstreamSet>,
    pub catalog: Arc<ToolCatalog>,
    pub vector: Option<Arc<VectorIndex>>,
    pub sessions: Arc<SessionManager>,
    pub server_info: ServerInfo,
    pub base_path: String,
}

/// A running hub: state plus its background tasks.
pub struct Hub {
    pub state: HubState,
    tasks: Vec<JoinHandle<()>>,
}

impl Hub {
    /// Start with the production transport factory and embedder.
    pub async fn start(config: ManifoldConfig) -> HubResult<Self> {
        Self::start_with(config, Arc::new(TransportClientFactory), None).await
    }

    /// Start with injected collaborators (the test seam).
    pub async fn start_with(
        config: ManifoldConfig,
        factory: Arc<dyn ClientFactory>,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> HubResult<Self> {
        let base_path = config.server.base_path.clone();
        let settings = Arc::new(SettingsStore::new(config.settings));
        let catalog = Arc::new(ToolCatalog::new());
        let upstreams = Arc::new(UpstreamSet::new(factory, Arc::clone(&catalog)));

        let snapshot = settings.snapshot();
        upstreams.sync(&snapshot).await;

        let mut tasks = Vec::new();
        tasks.push(upstreams.run(&settings));

        let vector = if snapshot.flags.smart_routing.enabled {
            let flags = &snapshot.flags.smart_routing;
            let store = match &flags.database {
                Some(path) => EmbeddingStore::open(path),
                None => EmbeddingStore::open_in_memory(),
            }
            .map_err(|e| HubError::configuration(format!("embedding store: {}", e)))?;

            let embedder = embedder.unwrap_or_else(|| {
                Arc::new(HttpEmbedder::new(
                    flags.endpoint.clone(),
                    flags.embed_model.clone(),
                    flags.api_key.clone(),
                )) as Arc<dyn Embedder>
            });

            let index = VectorIndex::new(store, embedder, Arc::clone(&catalog));
            tasks.push(index.spawn_reconciler());

            // Seed from whatever the catalog already holds; later changes
            // arrive through the reconciler.
            let seed_index = Arc::clone(&index);
            tasks.push(tokio::spawn(async move {
                if let Err(e) = seed_index.resync().await {
                    tracing::warn!("initial vector resync deferred: {}", e);
                }
            }));

            Some(index)
        } else {
            None
        };

        let sessions = SessionManager::new(Arc::clone(&settings));
        tasks.push(sessions.spawn_cleanup());

        let state = HubState {
            settings,
            upstreams,
            catalog,
            vector,
            sessions,
            server_info: ServerInfo {
                name: "manifold".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            base_path,
        };
        tasks.push(spawn_change_notifier(state.clone()));

        Ok(Self { state, tasks })
    }

    /// The downstream HTTP surface.
    pub fn router(&self) -> axum::Router {
        crate::handlers::build_router(self.state.clone())
    }

    /// Orderly teardown: sessions first, then supervisors, then tasks.
    pub async fn shutdown(self) {
        self.state.sessions.close_all();
        self.state.upstreams.shutdown_all(SHUTDOWN_GRACE).await;
        for task in self.tasks {
            task.abort();
        }
    }
}
