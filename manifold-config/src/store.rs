//! Live settings store: atomic snapshots, serialized mutations, change
//! notification.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use crate::error::ConfigResult;
use crate::settings::Settings;
use crate::validation::Validatable;

/// How one upstream changed between two settings snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamChange {
    /// Newly declared (or newly enabled); a runtime must be created.
    Added,

    /// Removed or disabled; the runtime must be closed.
    Removed,

    /// A connection-relevant field changed; close then re-create.
    Reconnect,

    /// Only the overlay (tool flags/descriptions, keep-alive) changed;
    /// apply in place without restarting.
    Overlay,
}

/// Per-upstream entry of a [`SettingsDiff`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamDiff {
    pub name: String,
    pub change: UpstreamChange,
}

/// How one group changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupChange {
    Added,
    Removed,
    Modified,
}

/// Per-group entry of a [`SettingsDiff`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDiff {
    pub id: Uuid,
    pub change: GroupChange,
}

/// What a settings mutation actually changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsDiff {
    pub upstreams: Vec<UpstreamDiff>,
    pub groups: Vec<GroupDiff>,
    pub flags_changed: bool,
}

impl SettingsDiff {
    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty() && self.groups.is_empty() && !self.flags_changed
    }

    /// Compute the diff between two settings snapshots.
    ///
    /// A disabled upstream is treated the same as an absent one, so flipping
    /// `enabled` shows up as Added/Removed rather than a modification.
    pub fn between(old: &Settings, new: &Settings) -> Self {
        let mut upstreams = Vec::new();
        let mut names: Vec<&str> = old
            .upstreams
            .iter()
            .chain(new.upstreams.iter())
            .map(|u| u.name.as_str())
            .collect();
        names.sort_unstable();
        names.dedup();

        for name in names {
            let before = old.upstream(name).filter(|u| u.enabled);
            let after = new.upstream(name).filter(|u| u.enabled);
            let change = match (before, after) {
                (None, None) => continue,
                (None, Some(_)) => UpstreamChange::Added,
                (Some(_), None) => UpstreamChange::Removed,
                (Some(b), Some(a)) => {
                    if b.connection_fingerprint() != a.connection_fingerprint() {
                        UpstreamChange::Reconnect
                    } else if b != a {
                        UpstreamChange::Overlay
                    } else {
                        continue;
                    }
                }
            };
            upstreams.push(UpstreamDiff {
                name: name.to_string(),
                change,
            });
        }

        let mut groups = Vec::new();
        let mut ids: Vec<Uuid> = old
            .groups
            .iter()
            .chain(new.groups.iter())
            .map(|g| g.id)
            .collect();
        ids.sort_unstable();
        ids.dedup();

        for id in ids {
            let before = old.groups.iter().find(|g| g.id == id);
            let after = new.groups.iter().find(|g| g.id == id);
            let change = match (before, after) {
                (None, None) => continue,
                (None, Some(_)) => GroupChange::Added,
                (Some(_), None) => GroupChange::Removed,
                (Some(b), Some(a)) if b != a => GroupChange::Modified,
                _ => continue,
            };
            groups.push(GroupDiff { id, change });
        }

        Self {
            upstreams,
            groups,
            flags_changed: old.flags != new.flags,
        }
    }
}

/// One broadcast settings change.
#[derive(Debug, Clone)]
pub struct SettingsChange {
    /// Strictly increasing mutation counter.
    pub revision: u64,
    pub diff: SettingsDiff,
    /// The snapshot after the mutation.
    pub settings: Arc<Settings>,
}

/// Durable-storage collaborator. Failure never rolls back in-memory state.
#[async_trait::async_trait]
pub trait SettingsPersister: Send + Sync {
    async fn persist(&self, settings: &Settings) -> Result<(), String>;
}

/// Single source of truth for the hot-reloadable configuration.
///
/// Readers take cheap `Arc` snapshots and never block writers; mutations are
/// serialized by an async mutex and broadcast with their diff.
pub struct SettingsStore {
    current: RwLock<Arc<Settings>>,
    write_serial: Mutex<()>,
    revision: AtomicU64,
    changes: broadcast::Sender<SettingsChange>,
    persist_failures: broadcast::Sender<String>,
    persister: Option<Arc<dyn SettingsPersister>>,
}

impl SettingsStore {
    pub fn new(initial: Settings) -> Self {
        let (changes, _) = broadcast::channel(64);
        let (persist_failures, _) = broadcast::channel(16);
        Self {
            current: RwLock::new(Arc::new(initial)),
            write_serial: Mutex::new(()),
            revision: AtomicU64::new(0),
            changes,
            persist_failures,
            persister: None,
        }
    }

    pub fn with_persister(mut self, persister: Arc<dyn SettingsPersister>) -> Self {
        self.persister = Some(persister);
        self
    }

    /// Immutable snapshot of the current settings.
    pub fn snapshot(&self) -> Arc<Settings> {
        Arc::clone(&self.current.read().expect("settings lock poisoned"))
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Apply `mutator` to a working copy; on success the new snapshot is
    /// swapped in atomically and the diff broadcast.
    ///
    /// Mutating to identical content is a no-op: no revision bump, no
    /// broadcast, no persistence.
    pub async fn mutate<F>(&self, mutator: F) -> ConfigResult<SettingsDiff>
    where
        F: FnOnce(&mut Settings) -> ConfigResult<()>,
    {
        let _serial = self.write_serial.lock().await;

        let old = self.snapshot();
        let mut working = (*old).clone();
        mutator(&mut working)?;
        working.validate()?;

        let diff = SettingsDiff::between(&old, &working);
        if diff.is_empty() {
            return Ok(diff);
        }

        let settings = Arc::new(working);
        *self.current.write().expect("settings lock poisoned") = Arc::clone(&settings);
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;

        let _ = self.changes.send(SettingsChange {
            revision,
            diff: diff.clone(),
            settings: Arc::clone(&settings),
        });

        if let Some(persister) = self.persister.clone() {
            let failures = self.persist_failures.clone();
            tokio::spawn(async move {
                if let Err(reason) = persister.persist(&settings).await {
                    tracing::error!("settings persistence failed: {}", reason);
                    let _ = failures.send(reason);
                }
            });
        }

        Ok(diff)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SettingsChange> {
        self.changes.subscribe()
    }

    /// Persistence failures surface here; the in-memory snapshot stays
    /// authoritative.
    pub fn subscribe_persist_failures(&self) -> broadcast::Receiver<String> {
        self.persist_failures.subscribe()
    }
}

/// Persists settings as YAML to a file path.
pub struct FilePersister {
    path: std::path::PathBuf,
}

impl FilePersister {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl SettingsPersister for FilePersister {
    async fn persist(&self, settings: &Settings) -> Result<(), String> {
        let text = serde_yaml::to_string(settings).map_err(|e| e.to_string())?;
        tokio::fs::write(&self.path, text)
            .await
            .map_err(|e| format!("write {}: {}", self.path.display(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{GroupSpec, ToolOverride, UpstreamSpec};
    use manifold_mcp::transport::TransportKind;

    fn stdio_spec(name: &str, command: &str) -> UpstreamSpec {
        UpstreamSpec::new(
            name,
            TransportKind::Stdio {
                command: command.into(),
                args: vec![],
                env: Default::default(),
                cwd: None,
            },
        )
    }

    #[tokio::test]
    async fn mutate_swaps_snapshot_and_bumps_revision() {
        let store = SettingsStore::new(Settings::default());
        assert_eq!(store.revision(), 0);

        let diff = store
            .mutate(|s| {
                s.upstreams.push(stdio_spec("echo", "/bin/cat"));
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(diff.upstreams, vec![UpstreamDiff {
            name: "echo".into(),
            change: UpstreamChange::Added,
        }]);
        assert_eq!(store.revision(), 1);
        assert_eq!(store.snapshot().upstreams.len(), 1);
    }

    #[tokio::test]
    async fn identical_mutation_is_a_noop() {
        let store = SettingsStore::new(Settings::default());
        store
            .mutate(|s| {
                s.upstreams.push(stdio_spec("echo", "/bin/cat"));
                Ok(())
            })
            .await
            .unwrap();

        let mut changes = store.subscribe();
        let diff = store.mutate(|_| Ok(())).await.unwrap();
        assert!(diff.is_empty());
        assert_eq!(store.revision(), 1);
        assert!(matches!(
            changes.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn failed_validation_leaves_snapshot_untouched() {
        let store = SettingsStore::new(Settings::default());
        let result = store
            .mutate(|s| {
                s.upstreams.push(stdio_spec("bad", ""));
                Ok(())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(store.revision(), 0);
        assert!(store.snapshot().upstreams.is_empty());
    }

    #[tokio::test]
    async fn disabling_reads_as_removal() {
        let mut initial = Settings::default();
        initial.upstreams.push(stdio_spec("echo", "/bin/cat"));
        let store = SettingsStore::new(initial);

        let diff = store
            .mutate(|s| {
                s.upstreams[0].enabled = false;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(diff.upstreams[0].change, UpstreamChange::Removed);
    }

    #[tokio::test]
    async fn overlay_edit_classified_separately_from_reconnect() {
        let mut initial = Settings::default();
        initial.upstreams.push(stdio_spec("echo", "/bin/cat"));
        let store = SettingsStore::new(initial);

        let diff = store
            .mutate(|s| {
                s.upstreams[0].tools.insert(
                    "echo".into(),
                    ToolOverride {
                        enabled: None,
                        description: Some("Forecast service".into()),
                    },
                );
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(diff.upstreams[0].change, UpstreamChange::Overlay);

        let diff = store
            .mutate(|s| {
                s.upstreams[0].transport = TransportKind::Stdio {
                    command: "/bin/tee".into(),
                    args: vec![],
                    env: Default::default(),
                    cwd: None,
                };
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(diff.upstreams[0].change, UpstreamChange::Reconnect);
    }

    #[tokio::test]
    async fn group_changes_are_reported() {
        let store = SettingsStore::new(Settings::default());
        let diff = store
            .mutate(|s| {
                s.groups.push(GroupSpec::new("dev"));
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(diff.groups.len(), 1);
        assert_eq!(diff.groups[0].change, GroupChange::Added);

        let diff = store
            .mutate(|s| {
                s.groups[0].description = "dev tools".into();
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(diff.groups[0].change, GroupChange::Modified);
    }

    #[tokio::test]
    async fn subscribers_see_ordered_revisions() {
        let store = SettingsStore::new(Settings::default());
        let mut changes = store.subscribe();

        for i in 0..3 {
            store
                .mutate(|s| {
                    s.upstreams.push(stdio_spec(&format!("u{}", i), "/bin/cat"));
                    Ok(())
                })
                .await
                .unwrap();
        }

        let mut last = 0;
        for _ in 0..3 {
            let change = changes.recv().await.unwrap();
            assert!(change.revision > last);
            last = change.revision;
        }
    }
}
