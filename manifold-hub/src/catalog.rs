//! Effective tool catalog: the versioned projection of every upstream's
//! tools after the per-tool overlay is applied.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use manifold_config::ToolOverride;
use manifold_mcp::protocol::ToolDescriptor;
use serde_json::Value;
use tokio::sync::broadcast;

/// One tool as the hub exposes it: upstream-reported descriptor with the
/// operator overlay folded in.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveTool {
    pub upstream: String,
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub enabled: bool,
}

impl EffectiveTool {
    /// The text that gets embedded for similarity search. Description
    /// overrides flow through here, so vector search reflects operator
    /// intent.
    pub fn embedding_text(&self) -> String {
        format!(
            "{}: {}\n{}",
            self.name,
            self.description,
            serde_json::to_string(&self.input_schema).unwrap_or_default()
        )
    }

    pub fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(self.name.clone(), self.description.clone(), self.input_schema.clone())
    }
}

/// Fold the per-tool overlay into the raw descriptors one upstream reported.
pub fn apply_overlay(
    upstream: &str,
    overlay: &BTreeMap<String, ToolOverride>,
    raw: &[ToolDescriptor],
) -> Vec<EffectiveTool> {
    raw.iter()
        .map(|tool| {
            let entry = overlay.get(&tool.name);
            EffectiveTool {
                upstream: upstream.to_string(),
                name: tool.name.clone(),
                description: entry
                    .and_then(|o| o.description.clone())
                    .unwrap_or_else(|| tool.description.clone()),
                input_schema: tool.input_schema.clone(),
                enabled: entry.and_then(|o| o.enabled).unwrap_or(true),
            }
        })
        .collect()
}

/// Immutable, ordered view of the whole catalog at one version.
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    pub version: u64,
    /// Ordered by `(upstream, name)` so listings are stable.
    pub tools: Vec<EffectiveTool>,
}

impl CatalogSnapshot {
    pub fn get(&self, upstream: &str, name: &str) -> Option<&EffectiveTool> {
        self.tools
            .iter()
            .find(|t| t.upstream == upstream && t.name == name)
    }

    /// Whether `(upstream, name)` exists and is enabled.
    pub fn contains_enabled(&self, upstream: &str, name: &str) -> bool {
        self.get(upstream, name).map(|t| t.enabled).unwrap_or(false)
    }

    pub fn by_upstream<'a>(&'a self, upstream: &'a str) -> impl Iterator<Item = &'a EffectiveTool> {
        self.tools.iter().filter(move |t| t.upstream == upstream)
    }
}

/// Seed for one vector-index upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingSeed {
    pub upstream: String,
    pub tool: String,
    pub text: String,
}

/// Broadcast whenever the effective tool set changes.
#[derive(Debug, Clone)]
pub struct CatalogChange {
    pub old_version: u64,
    pub new_version: u64,
    /// Enabled tools that appeared or whose embedding text changed.
    pub upserts: Vec<EmbeddingSeed>,
    /// Keys that vanished or were disabled.
    pub deletes: Vec<(String, String)>,
}

/// The catalog itself: snapshot reads, serialized writes, monotonic version.
pub struct ToolCatalog {
    inner: RwLock<Arc<CatalogSnapshot>>,
    changes: broadcast::Sender<CatalogChange>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            inner: RwLock::new(Arc::new(CatalogSnapshot::default())),
            changes,
        }
    }

    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        Arc::clone(&self.inner.read().expect("catalog lock poisoned"))
    }

    pub fn version(&self) -> u64 {
        self.snapshot().version
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CatalogChange> {
        self.changes.subscribe()
    }

    /// Replace one upstream's tools. Returns true when the catalog actually
    /// changed (and the version was bumped).
    pub fn set_upstream_tools(&self, upstream: &str, tools: Vec<EffectiveTool>) -> bool {
        self.update(upstream, tools)
    }

    /// Drop one upstream's tools entirely.
    pub fn remove_upstream(&self, upstream: &str) -> bool {
        self.update(upstream, Vec::new())
    }

    fn update(&self, upstream: &str, mut replacement: Vec<EffectiveTool>) -> bool {
        replacement.sort_by(|a, b| a.name.cmp(&b.name));
        replacement.retain(|t| t.upstream == upstream);

        let mut guard = self.inner.write().expect("catalog lock poisoned");
        let old = Arc::clone(&guard);

        let old_subset: Vec<&EffectiveTool> = old.by_upstream(upstream).collect();
        if old_subset.len() == replacement.len()
            && old_subset.iter().zip(replacement.iter()).all(|(a, b)| *a == b)
        {
            return false;
        }

        // Refreshing to identical content never bumps; anything else does.
        let mut tools: Vec<EffectiveTool> = old
            .tools
            .iter()
            .filter(|t| t.upstream != upstream)
            .cloned()
            .collect();
        tools.extend(replacement.iter().cloned());
        tools.sort_by(|a, b| (a.upstream.as_str(), a.name.as_str()).cmp(&(b.upstream.as_str(), b.name.as_str())));

        let change = diff_subsets(&old_subset, &replacement, old.version);
        let snapshot = Arc::new(CatalogSnapshot {
            version: old.version + 1,
            tools,
        });
        *guard = Arc::clone(&snapshot);
        drop(guard);

        let _ = self.changes.send(change);
        true
    }
}

impl Default for ToolCatalog {
    fn default() -> Self {
        Self::new()
    }
}

/// Diff one upstream's old and new tool subsets into index operations.
fn diff_subsets(
    old: &[&EffectiveTool],
    new: &[EffectiveTool],
    old_version: u64,
) -> CatalogChange {
    let mut upserts = Vec::new();
    let mut deletes = Vec::new();

    for tool in new {
        if !tool.enabled {
            continue;
        }
        let before = old.iter().find(|t| t.name == tool.name);
        let needs_upsert = match before {
            None => true,
            Some(b) => !b.enabled || b.embedding_text() != tool.embedding_text(),
        };
        if needs_upsert {
            upserts.push(EmbeddingSeed {
                upstream: tool.upstream.clone(),
                tool: tool.name.clone(),
                text: tool.embedding_text(),
            });
        }
    }

    for before in old {
        if !before.enabled {
            continue;
        }
        let gone = !new.iter().any(|t| t.name == before.name && t.enabled);
        if gone {
            deletes.push((before.upstream.clone(), before.name.clone()));
        }
    }

    CatalogChange {
        old_version,
        new_version: old_version + 1,
        upserts,
        deletes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(upstream: &str, name: &str, description: &str) -> EffectiveTool {
        EffectiveTool {
            upstream: upstream.into(),
            name: name.into(),
            description: description.into(),
            input_schema: json!({"type": "object"}),
            enabled: true,
        }
    }

    #[test]
    fn version_bumps_only_on_real_change() {
        let catalog = ToolCatalog::new();
        assert_eq!(catalog.version(), 0);

        assert!(catalog.set_upstream_tools("a", vec![tool("a", "ping", "p")]));
        assert_eq!(catalog.version(), 1);

        // Identical refresh: no bump.
        assert!(!catalog.set_upstream_tools("a", vec![tool("a", "ping", "p")]));
        assert_eq!(catalog.version(), 1);

        assert!(catalog.set_upstream_tools("a", vec![tool("a", "ping", "new text")]));
        assert_eq!(catalog.version(), 2);
    }

    #[test]
    fn snapshot_is_ordered_by_upstream_then_name() {
        let catalog = ToolCatalog::new();
        catalog.set_upstream_tools("b", vec![tool("b", "zeta", ""), tool("b", "alpha", "")]);
        catalog.set_upstream_tools("a", vec![tool("a", "mid", "")]);

        let names: Vec<(String, String)> = catalog
            .snapshot()
            .tools
            .iter()
            .map(|t| (t.upstream.clone(), t.name.clone()))
            .collect();
        assert_eq!(
            names,
            vec![
                ("a".into(), "mid".into()),
                ("b".into(), "alpha".into()),
                ("b".into(), "zeta".into())
            ]
        );
    }

    #[test]
    fn overlay_applies_enable_and_description() {
        let mut overlay = BTreeMap::new();
        overlay.insert(
            "weather".to_string(),
            ToolOverride {
                enabled: None,
                description: Some("Forecast service".into()),
            },
        );
        overlay.insert(
            "nuke".to_string(),
            ToolOverride {
                enabled: Some(false),
                description: None,
            },
        );

        let raw = vec![
            ToolDescriptor::new("weather", "Get current weather", json!({"type": "object"})),
            ToolDescriptor::new("nuke", "Dangerous", json!({"type": "object"})),
            ToolDescriptor::new("plain", "Untouched", json!({"type": "object"})),
        ];

        let effective = apply_overlay("a", &overlay, &raw);
        assert_eq!(effective[0].description, "Forecast service");
        assert!(effective[0].enabled);
        assert!(!effective[1].enabled);
        assert!(effective[2].enabled);
        assert_eq!(effective[2].description, "Untouched");
    }

    #[test]
    fn change_events_carry_upserts_and_deletes() {
        let catalog = ToolCatalog::new();
        let mut changes = catalog.subscribe();

        catalog.set_upstream_tools("a", vec![tool("a", "weather", "forecast")]);
        let change = changes.try_recv().unwrap();
        assert_eq!(change.upserts.len(), 1);
        assert_eq!(change.upserts[0].tool, "weather");
        assert!(change.deletes.is_empty());

        // Disabling reads as a delete.
        let mut disabled = tool("a", "weather", "forecast");
        disabled.enabled = false;
        catalog.set_upstream_tools("a", vec![disabled]);
        let change = changes.try_recv().unwrap();
        assert!(change.upserts.is_empty());
        assert_eq!(change.deletes, vec![("a".into(), "weather".into())]);
    }

    #[test]
    fn remove_upstream_deletes_every_key() {
        let catalog = ToolCatalog::new();
        catalog.set_upstream_tools("a", vec![tool("a", "one", ""), tool("a", "two", "")]);
        let mut changes = catalog.subscribe();

        assert!(catalog.remove_upstream("a"));
        let change = changes.try_recv().unwrap();
        assert_eq!(change.deletes.len(), 2);
        assert!(catalog.snapshot().tools.is_empty());

        // Removing an absent upstream is a no-op.
        assert!(!catalog.remove_upstream("a"));
    }

    #[test]
    fn versions_are_strictly_monotonic() {
        let catalog = ToolCatalog::new();
        let mut last = catalog.version();
        for i in 0..5 {
            catalog.set_upstream_tools("a", vec![tool("a", "t", &format!("d{}", i))]);
            let v = catalog.version();
            assert!(v > last);
            last = v;
        }
    }
}
