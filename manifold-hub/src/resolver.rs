//! Scope and access resolution: which upstreams, and which of their tools, a
//! session may reach.

use std::collections::BTreeSet;

use manifold_config::{GroupSpec, Settings, UpstreamSpec};
use serde::{Deserialize, Serialize};

use crate::error::{HubError, HubResult};

/// Literal path segment selecting the smart scope.
pub const SMART_SCOPE: &str = "$smart";

/// The identity a request acts as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub display_name: String,
    pub admin: bool,
}

impl Principal {
    /// The principal used when no authentication is configured.
    pub fn anonymous() -> Self {
        Self {
            id: "anonymous".to_string(),
            display_name: "Anonymous".to_string(),
            admin: true,
        }
    }

    /// A named, non-admin principal (the `/:principal/...` path form).
    pub fn user(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            admin: false,
        }
    }

    fn may_see(&self, owner: Option<&str>) -> bool {
        self.admin || owner.map(|o| o == self.id).unwrap_or(true)
    }

    pub fn may_see_upstream(&self, spec: &UpstreamSpec) -> bool {
        self.may_see(spec.owner.as_deref())
    }

    pub fn may_see_group(&self, group: &GroupSpec) -> bool {
        self.may_see(group.owner.as_deref())
    }
}

/// Routing target of a downstream session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteScope {
    /// Every enabled upstream visible to the principal.
    Global,
    /// One named upstream.
    Upstream(String),
    /// A stored group, addressed by id or name.
    Group(String),
    /// The similarity-search pseudo-group.
    Smart,
}

impl RouteScope {
    /// Interpret a URL path segment as a scope.
    ///
    /// An absent segment resolves to the configured default group if one is
    /// set, otherwise global. Unknown names are rejected here so sessions
    /// fail at creation, not at first use.
    pub fn parse(segment: Option<&str>, settings: &Settings) -> HubResult<Self> {
        let Some(segment) = segment else {
            return Ok(match &settings.flags.routing.default_group {
                Some(group) => RouteScope::Group(group.clone()),
                None => RouteScope::Global,
            });
        };
        if segment == SMART_SCOPE {
            return Ok(RouteScope::Smart);
        }
        if settings.upstream(segment).is_some() {
            return Ok(RouteScope::Upstream(segment.to_string()));
        }
        if settings.group(segment).is_some() {
            return Ok(RouteScope::Group(segment.to_string()));
        }
        Err(HubError::scope_not_found(segment))
    }

    pub fn label(&self) -> String {
        match self {
            RouteScope::Global => "global".to_string(),
            RouteScope::Upstream(name) => format!("upstream:{}", name),
            RouteScope::Group(id) => format!("group:{}", id),
            RouteScope::Smart => SMART_SCOPE.to_string(),
        }
    }
}

/// Which of an upstream's tools a scope admits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolFilter {
    All,
    Only(BTreeSet<String>),
}

impl ToolFilter {
    pub fn allows(&self, tool: &str) -> bool {
        match self {
            ToolFilter::All => true,
            ToolFilter::Only(set) => set.contains(tool),
        }
    }
}

/// One reachable upstream within a resolved scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeEntry {
    pub upstream: String,
    pub allowed: ToolFilter,
}

/// The outcome of scope resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedScope {
    /// Ordered by upstream name for determinism.
    pub entries: Vec<ScopeEntry>,
    pub is_smart: bool,
}

impl ResolvedScope {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, upstream: &str) -> Option<&ScopeEntry> {
        self.entries.iter().find(|e| e.upstream == upstream)
    }

    /// Whether `(upstream, tool)` passes this scope's filters.
    pub fn admits(&self, upstream: &str, tool: &str) -> bool {
        self.entry(upstream).map(|e| e.allowed.allows(tool)).unwrap_or(false)
    }
}

/// Resolve a scope for a principal against a settings snapshot.
///
/// Pure and deterministic: same inputs, same output, no side effects.
pub fn resolve(
    scope: &RouteScope,
    principal: &Principal,
    settings: &Settings,
) -> HubResult<ResolvedScope> {
    let visible_enabled = |spec: &UpstreamSpec| spec.enabled && principal.may_see_upstream(spec);

    match scope {
        RouteScope::Upstream(name) => {
            let entries = settings
                .upstream(name)
                .filter(|spec| visible_enabled(spec))
                .map(|spec| {
                    vec![ScopeEntry {
                        upstream: spec.name.clone(),
                        allowed: ToolFilter::All,
                    }]
                })
                .unwrap_or_default();
            Ok(ResolvedScope {
                entries,
                is_smart: false,
            })
        }

        RouteScope::Group(id_or_name) => {
            let Some(group) = settings.group(id_or_name) else {
                return Ok(ResolvedScope {
                    entries: Vec::new(),
                    is_smart: false,
                });
            };
            if !principal.may_see_group(group) {
                return Err(HubError::Unauthorized {
                    message: format!("group '{}' is not visible to '{}'", group.name, principal.id),
                });
            }

            let mut entries: Vec<ScopeEntry> = group
                .servers
                .iter()
                .filter_map(|member| {
                    let spec = settings.upstream(&member.upstream)?;
                    if !visible_enabled(spec) {
                        return None;
                    }
                    Some(ScopeEntry {
                        upstream: spec.name.clone(),
                        allowed: match &member.tools {
                            Some(selected) => ToolFilter::Only(selected.clone()),
                            None => ToolFilter::All,
                        },
                    })
                })
                .collect();
            entries.sort_by(|a, b| a.upstream.cmp(&b.upstream));
            Ok(ResolvedScope {
                entries,
                is_smart: false,
            })
        }

        RouteScope::Global => {
            if !settings.flags.routing.allow_global && !principal.admin {
                return Err(HubError::Unauthorized {
                    message: "global scope is restricted to admins".to_string(),
                });
            }
            Ok(ResolvedScope {
                entries: all_visible(settings, visible_enabled),
                is_smart: false,
            })
        }

        RouteScope::Smart => {
            let entries = if settings.flags.smart_routing.enabled {
                all_visible(settings, visible_enabled)
            } else {
                Vec::new()
            };
            Ok(ResolvedScope {
                entries,
                is_smart: true,
            })
        }
    }
}

fn all_visible(
    settings: &Settings,
    visible_enabled: impl Fn(&UpstreamSpec) -> bool,
) -> Vec<ScopeEntry> {
    let mut entries: Vec<ScopeEntry> = settings
        .upstreams
        .iter()
        .filter(|spec| visible_enabled(spec))
        .map(|spec| ScopeEntry {
            upstream: spec.name.clone(),
            allowed: ToolFilter::All,
        })
        .collect();
    entries.sort_by(|a, b| a.upstream.cmp(&b.upstream));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_config::{GroupServer, GroupSpec};
    use manifold_mcp::transport::TransportKind;

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

    fn settings_with(upstreams: Vec<UpstreamSpec>, groups: Vec<GroupSpec>) -> Settings {
        Settings {
            upstreams,
            groups,
            ..Default::default()
        }
    }

    #[test]
    fn upstream_scope_is_a_singleton() {
        let settings = settings_with(vec![stdio_spec("a"), stdio_spec("b")], vec![]);
        let resolved = resolve(
            &RouteScope::Upstream("a".into()),
            &Principal::anonymous(),
            &settings,
        )
        .unwrap();
        assert_eq!(resolved.entries.len(), 1);
        assert_eq!(resolved.entries[0].upstream, "a");
        assert_eq!(resolved.entries[0].allowed, ToolFilter::All);
    }

    #[test]
    fn disabled_upstreams_resolve_empty() {
        let mut spec = stdio_spec("a");
        spec.enabled = false;
        let settings = settings_with(vec![spec], vec![]);
        let resolved = resolve(
            &RouteScope::Upstream("a".into()),
            &Principal::anonymous(),
            &settings,
        )
        .unwrap();
        assert!(resolved.is_empty());
    }

    #[test]
    fn group_allowlist_is_carried_through() {
        let mut group = GroupSpec::new("dev");
        group.servers = vec![GroupServer {
            upstream: "a".into(),
            tools: Some(["ping".to_string()].into()),
        }];
        let settings = settings_with(vec![stdio_spec("a")], vec![group]);

        let resolved = resolve(
            &RouteScope::Group("dev".into()),
            &Principal::anonymous(),
            &settings,
        )
        .unwrap();
        assert_eq!(resolved.entries.len(), 1);
        assert!(resolved.admits("a", "ping"));
        assert!(!resolved.admits("a", "nuke"));
    }

    #[test]
    fn group_skips_dangling_and_disabled_references() {
        let mut disabled = stdio_spec("off");
        disabled.enabled = false;
        let mut group = GroupSpec::new("dev");
        group.servers = vec![
            GroupServer {
                upstream: "off".into(),
                tools: None,
            },
            GroupServer {
                upstream: "ghost".into(),
                tools: None,
            },
        ];
        let settings = settings_with(vec![disabled], vec![group]);

        let resolved = resolve(
            &RouteScope::Group("dev".into()),
            &Principal::anonymous(),
            &settings,
        )
        .unwrap();
        assert!(resolved.is_empty());
    }

    #[test]
    fn ownership_hides_resources_from_other_users() {
        let mut owned = stdio_spec("private");
        owned.owner = Some("alice".into());
        let settings = settings_with(vec![owned, stdio_spec("public")], vec![]);

        let bob = Principal::user("bob");
        let resolved = resolve(&RouteScope::Global, &bob, &settings).unwrap();
        assert_eq!(resolved.entries.len(), 1);
        assert_eq!(resolved.entries[0].upstream, "public");

        let alice = Principal::user("alice");
        let resolved = resolve(&RouteScope::Global, &alice, &settings).unwrap();
        assert_eq!(resolved.entries.len(), 2);
    }

    #[test]
    fn owned_group_rejects_other_users() {
        let mut group = GroupSpec::new("mine");
        group.owner = Some("alice".into());
        let settings = settings_with(vec![], vec![group]);

        let result = resolve(
            &RouteScope::Group("mine".into()),
            &Principal::user("bob"),
            &settings,
        );
        assert!(matches!(result, Err(HubError::Unauthorized { .. })));
    }

    #[test]
    fn global_can_be_restricted_to_admins() {
        let mut settings = settings_with(vec![stdio_spec("a")], vec![]);
        settings.flags.routing.allow_global = false;

        let result = resolve(&RouteScope::Global, &Principal::user("bob"), &settings);
        assert!(matches!(result, Err(HubError::Unauthorized { .. })));

        // The anonymous principal is an admin and passes.
        let resolved = resolve(&RouteScope::Global, &Principal::anonymous(), &settings).unwrap();
        assert_eq!(resolved.entries.len(), 1);
    }

    #[test]
    fn smart_scope_lists_everything_visible_when_enabled() {
        let mut settings = settings_with(vec![stdio_spec("a"), stdio_spec("b")], vec![]);
        settings.flags.smart_routing.enabled = true;

        let resolved = resolve(&RouteScope::Smart, &Principal::anonymous(), &settings).unwrap();
        assert!(resolved.is_smart);
        assert_eq!(resolved.entries.len(), 2);
    }

    #[test]
    fn smart_scope_resolves_empty_when_disabled() {
        let settings = settings_with(vec![stdio_spec("a")], vec![]);
        let resolved = resolve(&RouteScope::Smart, &Principal::anonymous(), &settings).unwrap();
        assert!(resolved.is_smart);
        assert!(resolved.is_empty());
    }

    #[test]
    fn scope_parsing_prefers_upstreams_then_groups() {
        let group = GroupSpec::new("dev");
        let group_id = group.id.to_string();
        let settings = settings_with(vec![stdio_spec("a")], vec![group]);

        assert_eq!(
            RouteScope::parse(Some("a"), &settings).unwrap(),
            RouteScope::Upstream("a".into())
        );
        assert_eq!(
            RouteScope::parse(Some("dev"), &settings).unwrap(),
            RouteScope::Group("dev".into())
        );
        assert_eq!(
            RouteScope::parse(Some(&group_id), &settings).unwrap(),
            RouteScope::Group(group_id.clone())
        );
        assert_eq!(
            RouteScope::parse(Some("$smart"), &settings).unwrap(),
            RouteScope::Smart
        );
        assert!(matches!(
            RouteScope::parse(Some("ghost"), &settings),
            Err(HubError::ScopeNotFound { .. })
        ));
    }

    #[test]
    fn absent_segment_uses_default_group_flag() {
        let mut settings = settings_with(vec![], vec![GroupSpec::new("dev")]);
        assert_eq!(RouteScope::parse(None, &settings).unwrap(), RouteScope::Global);

        settings.flags.routing.default_group = Some("dev".into());
        assert_eq!(
            RouteScope::parse(None, &settings).unwrap(),
            RouteScope::Group("dev".into())
        );
    }
}
