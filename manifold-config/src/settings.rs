//! Declarative configuration model: upstreams, groups, and system flags.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;

use manifold_mcp::transport::TransportKind;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConfigError, ConfigResult};
use crate::validation::{validate_identifier, validate_port, Validatable};

/// One declared upstream MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamSpec {
    /// Unique, stable identifier; becomes the namespacing prefix.
    pub name: String,

    /// Connection parameters, discriminated by `type`.
    #[serde(flatten)]
    pub transport: TransportKind,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Per-tool overlay: enable flags and description overrides.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tools: BTreeMap<String, ToolOverride>,

    /// Overrides `flags.keep_alive_interval` for this upstream.
    #[serde(
        default,
        with = "humantime_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub keep_alive_interval: Option<Duration>,

    /// Owning principal; `None` makes the upstream public.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl UpstreamSpec {
    pub fn new(name: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            name: name.into(),
            transport,
            enabled: true,
            tools: BTreeMap::new(),
            keep_alive_interval: None,
            owner: None,
        }
    }

    /// Fields that force a reconnect when they change, as opposed to the
    /// overlay fields the supervisor can apply in place.
    pub fn connection_fingerprint(&self) -> &TransportKind {
        &self.transport
    }
}

impl Validatable for UpstreamSpec {
    fn validate(&self) -> ConfigResult<()> {
        validate_identifier(&self.name, "name", self.domain_name())?;
        self.transport.validate().map_err(|e| {
            ConfigError::domain(self.domain_name(), format!("upstream '{}': {}", self.name, e))
        })?;
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "upstream"
    }
}

/// Overlay applied to one upstream tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOverride {
    /// Tool is exposed iff this is absent or `true`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Replaces the upstream-reported description everywhere, embeddings
    /// included.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A curated subset of upstreams exposed under one routing scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub id: Uuid,

    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub servers: Vec<GroupServer>,

    /// Owning principal; `None` makes the group public.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl GroupSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            servers: Vec::new(),
            owner: None,
        }
    }
}

impl Validatable for GroupSpec {
    fn validate(&self) -> ConfigResult<()> {
        validate_identifier(&self.name, "name", self.domain_name())?;
        let mut seen = HashSet::new();
        for server in &self.servers {
            if !seen.insert(server.upstream.as_str()) {
                return Err(ConfigError::domain(
                    self.domain_name(),
                    format!(
                        "group '{}' references upstream '{}' more than once",
                        self.name, server.upstream
                    ),
                ));
            }
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "group"
    }
}

/// One upstream within a group, with an optional tool allowlist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupServer {
    pub upstream: String,

    /// When set, only these tools are exposed through the group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<BTreeSet<String>>,
}

/// Smart-routing (vector similarity) flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmartRoutingFlags {
    /// When false the `$smart` scope resolves empty and no embeddings are
    /// maintained.
    pub enabled: bool,

    /// Model identifier handed to the embedder.
    pub embed_model: String,

    /// OpenAI-compatible embeddings endpoint.
    pub endpoint: String,

    /// Bearer token for the endpoint; also read from `MANIFOLD_EMBED_API_KEY`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Path of the embedding database; in-memory when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
}

impl Default for SmartRoutingFlags {
    fn default() -> Self {
        Self {
            enabled: false,
            embed_model: "text-embedding-3-small".to_string(),
            endpoint: "https://api.openai.com/v1/embeddings".to_string(),
            api_key: None,
            database: None,
        }
    }
}

/// Scope-routing flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingFlags {
    /// When false the global scope is refused for non-admins.
    pub allow_global: bool,

    /// Substituted when a session names no scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_group: Option<String>,
}

impl Default for RoutingFlags {
    fn default() -> Self {
        Self {
            allow_global: true,
            default_group: None,
        }
    }
}

/// System-wide flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemFlags {
    pub smart_routing: SmartRoutingFlags,

    pub routing: RoutingFlags,

    /// Default keep-alive interval for upstreams without an override.
    #[serde(with = "humantime_serde")]
    pub keep_alive_interval: Duration,

    /// Per-call deadline for `tools/call`; zero disables it.
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,

    /// Downstream session idle expiry.
    #[serde(with = "humantime_serde")]
    pub idle_session_timeout: Duration,

    /// When true, tools of non-ready upstreams vanish from `tools/list`.
    pub hide_degraded_upstreams_from_list: bool,
}

impl Default for SystemFlags {
    fn default() -> Self {
        Self {
            smart_routing: SmartRoutingFlags::default(),
            routing: RoutingFlags::default(),
            keep_alive_interval: Duration::from_secs(60),
            call_timeout: Duration::from_secs(60),
            idle_session_timeout: Duration::from_secs(30 * 60),
            hide_degraded_upstreams_from_list: false,
        }
    }
}

/// The hot-reloadable part of the configuration, owned by the
/// [`crate::store::SettingsStore`] at runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub upstreams: Vec<UpstreamSpec>,

    pub groups: Vec<GroupSpec>,

    pub flags: SystemFlags,
}

impl Settings {
    pub fn upstream(&self, name: &str) -> Option<&UpstreamSpec> {
        self.upstreams.iter().find(|u| u.name == name)
    }

    /// Look a group up by its UUID or its name, in that order.
    pub fn group(&self, id_or_name: &str) -> Option<&GroupSpec> {
        if let Ok(id) = id_or_name.parse::<Uuid>() {
            if let Some(group) = self.groups.iter().find(|g| g.id == id) {
                return Some(group);
            }
        }
        self.groups.iter().find(|g| g.name == id_or_name)
    }

    /// Effective keep-alive interval for one upstream.
    pub fn keep_alive_for(&self, spec: &UpstreamSpec) -> Duration {
        spec.keep_alive_interval.unwrap_or(self.flags.keep_alive_interval)
    }
}

impl Validatable for Settings {
    fn validate(&self) -> ConfigResult<()> {
        let mut names = HashSet::new();
        for upstream in &self.upstreams {
            upstream.validate()?;
            if !names.insert(upstream.name.as_str()) {
                return Err(ConfigError::domain(
                    self.domain_name(),
                    format!("duplicate upstream name '{}'", upstream.name),
                ));
            }
        }

        let mut ids = HashSet::new();
        let mut group_names = HashSet::new();
        for group in &self.groups {
            group.validate()?;
            if !ids.insert(group.id) {
                return Err(ConfigError::domain(
                    self.domain_name(),
                    format!("duplicate group id '{}'", group.id),
                ));
            }
            if !group_names.insert(group.name.as_str()) {
                return Err(ConfigError::domain(
                    self.domain_name(),
                    format!("duplicate group name '{}'", group.name),
                ));
            }
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "settings"
    }
}

/// Listen address and base path for the downstream HTTP surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,

    pub port: u16,

    /// Prefix all routes are mounted under.
    pub base_path: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3100,
            base_path: String::new(),
        }
    }
}

impl ServerSettings {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Validatable for ServerSettings {
    fn validate(&self) -> ConfigResult<()> {
        validate_port(self.port, "port", self.domain_name())?;
        if !self.base_path.is_empty() && !self.base_path.starts_with('/') {
            return Err(ConfigError::domain(
                self.domain_name(),
                "base_path must start with '/'",
            ));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "server"
    }
}

/// Top-level configuration file model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifoldConfig {
    pub server: ServerSettings,

    #[serde(flatten)]
    pub settings: Settings,
}

impl ManifoldConfig {
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.server.validate()?;
        self.settings.validate()?;
        Ok(())
    }

    /// Generate a commented sample configuration.
    pub fn generate_sample() -> String {
        let mut config = ManifoldConfig::default();
        config.settings.upstreams.push(UpstreamSpec::new(
            "everything",
            TransportKind::Stdio {
                command: "npx".to_string(),
                args: vec!["-y".to_string(), "@modelcontextprotocol/server-everything".to_string()],
                env: Default::default(),
                cwd: None,
            },
        ));
        serde_yaml::to_string(&config).unwrap_or_else(|_| "# failed to render sample".to_string())
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn settings_reject_duplicate_upstream_names() {
        let settings = Settings {
            upstreams: vec![stdio_spec("echo"), stdio_spec("echo")],
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn settings_reject_stdio_without_command() {
        let mut spec = stdio_spec("echo");
        spec.transport = TransportKind::Stdio {
            command: "".into(),
            args: vec![],
            env: Default::default(),
            cwd: None,
        };
        let settings = Settings {
            upstreams: vec![spec],
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn group_rejects_duplicate_server_references() {
        let mut group = GroupSpec::new("dev");
        group.servers = vec![
            GroupServer {
                upstream: "echo".into(),
                tools: None,
            },
            GroupServer {
                upstream: "echo".into(),
                tools: None,
            },
        ];
        assert!(group.validate().is_err());
    }

    #[test]
    fn group_lookup_by_id_and_name() {
        let group = GroupSpec::new("dev");
        let id = group.id;
        let settings = Settings {
            groups: vec![group],
            ..Default::default()
        };
        assert!(settings.group("dev").is_some());
        assert!(settings.group(&id.to_string()).is_some());
        assert!(settings.group("prod").is_none());
    }

    #[test]
    fn keep_alive_falls_back_to_flags() {
        let mut spec = stdio_spec("echo");
        let settings = Settings::default();
        assert_eq!(settings.keep_alive_for(&spec), Duration::from_secs(60));

        spec.keep_alive_interval = Some(Duration::from_secs(5));
        assert_eq!(settings.keep_alive_for(&spec), Duration::from_secs(5));
    }

    #[test]
    fn upstream_spec_round_trips_through_yaml() {
        let mut spec = stdio_spec("echo");
        spec.tools.insert(
            "echo".into(),
            ToolOverride {
                enabled: Some(true),
                description: Some("echoes".into()),
            },
        );
        spec.keep_alive_interval = Some(Duration::from_secs(30));

        let text = serde_yaml::to_string(&spec).unwrap();
        let back: UpstreamSpec = serde_yaml::from_str(&text).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn sample_config_parses_back() {
        let sample = ManifoldConfig::generate_sample();
        let config: ManifoldConfig = serde_yaml::from_str(&sample).unwrap();
        assert_eq!(config.settings.upstreams.len(), 1);
        assert!(config.validate_all().is_ok());
    }
}
