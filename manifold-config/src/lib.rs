//! Configuration for the Manifold hub.
//!
//! Follows a domain-driven split: declarative models with validation and
//! defaults in [`settings`], file/env loading in [`loader`], and the live,
//! hot-reloadable [`store::SettingsStore`] that the rest of the hub
//! subscribes to.

pub mod error;
pub mod loader;
pub mod settings;
pub mod store;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use settings::{
    GroupServer, GroupSpec, ManifoldConfig, RoutingFlags, ServerSettings, Settings,
    SmartRoutingFlags, SystemFlags, ToolOverride, UpstreamSpec,
};
pub use store::{
    GroupChange, GroupDiff, SettingsChange, SettingsDiff, SettingsPersister, SettingsStore,
    UpstreamChange, UpstreamDiff,
};
