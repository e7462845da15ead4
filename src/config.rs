//! Core configuration.
//!
//! The server's outer layers own config file discovery and CLI parsing;
//! the core consumes the already-located TOML fragment below.

use std::time::Duration;

use serde::Deserialize;

fn default_core_threads() -> usize {
    16
}

fn default_delegation_threads() -> usize {
    64
}

fn default_cache_ttl() -> u64 {
    60
}

fn default_max_fds() -> u64 {
    1024
}

/// Configuration of one backend module instance.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ModuleConfig {
    /// Short module name used in share definitions.
    pub module_name: String,
    /// Path to a dynamically loaded module, empty for builtins.
    #[serde(default)]
    pub module_path: String,
    /// Opaque configuration handed verbatim to the module's init hook.
    #[serde(default)]
    pub config_data: String,
}

/// Tunables recognized by the VFS core.
#[derive(Debug, Clone, Deserialize)]
pub struct VfsConfig {
    /// Size of the network worker pool the core is expected to run under.
    #[serde(default = "default_core_threads")]
    pub core_threads: usize,
    /// Size of the blocking-backend delegation pool.
    #[serde(default = "default_delegation_threads")]
    pub delegation_threads: usize,
    /// TTL in seconds for the attribute and name caches and the
    /// open-handle reclaim window.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: u64,
    /// Advisory descriptor budget, logged at startup.
    #[serde(default = "default_max_fds")]
    pub max_fds: u64,
    /// Backend modules to register.
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
}

impl Default for VfsConfig {
    fn default() -> Self {
        VfsConfig {
            core_threads: default_core_threads(),
            delegation_threads: default_delegation_threads(),
            cache_ttl: default_cache_ttl(),
            max_fds: default_max_fds(),
            modules: Vec::new(),
        }
    }
}

impl VfsConfig {
    /// Parses a TOML fragment.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// The cache TTL as a [`Duration`].
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl)
    }
}
