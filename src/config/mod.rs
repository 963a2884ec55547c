pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use anyhow::Result;
use std::path::Path;

impl RouterConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used — the router can start with zero configuration.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: RouterConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!(
                "config file not found at {}, using built-in service defaults",
                path.display()
            );
            RouterConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(services = config.services.len(), "loaded router configuration");
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ROUTER_WORKERS") {
            if let Ok(n) = v.parse::<usize>() {
                self.http.workers = n;
            }
        }
        if let Ok(v) = std::env::var("ROUTER_PORT_ISOLATION_ENABLED") {
            self.security.port_isolation_enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("ROUTER_BRIDGE_SEED_WS") {
            self.bridge.seed_ws = v;
        }
        if let Ok(v) = std::env::var("ROUTER_BRIDGE_EXE") {
            self.bridge.bridge_exe = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.http.workers == 0 {
            anyhow::bail!("http.workers must be at least 1");
        }
        if self.http.chunk_upload_b == 0 {
            anyhow::bail!("http.chunk_upload_b must be non-zero");
        }
        if self.security.port_isolation_enabled {
            for def in self.services.values() {
                if def.ports.is_empty() {
                    anyhow::bail!(
                        "service '{}' has an empty port whitelist while port isolation is enabled",
                        def.name
                    );
                }
            }
        }
        Ok(())
    }

    /// Persist the configuration back to `path`, auto-detecting format by extension.
    pub fn save(&self, path: &Path) -> Result<()> {
        let serialized = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::to_string_pretty(self)?,
            _ => serde_json::to_string_pretty(self)?,
        };
        std::fs::write(path, serialized)?;
        Ok(())
    }
}
