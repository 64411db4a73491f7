//! Config-root discovery and loading (§6.6).
//!
//! Grounded on the teacher's `ConsciousnessConfig::load` (TOML, falls back
//! to defaults on missing/unparsable file, logs via `tracing`). Extended to
//! the rewrite's three-file layout and process/project precedence: a
//! per-process root at `<user-config>/amcp/` holds `config.toml`,
//! `server.yaml` and `hooks.toml`; a project-scoped `<cwd>/.amcp/` directory
//! overrides any of the three when present (§6.6 "take precedence where
//! noted").

use crate::hooks::HookHandler;
use crate::permission::PermissionRule;
use crate::types::{AuthConfig, BindMode, GatewayConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// `config.toml` — chat defaults and permission rules.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub default_model: Option<String>,
    pub system_prompt_path: Option<PathBuf>,
    pub context_tokens: Option<usize>,
    pub permission_rules: Vec<PermissionRule>,
}

/// `server.yaml` — bind host/port, CORS origins.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: BindMode,
    pub auth: AuthConfig,
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let g = GatewayConfig::default();
        Self {
            port: g.port,
            bind: g.bind,
            auth: g.auth,
            cors_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn into_gateway_config(self) -> GatewayConfig {
        GatewayConfig {
            port: self.port,
            bind: self.bind,
            auth: self.auth,
        }
    }
}

/// `hooks.toml` — pipeline config, a flat list under `[[hook]]`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    #[serde(rename = "hook")]
    pub hooks: Vec<HookHandler>,
}

/// Union of everything discovered under a config root, with environment
/// overrides already folded into `server`.
#[derive(Clone, Debug, Default)]
pub struct RootConfig {
    pub chat: ChatConfig,
    pub server: ServerConfig,
    pub hooks: HooksConfig,
}

impl RootConfig {
    /// Load from the process config root, then let a project-scoped
    /// `.amcp/` override any of the three files it contains.
    pub fn discover(project_dir: &Path) -> Self {
        let process_root = config_root();
        let mut config = Self::load_from(&process_root);

        let project_root = project_dir.join(".amcp");
        if project_root.is_dir() {
            let project = Self::load_from(&project_root);
            if project_root.join("config.toml").is_file() {
                config.chat = project.chat;
            }
            if project_root.join("server.yaml").is_file() {
                config.server = project.server;
            }
            if project_root.join("hooks.toml").is_file() || project_root.join("hooks.json").is_file() {
                config.hooks = project.hooks;
            }
        }

        config.server.apply_env_overrides();
        config
    }

    fn load_from(root: &Path) -> Self {
        Self {
            chat: load_toml(&root.join("config.toml")).unwrap_or_default(),
            server: load_yaml(&root.join("server.yaml")).unwrap_or_default(),
            hooks: load_toml(&root.join("hooks.toml"))
                .or_else(|| load_json(&root.join("hooks.json")))
                .unwrap_or_default(),
        }
    }
}

impl ServerConfig {
    /// `AMCP_PORT` / `AMCP_BIND` / `AMCP_TOKEN` take precedence over
    /// whatever was read from `server.yaml`.
    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("AMCP_PORT") {
            if let Ok(p) = port.parse() {
                self.port = p;
            }
        }
        if let Ok(bind) = std::env::var("AMCP_BIND") {
            self.bind = match bind.as_str() {
                "lan" | "0.0.0.0" => BindMode::Lan,
                _ => BindMode::Loopback,
            };
        }
        if let Ok(token) = std::env::var("AMCP_TOKEN") {
            self.auth.token = Some(token);
        }
    }
}

/// Platform config root: `<user-config>/amcp/`. Honors `XDG_CONFIG_HOME`
/// on Linux, falls back to `~/.config` everywhere else `HOME` is set.
pub fn config_root() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("amcp");
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home).join(".config").join("amcp")
}

fn load_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&content) {
        Ok(v) => {
            tracing::info!("loaded {}", path.display());
            Some(v)
        }
        Err(e) => {
            tracing::warn!("failed to parse {}: {} — ignoring", path.display(), e);
            None
        }
    }
}

fn load_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_yaml::from_str(&content) {
        Ok(v) => {
            tracing::info!("loaded {}", path.display());
            Some(v)
        }
        Err(e) => {
            tracing::warn!("failed to parse {}: {} — ignoring", path.display(), e);
            None
        }
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(v) => {
            tracing::info!("loaded {}", path.display());
            Some(v)
        }
        Err(e) => {
            tracing::warn!("failed to parse {}: {} — ignoring", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_defaults_match_gateway_config() {
        let s = ServerConfig::default();
        let g = GatewayConfig::default();
        assert_eq!(s.port, g.port);
    }

    #[test]
    fn env_overrides_port_and_token() {
        std::env::set_var("AMCP_PORT", "9999");
        std::env::set_var("AMCP_TOKEN", "secret");
        let mut server = ServerConfig::default();
        server.apply_env_overrides();
        assert_eq!(server.port, 9999);
        assert_eq!(server.auth.token.as_deref(), Some("secret"));
        std::env::remove_var("AMCP_PORT");
        std::env::remove_var("AMCP_TOKEN");
    }

    #[test]
    fn missing_files_fall_back_to_defaults() {
        let config = RootConfig::load_from(Path::new("/nonexistent/amcp/root"));
        assert!(config.hooks.hooks.is_empty());
        assert!(config.chat.permission_rules.is_empty());
    }
}
