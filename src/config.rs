use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// `demo/demo-chat` — the model used when no override and no global active
/// provider is configured (spec §4.1 step 2).
pub const DEFAULT_PROVIDER_ID: &str = "demo";
pub const DEFAULT_MODEL: &str = "demo-chat";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub http: HttpTimeouts,
    #[serde(default)]
    pub disabled_tools: HashSet<String>,
    #[serde(default)]
    pub features: FeatureFlags,
    #[serde(default)]
    pub search: SearchConfig,
    pub api_key: Option<String>,
    pub browser_agent_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HttpTimeouts {
    pub read_header_timeout_secs: u64,
    pub read_timeout_secs: u64,
    /// Spec §9: long-lived SSE streams rely on this being effectively unbounded
    /// (default 0 = disabled) rather than a fixed write deadline.
    pub write_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl HttpTimeouts {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct FeatureFlags {
    #[serde(default)]
    pub prompt_templates: bool,
    #[serde(default)]
    pub prompt_context_introspect: bool,
    #[serde(default)]
    pub codex_mode_v2: bool,
    #[serde(default)]
    pub browser_tool: bool,
    #[serde(default)]
    pub search_tool: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SearchConfig {
    pub serpapi_key: Option<String>,
    pub serpapi_base_url: Option<String>,
    pub tavily_key: Option<String>,
    pub tavily_base_url: Option<String>,
    pub brave_key: Option<String>,
    pub brave_base_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                data_dir: crate::paths::nextai_home().clone(),
            },
            http: HttpTimeouts {
                read_header_timeout_secs: 10,
                read_timeout_secs: 30,
                write_timeout_secs: 0,
                idle_timeout_secs: 120,
                shutdown_timeout_secs: 15,
            },
            disabled_tools: HashSet::new(),
            features: FeatureFlags::default(),
            search: SearchConfig::default(),
            api_key: None,
            browser_agent_dir: None,
        }
    }
}

impl Config {
    /// Load `nextai.toml` from the current directory if present, then apply
    /// `NEXTAI_*` environment variable overrides on top (env always wins).
    pub fn load() -> Result<Self> {
        Self::load_with_path(Path::new("nextai.toml"))
    }

    pub fn load_with_path(config_path: &Path) -> Result<Self> {
        let mut config = if config_path.exists() {
            let content = fs::read_to_string(config_path)?;
            toml::from_str(&content)?
        } else {
            Config::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("NEXTAI_HOST") {
            if !v.is_empty() {
                self.server.host = v;
            }
        }
        if let Ok(v) = std::env::var("NEXTAI_PORT") {
            if let Ok(port) = v.parse() {
                self.server.port = port;
            }
        }
        if let Ok(v) = std::env::var("NEXTAI_DATA_DIR") {
            if !v.is_empty() {
                self.server.data_dir = PathBuf::from(v);
            }
        }
        if let Ok(v) = std::env::var("NEXTAI_API_KEY") {
            if !v.is_empty() {
                self.api_key = Some(v);
            }
        }
        if let Ok(v) = std::env::var("NEXTAI_DISABLED_TOOLS") {
            self.disabled_tools = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(v) = std::env::var("NEXTAI_BROWSER_AGENT_DIR") {
            if !v.is_empty() {
                self.browser_agent_dir = Some(PathBuf::from(v));
            }
        }

        env_secs(&mut self.http.read_header_timeout_secs, "NEXTAI_HTTP_READ_HEADER_TIMEOUT_SECONDS");
        env_secs(&mut self.http.read_timeout_secs, "NEXTAI_HTTP_READ_TIMEOUT_SECONDS");
        env_secs(&mut self.http.write_timeout_secs, "NEXTAI_HTTP_WRITE_TIMEOUT_SECONDS");
        env_secs(&mut self.http.idle_timeout_secs, "NEXTAI_HTTP_IDLE_TIMEOUT_SECONDS");
        env_secs(&mut self.http.shutdown_timeout_secs, "NEXTAI_HTTP_SHUTDOWN_TIMEOUT_SECONDS");

        env_bool(&mut self.features.prompt_templates, "NEXTAI_ENABLE_PROMPT_TEMPLATES");
        env_bool(
            &mut self.features.prompt_context_introspect,
            "NEXTAI_ENABLE_PROMPT_CONTEXT_INTROSPECT",
        );
        env_bool(&mut self.features.codex_mode_v2, "NEXTAI_ENABLE_CODEX_MODE_V2");
        env_bool(&mut self.features.browser_tool, "NEXTAI_ENABLE_BROWSER_TOOL");
        env_bool(&mut self.features.search_tool, "NEXTAI_ENABLE_SEARCH_TOOL");

        env_opt(&mut self.search.serpapi_key, "NEXTAI_SEARCH_SERPAPI_KEY");
        env_opt(&mut self.search.serpapi_base_url, "NEXTAI_SEARCH_SERPAPI_BASE_URL");
        env_opt(&mut self.search.tavily_key, "NEXTAI_SEARCH_TAVILY_KEY");
        env_opt(&mut self.search.tavily_base_url, "NEXTAI_SEARCH_TAVILY_BASE_URL");
        env_opt(&mut self.search.brave_key, "NEXTAI_SEARCH_BRAVE_KEY");
        env_opt(&mut self.search.brave_base_url, "NEXTAI_SEARCH_BRAVE_BASE_URL");
    }
}

fn env_secs(field: &mut u64, key: &str) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(secs) = v.parse() {
            *field = secs;
        }
    }
}

fn env_bool(field: &mut bool, key: &str) {
    if let Ok(v) = std::env::var(key) {
        *field = matches!(v.as_str(), "1" | "true" | "TRUE" | "yes");
    }
}

fn env_opt(field: &mut Option<String>, key: &str) {
    if let Ok(v) = std::env::var(key) {
        if !v.is_empty() {
            *field = Some(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_demo_provider_fallback_values() {
        let cfg = Config::default();
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.http.write_timeout_secs, 0);
    }

    #[test]
    fn load_with_path_falls_back_to_default_when_missing() {
        let cfg = Config::load_with_path(Path::new("/nonexistent/nextai.toml")).unwrap();
        assert_eq!(cfg.server.port, 8080);
    }
}
