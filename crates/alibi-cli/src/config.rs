use alibi_core::RouterConfig;
use alibi_gateway::Suspect;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlibiConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub router: RouterSection,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default = "default_suspects")]
    pub suspects: Vec<Suspect>,
}

impl Default for AlibiConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            router: RouterSection::default(),
            fallback: FallbackConfig::default(),
            suspects: default_suspects(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Keep conversations in memory only
    #[serde(default)]
    pub ephemeral: bool,
}

fn default_db_path() -> String {
    "~/.alibi/alibi.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            ephemeral: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSection {
    /// Seconds to wait for an agent reply; 0 waits forever
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_agent_timeout_secs() -> u64 {
    30
}

fn default_event_buffer() -> usize {
    256
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            agent_timeout_secs: default_agent_timeout_secs(),
            event_buffer: default_event_buffer(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Empty means the built-in pool
    #[serde(default)]
    pub replies: Vec<String>,
}

fn default_suspects() -> Vec<Suspect> {
    [
        ("suspectA", "Mr. Black"),
        ("suspectB", "Ms. Scarlet"),
        ("suspectC", "Prof. Plum"),
        ("suspectD", "Colonel Mustard"),
    ]
    .into_iter()
    .map(|(id, name)| Suspect {
        id: id.to_string(),
        name: name.to_string(),
    })
    .collect()
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".alibi")
}

impl AlibiConfig {
    /// Load from `custom_path`, or `~/.alibi/config.toml`. A missing default
    /// file yields the built-in defaults; a missing explicit file is an error.
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = match custom_path {
            Some(p) => p.clone(),
            None => {
                let path = config_dir().join("config.toml");
                if !path.exists() {
                    info!(
                        "No config at {}, using defaults. Run `alibi init` to create one.",
                        path.display()
                    );
                    return Ok(Self::default());
                }
                path
            }
        };

        let content = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "Failed to read config at {}. Run `alibi init` first.",
                path.display()
            )
        })?;

        Self::parse(&content).with_context(|| format!("Failed to parse config at {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        // Expand environment variables before parsing
        let expanded = expand_env_vars(content);
        let config: Self = toml::from_str(&expanded)?;

        if config.suspects.is_empty() {
            warn!("No suspects configured; /suspects will be empty");
        }
        Ok(config)
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let addr = format!("{}:{}", self.server.bind, self.server.port);
        addr.parse()
            .with_context(|| format!("Invalid server address '{}'", addr))
    }

    pub fn db_path(&self) -> PathBuf {
        shellexpand(&self.store.db_path)
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            agent_timeout: match self.router.agent_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            event_buffer: self.router.event_buffer,
        }
    }
}

/// Allowlist of environment variable names that may be expanded in config files.
const ALLOWED_ENV_VARS: &[&str] = &["HOME", "USER", "ALIBI_DB_PATH", "ALIBI_BIND"];

fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let mut pos = 0;
    while pos < result.len() {
        let Some(start) = result[pos..].find("${") else {
            break;
        };
        let abs_start = pos + start;
        let Some(end) = result[abs_start..].find('}') else {
            break;
        };
        let var_name = result[abs_start + 2..abs_start + end].to_string();

        if !ALLOWED_ENV_VARS.contains(&var_name.as_str()) {
            warn!(
                "Skipping expansion of unrecognized env var '{}' in config (not in allowlist)",
                var_name
            );
            // Leave the ${VAR} unexpanded so it's obvious
            pos = abs_start + end + 1;
            continue;
        }

        let value = std::env::var(&var_name).unwrap_or_default();
        result = format!(
            "{}{}{}",
            &result[..abs_start],
            value,
            &result[abs_start + end + 1..]
        );
        pos = abs_start + value.len();
    }
    result
}

/// Expand a leading `~/` to the home directory
pub fn shellexpand(s: &str) -> PathBuf {
    match (s.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => Path::new(s).to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg = AlibiConfig::parse("").unwrap();
        assert_eq!(cfg.server.port, 5000);
        assert_eq!(cfg.bind_addr().unwrap().to_string(), "127.0.0.1:5000");
        assert!(!cfg.store.ephemeral);
        assert_eq!(cfg.router.agent_timeout_secs, 30);
        assert!(cfg.fallback.replies.is_empty());
        assert_eq!(cfg.suspects.len(), 4);
        assert_eq!(cfg.suspects[3].name, "Colonel Mustard");
    }

    #[test]
    fn test_bundled_default_config_parses() {
        let cfg = AlibiConfig::parse(include_str!("../../../config/default.toml")).unwrap();
        assert_eq!(cfg.server.port, 5000);
        assert_eq!(cfg.suspects[0].id, "suspectA");
        assert_eq!(cfg.fallback.replies.len(), 5);
    }

    #[test]
    fn test_partial_sections() {
        let cfg = AlibiConfig::parse(
            r#"
            [server]
            port = 8080

            [router]
            agent_timeout_secs = 0

            [[suspects]]
            id = "butler"
            name = "The Butler"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.bind, "127.0.0.1");
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.router.event_buffer, 256);
        assert!(cfg.router_config().agent_timeout.is_none());
        assert_eq!(cfg.suspects.len(), 1);
        assert_eq!(cfg.suspects[0].id, "butler");
    }

    #[test]
    fn test_router_config_timeout() {
        let cfg = AlibiConfig::parse("[router]\nagent_timeout_secs = 5\nevent_buffer = 8\n").unwrap();
        let rc = cfg.router_config();
        assert_eq!(rc.agent_timeout, Some(Duration::from_secs(5)));
        assert_eq!(rc.event_buffer, 8);
    }

    #[test]
    fn test_invalid_bind() {
        let cfg = AlibiConfig::parse("[server]\nbind = \"not an ip\"\n").unwrap();
        assert!(cfg.bind_addr().is_err());
    }

    #[test]
    fn test_env_expansion_allowlist() {
        let home = std::env::var("HOME").unwrap_or_default();
        assert_eq!(expand_env_vars("db = \"${HOME}/x\""), format!("db = \"{}/x\"", home));
        assert_eq!(expand_env_vars("k = \"${SECRET_THING}\""), "k = \"${SECRET_THING}\"");
        assert_eq!(expand_env_vars("unterminated ${HOME"), "unterminated ${HOME");
    }

    #[test]
    fn test_shellexpand() {
        assert_eq!(shellexpand("/tmp/alibi.db"), PathBuf::from("/tmp/alibi.db"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(shellexpand("~/.alibi/alibi.db"), home.join(".alibi/alibi.db"));
        }
    }

    #[test]
    fn test_round_trips_through_toml() {
        let cfg = AlibiConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let back = AlibiConfig::parse(&text).unwrap();
        assert_eq!(back.suspects, cfg.suspects);
        assert_eq!(back.server.port, cfg.server.port);
    }
}
