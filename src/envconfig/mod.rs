use std::env;
use std::path::PathBuf;

use crate::checkpoint::CheckpointMatcher;
use crate::restore::RestoreParams;

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_INPUT_DIR: &str = "/kaggle/input";
pub const DEFAULT_REPO_URL: &str = "https://github.com/google-deepmind/predictingthepast.git";
pub const DEFAULT_REPO_DIR: &str = "predictingthepast";
pub const DEFAULT_PIP_PACKAGES: &str = "dm-haiku optax";

#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub host: Host,
    pub input_dir: PathBuf,
    pub checkpoint: CheckpointMatcher,
    pub repo_url: String,
    pub repo_dir: PathBuf,
    pub python: String,
    pub pip_packages: Vec<String>,
    pub restore: RestoreParams,
    pub tunnel: TunnelConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub host: String,
    pub port: u16,
}

/// ngrok settings. Both values come from the environment or the command
/// line, never from source.
#[derive(Debug, Clone, Default)]
pub struct TunnelConfig {
    pub auth_token: Option<String>,
    pub domain: Option<String>,
    pub binary: String,
}

impl EnvConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let defaults = RestoreParams::default();
        let matcher = CheckpointMatcher::default();

        Self {
            host: Host::parse(&var("AENEAS_HOST", "0.0.0.0")),
            input_dir: expand_home(&var("AENEAS_INPUT_DIR", DEFAULT_INPUT_DIR)),
            checkpoint: CheckpointMatcher {
                marker: var("AENEAS_CHECKPOINT_MARKER", &matcher.marker),
                extension: var("AENEAS_CHECKPOINT_EXT", &matcher.extension),
                exclude: var("AENEAS_CHECKPOINT_EXCLUDE", &matcher.exclude),
            },
            repo_url: var("AENEAS_REPO_URL", DEFAULT_REPO_URL),
            repo_dir: expand_home(&var("AENEAS_REPO_DIR", DEFAULT_REPO_DIR)),
            python: var("AENEAS_PYTHON", "python3"),
            pip_packages: var("AENEAS_PIP_PACKAGES", DEFAULT_PIP_PACKAGES)
                .split_whitespace()
                .map(String::from)
                .collect(),
            restore: RestoreParams {
                beam_width: lookup("AENEAS_BEAM_WIDTH")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.beam_width),
                temperature: lookup("AENEAS_TEMPERATURE")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.temperature),
                unk_restoration_max_len: lookup("AENEAS_UNK_MAX_LEN")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.unk_restoration_max_len),
            },
            tunnel: TunnelConfig {
                auth_token: lookup("NGROK_AUTHTOKEN").filter(|v| !v.is_empty()),
                domain: lookup("NGROK_DOMAIN").filter(|v| !v.is_empty()),
                binary: var("NGROK_BIN", "ngrok"),
            },
        }
    }
}

impl Host {
    /// Parses `host[:port]`, defaulting the port to 8000.
    pub fn parse(value: &str) -> Self {
        let (host, port) = if value.contains(':') {
            let parts: Vec<&str> = value.rsplitn(2, ':').collect();
            let port = parts[0].parse().unwrap_or(DEFAULT_PORT);
            (parts[1].to_string(), port)
        } else {
            (value.to_string(), DEFAULT_PORT)
        };

        Self { host, port }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Base URL used by the `restore` client subcommand.
pub fn server_url() -> String {
    env::var("AENEAS_URL").unwrap_or_else(|_| format!("http://localhost:{}", DEFAULT_PORT))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> EnvConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]);

        assert_eq!(config.host, Host { host: "0.0.0.0".into(), port: 8000 });
        assert_eq!(config.input_dir, PathBuf::from("/kaggle/input"));
        assert_eq!(config.checkpoint.marker, "aeneas");
        assert_eq!(config.checkpoint.extension, "pkl");
        assert_eq!(config.checkpoint.exclude, "emb");
        assert_eq!(config.repo_dir, PathBuf::from("predictingthepast"));
        assert_eq!(config.pip_packages, vec!["dm-haiku", "optax"]);
        assert_eq!(config.restore, RestoreParams::default());
        assert!(config.tunnel.auth_token.is_none());
        assert!(config.tunnel.domain.is_none());
        assert_eq!(config.tunnel.binary, "ngrok");
    }

    #[test]
    fn test_host_parsing() {
        assert_eq!(Host::parse("127.0.0.1:9000").port, 9000);
        assert_eq!(Host::parse("127.0.0.1").port, 8000);
        assert_eq!(Host::parse("localhost:nope"), Host { host: "localhost".into(), port: 8000 });
        assert_eq!(Host::parse("0.0.0.0:8080").addr(), "0.0.0.0:8080");
    }

    #[test]
    fn test_overrides_and_fallbacks() {
        let config = config_from(&[
            ("AENEAS_BEAM_WIDTH", "8"),
            ("AENEAS_TEMPERATURE", "warm"),
            ("NGROK_DOMAIN", "demo.ngrok-free.app"),
            ("NGROK_AUTHTOKEN", ""),
        ]);

        assert_eq!(config.restore.beam_width, 8);
        assert_eq!(config.restore.temperature, 1.0);
        assert_eq!(config.restore.unk_restoration_max_len, 15);
        assert_eq!(config.tunnel.domain.as_deref(), Some("demo.ngrok-free.app"));
        assert!(config.tunnel.auth_token.is_none());
    }
}
