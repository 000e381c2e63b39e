use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::process::{Child, Command};
use tracing::{debug, error, info};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunnel {
    pub public_url: String,
    pub domain: Option<String>,
}

impl Tunnel {
    pub fn restore_url(&self) -> String {
        format!("{}/restore", self.public_url.trim_end_matches('/'))
    }
}

#[async_trait]
pub trait TunnelProvider: Send + Sync {
    /// Opens a tunnel to local `port`, on `domain` when given, otherwise on
    /// an address the provider picks.
    async fn connect(&self, port: u16, domain: Option<&str>) -> Result<Tunnel>;
}

/// Publishes `port`, preferring the static `domain`. A failed static request
/// is followed by exactly one request for an assigned address.
pub async fn publish(provider: &dyn TunnelProvider, port: u16, domain: Option<&str>) -> Result<Tunnel> {
    if let Some(domain) = domain {
        match provider.connect(port, Some(domain)).await {
            Ok(tunnel) => {
                info!("Server online: {}", tunnel.restore_url());
                return Ok(tunnel);
            }
            Err(e) => error!("Static domain {} failed: {}", domain, e),
        }
    }

    let tunnel = provider.connect(port, None).await?;
    info!("Fallback URL: {}", tunnel.restore_url());
    Ok(tunnel)
}

/// Loopback address for the agent's web API, on a port nothing else holds.
fn free_web_addr() -> Result<SocketAddr> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?)
}

fn agent_config(web_addr: SocketAddr) -> String {
    format!("version: \"2\"\nweb_addr: {}\n", web_addr)
}

/// Agent config written for one run and removed with the agent.
struct ConfigFile(PathBuf);

impl ConfigFile {
    fn write(web_addr: SocketAddr) -> Result<Self> {
        let path = std::env::temp_dir().join(format!("aeneas-ngrok-{}.yml", uuid::Uuid::new_v4()));
        std::fs::write(&path, agent_config(web_addr))?;
        Ok(Self(path))
    }
}

impl Drop for ConfigFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

/// The user's own agent config, merged in first so its settings still apply.
fn default_config() -> Option<PathBuf> {
    let path = dirs::config_dir()?.join("ngrok").join("ngrok.yml");
    path.is_file().then_some(path)
}

#[derive(Debug, Deserialize)]
struct TunnelCreated {
    public_url: String,
}

#[derive(Debug, Deserialize)]
struct AgentError {
    msg: String,
}

/// Tunnels through a local `ngrok` agent, driven over its HTTP API.
pub struct NgrokAgent {
    child: Child,
    api: String,
    client: reqwest::Client,
    _config: ConfigFile,
}

impl NgrokAgent {
    /// Starts the agent binary on a private web address and waits for its
    /// API to come up.
    pub async fn start(binary: &str, auth_token: Option<&str>) -> Result<Self> {
        let web_addr = free_web_addr()?;
        let config = ConfigFile::write(web_addr)?;

        let mut cmd = Command::new(binary);
        cmd.args(["start", "--none", "--log", "stderr", "--log-format", "logfmt"]);
        if let Some(path) = default_config() {
            cmd.arg("--config").arg(path);
        }
        cmd.arg("--config")
            .arg(&config.0)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(token) = auth_token {
            cmd.env("NGROK_AUTHTOKEN", token);
        }

        let child = cmd
            .spawn()
            .map_err(|e| Error::Tunnel(format!("failed to start {}: {}", binary, e)))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        debug!("ngrok agent API on {}", web_addr);
        let mut agent = Self {
            child,
            api: format!("http://{}", web_addr),
            client,
            _config: config,
        };
        agent.wait_ready().await?;
        Ok(agent)
    }

    async fn wait_ready(&mut self) -> Result<()> {
        let url = format!("{}/api/tunnels", self.api);
        for _ in 0..40 {
            if let Some(status) = self.child.try_wait()? {
                return Err(Error::Tunnel(format!("agent exited before its API came up ({})", status)));
            }
            if let Ok(response) = self.client.get(&url).send().await {
                if response.status().is_success() {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        Err(Error::Tunnel("agent API did not come up".to_string()))
    }
}

#[async_trait]
impl TunnelProvider for NgrokAgent {
    async fn connect(&self, port: u16, domain: Option<&str>) -> Result<Tunnel> {
        let mut body = json!({
            "name": format!("aeneas-{}", uuid::Uuid::new_v4()),
            "addr": port.to_string(),
            "proto": "http",
        });
        if let Some(domain) = domain {
            body["domain"] = json!(domain);
        }

        let response = self
            .client
            .post(format!("{}/api/tunnels", self.api))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let message = match response.json::<AgentError>().await {
                Ok(e) => e.msg,
                Err(_) => status.to_string(),
            };
            return Err(Error::Tunnel(message));
        }

        let created: TunnelCreated = response.json().await?;
        Ok(Tunnel {
            public_url: created.public_url,
            domain: domain.map(String::from),
        })
    }
}
