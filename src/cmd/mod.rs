use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{error, info};

use aeneas_serve::envconfig::{EnvConfig, TunnelConfig};
use aeneas_serve::{find_checkpoint, publish, server, AppState, Bootstrap, Client, NgrokAgent, Worker};

pub struct ServeOptions {
    pub no_tunnel: bool,
    pub skip_bootstrap: bool,
}

pub async fn serve(config: EnvConfig, opts: ServeOptions) -> Result<()> {
    if opts.skip_bootstrap {
        info!("Skipping package install and clone");
    } else {
        Bootstrap::new(&config.python, &config.repo_url, &config.repo_dir)
            .packages(config.pip_packages.clone())
            .run()
            .await;
    }

    info!("Finding checkpoint under {}", config.input_dir.display());
    let path = find_checkpoint(&config.input_dir, &config.checkpoint)?;

    info!("Loading checkpoint {}", path.display());
    let worker = Worker::start_python(&config.python, &config.repo_dir, path)
        .await
        .context("failed to load checkpoint")?;
    info!(
        "Model ready from {} (vocab_char_size {})",
        worker.checkpoint().file_name(),
        worker.checkpoint().vocab_char_size
    );

    let addr = config.host.addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    let port = listener.local_addr()?.port();

    // held for the lifetime of the server; dropping it closes the tunnel
    let _agent = if opts.no_tunnel {
        None
    } else {
        open_tunnel(&config.tunnel, port).await
    };

    let state = AppState {
        restorer: Arc::new(worker),
        params: config.restore,
    };
    server::serve(listener, state).await?;

    Ok(())
}

async fn open_tunnel(config: &TunnelConfig, port: u16) -> Option<NgrokAgent> {
    let agent = match NgrokAgent::start(&config.binary, config.auth_token.as_deref()).await {
        Ok(agent) => agent,
        Err(e) => {
            error!("Tunnel unavailable, serving locally only: {}", e);
            return None;
        }
    };

    if let Err(e) = publish(&agent, port, config.domain.as_deref()).await {
        error!("Fallback tunnel failed, serving locally only: {}", e);
    }
    Some(agent)
}

pub async fn find(config: EnvConfig) -> Result<()> {
    let path: PathBuf = find_checkpoint(&config.input_dir, &config.checkpoint)?;
    println!("{}", path.display());
    Ok(())
}

pub async fn restore(url: Option<String>, text: &str) -> Result<()> {
    let client = match url {
        Some(url) => Client::new(&url)?,
        None => Client::from_env()?,
    };
    let prediction = client
        .restore(text)
        .await
        .with_context(|| format!("request to {} failed", client.restore_url().map(|u| u.to_string()).unwrap_or_default()))?;
    println!("{}", prediction);
    Ok(())
}

pub async fn version() -> Result<()> {
    println!("aeneas-serve version {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
