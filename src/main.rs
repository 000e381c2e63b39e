mod cmd;

use std::path::PathBuf;
use std::process;

use clap::{Args, Parser, Subcommand};

use aeneas_serve::envconfig::{expand_home, EnvConfig};

#[derive(Parser)]
#[command(name = "aeneas-serve")]
#[command(version)]
#[command(about = "Serve ancient-text restoration over HTTP", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct InputArgs {
    /// Directory scanned for the checkpoint
    #[arg(long)]
    input_dir: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the checkpoint, publish a tunnel and serve POST /restore
    Serve {
        #[command(flatten)]
        input: InputArgs,
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
        /// Static tunnel domain
        #[arg(long)]
        domain: Option<String>,
        #[arg(long)]
        python: Option<String>,
        #[arg(long)]
        repo_dir: Option<String>,
        #[arg(long)]
        no_tunnel: bool,
        #[arg(long)]
        skip_bootstrap: bool,
    },
    /// Print the checkpoint that `serve` would load
    FindCheckpoint {
        #[command(flatten)]
        input: InputArgs,
    },
    /// Send text to a running server and print the prediction
    Restore {
        text: String,
        #[arg(short, long)]
        url: Option<String>,
    },
    Version,
}

fn apply_input(config: &mut EnvConfig, input: InputArgs) {
    if let Some(dir) = input.input_dir {
        config.input_dir = expand_home(&dir);
    }
}

#[tokio::main]
async fn main() {
    aeneas_serve::logging::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve {
            input,
            host,
            port,
            domain,
            python,
            repo_dir,
            no_tunnel,
            skip_bootstrap,
        } => {
            let mut config = EnvConfig::from_env();
            apply_input(&mut config, input);
            if let Some(host) = host {
                config.host.host = host;
            }
            if let Some(port) = port {
                config.host.port = port;
            }
            if domain.is_some() {
                config.tunnel.domain = domain;
            }
            if let Some(python) = python {
                config.python = python;
            }
            if let Some(repo_dir) = repo_dir {
                config.repo_dir = PathBuf::from(repo_dir);
            }
            cmd::serve(config, cmd::ServeOptions { no_tunnel, skip_bootstrap }).await
        }
        Commands::FindCheckpoint { input } => {
            let mut config = EnvConfig::from_env();
            apply_input(&mut config, input);
            cmd::find(config).await
        }
        Commands::Restore { text, url } => cmd::restore(url, &text).await,
        Commands::Version => cmd::version().await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}
