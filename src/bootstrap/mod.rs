use std::path::PathBuf;
use std::process::Output;

use tokio::process::Command;
use tracing::{info, warn};

use crate::error::Result;

/// Result of one setup step. Failures are reported, never raised: a broken
/// install or clone only shows up later when the worker imports the code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub step: &'static str,
    pub success: bool,
    pub detail: String,
}

impl StepOutcome {
    fn from_output(step: &'static str, output: std::io::Result<Output>) -> Self {
        match output {
            Ok(o) if o.status.success() => Self {
                step,
                success: true,
                detail: String::new(),
            },
            Ok(o) => Self {
                step,
                success: false,
                detail: format!(
                    "exit {}: {}",
                    o.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&o.stderr).trim()
                ),
            },
            Err(e) => Self {
                step,
                success: false,
                detail: e.to_string(),
            },
        }
    }

    fn log(&self) {
        if self.success {
            info!("{} done", self.step);
        } else {
            warn!("{} failed ({}), continuing", self.step, self.detail);
        }
    }
}

pub struct Bootstrap {
    python: String,
    packages: Vec<String>,
    repo_url: String,
    repo_dir: PathBuf,
}

impl Bootstrap {
    pub fn new(python: impl Into<String>, repo_url: impl Into<String>, repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            python: python.into(),
            packages: Vec::new(),
            repo_url: repo_url.into(),
            repo_dir: repo_dir.into(),
        }
    }

    pub fn packages(mut self, packages: Vec<String>) -> Self {
        self.packages = packages;
        self
    }

    /// Installs packages, then replaces the model-code checkout.
    pub async fn run(&self) -> Vec<StepOutcome> {
        let mut outcomes = Vec::with_capacity(2);

        if !self.packages.is_empty() {
            info!("Installing {}", self.packages.join(" "));
            let outcome = self.install().await;
            outcome.log();
            outcomes.push(outcome);
        }

        info!("Cloning {} into {}", self.repo_url, self.repo_dir.display());
        let outcome = match self.clear_repo_dir().await {
            Ok(()) => self.clone_repo().await,
            Err(e) => StepOutcome {
                step: "git clone",
                success: false,
                detail: format!("could not remove {}: {}", self.repo_dir.display(), e),
            },
        };
        outcome.log();
        outcomes.push(outcome);

        outcomes
    }

    async fn install(&self) -> StepOutcome {
        let output = Command::new(&self.python)
            .args(["-m", "pip", "install", "-q"])
            .args(&self.packages)
            .output()
            .await;
        StepOutcome::from_output("pip install", output)
    }

    async fn clear_repo_dir(&self) -> Result<()> {
        if tokio::fs::metadata(&self.repo_dir).await.is_ok() {
            tokio::fs::remove_dir_all(&self.repo_dir).await?;
        }
        Ok(())
    }

    async fn clone_repo(&self) -> StepOutcome {
        let output = Command::new("git")
            .arg("clone")
            .arg("--depth=1")
            .arg(&self.repo_url)
            .arg(&self.repo_dir)
            .output()
            .await;
        StepOutcome::from_output("git clone", output)
    }
}
