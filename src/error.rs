use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{marker} .{extension} file not found under {}", root.display())]
    CheckpointNotFound {
        root: PathBuf,
        marker: String,
        extension: String,
    },

    #[error("checkpoint {}: {message}", path.display())]
    Checkpoint { path: PathBuf, message: String },

    #[error("worker: {0}")]
    Worker(String),

    #[error("worker exited")]
    WorkerExited,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("client: {0}")]
    Client(String),

    #[error("tunnel: {0}")]
    Tunnel(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}
