pub mod api;
pub mod bootstrap;
pub mod checkpoint;
pub mod envconfig;
pub mod error;
pub mod logging;
pub mod restore;
pub mod server;
pub mod tunnel;
pub mod worker;

pub use api::Client;
pub use bootstrap::Bootstrap;
pub use checkpoint::{find_checkpoint, Checkpoint, CheckpointMatcher};
pub use envconfig::EnvConfig;
pub use error::{Error, Result};
pub use restore::{top_prediction, RestoreParams, Restorer};
pub use server::{AppState, RestoreRequest, RestoreResponse};
pub use tunnel::{publish, NgrokAgent, Tunnel, TunnelProvider};
pub use worker::Worker;
