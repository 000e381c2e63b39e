use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State as AxumState,
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::restore::{top_prediction, RestoreParams, Restorer};

#[derive(Clone)]
pub struct AppState {
    pub restorer: Arc<dyn Restorer>,
    pub params: RestoreParams,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RestoreRequest {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestoreResponse {
    pub prediction: String,
}

impl RestoreResponse {
    fn new(prediction: impl Into<String>) -> Self {
        Self { prediction: prediction.into() }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/restore", post(restore))
        .with_state(state)
}

pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> Result<()> {
    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Always answers 200: failures travel as `Error: ...` predictions.
async fn restore(AxumState(state): AxumState<AppState>, body: Bytes) -> Json<RestoreResponse> {
    match handle(&state, &body).await {
        Ok(prediction) => Json(RestoreResponse::new(prediction)),
        Err(e) => {
            error!("Restoration failed: {}", e);
            Json(RestoreResponse::new(format!("Error: {}", e)))
        }
    }
}

async fn handle(state: &AppState, body: &[u8]) -> Result<String> {
    let request: RestoreRequest = match serde_json::from_slice::<Value>(body)? {
        value @ Value::Object(_) => serde_json::from_value(value)?,
        other => return Err(Error::BadRequest(format!("expected a JSON object, got {}", other))),
    };
    let text = request.text.unwrap_or_default();
    info!("Received input: {}...", text.chars().take(50).collect::<String>());

    if text.is_empty() {
        warn!("Empty input received");
        return Ok(String::new());
    }

    info!("Inference started");
    let result: Value = state.restorer.restore(&text, &state.params).await?;
    let prediction = top_prediction(result)?;
    info!("Inference finished, sending: {}", prediction);

    Ok(prediction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        calls: AtomicUsize,
        result: Value,
    }

    #[async_trait]
    impl Restorer for Fixed {
        async fn restore(&self, _text: &str, params: &RestoreParams) -> Result<Value> {
            assert_eq!(*params, RestoreParams::default());
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.result.clone())
        }
    }

    fn state(result: Value) -> (AppState, Arc<Fixed>) {
        let fixed = Arc::new(Fixed { calls: AtomicUsize::new(0), result });
        let state = AppState {
            restorer: fixed.clone(),
            params: RestoreParams::default(),
        };
        (state, fixed)
    }

    #[tokio::test]
    async fn test_handle_skips_model_for_empty_text() {
        let (state, fixed) = state(json!({"predictions": ["x"]}));

        assert_eq!(handle(&state, br#"{"text": ""}"#).await.unwrap(), "");
        assert_eq!(handle(&state, br#"{}"#).await.unwrap(), "");
        assert_eq!(handle(&state, br#"{"text": null}"#).await.unwrap(), "");
        assert_eq!(fixed.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handle_rejects_bad_bodies() {
        let (state, fixed) = state(json!({"predictions": ["x"]}));

        assert!(handle(&state, b"not json").await.is_err());
        assert!(handle(&state, b"42").await.is_err());
        assert!(handle(&state, b"[]").await.is_err());
        assert!(handle(&state, br#"["d[..] m[..]"]"#).await.is_err());
        assert!(handle(&state, br#"{"text": 7}"#).await.is_err());
        assert_eq!(fixed.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handle_returns_top_prediction() {
        let (state, fixed) = state(json!(r#"{"predictions": ["in memoriam", "in memoria"]}"#));

        let prediction = handle(&state, br#"{"text": "in memori[.]m"}"#).await.unwrap();
        assert_eq!(prediction, "in memoriam");
        assert_eq!(fixed.calls.load(Ordering::SeqCst), 1);
    }
}
