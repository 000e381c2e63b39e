use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

/// Returned when a restoration carries no predictions.
pub const NO_RESULT: &str = "No result";

/// Decoding settings handed to the restoration routine on every call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RestoreParams {
    pub beam_width: u32,
    pub temperature: f32,
    pub unk_restoration_max_len: u32,
}

impl Default for RestoreParams {
    fn default() -> Self {
        Self {
            beam_width: 5,
            temperature: 1.0,
            unk_restoration_max_len: 15,
        }
    }
}

/// Something that can restore damaged text. Implementations return the raw
/// restoration result, either a JSON document or a string containing one.
#[async_trait]
pub trait Restorer: Send + Sync {
    async fn restore(&self, text: &str, params: &RestoreParams) -> Result<Value>;
}

/// Reduces a restoration result to its top prediction.
///
/// String results are parsed as JSON first. The first entry of
/// `predictions` wins; objects contribute their `text` field and anything
/// else is rendered as JSON so callers always get a string back.
pub fn top_prediction(result: Value) -> Result<String> {
    let result = match result {
        Value::String(s) => serde_json::from_str(&s)?,
        other => other,
    };

    let first = result
        .get("predictions")
        .and_then(Value::as_array)
        .and_then(|predictions| predictions.first());

    Ok(match first {
        None => NO_RESULT.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(entry)) => match entry.get("text") {
            Some(Value::String(text)) => text.clone(),
            _ => Value::Object(entry.clone()).to_string(),
        },
        Some(other) => other.to_string(),
    })
}
