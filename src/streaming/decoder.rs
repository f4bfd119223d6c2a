//! Incoming message decoding
//!
//! Every service message looks like `{code, message, sid?, data: {status, data?}}`.
//! `data.data`, when present, is a base64-encoded XML score document.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Deserialize;

use super::result::EvaluationResult;
use crate::error::IseError;

/// `data.status` value marking the final response
pub const FINAL_STATUS: i64 = 2;

#[derive(Debug, Clone, Deserialize)]
struct ServiceResponse {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    sid: Option<String>,
    #[serde(default)]
    data: Option<ResponseData>,
}

#[derive(Debug, Clone, Deserialize)]
struct ResponseData {
    #[serde(default)]
    status: Option<i64>,
    #[serde(default)]
    data: Option<String>,
}

/// What a single service message means for the session
#[derive(Debug, Clone)]
pub struct DecodedResponse {
    pub code: i64,
    pub message: String,
    pub sid: Option<String>,
    /// Scores carried by this message, if any
    pub result: Option<EvaluationResult>,
    /// Why a payload that was present could not be turned into `result`
    pub result_error: Option<IseError>,
    /// Success code with the final status: the evaluation is complete
    pub terminal: bool,
    /// The message exactly as received
    pub raw: serde_json::Value,
}

impl DecodedResponse {
    pub fn is_error(&self) -> bool {
        self.code != 0
    }

    /// Service error for a non-zero code, carrying the original payload
    pub fn error(&self) -> Option<IseError> {
        if !self.is_error() {
            return None;
        }
        Some(IseError::Service {
            code: self.code,
            message: self.message.clone(),
            raw: self.raw.clone(),
        })
    }
}

/// Decode one text message from the service.
///
/// Fails with `IseError::Protocol` only when the envelope itself is unusable
/// (not JSON, no `code`). A result payload that cannot be decoded leaves
/// `result` empty and is reported in `result_error`; the code and status
/// still count.
pub fn decode(raw_message: &str) -> Result<DecodedResponse, IseError> {
    let raw: serde_json::Value = serde_json::from_str(raw_message)
        .map_err(|e| IseError::Protocol(format!("response is not JSON: {}", e)))?;
    let response: ServiceResponse = serde_json::from_value(raw.clone())
        .map_err(|e| IseError::Protocol(format!("unexpected response shape: {}", e)))?;

    let status = response.data.as_ref().and_then(|d| d.status);
    let payload = response
        .data
        .as_ref()
        .and_then(|d| d.data.as_deref())
        .filter(|d| !d.is_empty());

    let (result, result_error) = match payload.map(decode_result) {
        Some(Ok(result)) => (Some(result), None),
        Some(Err(e)) => (None, Some(e)),
        None => (None, None),
    };

    Ok(DecodedResponse {
        terminal: response.code == 0 && status == Some(FINAL_STATUS),
        code: response.code,
        message: response.message,
        sid: response.sid,
        result,
        result_error,
        raw,
    })
}

fn decode_result(encoded: &str) -> Result<EvaluationResult, IseError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| IseError::Protocol(format!("result is not base64: {}", e)))?;
    let xml = String::from_utf8(bytes)
        .map_err(|e| IseError::Protocol(format!("result is not UTF-8: {}", e)))?;
    EvaluationResult::from_xml(&xml)
}
