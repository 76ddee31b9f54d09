//! Maps raw error responses onto the typed error taxonomy.
//!
//! # Design
//! Classification never fails: whatever the body looks like, the caller gets
//! *some* `CozeError` back and decides to raise it. The Coze API reports
//! errors as `{"code": .., "msg": ..}`; the OAuth endpoints use
//! `{"error_code": .., "error_message": ..}`. Anything else falls back to the
//! raw body text with the HTTP status as the code.

use serde::Deserialize;

use crate::error::{ApiError, CozeError, OAuthError, OAuthErrorCode};

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    msg: Option<String>,
    /// A string for OAuth endpoints, a number inside workflow error frames.
    #[serde(default)]
    error_code: Option<serde_json::Value>,
    #[serde(default)]
    error_message: Option<String>,
}

/// Turn a failed response into an error value.
pub fn classify(status: u16, body: &[u8], logid: &str) -> CozeError {
    let parsed = serde_json::from_slice::<ErrorBody>(body)
        .ok()
        .filter(|b| b.code.is_some() || b.msg.is_some() || b.error_code.is_some());

    let Some(parsed) = parsed else {
        return ApiError {
            code: Some(i64::from(status)),
            msg: String::from_utf8_lossy(body).into_owned(),
            status,
            logid: logid.to_string(),
        }
        .into();
    };

    match parsed.error_code {
        Some(serde_json::Value::String(error_code)) => {
            let message = parsed.error_message.or(parsed.msg).unwrap_or_default();
            if let Some(code) = OAuthErrorCode::parse(&error_code) {
                return OAuthError {
                    code,
                    message,
                    status,
                    logid: logid.to_string(),
                }
                .into();
            }
            let msg = if message.is_empty() {
                error_code
            } else {
                format!("{error_code}: {message}")
            };
            return ApiError {
                code: parsed.code,
                msg,
                status,
                logid: logid.to_string(),
            }
            .into();
        }
        Some(serde_json::Value::Number(n)) => {
            return ApiError {
                code: n.as_i64(),
                msg: parsed.error_message.or(parsed.msg).unwrap_or_default(),
                status,
                logid: logid.to_string(),
            }
            .into();
        }
        _ => {}
    }

    ApiError {
        code: parsed.code,
        msg: parsed.msg.unwrap_or_default(),
        status,
        logid: logid.to_string(),
    }
    .into()
}
