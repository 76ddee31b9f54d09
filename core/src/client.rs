//! Transport-independent request building and response parsing.
//!
//! # Design
//! `Requester` holds only the base URL and user agent and carries no mutable
//! state between calls. Every call is split into `build` (descriptor + token
//! → `HttpRequest`) and `parse` (`HttpResponse` → typed result or error).
//! The blocking and async clients only move bytes between these two halves,
//! which keeps status handling, envelope checks and error classification in
//! one deterministic place.

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::classify::classify;
use crate::config::ClientConfig;
use crate::error::{ApiError, CozeError, StreamError};
use crate::http::{HttpRequest, HttpResponse, RequestDescriptor, Response, ResponseMeta};

/// Stateless request builder and response parser.
#[derive(Debug, Clone)]
pub struct Requester {
    base_url: String,
    user_agent: String,
}

impl Requester {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            base_url: config.get_base_url().to_string(),
            user_agent: config.get_user_agent().to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Resolve a descriptor into a sendable request.
    ///
    /// `auth` is `(token_type, token)`; `None` sends no `Authorization`
    /// header, as the OAuth endpoints expect.
    pub fn build(&self, desc: &RequestDescriptor, auth: Option<(&str, &str)>) -> HttpRequest {
        let mut headers = Vec::with_capacity(desc.headers.len() + 3);
        headers.push(("User-Agent".to_string(), self.user_agent.clone()));
        if let Some((token_type, token)) = auth {
            headers.push(("Authorization".to_string(), format!("{token_type} {token}")));
        }

        let mut request = HttpRequest {
            method: desc.method,
            url: self.url(desc),
            headers,
            body: desc.body.clone(),
            timeout: desc.timeout,
        };
        if let Some(content_type) = request.content_type() {
            request.headers.push(("Content-Type".to_string(), content_type));
        }
        request.headers.extend(desc.headers.iter().cloned());
        request
    }

    fn url(&self, desc: &RequestDescriptor) -> String {
        let mut url = if desc.path.starts_with("http://") || desc.path.starts_with("https://") {
            desc.path.clone()
        } else {
            format!("{}{}", self.base_url, desc.path)
        };
        if !desc.query.is_empty() {
            let query = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(desc.query.iter())
                .finish();
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(&query);
        }
        url
    }

    /// Check the status and decode the body of a buffered response.
    pub fn parse<T, D>(&self, response: HttpResponse, decode: D) -> Result<Response<T>, CozeError>
    where
        D: FnOnce(&[u8], &ResponseMeta) -> Result<T, CozeError>,
    {
        let meta = response.meta();
        check_status(&response, &meta)?;
        let data = decode(&response.body, &meta)?;
        Ok(Response { data, meta })
    }

    /// Error for a stream call that got a buffered answer instead of events.
    ///
    /// A successful envelope (`code: 0`) is not an error the server meant to
    /// report; it surfaces as an invalid event carrying the raw body.
    pub fn reject_stream(&self, response: HttpResponse) -> CozeError {
        let meta = response.meta();
        match check_status(&response, &meta) {
            Err(e) => e,
            Ok(()) => match classify(response.status, &response.body, meta.logid()) {
                CozeError::Api(e) if e.code == Some(0) => StreamError::InvalidEvent {
                    field: String::new(),
                    data: String::from_utf8_lossy(&response.body).into_owned(),
                    logid: e.logid,
                }
                .into(),
                err => err,
            },
        }
    }
}

fn check_status(response: &HttpResponse, meta: &ResponseMeta) -> Result<(), CozeError> {
    if (200..300).contains(&response.status) {
        return Ok(());
    }
    Err(classify(response.status, &response.body, meta.logid()))
}

/// True when a streaming call received something other than an event stream.
pub(crate) fn is_buffered_reply(meta: &ResponseMeta) -> bool {
    !(200..300).contains(&meta.status)
        || meta
            .header("content-type")
            .is_some_and(|ct| ct.trim_start().starts_with("application/json"))
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Decode the `data` field of the standard `{"code", "msg", "data"}` envelope.
///
/// A non-zero `code` is a business failure even on a 2xx status.
pub fn decode_data<T: DeserializeOwned>(body: &[u8], meta: &ResponseMeta) -> Result<T, CozeError> {
    let envelope: Envelope = serde_json::from_slice(body).map_err(|e| CozeError::decode(e, meta.logid()))?;
    if envelope.code != 0 {
        return Err(ApiError {
            code: Some(envelope.code),
            msg: envelope.msg,
            status: meta.status,
            logid: meta.logid().to_string(),
        }
        .into());
    }
    serde_json::from_value(envelope.data).map_err(|e| CozeError::decode(e, meta.logid()))
}

/// Decode the whole body as `T`, for endpoints without the envelope.
pub fn decode_json<T: DeserializeOwned>(body: &[u8], meta: &ResponseMeta) -> Result<T, CozeError> {
    serde_json::from_slice(body).map_err(|e| CozeError::decode(e, meta.logid()))
}
