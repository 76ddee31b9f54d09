//! HTTP request and response types shared by the blocking and async clients.
//!
//! # Design
//! Requests and responses are described as plain data. A resource module
//! builds a `RequestDescriptor`; `Requester` resolves it into an `HttpRequest`
//! (absolute URL, auth header, encoded body) which either executor sends over
//! its own transport. Whatever comes back is reduced to an `HttpResponse` (or
//! a live body for streams) and handed back to `Requester` for parsing, so
//! both execution modes run the exact same decision logic.
//!
//! All fields use owned types so values can move freely between threads and
//! tasks.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::error::CozeError;

/// Response header carrying the server-issued trace identifier.
pub const LOGID_HEADER: &str = "x-tt-logid";

/// HTTP method for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// Body of an outgoing request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RequestBody {
    #[default]
    Empty,
    /// Pre-serialized JSON.
    Json(Vec<u8>),
    /// Opaque bytes with an explicit content type.
    Bytes { content_type: String, data: Vec<u8> },
    /// A file sent as a single multipart/form-data field, streamed from disk.
    File { field: String, path: PathBuf },
}

/// Everything a resource module specifies about one call.
///
/// Built fresh per call with the consuming builder methods below and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    pub method: HttpMethod,
    pub path: String,
    /// Query parameters in insertion order.
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    /// Per-call override of the client's total timeout.
    pub timeout: Option<Duration>,
}

impl RequestDescriptor {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: RequestBody::Empty,
            timeout: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Put, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, CozeError> {
        let bytes = serde_json::to_vec(body).map_err(|e| CozeError::Request(e.to_string()))?;
        self.body = RequestBody::Json(bytes);
        Ok(self)
    }

    pub fn bytes(mut self, content_type: impl Into<String>, data: Vec<u8>) -> Self {
        self.body = RequestBody::Bytes {
            content_type: content_type.into(),
            data,
        };
        self
    }

    pub fn file(mut self, field: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.body = RequestBody::File {
            field: field.into(),
            path: path.into(),
        };
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A fully resolved request, ready for a transport to send.
///
/// `headers` contains the `Authorization` value; never log it.
#[derive(Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    pub timeout: Option<Duration>,
}

impl std::fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl HttpRequest {
    /// The `Content-Type` header implied by the body, if any.
    pub fn content_type(&self) -> Option<String> {
        match &self.body {
            RequestBody::Empty => None,
            RequestBody::Json(_) => Some("application/json".to_string()),
            RequestBody::Bytes { content_type, .. } => Some(content_type.clone()),
            RequestBody::File { .. } => None,
        }
    }
}

/// A buffered HTTP response described as plain data.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn meta(&self) -> ResponseMeta {
        ResponseMeta::new(self.status, self.headers.clone())
    }
}

/// Status, headers and trace identifier of one response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseMeta {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    logid: String,
}

impl ResponseMeta {
    pub fn new(status: u16, headers: Vec<(String, String)>) -> Self {
        let logid = find_header(&headers, LOGID_HEADER).unwrap_or_default().to_string();
        Self {
            status,
            headers,
            logid,
        }
    }

    /// Case-insensitive header lookup; the first match wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// The `x-tt-logid` value, empty when the server sent none.
    pub fn logid(&self) -> &str {
        &self.logid
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// A decoded payload together with the metadata of the response it came from.
#[derive(Debug, Clone)]
pub struct Response<T> {
    pub data: T,
    pub meta: ResponseMeta,
}

impl<T> Response<T> {
    pub fn logid(&self) -> &str {
        self.meta.logid()
    }

    pub fn into_data(self) -> T {
        self.data
    }
}

/// Framing for a single-file multipart/form-data upload.
///
/// The file content goes between `head` and `tail`, letting the transports
/// stream it from disk instead of assembling the whole body in memory.
pub(crate) struct Multipart {
    boundary: String,
    pub head: Vec<u8>,
    pub tail: Vec<u8>,
}

impl Multipart {
    pub fn new(field: &str, path: &std::path::Path) -> Self {
        let boundary = format!("coze-{}", uuid::Uuid::new_v4().simple());
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().replace('"', "%22"))
            .unwrap_or_else(|| "file".to_string());
        let head = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        let tail = format!("\r\n--{boundary}--\r\n").into_bytes();
        Self {
            boundary,
            head,
            tail,
        }
    }

    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }
}
