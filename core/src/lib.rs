//! Request, streaming and pagination core of the Coze API client.
//!
//! # Overview
//! Resource modules describe a call as a [`RequestDescriptor`]; a client
//! sends it and hands back a typed result, an event stream or a lazy
//! paginated listing. Every result carries the server's `x-tt-logid` trace
//! identifier, and every failure is a [`CozeError`].
//!
//! # Design
//! - [`Requester`] builds `HttpRequest` values and parses `HttpResponse`
//!   values without touching the network. [`CozeClient`] (ureq) and
//!   [`AsyncCozeClient`] (reqwest) only move bytes, so both modes share the
//!   same status handling, envelope checks and error classification.
//! - The event decoder frames `text/event-stream` bodies into typed events
//!   and ends on the event type's terminator; a connection that closes
//!   earlier is an error, never a silent end.
//! - The pagination engine owns the page state; resource modules only
//!   supply a page-fetch function.
//! - Credentials are asked for right before each send, so a refreshed token
//!   is picked up by the very next call.

pub mod async_client;
pub mod auth;
pub mod chat;
pub mod classify;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod logging;
pub mod oauth;
pub mod pagination;
pub mod stream;
pub mod sync_client;
pub mod workflow;

pub use async_client::AsyncCozeClient;
pub use auth::{AsyncAuth, AsyncCachedAuth, AsyncTokenSource, Auth, CachedAuth, Credential, TokenAuth, TokenSource};
pub use chat::ChatEvent;
pub use client::{decode_data, decode_json, Requester};
pub use config::{ClientConfig, Region};
pub use error::{ApiError, CozeError, OAuthError, OAuthErrorCode, StreamError, TransportKind};
pub use http::{HttpMethod, HttpRequest, HttpResponse, RequestBody, RequestDescriptor, Response, ResponseMeta};
pub use pagination::{AsyncPaged, Page, PageState, Paged};
pub use stream::{AsyncEventStream, EventStream, Frame, StreamEvent};
pub use sync_client::{BlockingEventStream, CozeClient};
pub use workflow::WorkflowEvent;
