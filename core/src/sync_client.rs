//! Blocking client: executes requests built by [`Requester`] with `ureq`.

use std::io::{BufReader, Cursor, Read};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::debug;
use ureq::typestate::WithBody;
use ureq::{Agent, Body, BodyReader, RequestBuilder};

use crate::auth::Auth;
use crate::client::{decode_data, is_buffered_reply, Requester};
use crate::config::ClientConfig;
use crate::error::CozeError;
use crate::http::{HttpMethod, HttpRequest, HttpResponse, Multipart, RequestBody, RequestDescriptor, Response, ResponseMeta};
use crate::pagination::{Page, PageData, PageState, Paged};
use crate::stream::{EventStream, StreamEvent};

/// Event stream over a live `ureq` response body.
pub type BlockingEventStream<E> = EventStream<E, BufReader<BodyReader<'static>>>;

type RawResponse = ureq::http::Response<Body>;

/// Blocking Coze API client.
///
/// Cheap to clone; clones share the connection pool and credential provider.
#[derive(Clone)]
pub struct CozeClient {
    requester: Requester,
    agent: Agent,
    auth: Option<Arc<dyn Auth>>,
}

impl CozeClient {
    pub fn new(config: &ClientConfig, auth: impl Auth + 'static) -> Self {
        Self::with_agent(config, Some(Arc::new(auth)), default_agent(config))
    }

    /// A client that sends no `Authorization` header, for the OAuth endpoints.
    pub fn anonymous(config: &ClientConfig) -> Self {
        Self::with_agent(config, None, default_agent(config))
    }

    /// Use a caller-built agent.
    ///
    /// The agent must not treat 4xx/5xx statuses as errors, otherwise the
    /// server's error body is lost before it can be classified.
    pub fn with_agent(config: &ClientConfig, auth: Option<Arc<dyn Auth>>, agent: Agent) -> Self {
        Self {
            requester: Requester::new(config),
            agent,
            auth,
        }
    }

    pub fn requester(&self) -> &Requester {
        &self.requester
    }

    /// Send `desc` and decode the buffered body with `decode`.
    pub fn execute<T, D>(&self, desc: &RequestDescriptor, decode: D) -> Result<Response<T>, CozeError>
    where
        D: FnOnce(&[u8], &ResponseMeta) -> Result<T, CozeError>,
    {
        let mut response = self.send(desc)?;
        let meta = response_meta(&response);
        let body = response.body_mut().read_to_vec()?;
        debug!(
            method = desc.method.as_str(),
            path = %desc.path,
            status = meta.status,
            logid = meta.logid(),
            "response received"
        );
        self.requester.parse(
            HttpResponse {
                status: meta.status,
                headers: meta.headers,
                body,
            },
            decode,
        )
    }

    /// Send `desc` and decode the `data` field of the standard envelope.
    pub fn get_data<T: DeserializeOwned>(&self, desc: &RequestDescriptor) -> Result<Response<T>, CozeError> {
        self.execute(desc, decode_data::<T>)
    }

    /// Open an event stream.
    ///
    /// Errors that arrive as a buffered JSON answer are raised here, before
    /// any event is read.
    pub fn stream<E: StreamEvent>(&self, desc: &RequestDescriptor) -> Result<BlockingEventStream<E>, CozeError> {
        let mut response = self.send(desc)?;
        let meta = response_meta(&response);
        debug!(
            method = desc.method.as_str(),
            path = %desc.path,
            status = meta.status,
            logid = meta.logid(),
            "stream opened"
        );
        if is_buffered_reply(&meta) {
            let body = response.body_mut().read_to_vec()?;
            return Err(self.requester.reject_stream(HttpResponse {
                status: meta.status,
                headers: meta.headers,
                body,
            }));
        }
        let reader = BufReader::new(response.into_body().into_reader());
        Ok(EventStream::new(reader, meta))
    }

    /// Fetch one page of a list endpoint whose `data` is a [`PageData`].
    pub fn fetch_page<T: DeserializeOwned>(&self, desc: &RequestDescriptor, state: &PageState) -> Result<Page<T>, CozeError> {
        let response = self.get_data::<PageData<T>>(&state.apply(desc.clone()))?;
        Ok(response.data.into_page(response.meta))
    }

    /// Lazily list every item behind `desc`, starting at `initial`.
    pub fn list<T: DeserializeOwned>(
        &self,
        desc: RequestDescriptor,
        initial: PageState,
    ) -> Paged<T, impl FnMut(&PageState) -> Result<Page<T>, CozeError> + '_> {
        Paged::new(initial, move |state: &PageState| self.fetch_page(&desc, state))
    }

    fn send(&self, desc: &RequestDescriptor) -> Result<RawResponse, CozeError> {
        let request = match &self.auth {
            Some(auth) => {
                let token = auth.token()?;
                self.requester.build(desc, Some((auth.token_type(), token.as_str())))
            }
            None => self.requester.build(desc, None),
        };
        self.dispatch(request)
    }

    fn dispatch(&self, request: HttpRequest) -> Result<RawResponse, CozeError> {
        let HttpRequest {
            method,
            url,
            headers,
            body,
            timeout,
        } = request;

        let response = match method {
            HttpMethod::Get => prepare(self.agent.get(&url), &headers, timeout).call()?,
            HttpMethod::Delete => prepare(self.agent.delete(&url), &headers, timeout).call()?,
            HttpMethod::Post => send_body(prepare(self.agent.post(&url), &headers, timeout), body)?,
            HttpMethod::Put => send_body(prepare(self.agent.put(&url), &headers, timeout), body)?,
            HttpMethod::Patch => send_body(prepare(self.agent.patch(&url), &headers, timeout), body)?,
        };
        Ok(response)
    }
}

impl std::fmt::Debug for CozeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CozeClient")
            .field("base_url", &self.requester.base_url())
            .field("authenticated", &self.auth.is_some())
            .finish_non_exhaustive()
    }
}

/// Agent with the configured timeouts that hands 4xx/5xx back as responses.
fn default_agent(config: &ClientConfig) -> Agent {
    Agent::config_builder()
        .http_status_as_error(false)
        .timeout_connect(Some(config.get_connect_timeout()))
        .timeout_global(Some(config.get_timeout()))
        .build()
        .new_agent()
}

fn prepare<B>(mut builder: RequestBuilder<B>, headers: &[(String, String)], timeout: Option<Duration>) -> RequestBuilder<B> {
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    match timeout {
        Some(timeout) => builder.config().timeout_global(Some(timeout)).build(),
        None => builder,
    }
}

fn send_body(builder: RequestBuilder<WithBody>, body: RequestBody) -> Result<RawResponse, CozeError> {
    let response = match body {
        RequestBody::Empty => builder.send_empty()?,
        RequestBody::Json(data) | RequestBody::Bytes { data, .. } => builder.send(&data[..])?,
        RequestBody::File { field, path } => {
            let multipart = Multipart::new(&field, &path);
            let file = std::fs::File::open(&path)
                .map_err(|e| CozeError::Request(format!("cannot open {}: {e}", path.display())))?;
            let mut reader = Cursor::new(multipart.head.clone())
                .chain(file)
                .chain(Cursor::new(multipart.tail.clone()));
            builder
                .content_type(multipart.content_type())
                .send(ureq::SendBody::from_reader(&mut reader))?
        }
    };
    Ok(response)
}

fn response_meta(response: &RawResponse) -> ResponseMeta {
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
        .collect();
    ResponseMeta::new(response.status().as_u16(), headers)
}
