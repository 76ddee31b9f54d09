//! Async client: executes requests built by [`Requester`] with `reqwest`.
//!
//! Behaves exactly like [`crate::CozeClient`]; only the transport and the
//! credential provider trait differ.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{stream, FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::auth::AsyncAuth;
use crate::client::{decode_data, is_buffered_reply, Requester};
use crate::config::ClientConfig;
use crate::error::CozeError;
use crate::http::{HttpMethod, HttpRequest, HttpResponse, Multipart, RequestBody, RequestDescriptor, Response, ResponseMeta};
use crate::pagination::{AsyncPaged, Page, PageData, PageState};
use crate::stream::{AsyncEventStream, StreamEvent};

type PageFuture<T> = BoxFuture<'static, Result<Page<T>, CozeError>>;

/// Async Coze API client.
#[derive(Clone)]
pub struct AsyncCozeClient {
    requester: Requester,
    client: reqwest::Client,
    auth: Option<Arc<dyn AsyncAuth>>,
}

impl AsyncCozeClient {
    pub fn new(config: &ClientConfig, auth: impl AsyncAuth + 'static) -> Result<Self, CozeError> {
        Ok(Self::with_client(config, Some(Arc::new(auth)), default_client(config)?))
    }

    pub fn anonymous(config: &ClientConfig) -> Result<Self, CozeError> {
        Ok(Self::with_client(config, None, default_client(config)?))
    }

    /// Use a caller-built `reqwest::Client`; its own timeouts apply.
    pub fn with_client(config: &ClientConfig, auth: Option<Arc<dyn AsyncAuth>>, client: reqwest::Client) -> Self {
        Self {
            requester: Requester::new(config),
            client,
            auth,
        }
    }

    pub fn requester(&self) -> &Requester {
        &self.requester
    }

    pub async fn execute<T, D>(&self, desc: &RequestDescriptor, decode: D) -> Result<Response<T>, CozeError>
    where
        D: FnOnce(&[u8], &ResponseMeta) -> Result<T, CozeError>,
    {
        let response = self.send(desc).await?;
        let meta = response_meta(&response);
        let body = response.bytes().await?;
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
                body: body.to_vec(),
            },
            decode,
        )
    }

    pub async fn get_data<T: DeserializeOwned>(&self, desc: &RequestDescriptor) -> Result<Response<T>, CozeError> {
        self.execute(desc, decode_data::<T>).await
    }

    /// Open an event stream; buffered error answers are raised here.
    pub async fn stream<E>(&self, desc: &RequestDescriptor) -> Result<AsyncEventStream<E>, CozeError>
    where
        E: StreamEvent + Send + 'static,
    {
        let response = self.send(desc).await?;
        let meta = response_meta(&response);
        debug!(
            method = desc.method.as_str(),
            path = %desc.path,
            status = meta.status,
            logid = meta.logid(),
            "stream opened"
        );
        if is_buffered_reply(&meta) {
            let body = response.bytes().await?;
            return Err(self.requester.reject_stream(HttpResponse {
                status: meta.status,
                headers: meta.headers,
                body: body.to_vec(),
            }));
        }
        Ok(AsyncEventStream::new(response.bytes_stream(), meta))
    }

    pub async fn fetch_page<T: DeserializeOwned>(&self, desc: &RequestDescriptor, state: &PageState) -> Result<Page<T>, CozeError> {
        let response = self.get_data::<PageData<T>>(&state.apply(desc.clone())).await?;
        Ok(response.data.into_page(response.meta))
    }

    /// Lazily list every item behind `desc`, starting at `initial`.
    pub fn list<T>(
        &self,
        desc: RequestDescriptor,
        initial: PageState,
    ) -> AsyncPaged<T, impl FnMut(PageState) -> PageFuture<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let client = self.clone();
        AsyncPaged::new(initial, move |state: PageState| {
            let client = client.clone();
            let desc = desc.clone();
            async move { client.fetch_page(&desc, &state).await }.boxed()
        })
    }

    async fn send(&self, desc: &RequestDescriptor) -> Result<reqwest::Response, CozeError> {
        let request = match &self.auth {
            Some(auth) => {
                let token = auth.token().await?;
                self.requester.build(desc, Some((auth.token_type(), token.as_str())))
            }
            None => self.requester.build(desc, None),
        };
        self.dispatch(request).await
    }

    async fn dispatch(&self, request: HttpRequest) -> Result<reqwest::Response, CozeError> {
        let HttpRequest {
            method,
            url,
            headers,
            body,
            timeout,
        } = request;

        let mut builder = self.client.request(to_reqwest_method(method), &url);
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        builder = match body {
            RequestBody::Empty => builder,
            RequestBody::Json(data) | RequestBody::Bytes { data, .. } => builder.body(data),
            RequestBody::File { field, path } => {
                let multipart = Multipart::new(&field, &path);
                let file = tokio::fs::File::open(&path)
                    .await
                    .map_err(|e| CozeError::Request(format!("cannot open {}: {e}", path.display())))?;
                let content_type = multipart.content_type();
                let head = Bytes::from(multipart.head);
                let tail = Bytes::from(multipart.tail);
                let body = stream::once(async move { Ok::<_, std::io::Error>(head) })
                    .chain(ReaderStream::new(file))
                    .chain(stream::once(async move { Ok(tail) }));
                builder
                    .header("Content-Type", content_type)
                    .body(reqwest::Body::wrap_stream(body))
            }
        };
        Ok(builder.send().await?)
    }
}

impl std::fmt::Debug for AsyncCozeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncCozeClient")
            .field("base_url", &self.requester.base_url())
            .field("authenticated", &self.auth.is_some())
            .finish_non_exhaustive()
    }
}

fn default_client(config: &ClientConfig) -> Result<reqwest::Client, CozeError> {
    Ok(reqwest::Client::builder()
        .connect_timeout(config.get_connect_timeout())
        .timeout(config.get_timeout())
        .build()?)
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

fn response_meta(response: &reqwest::Response) -> ResponseMeta {
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
        .collect();
    ResponseMeta::new(response.status().as_u16(), headers)
}
