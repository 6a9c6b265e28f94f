//! Renderable content and the fetchers that produce it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use time::OffsetDateTime;

use crate::application::repos::StoreError;

/// Named segments extracted from the request path by the routing layer.
pub type PathParams = HashMap<String, String>;

/// Shared handle to rendered-or-renderable content; cached entries hold one.
pub type Content = Arc<dyn RenderableContent>;

/// The parts of an inbound request that rendering may look at.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub path: String,
    pub if_modified_since: Option<OffsetDateTime>,
}

impl RequestContext {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            if_modified_since: None,
        }
    }

    pub fn with_if_modified_since(mut self, at: OffsetDateTime) -> Self {
        self.if_modified_since = Some(at);
        self
    }
}

/// Output side of a render: status, headers, then body bytes.
pub trait ContentSink {
    fn set_status(&mut self, status: u16);
    fn set_header(&mut self, name: &str, value: String);
    fn write_body(&mut self, chunk: &[u8]);
}

/// Something that can render itself for a request. Real pages and the
/// not-found sentinel are used the same way.
pub trait RenderableContent: Send + Sync {
    fn render(&self, request: &RequestContext, sink: &mut dyn ContentSink);
}

/// In-memory sink, used by tests and by callers that buffer before replying.
#[derive(Debug, Clone)]
pub struct BufferedSink {
    status: u16,
    headers: Vec<(String, String)>,
    body: BytesMut,
}

impl Default for BufferedSink {
    fn default() -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: BytesMut::new(),
        }
    }
}

impl BufferedSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn body(&self) -> Bytes {
        self.body.clone().freeze()
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl ContentSink for BufferedSink {
    fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    fn set_header(&mut self, name: &str, value: String) {
        match self
            .headers
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            Some(existing) => existing.1 = value,
            None => self.headers.push((name.to_string(), value)),
        }
    }

    fn write_body(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }
}

/// Render `content` into a fresh [`BufferedSink`].
pub fn render_to_buffer(content: &dyn RenderableContent, request: &RequestContext) -> BufferedSink {
    let mut sink = BufferedSink::new();
    content.render(request, &mut sink);
    sink
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch timed out after {after:?}")]
    Timeout { after: Duration },
    #[error("fetch failed: {message}")]
    Failed { message: String },
    #[error("{what} not found")]
    NotFound { what: String },
    #[error("`{key}` is not published")]
    NotPublished { key: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl FetchError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Metric label distinguishing timeouts from every other failure.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            _ => "failed",
        }
    }
}

/// Produces content for a cache key. One implementation per resource type.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, key: &str, params: &PathParams) -> Result<Content, FetchError>;
}

/// Adapts an async closure taking owned arguments into a [`Fetcher`].
pub struct FnFetcher<F>(F);

pub fn fetcher_fn<F, Fut>(f: F) -> FnFetcher<F>
where
    F: Fn(String, PathParams) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Content, FetchError>> + Send,
{
    FnFetcher(f)
}

#[async_trait]
impl<F, Fut> Fetcher for FnFetcher<F>
where
    F: Fn(String, PathParams) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Content, FetchError>> + Send,
{
    async fn fetch(&self, key: &str, params: &PathParams) -> Result<Content, FetchError> {
        (self.0)(key.to_string(), params.clone()).await
    }
}

/// Fixed body served as-is; handy for feeds rendered elsewhere and for tests.
#[derive(Debug, Clone)]
pub struct StaticContent {
    status: u16,
    content_type: &'static str,
    body: Bytes,
}

impl StaticContent {
    pub fn new(status: u16, content_type: &'static str, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            content_type,
            body: body.into(),
        }
    }

    pub fn html(body: impl Into<Bytes>) -> Self {
        Self::new(200, "text/html; charset=utf-8", body)
    }
}

impl RenderableContent for StaticContent {
    fn render(&self, _request: &RequestContext, sink: &mut dyn ContentSink) {
        sink.set_status(self.status);
        sink.set_header("Content-Type", self.content_type.to_string());
        sink.set_header("Content-Length", self.body.len().to_string());
        sink.write_body(&self.body);
    }
}
