//! Document-backed fetchers and page rendering.

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use thiserror::Error;
use time::{OffsetDateTime, UtcOffset, format_description::FormatItem, macros::format_description};
use tracing::error;

use crate::application::content::{
    Content, ContentSink, FetchError, Fetcher, PathParams, RenderableContent, RequestContext,
};
use crate::application::repos::{CreatedOrder, DocumentQuery, DocumentStore, StoreError};
use crate::domain::entities::{DocumentKey, DocumentRecord, SiteKey};

const SOURCE: &str = "application::page";

/// Path parameter naming the requested document.
pub const PAGE_PARAM: &str = "page";

const NOT_FOUND_NAME: &str = "notfound";
const NOT_FOUND_TITLE: &str = "Error 404";
const NOT_FOUND_CONTENTS: &str = "#### That URL makes no sense to me\n\n###### Sorry\n\n\
You might want to click one of the menu items above, or check the URL and try again.";

const HTTP_DATE_FORMAT: &[FormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

#[derive(Debug, Error)]
#[error("template execution failed: {0}")]
pub struct TemplateError(pub String);

/// Site page template. Markdown conversion and HTML layout live behind it.
pub trait PageTemplate: Send + Sync {
    fn execute(&self, page: &DocumentRecord) -> Result<String, TemplateError>;

    /// When the template itself last changed; bounds `Last-Modified`.
    fn modified(&self) -> OffsetDateTime;
}

/// A document bound to the site template, rendered at most once.
pub struct PageContent {
    page: DocumentRecord,
    template: Arc<dyn PageTemplate>,
    not_found: bool,
    html: OnceCell<String>,
}

impl PageContent {
    pub fn new(page: DocumentRecord, template: Arc<dyn PageTemplate>) -> Self {
        Self {
            page,
            template,
            not_found: false,
            html: OnceCell::new(),
        }
    }

    /// The fixed "Error 404" page served in place of failed fetches.
    pub fn not_found(site: &SiteKey, template: Arc<dyn PageTemplate>) -> Self {
        let mut page = DocumentRecord::draft(
            DocumentKey::new(site, NOT_FOUND_NAME),
            NOT_FOUND_TITLE,
            OffsetDateTime::UNIX_EPOCH,
        );
        page.contents = NOT_FOUND_CONTENTS.to_string();
        Self {
            page,
            template,
            not_found: true,
            html: OnceCell::new(),
        }
    }

    pub fn page(&self) -> &DocumentRecord {
        &self.page
    }

    fn html(&self) -> &str {
        self.html.get_or_init(|| {
            self.template.execute(&self.page).unwrap_or_else(|err| {
                error!(target: SOURCE, key = %self.page.key, error = %err, "Couldn't execute page template");
                String::new()
            })
        })
    }

    fn last_modified(&self) -> OffsetDateTime {
        self.page.last_modified.max(self.template.modified())
    }
}

impl RenderableContent for PageContent {
    fn render(&self, request: &RequestContext, sink: &mut dyn ContentSink) {
        let html = self.html();
        if html.is_empty() {
            sink.set_status(500);
            sink.set_header("Content-Type", "text/plain; charset=utf-8".to_string());
            sink.write_body(b"internal server error\n");
            return;
        }

        if self.not_found {
            sink.set_status(404);
            sink.set_header("Content-Type", "text/html".to_string());
            sink.set_header("Content-Length", html.len().to_string());
            sink.write_body(html.as_bytes());
            return;
        }

        // HTTP dates carry whole seconds only.
        let modified = self.last_modified();
        let modified = modified.replace_nanosecond(0).unwrap_or(modified);
        if request
            .if_modified_since
            .is_some_and(|since| modified <= since)
        {
            sink.set_status(304);
            return;
        }

        sink.set_status(200);
        sink.set_header("Content-Type", "text/html; charset=utf-8".to_string());
        if let Ok(value) = modified.to_offset(UtcOffset::UTC).format(HTTP_DATE_FORMAT) {
            sink.set_header("Last-Modified", value);
        }
        sink.set_header("Content-Length", html.len().to_string());
        sink.write_body(html.as_bytes());
    }
}

/// Everything the document fetchers need: the store, the site scope and the template.
#[derive(Clone)]
pub struct DocumentSource {
    store: Arc<dyn DocumentStore>,
    site: SiteKey,
    template: Arc<dyn PageTemplate>,
}

impl DocumentSource {
    pub fn new(store: Arc<dyn DocumentStore>, site: SiteKey, template: Arc<dyn PageTemplate>) -> Self {
        Self {
            store,
            site,
            template,
        }
    }

    pub fn site(&self) -> &SiteKey {
        &self.site
    }

    /// Sentinel content for the content cache.
    pub fn not_found_content(&self) -> Content {
        Arc::new(PageContent::not_found(&self.site, Arc::clone(&self.template)))
    }

    pub fn fetcher(&self, kind: DocumentFetch) -> DocumentFetcher {
        DocumentFetcher {
            source: self.clone(),
            kind,
        }
    }

    /// A published document named by the `page` path parameter.
    pub async fn fetch_page(&self, params: &PathParams) -> Result<Content, FetchError> {
        let doc = self.load(params).await?;
        if !doc.published {
            return Err(FetchError::NotPublished {
                key: doc.key.name,
            });
        }
        Ok(self.wrap(doc))
    }

    /// Like [`Self::fetch_page`] but serves unpublished documents too.
    pub async fn fetch_draft_page(&self, params: &PathParams) -> Result<Content, FetchError> {
        let doc = self.load(params).await?;
        Ok(self.wrap(doc))
    }

    /// The newest published chain member.
    pub async fn fetch_latest(&self) -> Result<Content, FetchError> {
        let doc = self.latest().await?;
        Ok(self.wrap(doc))
    }

    /// Key of the newest published chain member, for redirect-to-latest.
    pub async fn latest_key(&self) -> Result<DocumentKey, FetchError> {
        self.latest().await.map(|doc| doc.key)
    }

    async fn latest(&self) -> Result<DocumentRecord, FetchError> {
        let query = DocumentQuery::chain_members(&self.site)
            .order(CreatedOrder::Descending)
            .limit(1);
        self.store
            .query(&query)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| FetchError::not_found("latest post"))
    }

    async fn load(&self, params: &PathParams) -> Result<DocumentRecord, FetchError> {
        let name = params
            .get(PAGE_PARAM)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| FetchError::not_found("page parameter"))?;

        let key = DocumentKey::new(&self.site, name);
        match self.store.get(&key).await {
            Ok(doc) => Ok(doc),
            Err(StoreError::NotFound) => Err(FetchError::not_found(format!("page `{name}`"))),
            Err(err) => Err(err.into()),
        }
    }

    fn wrap(&self, doc: DocumentRecord) -> Content {
        Arc::new(PageContent::new(doc, Arc::clone(&self.template)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFetch {
    Page,
    DraftPage,
    Latest,
}

/// [`Fetcher`] over a [`DocumentSource`].
#[derive(Clone)]
pub struct DocumentFetcher {
    source: DocumentSource,
    kind: DocumentFetch,
}

#[async_trait]
impl Fetcher for DocumentFetcher {
    async fn fetch(&self, _key: &str, params: &PathParams) -> Result<Content, FetchError> {
        match self.kind {
            DocumentFetch::Page => self.source.fetch_page(params).await,
            DocumentFetch::DraftPage => self.source.fetch_draft_page(params).await,
            DocumentFetch::Latest => self.source.fetch_latest().await,
        }
    }
}
