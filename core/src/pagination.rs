//! Lazy page-by-page listing over a caller-supplied fetch function.
//!
//! # Design
//! Resource modules supply `fetch_page(state) -> Page<T>`; the engine owns
//! the pagination state and is the only thing that advances it. Three views
//! sit on top of the same fetch contract:
//!
//! - manual access: [`Paged::get_page`] and [`Paged::next_page`]
//! - page iteration: [`Paged::pages`]
//! - flat item iteration: [`Paged::items`]
//!
//! [`AsyncPaged`] offers the same views as `futures::Stream`s. Both variants
//! decide when to stop through [`PageState::advance`], so they fetch exactly
//! the same pages in the same order. Pages are passed through as the server
//! returned them; nothing is reordered or deduplicated.

use std::future::Future;

use futures::Stream;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::CozeError;
use crate::http::{RequestDescriptor, ResponseMeta};

/// Where the next page starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageState {
    /// Numbered pages; `page_num` starts at whatever the caller chose.
    Number { page_num: u32, page_size: u32 },
    /// Opaque server cursor; `None` requests the first page.
    Cursor { token: Option<String>, page_size: u32 },
}

impl PageState {
    /// Numbered pagination starting at page 1.
    pub fn number(page_size: u32) -> Self {
        Self::starting_at(1, page_size)
    }

    pub fn starting_at(page_num: u32, page_size: u32) -> Self {
        PageState::Number { page_num, page_size }
    }

    pub fn cursor(page_size: u32) -> Self {
        PageState::Cursor {
            token: None,
            page_size,
        }
    }

    pub fn page_size(&self) -> u32 {
        match self {
            PageState::Number { page_size, .. } | PageState::Cursor { page_size, .. } => *page_size,
        }
    }

    /// Add this state's query parameters to a list request.
    ///
    /// `page_size` is forwarded as-is; the server validates it.
    pub fn apply(&self, desc: RequestDescriptor) -> RequestDescriptor {
        match self {
            PageState::Number { page_num, page_size } => {
                desc.query("page_num", page_num).query("page_size", page_size)
            }
            PageState::Cursor { token, page_size } => {
                let desc = match token {
                    Some(token) => desc.query("page_token", token),
                    None => desc,
                };
                desc.query("page_size", page_size)
            }
        }
    }

    /// State for the page after `page`, or `None` when the listing is over.
    pub fn advance<T>(&self, page: &Page<T>) -> Option<PageState> {
        if !page.has_more || page.items.is_empty() {
            return None;
        }
        match self {
            PageState::Number { page_num, page_size } => match page_num.checked_add(1) {
                Some(page_num) => Some(PageState::Number {
                    page_num,
                    page_size: *page_size,
                }),
                None => {
                    warn!("page number overflows; stopping");
                    None
                }
            },
            PageState::Cursor { page_size, .. } => match &page.next_cursor {
                Some(token) if !token.is_empty() => Some(PageState::Cursor {
                    token: Some(token.clone()),
                    page_size: *page_size,
                }),
                _ => {
                    warn!("page reports has_more without a next cursor; stopping");
                    None
                }
            },
        }
    }
}

/// One page of a listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub has_more: bool,
    /// Total item count, when the server reports it.
    pub total: Option<u64>,
    /// Cursor for the next page, for cursor-paged listings.
    pub next_cursor: Option<String>,
    pub meta: ResponseMeta,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, has_more: bool) -> Self {
        Self {
            items,
            has_more,
            total: None,
            next_cursor: None,
            meta: ResponseMeta::default(),
        }
    }

    pub fn with_total(mut self, total: u64) -> Self {
        self.total = Some(total);
        self
    }

    pub fn with_next_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.next_cursor = Some(cursor.into());
        self
    }

    pub fn with_meta(mut self, meta: ResponseMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn logid(&self) -> &str {
        self.meta.logid()
    }
}

/// The common `data` shape of list endpoints.
#[derive(Debug, Deserialize)]
pub struct PageData<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

impl<T> PageData<T> {
    pub fn into_page(self, meta: ResponseMeta) -> Page<T> {
        Page {
            items: self.items,
            has_more: self.has_more,
            total: self.total,
            next_cursor: self.next_page_token,
            meta,
        }
    }
}

// ---------------------------------------------------------------------------
// Blocking
// ---------------------------------------------------------------------------

/// Blocking listing driven by `fetch`.
pub struct Paged<T, F> {
    fetch: F,
    next: Option<PageState>,
    fetches: usize,
    _item: std::marker::PhantomData<fn() -> T>,
}

impl<T, F> Paged<T, F>
where
    F: FnMut(&PageState) -> Result<Page<T>, CozeError>,
{
    pub fn new(initial: PageState, fetch: F) -> Self {
        Self {
            fetch,
            next: Some(initial),
            fetches: 0,
            _item: std::marker::PhantomData,
        }
    }

    /// Fetch exactly one page for `state`, without touching the listing's
    /// own position.
    pub fn get_page(&mut self, state: &PageState) -> Result<Page<T>, CozeError> {
        self.fetches += 1;
        let page = (self.fetch)(state)?;
        debug!(state = ?state, items = page.items.len(), has_more = page.has_more, "fetched page");
        Ok(page)
    }

    /// Fetch the page at the current position and advance past it.
    ///
    /// Returns `Ok(None)` once the listing is exhausted. An error ends the
    /// listing.
    pub fn next_page(&mut self) -> Result<Option<Page<T>>, CozeError> {
        let Some(state) = self.next.take() else {
            return Ok(None);
        };
        let page = self.get_page(&state)?;
        self.next = state.advance(&page);
        Ok(Some(page))
    }

    /// Whether another call to `next_page` would fetch.
    pub fn has_next(&self) -> bool {
        self.next.is_some()
    }

    /// Number of fetches made so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches
    }

    pub fn pages(self) -> Pages<T, F> {
        Pages { paged: self }
    }

    pub fn items(self) -> Items<T, F> {
        Items {
            paged: self,
            current: Vec::new().into_iter(),
        }
    }
}

/// Iterator over whole pages.
pub struct Pages<T, F> {
    paged: Paged<T, F>,
}

impl<T, F> Pages<T, F> {
    pub fn fetch_count(&self) -> usize {
        self.paged.fetches
    }
}

impl<T, F> Iterator for Pages<T, F>
where
    F: FnMut(&PageState) -> Result<Page<T>, CozeError>,
{
    type Item = Result<Page<T>, CozeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.paged.next_page().transpose()
    }
}

/// Iterator over the items of every page, in server order.
pub struct Items<T, F> {
    paged: Paged<T, F>,
    current: std::vec::IntoIter<T>,
}

impl<T, F> Items<T, F> {
    pub fn fetch_count(&self) -> usize {
        self.paged.fetches
    }
}

impl<T, F> Iterator for Items<T, F>
where
    F: FnMut(&PageState) -> Result<Page<T>, CozeError>,
{
    type Item = Result<T, CozeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.current.next() {
                return Some(Ok(item));
            }
            match self.paged.next_page() {
                Ok(Some(page)) => self.current = page.items.into_iter(),
                Ok(None) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Async
// ---------------------------------------------------------------------------

/// Async listing driven by `fetch`.
pub struct AsyncPaged<T, F> {
    fetch: F,
    next: Option<PageState>,
    fetches: usize,
    _item: std::marker::PhantomData<fn() -> T>,
}

impl<T, F, Fut> AsyncPaged<T, F>
where
    F: FnMut(PageState) -> Fut,
    Fut: Future<Output = Result<Page<T>, CozeError>>,
{
    pub fn new(initial: PageState, fetch: F) -> Self {
        Self {
            fetch,
            next: Some(initial),
            fetches: 0,
            _item: std::marker::PhantomData,
        }
    }

    pub async fn get_page(&mut self, state: PageState) -> Result<Page<T>, CozeError> {
        self.fetches += 1;
        let page = (self.fetch)(state.clone()).await?;
        debug!(state = ?state, items = page.items.len(), has_more = page.has_more, "fetched page");
        Ok(page)
    }

    pub async fn next_page(&mut self) -> Result<Option<Page<T>>, CozeError> {
        let Some(state) = self.next.take() else {
            return Ok(None);
        };
        let page = self.get_page(state.clone()).await?;
        self.next = state.advance(&page);
        Ok(Some(page))
    }

    pub fn has_next(&self) -> bool {
        self.next.is_some()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches
    }

    pub fn pages(mut self) -> impl Stream<Item = Result<Page<T>, CozeError>> {
        async_stream::stream! {
            loop {
                match self.next_page().await {
                    Ok(Some(page)) => yield Ok(page),
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        }
    }

    pub fn items(mut self) -> impl Stream<Item = Result<T, CozeError>> {
        async_stream::stream! {
            loop {
                match self.next_page().await {
                    Ok(Some(page)) => {
                        for item in page.items {
                            yield Ok(item);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        }
    }
}
