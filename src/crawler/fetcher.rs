use async_trait::async_trait;
use scraper::{Html, Selector};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

use crate::browser::source::PageSource;
use crate::cli::config::ListingSettings;
use crate::crawler::error::FetchError;
use crate::crawler::task::{PageQuery, PositionResult};

/// Finds where an identifier ranks for a keyword
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PositionLocator: Send + Sync {
    async fn locate_position(
        &self,
        keyword: &str,
        identifier: &str,
        max_pages: u32,
    ) -> Result<PositionResult, FetchError>;
}

/// Compiled selectors describing the listing page structure
#[derive(Debug)]
pub struct ListingSelectors {
    item: Selector,
    identifier_attribute: String,
    action: Selector,
    promoted: Selector,
    blocked: Option<Selector>,
}

impl ListingSelectors {
    pub fn compile(settings: &ListingSettings) -> Result<Self, FetchError> {
        Ok(Self {
            item: compile_selector(&settings.item_selector)?,
            identifier_attribute: settings.identifier_attribute.clone(),
            action: compile_selector(&settings.action_selector)?,
            promoted: compile_selector(&settings.promoted_selector)?,
            blocked: settings.blocked_selector.as_deref().map(compile_selector).transpose()?,
        })
    }
}

fn compile_selector(selector: &str) -> Result<Selector, FetchError> {
    Selector::parse(selector)
        .map_err(|e| FetchError::Unexpected(format!("invalid selector '{}': {:?}", selector, e)))
}

/// One product entry of a listing page, in document order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub identifier: String,
    pub promoted: bool,
}

/// Extract the product entries of a listing page.
///
/// Entries without a primary action (placeholders, widgets) are dropped.
pub fn parse_listing(html: &str, selectors: &ListingSelectors) -> Result<Vec<ListingEntry>, FetchError> {
    if html.trim().is_empty() {
        return Err(FetchError::MalformedListing("empty response body".to_string()));
    }

    let document = Html::parse_document(html);

    if let Some(blocked) = &selectors.blocked {
        if document.select(blocked).next().is_some() {
            return Err(FetchError::Blocked);
        }
    }

    let entries = document
        .select(&selectors.item)
        .filter_map(|node| {
            if node.select(&selectors.action).next().is_none() {
                return None;
            }

            let identifier = node.value().attr(&selectors.identifier_attribute)?.trim();
            if identifier.is_empty() {
                return None;
            }

            Some(ListingEntry {
                identifier: identifier.to_string(),
                promoted: node.select(&selectors.promoted).next().is_some(),
            })
        })
        .collect();

    Ok(entries)
}

/// Position of `identifier` among `entries`, counting only organic entries
pub fn locate_in_entries(entries: &[ListingEntry], identifier: &str, page: u32) -> Option<PositionResult> {
    let mut organic = 0;

    for entry in entries {
        if !entry.promoted {
            organic += 1;
        }

        if entry.identifier == identifier {
            return Some(if entry.promoted {
                PositionResult::promoted(page)
            } else {
                PositionResult::organic(page, organic)
            });
        }
    }

    None
}

/// Walks a keyword's listing page by page looking for an identifier
pub struct PageFetcher {
    source: Arc<dyn PageSource>,
    listing: ListingSettings,
    selectors: ListingSelectors,
    timeout: Duration,
}

impl PageFetcher {
    pub fn new(source: Arc<dyn PageSource>, listing: ListingSettings, timeout: Duration) -> Result<Self, FetchError> {
        let selectors = ListingSelectors::compile(&listing)?;

        Ok(Self {
            source,
            listing,
            selectors,
            timeout,
        })
    }

    async fn fetch_with_ceiling(&self, query: &PageQuery) -> Result<String, FetchError> {
        let url = query.listing_url(&self.listing)?;

        match timeout(self.timeout, self.source.fetch_page(&url)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl PositionLocator for PageFetcher {
    async fn locate_position(
        &self,
        keyword: &str,
        identifier: &str,
        max_pages: u32,
    ) -> Result<PositionResult, FetchError> {
        for page in 1..=max_pages {
            let query = PageQuery {
                keyword: keyword.to_string(),
                page_number: page,
                max_pages,
            };

            let html = self.fetch_with_ceiling(&query).await?;
            let entries = parse_listing(&html, &self.selectors)?;

            debug!(
                "Page {}/{} for '{}' has {} entries",
                query.page_number, query.max_pages, keyword, entries.len()
            );

            if let Some(result) = locate_in_entries(&entries, identifier, page) {
                return Ok(result);
            }
        }

        Ok(PositionResult::not_found())
    }
}
