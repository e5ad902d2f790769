use serde::{Serialize, Deserialize};
use url::Url;

use crate::cli::config::ListingSettings;
use crate::crawler::error::FetchError;

/// One (keyword, identifier) pair to locate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub keyword: String,
    pub identifier: String,
}

/// A single listing page request derived from a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageQuery {
    pub keyword: String,
    pub page_number: u32,
    pub max_pages: u32,
}

impl PageQuery {
    /// Build the listing URL for this page
    pub fn listing_url(&self, settings: &ListingSettings) -> Result<Url, FetchError> {
        let mut url = Url::parse(&settings.base_url)
            .and_then(|base| base.join(&settings.search_path))
            .map_err(|e| FetchError::Unexpected(format!("invalid listing URL {}: {}", settings.base_url, e)))?;

        url.query_pairs_mut()
            .clear()
            .append_pair(&settings.keyword_param, &self.keyword)
            .append_pair(&settings.page_param, &self.page_number.to_string());

        Ok(url)
    }
}

/// Where a target identifier sits in a keyword's listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionResult {
    pub found: bool,
    pub page: Option<u32>,
    /// Rank among organic entries on the page; absent for promoted matches
    pub organic_position: Option<u32>,
    pub is_promoted: bool,
}

impl PositionResult {
    pub fn not_found() -> Self {
        Self {
            found: false,
            page: None,
            organic_position: None,
            is_promoted: false,
        }
    }

    pub fn organic(page: u32, position: u32) -> Self {
        Self {
            found: true,
            page: Some(page),
            organic_position: Some(position),
            is_promoted: false,
        }
    }

    pub fn promoted(page: u32) -> Self {
        Self {
            found: true,
            page: Some(page),
            organic_position: None,
            is_promoted: true,
        }
    }
}

/// A located identifier, as reported back to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankRecord {
    pub identifier: String,
    pub keyword: String,
    pub page: u32,
    pub position: Option<u32>,
    pub overall_rank: Option<u32>,
    pub is_promoted: bool,
}

impl RankRecord {
    /// Build a record from a found position. Returns `None` for a "not found" result.
    pub fn from_position(task: &Task, result: &PositionResult, page_size: u32) -> Option<Self> {
        if !result.found {
            return None;
        }
        let page = result.page?;

        Some(Self {
            identifier: task.identifier.clone(),
            keyword: task.keyword.clone(),
            page,
            position: result.organic_position,
            overall_rank: result
                .organic_position
                .and_then(|position| overall_rank(page, position, page_size)),
            is_promoted: result.is_promoted,
        })
    }
}

/// Linearize a 1-based (page, position) pair across pages.
/// `None` when page is 0 or the rank does not fit in a `u32`.
pub fn overall_rank(page: u32, position: u32, page_size: u32) -> Option<u32> {
    page.checked_sub(1)?
        .checked_mul(page_size)?
        .checked_add(position)
}
