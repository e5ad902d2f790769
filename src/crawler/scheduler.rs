use tracing::debug;

use crate::crawler::error::BatchError;
use crate::crawler::task::Task;

/// Turns a batch request into its ordered task list
pub struct Scheduler {
    /// Most identifiers a single batch may track
    identifier_cap: usize,
}

impl Scheduler {
    pub fn new(identifier_cap: usize) -> Self {
        Self { identifier_cap }
    }

    /// Validate the request and expand keywords × identifiers, keyword-major,
    /// keeping input order and values. Duplicates are kept.
    ///
    /// Identifiers are matched exactly against listing attributes, so one with
    /// surrounding whitespace is rejected rather than trimmed.
    pub fn plan(&self, keywords: &[String], identifiers: &[String], max_pages: u32) -> Result<Vec<Task>, BatchError> {
        if keywords.is_empty() {
            return Err(BatchError::Validation("at least one keyword is required".to_string()));
        }
        if identifiers.is_empty() || identifiers.len() > self.identifier_cap {
            return Err(BatchError::Validation(format!(
                "between 1 and {} identifiers are allowed, got {}",
                self.identifier_cap,
                identifiers.len()
            )));
        }
        if max_pages < 1 {
            return Err(BatchError::Validation("max pages must be at least 1".to_string()));
        }
        if keywords.iter().any(|k| k.trim().is_empty()) {
            return Err(BatchError::Validation("keywords must not be blank".to_string()));
        }
        if identifiers.iter().any(|i| i.trim().is_empty()) {
            return Err(BatchError::Validation("identifiers must not be blank".to_string()));
        }
        if let Some(padded) = identifiers.iter().find(|i| i.trim() != i.as_str()) {
            return Err(BatchError::Validation(format!(
                "identifier {:?} has surrounding whitespace",
                padded
            )));
        }

        let tasks: Vec<Task> = keywords
            .iter()
            .flat_map(|keyword| {
                identifiers.iter().map(move |identifier| Task {
                    keyword: keyword.clone(),
                    identifier: identifier.clone(),
                })
            })
            .collect();

        debug!(
            "Planned {} tasks from {} keywords and {} identifiers",
            tasks.len(),
            keywords.len(),
            identifiers.len()
        );

        Ok(tasks)
    }
}
