use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crawler::runner::{BatchRun, BatchStatus, BatchSummary};
use crate::crawler::task::RankRecord;

/// Request accepted by the worker, over the channel or as a one-shot message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Request {
    #[serde(rename_all = "camelCase")]
    BatchSearch {
        keywords: Vec<String>,
        identifiers: Vec<String>,
        max_pages: u32,
    },
    ForceReconnect,
}

impl Request {
    /// Whether handling this request runs a batch
    pub fn is_long_running(&self) -> bool {
        matches!(self, Request::BatchSearch { .. })
    }
}

/// Reply to a `Request`; identical on both delivery paths
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<RankRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<BatchSummary>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            results: None,
            summary: None,
            message: message.into(),
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>, error: Option<String>) -> Self {
        Self {
            success: false,
            results: None,
            summary: None,
            message: message.into(),
            error,
        }
    }

    pub fn from_batch(run: BatchRun) -> Self {
        match run.status {
            BatchStatus::Completed => Self {
                success: true,
                results: Some(run.results),
                summary: Some(run.summary),
                message: run.progress_message,
                error: None,
            },
            _ => Self {
                success: false,
                results: None,
                summary: Some(run.summary),
                message: "batch search failed".to_string(),
                error: run.error,
            },
        }
    }
}

/// Worker → controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerMessage {
    Connected {
        origin: String,
    },
    #[serde(rename_all = "camelCase")]
    Progress {
        correlation_id: Uuid,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Response {
        correlation_id: Uuid,
        response: Response,
    },
}

/// Controller → worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControllerMessage {
    /// Liveness probe; never dispatched
    Ping,
    #[serde(rename_all = "camelCase")]
    Request {
        correlation_id: Uuid,
        request: Request,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_batch_search_wire_format() {
        let request: Request = serde_json::from_value(json!({
            "action": "batchSearch",
            "keywords": ["desk lamp"],
            "identifiers": ["B0C1234567"],
            "maxPages": 3
        }))
        .unwrap();

        assert_eq!(request, Request::BatchSearch {
            keywords: vec!["desk lamp".to_string()],
            identifiers: vec!["B0C1234567".to_string()],
            max_pages: 3,
        });
        assert!(request.is_long_running());

        let reconnect: Request = serde_json::from_value(json!({ "action": "forceReconnect" })).unwrap();
        assert_eq!(reconnect, Request::ForceReconnect);
    }

    #[test]
    fn test_handshake_and_ping_wire_format() {
        let connected = serde_json::to_value(WorkerMessage::Connected {
            origin: "https://www.amazon.com".to_string(),
        })
        .unwrap();
        assert_eq!(connected, json!({ "type": "connected", "origin": "https://www.amazon.com" }));

        let ping: ControllerMessage = serde_json::from_value(json!({ "type": "ping" })).unwrap();
        assert_eq!(ping, ControllerMessage::Ping);
    }

    #[test]
    fn test_failure_response_omits_results() {
        let value = serde_json::to_value(Response::failure("batch search rejected", Some("a batch is already running".into()))).unwrap();

        assert_eq!(value, json!({
            "success": false,
            "message": "batch search rejected",
            "error": "a batch is already running"
        }));
    }
}
