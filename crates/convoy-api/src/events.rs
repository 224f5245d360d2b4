//! Progress events emitted while a fan-out runs

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::result::{Action, TargetResult};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    NodeStart {
        target: String,
        action: Action,
        at: DateTime<Utc>,
    },
    NodeResult {
        result: TargetResult,
        at: DateTime<Utc>,
    },
}

impl ProgressEvent {
    pub fn node_start(target: impl Into<String>, action: Action) -> Self {
        ProgressEvent::NodeStart {
            target: target.into(),
            action,
            at: Utc::now(),
        }
    }

    #[must_use]
    pub fn node_result(result: TargetResult) -> Self {
        ProgressEvent::NodeResult {
            result,
            at: Utc::now(),
        }
    }

    #[must_use]
    pub fn target(&self) -> &str {
        match self {
            ProgressEvent::NodeStart { target, .. } => target,
            ProgressEvent::NodeResult { result, .. } => &result.target,
        }
    }
}

/// Callback receiving progress events; must tolerate calls from any task
pub type EventSink = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tagging() {
        let event = ProgressEvent::node_start("web1", Action::Command);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "node_start");
        assert_eq!(value["target"], "web1");
        assert_eq!(value["action"], "command");

        let result = TargetResult::for_command("web1", Action::Command, "id", "", "", 0);
        let value = serde_json::to_value(ProgressEvent::node_result(result)).unwrap();
        assert_eq!(value["type"], "node_result");
        assert_eq!(value["result"]["status"], "success");
    }
}
