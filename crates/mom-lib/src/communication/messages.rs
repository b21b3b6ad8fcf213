//! Request kinds exchanged with guest servers and the reply envelope

use crate::record::Record;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Resource name → amount (memory in MB)
pub type Allocation = BTreeMap<String, f64>;

/// A request to a guest server.
///
/// On the wire a message is `{"type": <kind>, "content": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content")]
pub enum Message {
    /// Liveness probe
    Echo(Record),
    /// Ask the guest for its desired allocation
    Inquiry(InquiryContent),
    /// Push the decided allocation to the guest
    Notify(NotifyContent),
    /// Ask the guest for its merged monitor record
    Stats(Record),
    /// Wait for the next notification and return the latest one
    TargetAllocation(TargetAllocationContent),
    /// Report the measured gap between allocated and visible resources
    UpdateResourceDiff(Allocation),
    /// Report the target the application settled on
    UpdateApplicationTarget(Allocation),
}

impl Message {
    pub fn echo() -> Self {
        Message::Echo(Record::new())
    }

    pub fn stats() -> Self {
        Message::Stats(Record::new())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Echo(_) => "Echo",
            Message::Inquiry(_) => "Inquiry",
            Message::Notify(_) => "Notify",
            Message::Stats(_) => "Stats",
            Message::TargetAllocation(_) => "TargetAllocation",
            Message::UpdateResourceDiff(_) => "UpdateResourceDiff",
            Message::UpdateApplicationTarget(_) => "UpdateApplicationTarget",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InquiryContent {
    /// Controls applied in the previous cycle
    #[serde(default)]
    pub last_alloc: Allocation,
    #[serde(default)]
    pub grace_period: Option<f64>,
    #[serde(default)]
    pub timeout: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NotifyContent {
    pub alloc: Allocation,
    /// `None` marks an authoritative notification
    #[serde(default)]
    pub grace_period: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetAllocationContent {
    /// Seconds to wait for a new notification; `None` waits indefinitely
    #[serde(default)]
    pub timeout: Option<f64>,
}

/// Latest notification as seen by the guest, returned by `TargetAllocation`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TargetAllocation {
    #[serde(default)]
    pub alloc: Option<Allocation>,
    #[serde(default)]
    pub grace_period: Option<f64>,
    #[serde(default)]
    pub update_time: Option<f64>,
    #[serde(default)]
    pub is_new_notification: bool,
}

impl TargetAllocation {
    pub fn memory(&self) -> Option<f64> {
        self.alloc.as_ref()?.get("memory").copied()
    }
}

/// Reply wrapper produced by the guest server for every request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Envelope {
    pub ack: bool,
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub process_time: f64,
}

impl Envelope {
    pub fn ok(response: Record, process_time: f64) -> Self {
        Self {
            ack: true,
            response: Some(Value::Object(response)),
            error: None,
            process_time,
        }
    }

    pub fn failed(error: impl Into<String>, process_time: f64) -> Self {
        Self {
            ack: false,
            response: None,
            error: Some(error.into()),
            process_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_wire_format() {
        let message = Message::Notify(NotifyContent {
            alloc: Allocation::from([("memory".to_string(), 2048.0)]),
            grace_period: None,
        });

        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "Notify",
                "content": {"alloc": {"memory": 2048.0}, "grace-period": null}
            })
        );
    }

    #[test]
    fn test_inquiry_parses_partial_content() {
        let message: Message = serde_json::from_value(json!({
            "type": "Inquiry",
            "content": {"grace-period": 5.0}
        }))
        .unwrap();

        match message {
            Message::Inquiry(content) => {
                assert!(content.last_alloc.is_empty());
                assert_eq!(content.grace_period, Some(5.0));
                assert_eq!(content.timeout, None);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_echo_kind() {
        let message: Message =
            serde_json::from_value(json!({"type": "Echo", "content": {}})).unwrap();
        assert_eq!(message.kind(), "Echo");
        assert_eq!(message, Message::echo());
    }

    #[test]
    fn test_failed_envelope_has_no_response() {
        let envelope = Envelope::failed("boom", 0.1);
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["ack"], false);
        assert_eq!(value["response"], Value::Null);
        assert_eq!(value["error"], "boom");
        assert_eq!(value["process-time"], 0.1);
    }
}
