//! Message and lifecycle event types carried by the bus.

use crate::widget::InstanceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Sender id used for messages the orchestrator emits itself.
pub const ORCHESTRATOR_SENDER: &str = "orchestrator";

/// Unique identifier for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of a message, without routing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Broadcast,
    Direct,
    Request,
    Response,
}

/// Routing of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Delivery {
    /// Every subscribed instance
    Broadcast,
    /// Only the listed recipients
    Direct { recipients: Vec<InstanceId> },
    /// Listed recipients, who are expected to reply
    Request { recipients: Vec<InstanceId> },
    /// Reply to an earlier request
    Response {
        recipient: InstanceId,
        in_reply_to: MessageId,
    },
}

/// A message exchanged between instances and external callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub delivery: Delivery,
    /// Sending instance id, or [`ORCHESTRATOR_SENDER`]
    pub sender: String,
    /// What the message means (e.g. `"guest.added"`)
    pub action: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn with_delivery(
        delivery: Delivery,
        sender: impl Into<String>,
        action: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: MessageId::new(),
            delivery,
            sender: sender.into(),
            action: action.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Message for every subscriber.
    pub fn broadcast(sender: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Self::with_delivery(Delivery::Broadcast, sender, action, payload)
    }

    /// Message for one recipient.
    pub fn direct(
        sender: impl Into<String>,
        recipient: impl Into<InstanceId>,
        action: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self::direct_many(sender, [recipient.into()], action, payload)
    }

    /// Message for several recipients.
    pub fn direct_many(
        sender: impl Into<String>,
        recipients: impl IntoIterator<Item = InstanceId>,
        action: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self::with_delivery(
            Delivery::Direct {
                recipients: recipients.into_iter().collect(),
            },
            sender,
            action,
            payload,
        )
    }

    /// Request addressed to the listed recipients.
    pub fn request(
        sender: impl Into<String>,
        recipients: impl IntoIterator<Item = InstanceId>,
        action: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self::with_delivery(
            Delivery::Request {
                recipients: recipients.into_iter().collect(),
            },
            sender,
            action,
            payload,
        )
    }

    /// Build a response to this message, addressed to its sender.
    pub fn reply(&self, sender: impl Into<String>, payload: Value) -> Self {
        Self::with_delivery(
            Delivery::Response {
                recipient: InstanceId::new(self.sender.clone()),
                in_reply_to: self.id,
            },
            sender,
            self.action.clone(),
            payload,
        )
    }

    pub fn kind(&self) -> MessageKind {
        match self.delivery {
            Delivery::Broadcast => MessageKind::Broadcast,
            Delivery::Direct { .. } => MessageKind::Direct,
            Delivery::Request { .. } => MessageKind::Request,
            Delivery::Response { .. } => MessageKind::Response,
        }
    }

    /// Explicit recipients; `None` for broadcasts.
    pub fn recipients(&self) -> Option<Vec<&InstanceId>> {
        match &self.delivery {
            Delivery::Broadcast => None,
            Delivery::Direct { recipients } | Delivery::Request { recipients } => {
                Some(recipients.iter().collect())
            }
            Delivery::Response { recipient, .. } => Some(vec![recipient]),
        }
    }

    /// Whether a subscriber registered under `instance_id` should receive this.
    pub fn is_addressed_to(&self, instance_id: &InstanceId) -> bool {
        match self.recipients() {
            None => true,
            Some(recipients) => recipients.contains(&instance_id),
        }
    }
}

/// Kind of a lifecycle or domain event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WidgetEventKind {
    /// Instance created (mount/created)
    Created,
    /// Instance fields updated
    Updated,
    Mounting,
    Mounted,
    MountFailed,
    Refreshing,
    Refreshed,
    RefreshFailed,
    Syncing,
    DataSynced,
    SyncFailed,
    /// Lifecycle unmount started
    Unmounting,
    /// Instance deleted from the store
    Unmount,
    Disabled,
    /// Error reported for the instance
    Error,
    /// Host-defined event
    Custom,
}

impl std::fmt::Display for WidgetEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Mounting => "mounting",
            Self::Mounted => "mounted",
            Self::MountFailed => "mount_failed",
            Self::Refreshing => "refreshing",
            Self::Refreshed => "refreshed",
            Self::RefreshFailed => "refresh_failed",
            Self::Syncing => "syncing",
            Self::DataSynced => "data_synced",
            Self::SyncFailed => "sync_failed",
            Self::Unmounting => "unmounting",
            Self::Unmount => "unmount",
            Self::Disabled => "disabled",
            Self::Error => "error",
            Self::Custom => "custom",
        };
        write!(f, "{}", s)
    }
}

/// An event about one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetEvent {
    pub kind: WidgetEventKind,
    pub instance_id: InstanceId,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl WidgetEvent {
    pub fn new(kind: WidgetEventKind, instance_id: impl Into<InstanceId>, payload: Value) -> Self {
        Self {
            kind,
            instance_id: instance_id.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Event with no payload.
    pub fn bare(kind: WidgetEventKind, instance_id: impl Into<InstanceId>) -> Self {
        Self::new(kind, instance_id, Value::Null)
    }

    /// Action string used when the event travels as a message.
    pub fn action(&self) -> String {
        format!("widget.{}", self.kind)
    }

    /// Wrap the event as a broadcast from the orchestrator.
    pub fn to_message(&self) -> Message {
        Message::broadcast(
            ORCHESTRATOR_SENDER,
            self.action(),
            json!({
                "instance_id": self.instance_id,
                "kind": self.kind,
                "payload": self.payload,
                "timestamp": self.timestamp,
            }),
        )
    }
}
