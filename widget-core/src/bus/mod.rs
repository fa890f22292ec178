//! Message bus connecting widget instances.
//!
//! Instances subscribe by id. Messages are broadcast to every subscriber or
//! addressed to specific recipients; lifecycle events travel as broadcasts
//! from the orchestrator and are also appended to the instance's own event
//! history in batches.

mod channel;
mod proptest;
pub mod types;

pub use channel::{EventSink, Handler, MessageBus, Subscription};
pub use types::{
    Delivery, Message, MessageId, MessageKind, WidgetEvent, WidgetEventKind, ORCHESTRATOR_SENDER,
};
