//! In-process publish/subscribe bus.

use super::types::{Message, WidgetEvent};
use crate::error::Result;
use crate::widget::{push_bounded, InstanceId};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::thread::{self, ThreadId};
use tracing::{debug, warn};

/// Message handler registered for an instance id.
pub type Handler = Arc<dyn Fn(&Message) -> Result<()> + Send + Sync>;

/// Receives batches of events queued by [`MessageBus::broadcast_event`].
pub trait EventSink: Send + Sync {
    fn append_events(&self, events: Vec<WidgetEvent>);
}

struct HandlerEntry {
    id: u64,
    handler: Handler,
}

struct SubscriberSet {
    instance_id: InstanceId,
    handlers: Vec<HandlerEntry>,
}

/// Messages waiting for the running dispatch to finish.
#[derive(Default)]
struct DispatchQueue {
    /// Thread currently delivering messages
    owner: Option<ThreadId>,
    queue: VecDeque<Message>,
}

struct BusState {
    /// In first-subscription order
    subscribers: RwLock<Vec<SubscriberSet>>,
    history: Mutex<VecDeque<Message>>,
    history_limit: usize,
    next_handler_id: AtomicU64,
    messages_sent: AtomicU64,
    pending_events: Mutex<Vec<WidgetEvent>>,
    flush_scheduled: AtomicBool,
    sink: RwLock<Option<Weak<dyn EventSink>>>,
    dispatch: Mutex<DispatchQueue>,
    /// Held by the thread that drains the dispatch queue
    dispatch_gate: Mutex<()>,
}

impl BusState {
    fn remove_handler(&self, instance_id: &InstanceId, handler_id: u64) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(pos) = subscribers
            .iter()
            .position(|s| &s.instance_id == instance_id)
        else {
            return false;
        };

        let set = &mut subscribers[pos];
        let before = set.handlers.len();
        set.handlers.retain(|h| h.id != handler_id);
        let removed = set.handlers.len() != before;
        if set.handlers.is_empty() {
            subscribers.remove(pos);
        }
        removed
    }
}

/// Broadcast/direct message bus.
///
/// Cloning is cheap and yields a handle to the same bus.
///
/// Delivery is synchronous: `send` returns after every matching handler ran.
/// Broadcasts reach subscribers in the order their ids first subscribed.
/// Direct messages to ids without subscribers are dropped; nothing is
/// buffered for later.
#[derive(Clone)]
pub struct MessageBus {
    state: Arc<BusState>,
}

impl MessageBus {
    /// Create a bus keeping the last `history_limit` messages.
    pub fn new(history_limit: usize) -> Self {
        Self {
            state: Arc::new(BusState {
                subscribers: RwLock::new(Vec::new()),
                history: Mutex::new(VecDeque::with_capacity(history_limit)),
                history_limit: history_limit.max(1),
                next_handler_id: AtomicU64::new(1),
                messages_sent: AtomicU64::new(0),
                pending_events: Mutex::new(Vec::new()),
                flush_scheduled: AtomicBool::new(false),
                sink: RwLock::new(None),
                dispatch: Mutex::new(DispatchQueue::default()),
                dispatch_gate: Mutex::new(()),
            }),
        }
    }

    /// Register a handler for messages addressed to `instance_id`.
    ///
    /// Several handlers may share an id; removing one leaves the others.
    pub fn subscribe<F>(&self, instance_id: impl Into<InstanceId>, handler: F) -> Subscription
    where
        F: Fn(&Message) -> Result<()> + Send + Sync + 'static,
    {
        let instance_id = instance_id.into();
        let handler_id = self.state.next_handler_id.fetch_add(1, Ordering::Relaxed);
        let entry = HandlerEntry {
            id: handler_id,
            handler: Arc::new(handler),
        };

        {
            let mut subscribers = self
                .state
                .subscribers
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            match subscribers.iter_mut().find(|s| s.instance_id == instance_id) {
                Some(set) => set.handlers.push(entry),
                None => subscribers.push(SubscriberSet {
                    instance_id: instance_id.clone(),
                    handlers: vec![entry],
                }),
            }
        }

        debug!(instance_id = %instance_id, handler_id, "Subscription created");

        Subscription {
            bus: Arc::downgrade(&self.state),
            instance_id,
            handler_id,
        }
    }

    /// Drop every handler registered for `instance_id`. Returns how many were removed.
    pub fn unsubscribe_all(&self, instance_id: &InstanceId) -> usize {
        let mut subscribers = self
            .state
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match subscribers
            .iter()
            .position(|s| &s.instance_id == instance_id)
        {
            Some(pos) => subscribers.remove(pos).handlers.len(),
            None => 0,
        }
    }

    /// Record the message in history and deliver it.
    ///
    /// Returns the number of handlers that ran without error. A failing or
    /// panicking handler is logged and skipped.
    ///
    /// A message sent from inside a handler is queued and delivered once the
    /// current message has reached every subscriber, so each subscriber sees
    /// messages in send order. Such a nested send returns 0.
    pub fn send(&self, message: Message) -> usize {
        self.state.messages_sent.fetch_add(1, Ordering::Relaxed);
        {
            let mut history = self
                .state
                .history
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            push_bounded(&mut history, message.clone(), self.state.history_limit);
        }

        let current = thread::current().id();
        {
            let mut dispatch = self
                .state
                .dispatch
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if dispatch.owner == Some(current) {
                debug!(action = %message.action, "Nested send queued behind running dispatch");
                dispatch.queue.push_back(message);
                return 0;
            }
        }

        let _gate = self
            .state
            .dispatch_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.state
            .dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .owner = Some(current);

        let delivered = self.deliver(&message);
        loop {
            let next = {
                let mut dispatch = self
                    .state
                    .dispatch
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                match dispatch.queue.pop_front() {
                    Some(next) => next,
                    None => {
                        dispatch.owner = None;
                        break;
                    }
                }
            };
            self.deliver(&next);
        }
        delivered
    }

    fn deliver(&self, message: &Message) -> usize {
        // Snapshot so handlers may subscribe or send without deadlocking.
        let targets: Vec<(InstanceId, Handler)> = {
            let subscribers = self
                .state
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            subscribers
                .iter()
                .filter(|s| message.is_addressed_to(&s.instance_id))
                .flat_map(|s| {
                    s.handlers
                        .iter()
                        .map(move |h| (s.instance_id.clone(), Arc::clone(&h.handler)))
                })
                .collect()
        };

        if targets.is_empty() {
            if let Some(recipients) = message.recipients() {
                debug!(
                    action = %message.action,
                    recipients = ?recipients,
                    "No subscribed recipients, message dropped"
                );
            }
            return 0;
        }

        let mut delivered = 0;
        for (instance_id, handler) in targets {
            match catch_unwind(AssertUnwindSafe(|| handler(message))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!(
                    instance_id = %instance_id,
                    action = %message.action,
                    error = %e,
                    "Message handler failed"
                ),
                Err(_) => warn!(
                    instance_id = %instance_id,
                    action = %message.action,
                    "Message handler panicked"
                ),
            }
        }
        delivered
    }

    /// Broadcast a lifecycle event and queue it for the instance's event history.
    ///
    /// Events queued before the next flush are handed to the event sink in
    /// one batch. Inside a tokio runtime the flush runs on a spawned task;
    /// without one it runs immediately.
    pub fn broadcast_event(&self, event: WidgetEvent) -> usize {
        let delivered = self.send(event.to_message());
        self.state
            .pending_events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
        self.schedule_flush();
        delivered
    }

    fn schedule_flush(&self) {
        if self.state.flush_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let bus = self.clone();
                handle.spawn(async move {
                    tokio::task::yield_now().await;
                    bus.flush_events();
                });
            }
            Err(_) => {
                self.flush_events();
            }
        }
    }

    /// Hand every queued event to the sink now. Returns the batch size.
    pub fn flush_events(&self) -> usize {
        self.state.flush_scheduled.store(false, Ordering::Release);
        let batch = std::mem::take(
            &mut *self
                .state
                .pending_events
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if batch.is_empty() {
            return 0;
        }

        let count = batch.len();
        let sink = self
            .state
            .sink
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade);
        match sink {
            Some(sink) => sink.append_events(batch),
            None => debug!(count, "No event sink attached, events dropped"),
        }
        count
    }

    /// Attach the sink that stores flushed events.
    pub fn attach_event_sink(&self, sink: Weak<dyn EventSink>) {
        *self
            .state
            .sink
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    /// Retained messages, oldest first.
    pub fn history(&self) -> Vec<Message> {
        self.state
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Number of handlers registered for an id.
    pub fn handler_count(&self, instance_id: &InstanceId) -> usize {
        self.state
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|s| &s.instance_id == instance_id)
            .map_or(0, |s| s.handlers.len())
    }

    /// Number of ids with at least one handler.
    pub fn subscriber_count(&self) -> usize {
        self.state
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Total messages sent over the bus lifetime.
    pub fn messages_sent(&self) -> u64 {
        self.state.messages_sent.load(Ordering::Relaxed)
    }

    pub fn history_limit(&self) -> usize {
        self.state.history_limit
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MESSAGE_HISTORY_LIMIT)
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("subscribers", &self.subscriber_count())
            .field("messages_sent", &self.messages_sent())
            .finish_non_exhaustive()
    }
}

/// Handle returned by [`MessageBus::subscribe`].
///
/// Dropping the handle keeps the handler registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[must_use = "keep the subscription to be able to unsubscribe"]
#[derive(Debug)]
pub struct Subscription {
    bus: Weak<BusState>,
    instance_id: InstanceId,
    handler_id: u64,
}

impl Subscription {
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Remove this handler. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        match self.bus.upgrade() {
            Some(state) => state.remove_handler(&self.instance_id, self.handler_id),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::types::{WidgetEventKind, ORCHESTRATOR_SENDER};
    use crate::error::Error;
    use serde_json::{json, Value};

    fn recorder(
        log: &Arc<Mutex<Vec<String>>>,
        tag: &str,
    ) -> Box<dyn Fn(&Message) -> Result<()> + Send + Sync> {
        let log = Arc::clone(log);
        let tag = tag.to_string();
        Box::new(move |msg: &Message| {
            log.lock().unwrap().push(format!("{}:{}", tag, msg.action));
            Ok(())
        })
    }

    #[test]
    fn test_broadcast_fan_out_in_subscription_order() {
        let bus = MessageBus::new(10);
        let log = Arc::new(Mutex::new(Vec::new()));
        let _a = bus.subscribe("a", recorder(&log, "a"));
        let _b = bus.subscribe("b", recorder(&log, "b"));
        let _c = bus.subscribe("c", recorder(&log, "c"));

        let delivered = bus.send(Message::broadcast("host", "theme", Value::Null));

        assert_eq!(delivered, 3);
        assert_eq!(*log.lock().unwrap(), vec!["a:theme", "b:theme", "c:theme"]);
    }

    #[test]
    fn test_direct_only_reaches_recipient() {
        let bus = MessageBus::new(10);
        let log = Arc::new(Mutex::new(Vec::new()));
        let _a = bus.subscribe("a", recorder(&log, "a"));
        let _b = bus.subscribe("b", recorder(&log, "b"));

        assert_eq!(bus.send(Message::direct("host", "b", "ping", Value::Null)), 1);
        assert_eq!(bus.send(Message::direct("host", "zzz", "ping", Value::Null)), 0);
        assert_eq!(*log.lock().unwrap(), vec!["b:ping"]);
        assert_eq!(bus.history().len(), 2);
    }

    #[test]
    fn test_failing_handlers_do_not_block_others() {
        let bus = MessageBus::new(10);
        let log = Arc::new(Mutex::new(Vec::new()));
        let _bad = bus.subscribe("a", |_: &Message| Err(Error::handler("nope")));
        let _panics = bus.subscribe("b", |_: &Message| -> Result<()> { panic!("handler bug") });
        let _good = bus.subscribe("c", recorder(&log, "c"));

        let delivered = bus.send(Message::broadcast("host", "x", Value::Null));

        assert_eq!(delivered, 1);
        assert_eq!(*log.lock().unwrap(), vec!["c:x"]);
        assert_eq!(bus.history().len(), 1);
        assert_eq!(bus.history()[0].action, "x");
    }

    #[test]
    fn test_unsubscribe_one_of_many() {
        let bus = MessageBus::new(10);
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = bus.subscribe("a", recorder(&log, "first"));
        let second = bus.subscribe("a", recorder(&log, "second"));
        assert_eq!(bus.handler_count(&"a".into()), 2);

        assert!(first.unsubscribe());
        bus.send(Message::direct("host", "a", "ping", Value::Null));
        assert_eq!(*log.lock().unwrap(), vec!["second:ping"]);

        assert!(second.unsubscribe());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_unsubscribe_all() {
        let bus = MessageBus::new(10);
        let first = bus.subscribe("a", |_: &Message| Ok(()));
        let _second = bus.subscribe("a", |_: &Message| Ok(()));

        assert_eq!(bus.unsubscribe_all(&"a".into()), 2);
        assert_eq!(bus.unsubscribe_all(&"a".into()), 0);
        assert!(!first.unsubscribe());
    }

    #[test]
    fn test_history_is_bounded() {
        let bus = MessageBus::new(100);
        for i in 0..150 {
            bus.send(Message::broadcast("host", format!("m{}", i), Value::Null));
        }

        let history = bus.history();
        assert_eq!(history.len(), 100);
        assert_eq!(history[0].action, "m50");
        assert_eq!(history[99].action, "m149");
        assert_eq!(bus.messages_sent(), 150);
    }

    #[test]
    fn test_handlers_may_send_reentrantly() {
        let bus = MessageBus::new(10);
        let inner = bus.clone();
        let _echo = bus.subscribe("a", move |msg: &Message| {
            if msg.action == "ping" {
                inner.send(Message::direct("a", "b", "pong", Value::Null));
            }
            Ok(())
        });
        let log = Arc::new(Mutex::new(Vec::new()));
        let _b = bus.subscribe("b", recorder(&log, "b"));

        bus.send(Message::direct("host", "a", "ping", Value::Null));
        assert_eq!(*log.lock().unwrap(), vec!["b:pong"]);
    }

    #[test]
    fn test_nested_send_keeps_send_order() {
        let bus = MessageBus::new(10);
        let inner = bus.clone();
        let _a = bus.subscribe("a", move |msg: &Message| {
            if msg.action == "first" {
                assert_eq!(
                    inner.send(Message::broadcast("a", "second", Value::Null)),
                    0
                );
            }
            Ok(())
        });
        let log = Arc::new(Mutex::new(Vec::new()));
        let _b = bus.subscribe("b", recorder(&log, "b"));

        assert_eq!(bus.send(Message::broadcast("host", "first", Value::Null)), 2);

        assert_eq!(*log.lock().unwrap(), vec!["b:first", "b:second"]);
        let actions: Vec<String> = bus.history().into_iter().map(|m| m.action).collect();
        assert_eq!(actions, vec!["first", "second"]);
    }

    #[test]
    fn test_sends_from_other_threads_are_delivered() {
        let bus = MessageBus::new(200);
        let log = Arc::new(Mutex::new(Vec::new()));
        let _b = bus.subscribe("b", recorder(&log, "b"));

        let workers: Vec<_> = (0..4)
            .map(|i| {
                let bus = bus.clone();
                std::thread::spawn(move || {
                    (0..25)
                        .map(|_| bus.send(Message::broadcast("host", format!("t{}", i), Value::Null)))
                        .sum::<usize>()
                })
            })
            .collect();
        let delivered: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();

        assert_eq!(delivered, 100);
        assert_eq!(log.lock().unwrap().len(), 100);
    }

    struct CollectingSink {
        batches: Mutex<Vec<Vec<WidgetEvent>>>,
    }

    impl EventSink for CollectingSink {
        fn append_events(&self, events: Vec<WidgetEvent>) {
            self.batches.lock().unwrap().push(events);
        }
    }

    #[test]
    fn test_broadcast_event_without_runtime_flushes_immediately() {
        let bus = MessageBus::new(10);
        let sink = Arc::new(CollectingSink {
            batches: Mutex::new(Vec::new()),
        });
        let weak: Weak<dyn EventSink> = Arc::downgrade(&sink) as Weak<dyn EventSink>;
        bus.attach_event_sink(weak);

        bus.broadcast_event(WidgetEvent::bare(WidgetEventKind::Created, "w1"));

        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].kind, WidgetEventKind::Created);
        assert_eq!(bus.history()[0].sender, ORCHESTRATOR_SENDER);
    }

    #[tokio::test]
    async fn test_events_in_same_tick_are_batched() {
        let bus = MessageBus::new(10);
        let sink = Arc::new(CollectingSink {
            batches: Mutex::new(Vec::new()),
        });
        let weak: Weak<dyn EventSink> = Arc::downgrade(&sink) as Weak<dyn EventSink>;
        bus.attach_event_sink(weak);

        bus.broadcast_event(WidgetEvent::bare(WidgetEventKind::Created, "w1"));
        bus.broadcast_event(WidgetEvent::new(
            WidgetEventKind::Updated,
            "w1",
            json!({"visible": false}),
        ));
        bus.broadcast_event(WidgetEvent::bare(WidgetEventKind::Created, "w2"));
        assert!(sink.batches.lock().unwrap().is_empty());

        for _ in 0..3 {
            tokio::task::yield_now().await;
        }

        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
    }

    #[tokio::test]
    async fn test_explicit_flush() {
        let bus = MessageBus::new(10);
        bus.broadcast_event(WidgetEvent::bare(WidgetEventKind::Created, "w1"));
        assert_eq!(bus.flush_events(), 1);
        assert_eq!(bus.flush_events(), 0);
    }
}
