//! Worker channel pair
//!
//! Two unidirectional queues connect the interactive side with a backend:
//! actions flow towards the backend, events flow back. The interactive side
//! keeps a callback table keyed by action id; every event that names an action
//! in `in_response_to` is handed to that action's callback.
//!
//! # Usage
//!
//! ```ignore
//! use mailcache::worker::{self, callback};
//! use mailcache::protocol::{Action, Event};
//!
//! let (handle, mut events, backend) = worker::channel();
//!
//! // Never blocks: the action queue is unbounded
//! handle.post_action(Action::ListDirectories, Some(callback(|msg| {
//!     if let Event::Directory(dir) = msg.body() {
//!         println!("{}", dir.name);
//!     }
//! })));
//!
//! // On the interactive side, drain and dispatch
//! while let Some(msg) = events.next().await {
//!     events.process_event(&msg);
//!     account.update(&msg);
//! }
//! ```
//!
//! A callback stays registered while non-terminal events arrive and is dropped
//! the moment its Done, Error or Unsupported event is dispatched.
//!
//! A handle can be scoped to a directory with [`WorkerHandle::scoped`]. Actions
//! posted through it remember that directory until their Done or Unsupported, so
//! replies can be routed back to the store that asked, whichever directory is
//! selected by the time they arrive.

use log::{debug, trace};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::protocol::{Action, ActionMessage, Event, EventMessage, MessageId, WorkerMessage};
use crate::types::DirectoryName;

/// Completion handler for an action, invoked once per event answering it
pub type Callback = Arc<dyn Fn(&EventMessage) + Send + Sync>;

/// Wrap a closure as a [`Callback`]
pub fn callback<F>(f: F) -> Callback
where
    F: Fn(&EventMessage) + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Default)]
struct Table {
    callbacks: HashMap<MessageId, Callback>,
    /// Directory of the scoped handle that posted each action
    origins: HashMap<MessageId, DirectoryName>,
}

type CallbackTable = Arc<Mutex<Table>>;

fn lock(table: &CallbackTable) -> MutexGuard<'_, Table> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Create a connected channel pair
///
/// Returns the interactive side's posting handle, its event receiver, and the
/// backend's end of both queues.
pub fn channel() -> (WorkerHandle, WorkerEvents, BackendChannel) {
    let (action_tx, action_rx) = unbounded_channel();
    let (event_tx, event_rx) = unbounded_channel();
    let callbacks: CallbackTable = Arc::new(Mutex::new(Table::default()));

    let handle = WorkerHandle {
        actions: action_tx,
        callbacks: callbacks.clone(),
        origin: None,
    };
    let events = WorkerEvents {
        events: event_rx,
        callbacks,
    };
    let backend = BackendChannel {
        actions: ActionReceiver { rx: action_rx },
        events: EventSender { tx: event_tx },
    };

    (handle, events, backend)
}

/// Posting side of the pair (cheap to clone)
#[derive(Clone)]
pub struct WorkerHandle {
    actions: UnboundedSender<ActionMessage>,
    callbacks: CallbackTable,
    origin: Option<DirectoryName>,
}

impl WorkerHandle {
    /// A handle whose actions are tagged with `directory`
    pub fn scoped(&self, directory: &str) -> WorkerHandle {
        WorkerHandle {
            actions: self.actions.clone(),
            callbacks: self.callbacks.clone(),
            origin: Some(directory.to_string()),
        }
    }

    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    /// Enqueue an action for the backend and register its callback
    ///
    /// The action is stamped with its id while the callback table is locked, so
    /// ids enter the queue in increasing order and the callback is in place
    /// before any reply can be dispatched.
    ///
    /// # Panics
    ///
    /// Panics if the backend has terminated. Posting to a dead worker is a
    /// programming error, not a recoverable condition.
    pub fn post_action(&self, action: Action, callback: Option<Callback>) -> MessageId {
        let mut table = lock(&self.callbacks);
        let msg = WorkerMessage::stamp(action, None);
        let id = msg.id();
        debug!("PostAction {} {}", id, msg.body().name());

        if let Some(cb) = callback {
            table.callbacks.insert(id, cb);
        }
        if let Some(origin) = &self.origin {
            table.origins.insert(id, origin.clone());
        }

        if self.actions.send(msg).is_err() {
            table.callbacks.remove(&id);
            table.origins.remove(&id);
            drop(table);
            panic!("action {} posted after the backend terminated", id);
        }
        id
    }

    /// Whether the backend has dropped its end of the action queue
    pub fn is_closed(&self) -> bool {
        self.actions.is_closed()
    }

    /// Number of actions still waiting for a terminal event
    pub fn pending_callbacks(&self) -> usize {
        lock(&self.callbacks).callbacks.len()
    }
}

/// Receiving side of the event queue, owned by the interactive context
pub struct WorkerEvents {
    events: UnboundedReceiver<EventMessage>,
    callbacks: CallbackTable,
}

impl WorkerEvents {
    /// Wait for the next event; `None` once the backend has gone away
    pub async fn next(&mut self) -> Option<EventMessage> {
        self.events.recv().await
    }

    /// Take the next event if one is already queued
    pub fn try_next(&mut self) -> Option<EventMessage> {
        self.events.try_recv().ok()
    }

    /// Directory whose scoped handle posted the action `msg` answers
    ///
    /// Known until a Done or Unsupported for the action has been processed.
    /// An Error keeps it: batches report one Error per failing uid and carry
    /// on. An action that fails with nothing but an Error keeps its entry.
    pub fn origin(&self, msg: &EventMessage) -> Option<DirectoryName> {
        let request = msg.in_response_to()?;
        lock(&self.callbacks).origins.get(&request).cloned()
    }

    /// Invoke the callback registered for the action this event answers
    ///
    /// Terminal events deregister the callback before it runs. Events for
    /// untracked actions (no callback, self-chained, unsolicited) are a no-op
    /// here; they still reach the default observer.
    pub fn process_event(&self, msg: &EventMessage) {
        let Some(request) = msg.in_response_to() else {
            return;
        };

        let callback = {
            let mut table = lock(&self.callbacks);
            if msg.body().is_terminal() {
                if !matches!(msg.body(), Event::Error(_)) {
                    table.origins.remove(&request);
                }
                table.callbacks.remove(&request)
            } else {
                table.callbacks.get(&request).cloned()
            }
        };

        match callback {
            Some(cb) => cb(msg),
            None => trace!("No callback for {} ({})", request, msg.body().name()),
        }
    }
}

/// Backend end of the pair
pub struct BackendChannel {
    actions: ActionReceiver,
    events: EventSender,
}

impl BackendChannel {
    pub async fn next_action(&mut self) -> Option<ActionMessage> {
        self.actions.recv().await
    }

    /// Post an unsolicited event
    pub fn post_event(&self, event: Event) -> MessageId {
        self.events.post(event)
    }

    /// Post an event answering `request`
    pub fn reply(&self, request: &ActionMessage, event: Event) -> MessageId {
        self.events.reply(request, event)
    }

    /// A sender for helper tasks
    pub fn events(&self) -> EventSender {
        self.events.clone()
    }

    pub fn split(self) -> (ActionReceiver, EventSender) {
        (self.actions, self.events)
    }
}

pub struct ActionReceiver {
    rx: UnboundedReceiver<ActionMessage>,
}

impl ActionReceiver {
    pub async fn recv(&mut self) -> Option<ActionMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ActionMessage> {
        self.rx.try_recv().ok()
    }
}

/// Cloneable event poster
#[derive(Clone)]
pub struct EventSender {
    tx: UnboundedSender<EventMessage>,
}

impl EventSender {
    pub fn post(&self, event: Event) -> MessageId {
        self.send(WorkerMessage::stamp(event, None))
    }

    pub fn reply(&self, request: &ActionMessage, event: Event) -> MessageId {
        self.reply_to(request.id(), event)
    }

    pub fn reply_to(&self, request: MessageId, event: Event) -> MessageId {
        self.send(WorkerMessage::stamp(event, Some(request)))
    }

    fn send(&self, msg: EventMessage) -> MessageId {
        let id = msg.id();
        trace!(
            "PostMessage {} {} (in response to {:?})",
            id,
            msg.body().name(),
            msg.in_response_to()
        );
        if self.tx.send(msg).is_err() {
            debug!("Dropping event {}: interactive side has gone away", id);
        }
        id
    }
}
