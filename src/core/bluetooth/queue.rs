//! Serialized GATT action queue
//! Only one GATT operation may be outstanding per device, so every read and
//! write goes through this FIFO with a single in-flight slot.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use tokio::sync::oneshot;
use uuid::Uuid;

pub type ActionId = u64;

/// Invoked exactly once with the result, or `None` on timeout or failure.
pub type ActionCallback = Box<dyn FnOnce(Option<Vec<u8>>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Read,
    Write,
    /// A write that only completes once a notification arrives on the given
    /// characteristic; some firmware acks the write before answering.
    WriteThenAwaitNotification(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionTarget {
    Characteristic {
        service: Uuid,
        characteristic: Uuid,
    },
    Descriptor {
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    },
}

/// What the transport has to perform for an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub id: ActionId,
    pub kind: ActionKind,
    pub target: ActionTarget,
    pub payload: Option<Vec<u8>>,
}

/// A single requested GATT operation.
pub struct Action {
    pub id: ActionId,
    pub kind: ActionKind,
    pub target: ActionTarget,
    pub payload: Option<Vec<u8>>,
    pub timeout: Duration,
    callback: Option<ActionCallback>,
    /// Set once the transport acknowledged an awaiting write
    written: bool,
    /// Notification that overtook the write acknowledgement
    early_reply: Option<Vec<u8>>,
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("target", &self.target)
            .field("payload", &self.payload.as_deref().map(hex::encode))
            .field("timeout", &self.timeout)
            .field("has_callback", &self.callback.is_some())
            .field("written", &self.written)
            .finish()
    }
}

impl Action {
    pub fn new(
        id: ActionId,
        kind: ActionKind,
        target: ActionTarget,
        payload: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Self {
        Self {
            id,
            kind,
            target,
            payload,
            timeout,
            callback: None,
            written: false,
            early_reply: None,
        }
    }

    pub fn with_callback(mut self, callback: impl FnOnce(Option<Vec<u8>>) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Attaches a oneshot and returns a handle that resolves with the result.
    pub fn with_handle(self) -> (Self, ActionHandle) {
        let (tx, rx) = oneshot::channel();
        let id = self.id;
        let action = self.with_callback(move |value| {
            let _ = tx.send(value);
        });
        (action, ActionHandle { id, rx })
    }

    pub fn operation(&self) -> Operation {
        Operation {
            id: self.id,
            kind: self.kind,
            target: self.target,
            payload: self.payload.clone(),
        }
    }

    fn finish(mut self, value: Option<Vec<u8>>) {
        if let Some(callback) = self.callback.take() {
            callback(value);
        }
    }
}

/// Awaitable result of a queued action.
///
/// Always resolves: with the data on success, `None` on timeout, failure,
/// or when the connection is torn down with the action still queued.
#[derive(Debug)]
pub struct ActionHandle {
    id: ActionId,
    rx: oneshot::Receiver<Option<Vec<u8>>>,
}

impl ActionHandle {
    pub fn id(&self) -> ActionId {
        self.id
    }

    pub async fn wait(self) -> Option<Vec<u8>> {
        self.rx.await.ok().flatten()
    }
}

/// FIFO of pending actions plus the one in flight.
#[derive(Debug, Default)]
pub struct ActionQueue {
    pending: VecDeque<Action>,
    current: Option<Action>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> Option<ActionId> {
        self.current.as_ref().map(|a| a.id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none() && self.pending.is_empty()
    }

    /// Appends an action. Returns the operation to start if the queue was idle.
    pub fn push(&mut self, action: Action) -> Option<Operation> {
        self.pending.push_back(action);
        if self.current.is_none() {
            self.advance()
        } else {
            None
        }
    }

    fn advance(&mut self) -> Option<Operation> {
        self.current = self.pending.pop_front();
        self.current.as_ref().map(Action::operation)
    }

    pub fn contains(&self, id: ActionId) -> bool {
        self.in_flight() == Some(id) || self.pending.iter().any(|a| a.id == id)
    }

    /// The transport finished operation `id`; `None` means it failed.
    ///
    /// Stale ids (already aborted) are ignored. A successful write that
    /// awaits a notification stays in flight until the notification arrives.
    pub fn complete(&mut self, id: ActionId, result: Option<Vec<u8>>) -> Option<Operation> {
        let current = self.current.as_mut().filter(|a| a.id == id)?;
        if matches!(current.kind, ActionKind::WriteThenAwaitNotification(_)) && result.is_some() {
            match current.early_reply.take() {
                Some(reply) => return self.finish_current(Some(reply)),
                None => {
                    current.written = true;
                    return None;
                }
            }
        }
        self.finish_current(result)
    }

    /// A notification arrived; completes an in-flight action waiting on it.
    ///
    /// If the write has not been acknowledged yet the value is held back, so
    /// the next operation never starts while the transport is still busy.
    pub fn notification(&mut self, characteristic: Uuid, value: &[u8]) -> Option<Operation> {
        let current = self
            .current
            .as_mut()
            .filter(|a| a.kind == ActionKind::WriteThenAwaitNotification(characteristic))?;
        if !current.written {
            if current.early_reply.is_none() {
                current.early_reply = Some(value.to_vec());
            }
            return None;
        }
        self.finish_current(Some(value.to_vec()))
    }

    fn finish_current(&mut self, value: Option<Vec<u8>>) -> Option<Operation> {
        if let Some(action) = self.current.take() {
            action.finish(value);
        }
        self.advance()
    }

    /// Aborts a queued or in-flight action, invoking its callback with `None`.
    /// Returns the next operation to start when the in-flight one was aborted.
    pub fn abort(&mut self, id: ActionId) -> Option<Operation> {
        if let Some(pos) = self.pending.iter().position(|a| a.id == id) {
            if let Some(action) = self.pending.remove(pos) {
                action.finish(None);
            }
            return None;
        }
        let action = self.current.take_if(|a| a.id == id)?;
        action.finish(None);
        self.advance()
    }

    /// Drops every queued action without invoking callbacks. The in-flight
    /// action is left to finish or time out.
    pub fn clear_pending(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }
}
