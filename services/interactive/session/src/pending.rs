//! Outstanding calls and frames waiting for the next open connection.
//!
//! Everything here is plain data; the engine mutates it under its state lock.

use interactive_wire::{Method, Reply};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::SocketError;

/// Outcome delivered to the waiting `execute` call
pub type CallResult = Result<Value, SocketError>;

/// A method awaiting its reply
#[derive(Debug)]
pub struct PendingCall {
    /// Method name, kept for error messages
    pub method: String,
    /// Encoded frame, resent verbatim after a reconnect
    pub frame: String,
    /// Whether the frame went out on some connection
    pub sent: bool,
    /// How many times the frame was sent again after a reconnect
    pub resent: u32,
    completion: oneshot::Sender<CallResult>,
}

impl PendingCall {
    /// Create an unsent call
    pub fn new(method: &Method, frame: String, completion: oneshot::Sender<CallResult>) -> Self {
        Self {
            method: method.method.clone(),
            frame,
            sent: false,
            resent: 0,
            completion,
        }
    }

    /// Hand the outcome to the caller; a caller that went away is fine
    pub fn settle(self, result: CallResult) {
        let _ = self.completion.send(result);
    }
}

/// Retry queue plus buffered fire-and-forget frames, both keyed by id
#[derive(Debug, Default)]
pub struct PendingTable {
    calls: BTreeMap<u64, PendingCall>,
    deferred: BTreeMap<u64, String>,
}

impl PendingTable {
    /// Queue a call
    pub fn insert(&mut self, id: u64, call: PendingCall) {
        self.calls.insert(id, call);
    }

    /// Buffer a fire-and-forget frame until the next open
    pub fn defer(&mut self, id: u64, frame: String) {
        self.deferred.insert(id, frame);
    }

    /// Flag a call as written to the current connection
    pub fn mark_sent(&mut self, id: u64) {
        if let Some(call) = self.calls.get_mut(&id) {
            call.sent = true;
        }
    }

    /// Remove a call without settling it
    pub fn remove(&mut self, id: u64) -> Option<PendingCall> {
        self.calls.remove(&id)
    }

    /// Settle the call a reply answers; false when no call has that id
    pub fn settle(&mut self, reply: Reply) -> bool {
        match self.calls.remove(&reply.id) {
            Some(call) => {
                debug!("Reply for {} (id {}) after {} resends", call.method, reply.id, call.resent);
                call.settle(reply.into_result().map_err(SocketError::RemoteMethod));
                true
            }
            None => false,
        }
    }

    /// Frames to write on a fresh connection, in id order.
    ///
    /// Drains the fire-and-forget buffer and marks every call as sent,
    /// counting a resend for calls that were already out once.
    pub fn replay(&mut self) -> Vec<(u64, String)> {
        let mut frames: Vec<(u64, String)> = Vec::with_capacity(self.calls.len() + self.deferred.len());
        for (&id, call) in self.calls.iter_mut() {
            if call.sent {
                call.resent += 1;
            }
            call.sent = true;
            frames.push((id, call.frame.clone()));
        }
        frames.extend(std::mem::take(&mut self.deferred));
        frames.sort_by_key(|(id, _)| *id);
        frames
    }

    /// Settle every call with `Cancelled` and drop buffered frames
    pub fn cancel_all(&mut self) -> usize {
        self.deferred.clear();
        let calls = std::mem::take(&mut self.calls);
        let count = calls.len();
        for (id, call) in calls {
            let method = call.method.clone();
            call.settle(Err(SocketError::Cancelled { method, id }));
        }
        count
    }

    /// Calls awaiting a reply
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Whether no call awaits a reply
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Buffered fire-and-forget frames
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Resend count of a queued call
    pub fn resent(&self, id: u64) -> Option<u32> {
        self.calls.get(&id).map(|call| call.resent)
    }
}
