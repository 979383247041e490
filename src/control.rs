//! Request/response mailbox for a supervisor loop
//!
//! Every control operation is a [`ControlMessage`] carrying a one-shot reply
//! slot. The receiving loop handles messages strictly one at a time and must
//! answer each one exactly once; [`ControlMessage::reply`] consumes the
//! message, so a second reply cannot be written.

use crate::error::SupervisorError;
use std::fmt;
use tokio::sync::{mpsc, oneshot};

/// Number of requests that may queue before senders wait
pub const MAILBOX_CAPACITY: usize = 32;

/// What the caller wants the loop to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Stop,
    Status,
    /// Force-stop any live process and end the loop
    Shutdown,
}

/// A single-use request
pub struct ControlMessage<R> {
    action: Action,
    reply: oneshot::Sender<R>,
}

impl<R> ControlMessage<R> {
    pub fn action(&self) -> Action {
        self.action
    }

    /// Answer the request. A caller that stopped waiting is ignored.
    pub fn reply(self, value: R) {
        let _ = self.reply.send(value);
    }
}

impl<R> fmt::Debug for ControlMessage<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlMessage")
            .field("action", &self.action)
            .finish_non_exhaustive()
    }
}

/// Create a connected sender/receiver pair
pub fn channel<R>() -> (ControlSender<R>, ControlReceiver<R>) {
    let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
    (ControlSender { tx }, ControlReceiver { rx })
}

/// Sending half; cheap to clone
pub struct ControlSender<R> {
    tx: mpsc::Sender<ControlMessage<R>>,
}

impl<R> Clone for ControlSender<R> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<R> fmt::Debug for ControlSender<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlSender")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl<R> ControlSender<R> {
    /// Send `action` and wait for the loop's answer
    pub async fn request(&self, action: Action) -> Result<R, SupervisorError> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(ControlMessage { action, reply })
            .await
            .map_err(|_| SupervisorError::LoopGone)?;
        reply_rx.await.map_err(|_| SupervisorError::LoopGone)
    }

    /// True once the receiving loop has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half, owned by the loop
pub struct ControlReceiver<R> {
    rx: mpsc::Receiver<ControlMessage<R>>,
}

impl<R> fmt::Debug for ControlReceiver<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlReceiver").finish_non_exhaustive()
    }
}

impl<R> ControlReceiver<R> {
    /// Next request, or `None` once every sender is gone
    pub async fn recv(&mut self) -> Option<ControlMessage<R>> {
        self.rx.recv().await
    }

    /// Refuse further requests. Requests already queued are dropped with
    /// the receiver, which fails their callers with `LoopGone`.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
