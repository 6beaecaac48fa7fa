//! Caller-side handle for a live subscription.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::connection::ConnCmd;
use crate::error::{HassLinkError, Result};

/// Handle returned by [`Connection::subscribe_message`](crate::Connection::subscribe_message).
///
/// The handle is stable across reconnects: the subscription is re-issued on
/// every new socket under a fresh command id, and [`unsubscribe`] always
/// targets the current one.  Dropping the handle does not unsubscribe; the
/// subscription lives until [`unsubscribe`] or the connection closes.
///
/// [`unsubscribe`]: Subscription::unsubscribe
#[must_use = "dropping a Subscription keeps it active with no way to cancel it"]
#[derive(Clone)]
pub struct Subscription {
    key: u64,
    cmd_tx: mpsc::Sender<ConnCmd>,
    active: Arc<AtomicBool>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Subscription {
    pub(crate) fn new(key: u64, cmd_tx: mpsc::Sender<ConnCmd>) -> Self {
        Self {
            key,
            cmd_tx,
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Stable subscription key, as listed by
    /// [`Connection::list_subscriptions`](crate::Connection::list_subscriptions).
    pub fn id(&self) -> u64 {
        self.key
    }

    /// `false` once [`unsubscribe`](Self::unsubscribe) has been called on
    /// this handle or one of its clones.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Cancel the subscription.
    ///
    /// Sends `unsubscribe_events` for the subscription's current command id
    /// and waits for the server's answer.  Only the first call does anything.
    /// If the socket is down or the connection closed, the subscription is
    /// simply forgotten.
    pub async fn unsubscribe(&self) -> Result<()> {
        if !self.active.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let (reply, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(ConnCmd::Unsubscribe {
                key: self.key,
                reply,
            })
            .await
            .is_err()
        {
            return Ok(());
        }

        match reply_rx.await {
            Ok(Ok(_)) | Err(_) => Ok(()),
            Ok(Err(HassLinkError::ConnectionLost | HassLinkError::Closed)) => Ok(()),
            Ok(Err(e)) => Err(e),
        }
    }
}
