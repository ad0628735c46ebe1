use crate::connection::{ConnError, Connection};
use crate::frame::Frame;
use tokio::sync::mpsc;

/// A handle returned from `Connection::subscribe` that packages the
/// subscription id, the destination and the receiving side of the
/// subscription.
pub struct Subscription {
    id: String,
    destination: String,
    receiver: mpsc::Receiver<Frame>,
    conn: Connection,
}

impl Subscription {
    pub(crate) fn new(
        id: String,
        destination: String,
        receiver: mpsc::Receiver<Frame>,
        conn: Connection,
    ) -> Self {
        Self {
            id,
            destination,
            receiver,
            conn,
        }
    }

    /// Returns the local subscription id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the destination this subscription listens to, as sent to the
    /// broker.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Wait for the next `MESSAGE` frame. Returns `None` once the
    /// connection has stopped or the subscription was removed.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.receiver.recv().await
    }

    /// Take an already delivered `MESSAGE` without waiting.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.receiver.try_recv().ok()
    }

    /// Split the handle into its receiver and the information needed to
    /// unsubscribe later.
    pub(crate) fn into_parts(self) -> (String, String, mpsc::Receiver<Frame>, Connection) {
        (self.id, self.destination, self.receiver, self.conn)
    }

    /// Send `UNSUBSCRIBE` and stop delivery.
    pub async fn unsubscribe(self) -> Result<(), ConnError> {
        self.conn.unsubscribe(&self.id).await
    }
}
