use crate::connection::ServerError;
use crate::frame::Frame;

/// Lifecycle callbacks invoked by the connection task.
///
/// Every method has a no-op default, so implementors override only the
/// events they care about. Hooks run on the task that owns the socket and
/// must return quickly; spawn a task for anything slow.
pub trait Hooks: Send + Sync + 'static {
    /// The broker answered `CONNECT` with `CONNECTED`.
    fn on_connect(&self, _frame: &Frame) {}

    /// The broker sent an `ERROR` frame, during the handshake or later.
    fn on_error(&self, _error: &ServerError) {}

    /// The connection task stopped. Not called when the handshake fails.
    fn on_disconnect(&self) {}
}

/// Hooks that ignore every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl Hooks for NoopHooks {}
