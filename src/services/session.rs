use async_trait::async_trait;
use serde_json::Value;

use crate::errors::ProtocolError;

/// Positional arguments of a protocol call.
pub type CallArgs = Vec<Value>;

pub const CONNECT: &str = "connect";
pub const DISCONNECT: &str = "disconnect";

/// The single stateful connection to the download-client daemon. The daemon
/// rejects overlapping commands, so only [`CallDispatcher`] may call
/// [`ProtocolSession::invoke`].
///
/// [`CallDispatcher`]: crate::services::CallDispatcher
#[async_trait]
pub trait ProtocolSession: Send + Sync {
    async fn invoke(&self, operation: &str, args: CallArgs) -> Result<Value, ProtocolError>;

    fn is_alive(&self) -> bool;
}

/// Calls that establish or tear down the channel the queue depends on.
pub fn is_lifecycle_operation(operation: &str) -> bool {
    matches!(operation, CONNECT | DISCONNECT)
}
