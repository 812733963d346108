use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::errors::{BridgeError, ProtocolError, Result};
use crate::services::session::{is_lifecycle_operation, CallArgs, ProtocolSession};

const NOT_CONNECTED: &str = "protocol session not connected";
const QUEUE_CLOSED: &str = "call dispatcher closed";
const HOOK_ABORTED: &str = "history hook aborted";

type CallResult = std::result::Result<Value, ProtocolError>;
type PendingReply = std::result::Result<oneshot::Receiver<CallResult>, ProtocolError>;

/// What happens to a protocol failure at the dispatcher boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log the failure and resolve to [`CallOutcome::Absorbed`].
    Absorb,
    /// Return the failure to the caller as an error.
    Propagate,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CallOutcome {
    Completed(Value),
    Absorbed(ProtocolError),
}

impl CallOutcome {
    pub fn value(&self) -> Option<&Value> {
        match self {
            CallOutcome::Completed(value) => Some(value),
            CallOutcome::Absorbed(_) => None,
        }
    }

    /// The call result, or `Null` for an absorbed failure.
    pub fn into_value(self) -> Value {
        match self {
            CallOutcome::Completed(value) => value,
            CallOutcome::Absorbed(_) => Value::Null,
        }
    }

    pub fn is_absorbed(&self) -> bool {
        matches!(self, CallOutcome::Absorbed(_))
    }
}

/// State carried from [`CallHook::before`] to [`CallHook::after`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HookContext {
    pub operation: String,
    /// Arguments as forwarded to the session.
    pub args: CallArgs,
    pub username: Option<String>,
}

/// Side effects attached to a named operation.
#[async_trait]
pub trait CallHook: Send + Sync {
    /// Runs before the call is queued. May strip hook-only arguments from
    /// `args`; whatever remains is forwarded to the session.
    fn before(&self, operation: &str, args: &mut CallArgs) -> HookContext;

    /// Runs after the call settles, successful or not.
    async fn after(
        &self,
        context: HookContext,
        outcome: &std::result::Result<Value, ProtocolError>,
    ) -> Result<()>;
}

/// Operation name to hook mapping consulted on every submission.
#[derive(Clone, Default)]
pub struct DispatchTable {
    hooks: HashMap<String, Arc<dyn CallHook>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, operation: &str, hook: Arc<dyn CallHook>) {
        self.hooks.insert(operation.to_string(), hook);
    }

    pub fn with(mut self, operation: &str, hook: Arc<dyn CallHook>) -> Self {
        self.register(operation, hook);
        self
    }

    pub fn get(&self, operation: &str) -> Option<&Arc<dyn CallHook>> {
        self.hooks.get(operation)
    }

    pub fn is_tracked(&self, operation: &str) -> bool {
        self.hooks.contains_key(operation)
    }
}

struct QueuedCall {
    operation: String,
    args: CallArgs,
    queued_at: Instant,
    reply: oneshot::Sender<CallResult>,
}

/// Funnels every protocol call through one FIFO queue drained by a single
/// worker task, so calls never overlap on the session.
#[derive(Clone)]
pub struct CallDispatcher {
    session: Arc<dyn ProtocolSession>,
    queue: mpsc::UnboundedSender<QueuedCall>,
    table: Arc<DispatchTable>,
    pending: Arc<AtomicUsize>,
    runtime: tokio::runtime::Handle,
}

impl CallDispatcher {
    /// Spawns the queue worker on the current tokio runtime. The worker
    /// drains what is already queued and exits once every handle is dropped.
    pub fn new(session: Arc<dyn ProtocolSession>, table: DispatchTable) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            BridgeError::Config("call dispatcher requires a tokio runtime".to_string())
        })?;
        let (queue, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));

        runtime.spawn(run_queue(session.clone(), rx, pending.clone()));

        Ok(Self {
            session,
            queue,
            table: Arc::new(table),
            pending,
            runtime,
        })
    }

    /// Calls queued or executing.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_tracked(&self, operation: &str) -> bool {
        self.table.is_tracked(operation)
    }

    /// Submits with the default policy: tracked calls propagate failures,
    /// generic calls absorb them.
    pub async fn call(&self, operation: &str, args: CallArgs) -> Result<CallOutcome> {
        let policy = if self.is_tracked(operation) {
            FailurePolicy::Propagate
        } else {
            FailurePolicy::Absorb
        };
        self.submit(operation, args, policy).await
    }

    pub async fn submit(
        &self,
        operation: &str,
        mut args: CallArgs,
        policy: FailurePolicy,
    ) -> Result<CallOutcome> {
        if is_lifecycle_operation(operation) {
            tracing::debug!("lifecycle call bypasses queue operation={}", operation);
            let result = self.session.invoke(operation, args).await;
            return settle(operation, result, policy);
        }

        let hook = self.table.get(operation).cloned();
        let context = hook.as_ref().map(|hook| hook.before(operation, &mut args));

        let alive = self.session.is_alive();
        let reply = if alive {
            // Enqueued before the first await so submission order is queue order.
            self.enqueue(operation, args)
        } else {
            Err(ProtocolError::new(operation, NOT_CONNECTED))
        };

        let result = match (hook, context) {
            (Some(hook), Some(context)) => {
                let (result, recorded) = self.run_tracked(operation, hook, context, reply).await;
                recorded?;
                result
            }
            _ => await_reply(operation, reply).await,
        };

        if !alive && policy == FailurePolicy::Propagate {
            tracing::warn!("rejecting {} while session is not connected", operation);
            return Err(BridgeError::NotConnected);
        }
        settle(operation, result, policy)
    }

    /// Awaits the reply and runs the hook on a detached task, so history is
    /// written even when the caller stops waiting on the call.
    async fn run_tracked(
        &self,
        operation: &str,
        hook: Arc<dyn CallHook>,
        context: HookContext,
        reply: PendingReply,
    ) -> (CallResult, Result<()>) {
        let (done, settled) = oneshot::channel();
        let owned = operation.to_string();
        self.runtime.spawn(async move {
            let result = await_reply(&owned, reply).await;
            let recorded = hook.after(context, &result).await;
            if done.send((result, recorded)).is_err() {
                tracing::debug!("caller left before {} settled", owned);
            }
        });
        settled
            .await
            .unwrap_or_else(|_| (Err(ProtocolError::new(operation, HOOK_ABORTED)), Ok(())))
    }

    fn enqueue(&self, operation: &str, args: CallArgs) -> PendingReply {
        let (reply, rx) = oneshot::channel();
        self.pending.fetch_add(1, Ordering::SeqCst);
        let call = QueuedCall {
            operation: operation.to_string(),
            args,
            queued_at: Instant::now(),
            reply,
        };
        if self.queue.send(call).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(ProtocolError::new(operation, QUEUE_CLOSED));
        }
        Ok(rx)
    }
}

async fn await_reply(operation: &str, reply: PendingReply) -> CallResult {
    match reply {
        Ok(rx) => rx
            .await
            .unwrap_or_else(|_| Err(ProtocolError::new(operation, QUEUE_CLOSED))),
        Err(err) => Err(err),
    }
}

async fn run_queue(
    session: Arc<dyn ProtocolSession>,
    mut rx: mpsc::UnboundedReceiver<QueuedCall>,
    pending: Arc<AtomicUsize>,
) {
    while let Some(call) = rx.recv().await {
        let started = Instant::now();
        let result = session.invoke(&call.operation, call.args).await;
        pending.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(
            "dispatched operation={} waited_ms={} took_ms={} ok={}",
            call.operation,
            started.duration_since(call.queued_at).as_millis(),
            started.elapsed().as_millis(),
            result.is_ok()
        );
        // The caller may have gone away; the call still ran in order.
        let _ = call.reply.send(result);
    }
    tracing::debug!("call dispatcher queue closed");
}

fn settle(
    operation: &str,
    result: std::result::Result<Value, ProtocolError>,
    policy: FailurePolicy,
) -> Result<CallOutcome> {
    match result {
        Ok(value) => Ok(CallOutcome::Completed(value)),
        Err(err) => match policy {
            FailurePolicy::Absorb => {
                tracing::warn!("protocol call absorbed operation={} error={}", operation, err);
                Ok(CallOutcome::Absorbed(err))
            }
            FailurePolicy::Propagate => {
                tracing::warn!("protocol call failed operation={} error={}", operation, err);
                Err(BridgeError::Protocol(err))
            }
        },
    }
}
