use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::errors::ProtocolError;
use crate::services::session::{CallArgs, ProtocolSession};

#[derive(Clone, Debug)]
pub struct CallWindow {
    pub operation: String,
    pub args: CallArgs,
    pub started: Instant,
    pub finished: Instant,
}

/// In-process stand-in for the daemon connection. Operations listed in
/// `failing` return a protocol error; everything else echoes its arguments
/// unless a canned response is registered.
pub struct ScriptedSession {
    alive: AtomicBool,
    delay: Duration,
    delays: Mutex<HashMap<String, Duration>>,
    failing: Mutex<Vec<String>>,
    responses: Mutex<HashMap<String, Value>>,
    calls: Mutex<Vec<CallWindow>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedSession {
    pub fn new(delay: Duration) -> Self {
        Self {
            alive: AtomicBool::new(true),
            delay,
            delays: Mutex::new(HashMap::new()),
            failing: Mutex::new(Vec::new()),
            responses: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn fail_on(&self, operation: &str) {
        self.failing
            .lock()
            .expect("failing lock")
            .push(operation.to_string());
    }

    pub fn respond(&self, operation: &str, value: Value) {
        self.responses
            .lock()
            .expect("responses lock")
            .insert(operation.to_string(), value);
    }

    pub fn delay_for(&self, operation: &str, delay: Duration) {
        self.delays
            .lock()
            .expect("delays lock")
            .insert(operation.to_string(), delay);
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<CallWindow> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProtocolSession for ScriptedSession {
    async fn invoke(&self, operation: &str, args: CallArgs) -> Result<Value, ProtocolError> {
        let started = Instant::now();
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        let delay = self
            .delays
            .lock()
            .expect("delays lock")
            .get(operation)
            .copied()
            .unwrap_or(self.delay);
        tokio::time::sleep(delay).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.calls.lock().expect("calls lock").push(CallWindow {
            operation: operation.to_string(),
            args: args.clone(),
            started,
            finished: Instant::now(),
        });

        if self
            .failing
            .lock()
            .expect("failing lock")
            .iter()
            .any(|name| name == operation)
        {
            return Err(ProtocolError::new(operation, "scripted failure"));
        }
        if let Some(value) = self.responses.lock().expect("responses lock").get(operation) {
            return Ok(value.clone());
        }
        Ok(json!({ "operation": operation, "args": args }))
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}
