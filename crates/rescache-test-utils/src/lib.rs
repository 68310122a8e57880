//! Testing utilities for the rescache workspace
//!
//! Scripted collaborators and fixture entities shared by the integration
//! tests.

#![allow(missing_docs)]

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use rescache_core::{
    CacheKey, ConditionProvider, ConditionState, Conflict, ConflictResolver, Decision, Entity, EntityId, Network,
    PushEvent, PushSource, TransportError, TreePath,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: EntityId,
    pub name: String,
}

impl Project {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: EntityId::new(id).unwrap(),
            name: name.to_string(),
        }
    }

    pub fn json(id: &str, name: &str) -> Value {
        json!({ "id": id, "name": name })
    }
}

impl Entity for Project {
    fn cache_key(&self) -> CacheKey {
        CacheKey::Entity(self.id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: EntityId,
}

impl User {
    pub fn new(id: &str) -> Self {
        Self {
            id: EntityId::new(id).unwrap(),
        }
    }
}

impl Entity for User {
    fn cache_key(&self) -> CacheKey {
        CacheKey::Entity(self.id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub path: TreePath,
    #[serde(default)]
    pub size: u64,
}

impl FileNode {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.parse().unwrap(),
            size: 0,
        }
    }

    pub fn json(path: &str) -> Value {
        json!({ "path": path, "size": 0 })
    }
}

impl Entity for FileNode {
    fn cache_key(&self) -> CacheKey {
        CacheKey::Path(self.path.clone())
    }
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

/// Network returning canned responses
///
/// Responses are looked up by operation and exact params first, then by
/// operation alone, when the call starts. Calls can be held at a gate until
/// the test releases them.
#[derive(Debug)]
pub struct ScriptedNetwork {
    responses: Mutex<HashMap<(String, Option<String>), Result<Value, TransportError>>>,
    log: Mutex<Vec<(String, Value)>>,
    calls: watch::Sender<usize>,
    gate: watch::Sender<bool>,
}

impl Default for ScriptedNetwork {
    fn default() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            calls: watch::channel(0).0,
            gate: watch::channel(true).0,
        }
    }
}

impl ScriptedNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer every call of `operation`
    pub fn respond(&self, operation: &str, result: Value) {
        self.responses.lock().insert((operation.to_string(), None), Ok(result));
    }

    /// Answer calls of `operation` made with exactly `params`
    pub fn respond_to(&self, operation: &str, params: Value, result: Value) {
        self.responses
            .lock()
            .insert((operation.to_string(), Some(params.to_string())), Ok(result));
    }

    /// Fail every call of `operation`
    pub fn fail(&self, operation: &str, message: &str) {
        self.responses
            .lock()
            .insert((operation.to_string(), None), Err(TransportError::remote(operation, message)));
    }

    /// Hold calls until [`ScriptedNetwork::release`]
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    /// Calls started so far
    pub fn calls(&self) -> usize {
        *self.calls.borrow()
    }

    pub fn calls_to(&self, operation: &str) -> usize {
        self.log.lock().iter().filter(|(op, _)| op == operation).count()
    }

    pub fn log(&self) -> Vec<(String, Value)> {
        self.log.lock().clone()
    }

    /// Wait until at least `n` calls have started
    pub async fn wait_for_calls(&self, n: usize) {
        let mut rx = self.calls.subscribe();
        let _ = rx.wait_for(|c| *c >= n).await;
    }
}

#[async_trait]
impl Network for ScriptedNetwork {
    async fn call(&self, operation: &str, params: Value) -> Result<Value, TransportError> {
        let result = {
            let responses = self.responses.lock();
            responses
                .get(&(operation.to_string(), Some(params.to_string())))
                .or_else(|| responses.get(&(operation.to_string(), None)))
                .cloned()
                .unwrap_or_else(|| Err(TransportError::remote(operation, "no scripted response")))
        };
        self.log.lock().push((operation.to_string(), params));
        self.calls.send_modify(|c| *c += 1);

        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        result
    }
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// Condition provider with states set by the test
#[derive(Debug)]
pub struct StaticConditions {
    states: Mutex<HashMap<String, ConditionState>>,
    fallback: ConditionState,
    updates: Mutex<Option<watch::Sender<u64>>>,
}

impl StaticConditions {
    /// Provider answering `fallback` for every unknown condition
    pub fn new(fallback: ConditionState) -> Arc<Self> {
        Arc::new(Self {
            states: Mutex::new(HashMap::new()),
            fallback,
            updates: Mutex::new(Some(watch::channel(0).0)),
        })
    }

    pub fn set_state(&self, condition: &str, state: ConditionState) {
        self.states.lock().insert(condition.to_string(), state);
        if let Some(tx) = self.updates.lock().as_ref() {
            tx.send_modify(|n| *n += 1);
        }
    }

    /// Stop publishing updates
    pub fn close(&self) {
        self.updates.lock().take();
    }
}

impl ConditionProvider for StaticConditions {
    fn check(&self, condition: &str) -> ConditionState {
        self.states.lock().get(condition).copied().unwrap_or(self.fallback)
    }

    fn updates(&self) -> watch::Receiver<u64> {
        match self.updates.lock().as_ref() {
            Some(tx) => tx.subscribe(),
            None => watch::channel(0).1,
        }
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Resolver recording every conflict it is asked about
#[derive(Debug)]
pub struct RecordingResolver {
    decision: Mutex<Decision>,
    seen: Mutex<Vec<Conflict>>,
}

impl RecordingResolver {
    pub fn new(decision: Decision) -> Arc<Self> {
        Arc::new(Self {
            decision: Mutex::new(decision),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn set_decision(&self, decision: Decision) {
        *self.decision.lock() = decision;
    }

    pub fn conflicts(&self) -> Vec<Conflict> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl ConflictResolver for RecordingResolver {
    async fn resolve(&self, conflict: &Conflict) -> Decision {
        self.seen.lock().push(conflict.clone());
        *self.decision.lock()
    }
}

// ---------------------------------------------------------------------------
// Push
// ---------------------------------------------------------------------------

/// Push source fed through in-memory channels
#[derive(Debug, Default)]
pub struct ChannelPushSource {
    senders: Mutex<HashMap<String, mpsc::UnboundedSender<PushEvent>>>,
    receivers: Mutex<HashMap<String, mpsc::UnboundedReceiver<PushEvent>>>,
}

impl ChannelPushSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue an event on its topic
    pub fn push(&self, event: PushEvent) {
        let mut senders = self.senders.lock();
        let tx = senders.entry(event.topic.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            self.receivers.lock().insert(event.topic.clone(), rx);
            tx
        });
        let _ = tx.send(event);
    }

    /// End every topic stream
    pub fn close(&self) {
        self.senders.lock().clear();
    }
}

impl PushSource for ChannelPushSource {
    fn subscribe(&self, topic: &str) -> BoxStream<'static, PushEvent> {
        let rx = {
            let mut senders = self.senders.lock();
            let mut receivers = self.receivers.lock();
            match receivers.remove(topic) {
                Some(rx) => Some(rx),
                None if !senders.contains_key(topic) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    senders.insert(topic.to_string(), tx);
                    Some(rx)
                }
                None => None,
            }
        };
        match rx {
            Some(rx) => stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|event| (event, rx)) }).boxed(),
            None => stream::empty().boxed(),
        }
    }
}
