//! In-process coordination tree
//!
//! Behaves like a single coordination server shared by every "process" of a
//! test or simulation: each [`MemorySession`] is one client session, and
//! expiring it drops the ephemeral nodes it owns exactly like a real session
//! timeout would.

use crate::common::{Error, Result};
use crate::storage::{ChangeEvent, ChangeKind, CoordinationClient, CreateMode, TxnOp, Watch};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
struct Node {
    data: Bytes,
    /// Owning session for ephemeral nodes
    owner: Option<u64>,
}

#[derive(Debug, Default)]
struct TreeState {
    nodes: BTreeMap<String, Node>,
    live_sessions: HashSet<u64>,
    unavailable: bool,
}

/// Shared tree
pub struct MemoryTree {
    state: Mutex<TreeState>,
    events: broadcast::Sender<ChangeEvent>,
    next_session: AtomicU64,
}

impl MemoryTree {
    pub fn new(event_capacity: usize) -> Arc<Self> {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Arc::new(Self {
            state: Mutex::new(TreeState::default()),
            events,
            next_session: AtomicU64::new(1),
        })
    }

    /// Open a new client session.
    pub fn connect(self: &Arc<Self>) -> MemorySession {
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        self.lock().live_sessions.insert(id);
        tracing::debug!(session_id = id, "Session opened");
        MemorySession {
            tree: Arc::clone(self),
            id,
        }
    }

    /// End a session as if its process died: its ephemeral nodes are removed.
    pub fn expire_session(&self, session_id: u64) {
        let mut state = self.lock();
        if !state.live_sessions.remove(&session_id) {
            return;
        }
        let owned: Vec<String> = state
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session_id))
            .map(|(path, _)| path.clone())
            .collect();

        // Drop everything first so handlers see the final state.
        let mut events = Vec::new();
        for path in owned {
            remove_subtree(&mut state.nodes, &path, &mut events);
        }
        tracing::debug!(session_id, removed = events.len(), "Session expired");
        for event in events {
            let _ = self.events.send(event);
        }
    }

    /// Simulate losing connectivity to the coordination service.
    pub fn set_available(&self, available: bool) {
        self.lock().unavailable = !available;
    }

    /// Snapshot of every node under `prefix` (path, data).
    pub fn dump(&self, prefix: &str) -> Vec<(String, Bytes)> {
        self.lock()
            .nodes
            .iter()
            .filter(|(path, _)| super::is_under(path, prefix))
            .map(|(path, node)| (path.clone(), node.data.clone()))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, TreeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the state of a live session and publish the events it produced.
    fn mutate<T>(
        &self,
        session_id: u64,
        f: impl FnOnce(&mut BTreeMap<String, Node>, &mut Vec<ChangeEvent>) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.lock();
        check_session(&state, session_id)?;
        let mut events = Vec::new();
        let out = f(&mut state.nodes, &mut events)?;
        for event in events {
            let _ = self.events.send(event);
        }
        Ok(out)
    }

    fn read<T>(&self, session_id: u64, f: impl FnOnce(&BTreeMap<String, Node>) -> T) -> Result<T> {
        let state = self.lock();
        check_session(&state, session_id)?;
        Ok(f(&state.nodes))
    }
}

fn check_session(state: &TreeState, session_id: u64) -> Result<()> {
    if state.unavailable {
        return Err(Error::CoordinationUnavailable(
            "coordination tree unreachable".into(),
        ));
    }
    if !state.live_sessions.contains(&session_id) {
        return Err(Error::SessionExpired(session_id));
    }
    Ok(())
}

fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') || path.len() < 2 || path.ends_with('/') || path.contains("//") {
        return Err(Error::Internal(format!("invalid node path '{}'", path)));
    }
    Ok(())
}

fn ensure_parents(nodes: &mut BTreeMap<String, Node>, path: &str, events: &mut Vec<ChangeEvent>) {
    let mut end = 0;
    while let Some(pos) = path[end + 1..].find('/') {
        end += pos + 1;
        let parent = &path[..end];
        if !nodes.contains_key(parent) {
            nodes.insert(
                parent.to_string(),
                Node {
                    data: Bytes::new(),
                    owner: None,
                },
            );
            events.push(ChangeEvent {
                kind: ChangeKind::Added,
                path: parent.to_string(),
                data: Bytes::new(),
            });
        }
    }
}

fn put_node(
    nodes: &mut BTreeMap<String, Node>,
    path: &str,
    data: Bytes,
    owner: Option<u64>,
    events: &mut Vec<ChangeEvent>,
) {
    ensure_parents(nodes, path, events);
    let kind = match nodes.insert(
        path.to_string(),
        Node {
            data: data.clone(),
            owner,
        },
    ) {
        Some(_) => ChangeKind::Updated,
        None => ChangeKind::Added,
    };
    events.push(ChangeEvent {
        kind,
        path: path.to_string(),
        data,
    });
}

fn remove_subtree(
    nodes: &mut BTreeMap<String, Node>,
    path: &str,
    events: &mut Vec<ChangeEvent>,
) -> bool {
    let descendant_prefix = format!("{}/", path);
    let doomed: Vec<String> = nodes
        .range(descendant_prefix.clone()..)
        .take_while(|(p, _)| p.starts_with(&descendant_prefix))
        .map(|(p, _)| p.clone())
        .collect();

    // Children first, deepest paths sort last.
    for child in doomed.iter().rev() {
        if let Some(node) = nodes.remove(child) {
            events.push(ChangeEvent {
                kind: ChangeKind::Removed,
                path: child.clone(),
                data: node.data,
            });
        }
    }
    match nodes.remove(path) {
        Some(node) => {
            events.push(ChangeEvent {
                kind: ChangeKind::Removed,
                path: path.to_string(),
                data: node.data,
            });
            true
        }
        None => !doomed.is_empty(),
    }
}

fn children_of(nodes: &BTreeMap<String, Node>, path: &str) -> Vec<String> {
    let prefix = format!("{}/", path);
    let mut children: Vec<String> = nodes
        .range(prefix.clone()..)
        .take_while(|(p, _)| p.starts_with(&prefix))
        .filter_map(|(p, _)| {
            let rest = &p[prefix.len()..];
            (!rest.contains('/')).then(|| rest.to_string())
        })
        .collect();
    children.sort();
    children
}

/// One client session on a [`MemoryTree`].
#[derive(Clone)]
pub struct MemorySession {
    tree: Arc<MemoryTree>,
    id: u64,
}

impl MemorySession {
    /// Kill this session (process crash).
    pub fn expire(&self) {
        self.tree.expire_session(self.id);
    }
}

#[async_trait]
impl CoordinationClient for MemorySession {
    fn session_id(&self) -> u64 {
        self.id
    }

    async fn create_persistent(&self, path: &str, data: Bytes) -> Result<()> {
        validate_path(path)?;
        self.tree.mutate(self.id, |nodes, events| {
            put_node(nodes, path, data, None, events);
            Ok(())
        })
    }

    async fn create_ephemeral(&self, path: &str, data: Bytes) -> Result<()> {
        validate_path(path)?;
        let owner = Some(self.id);
        self.tree.mutate(self.id, |nodes, events| {
            put_node(nodes, path, data, owner, events);
            Ok(())
        })
    }

    async fn try_create_ephemeral(&self, path: &str, data: Bytes) -> Result<bool> {
        validate_path(path)?;
        let owner = Some(self.id);
        self.tree.mutate(self.id, |nodes, events| {
            if nodes.contains_key(path) {
                return Ok(false);
            }
            put_node(nodes, path, data, owner, events);
            Ok(true)
        })
    }

    async fn remove(&self, path: &str) -> Result<()> {
        validate_path(path)?;
        self.tree.mutate(self.id, |nodes, events| {
            remove_subtree(nodes, path, events);
            Ok(())
        })
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.tree.read(self.id, |nodes| nodes.contains_key(path))
    }

    async fn get_data(&self, path: &str) -> Result<Option<Bytes>> {
        self.tree
            .read(self.id, |nodes| nodes.get(path).map(|n| n.data.clone()))
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        self.tree.read(self.id, |nodes| children_of(nodes, path))
    }

    async fn execute_transaction(&self, ops: Vec<TxnOp>) -> Result<()> {
        for op in &ops {
            validate_path(op.path())?;
        }
        let session = self.id;
        self.tree.mutate(session, |nodes, events| {
            // Apply to a scratch copy; only a fully successful run is kept.
            let mut scratch = nodes.clone();
            let mut pending = Vec::new();
            for (index, op) in ops.into_iter().enumerate() {
                match op {
                    TxnOp::Check { path } => {
                        if !scratch.contains_key(&path) {
                            return Err(Error::TransactionAborted {
                                index,
                                reason: format!("check failed, {} missing", path),
                            });
                        }
                    }
                    TxnOp::Create { path, data, mode } => {
                        if scratch.contains_key(&path) {
                            return Err(Error::TransactionAborted {
                                index,
                                reason: format!("{} already exists", path),
                            });
                        }
                        let owner = (mode == CreateMode::Ephemeral).then_some(session);
                        put_node(&mut scratch, &path, data, owner, &mut pending);
                    }
                    TxnOp::Put { path, data, mode } => {
                        let owner = (mode == CreateMode::Ephemeral).then_some(session);
                        put_node(&mut scratch, &path, data, owner, &mut pending);
                    }
                    TxnOp::Delete { path } => {
                        if !remove_subtree(&mut scratch, &path, &mut pending) {
                            return Err(Error::TransactionAborted {
                                index,
                                reason: format!("{} does not exist", path),
                            });
                        }
                    }
                }
            }
            *nodes = scratch;
            events.extend(pending);
            Ok(())
        })
    }

    fn watch(&self, prefix: &str) -> Watch {
        Watch::new(prefix, self.tree.events.subscribe())
    }
}
