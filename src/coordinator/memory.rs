//! In-process coordinator backend.
//!
//! A [`MemoryCluster`] holds the shared node tree; each
//! [`MemorySession`] is an independent [`Coordinator`] handle with its
//! own session, so ephemeral-node and session-expiry semantics can be
//! exercised across several "processes" inside one test or embedded
//! deployment. [`MemorySession::expire`] simulates a process losing its
//! session: its ephemeral nodes vanish and watchers are notified.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use super::{Coordinator, CoordinatorError, CoordinatorResult, CreateMode, VersionedData};

const WATCH_CHANNEL_CAPACITY: usize = 256;
const SEQUENCE_WIDTH: usize = 10;

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    version: i64,
    ephemeral_owner: Option<u64>,
}

#[derive(Debug, Default)]
struct StoreState {
    /// Full path -> node. BTreeMap keeps children listings sorted and
    /// lets them be produced with a range scan.
    nodes: BTreeMap<String, Node>,
    /// Per-parent monotonic counters for sequential creation.
    counters: HashMap<String, u64>,
    watches: HashMap<String, broadcast::Sender<()>>,
    next_session_id: u64,
}

#[derive(Debug, Default)]
struct Store {
    state: Mutex<StoreState>,
}

impl Store {
    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        // Mutations keep the maps consistent at every await-free step,
        // so a poisoned lock is still safe to recover.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn notify(&self, parent: &str) {
        let sender = {
            let state = self.lock();
            state.watches.get(parent).cloned()
        };
        if let Some(sender) = sender {
            // No receivers is fine; the watch is a hint, not a queue.
            let _ = sender.send(());
        }
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

fn validate_path(path: &str) -> CoordinatorResult<()> {
    if path.starts_with('/') && path.len() > 1 && !path.ends_with('/') {
        Ok(())
    } else {
        Err(CoordinatorError::ConnectionLoss(format!(
            "invalid path: {path}"
        )))
    }
}

/// The shared store backing a set of [`MemorySession`] handles.
#[derive(Debug, Clone, Default)]
pub struct MemoryCluster {
    store: Arc<Store>,
}

impl MemoryCluster {
    /// Creates an empty cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new session against this cluster.
    #[must_use]
    pub fn session(&self) -> MemorySession {
        let session_id = {
            let mut state = self.store.lock();
            state.next_session_id += 1;
            state.next_session_id
        };
        MemorySession {
            inner: Arc::new(SessionInner {
                store: Arc::clone(&self.store),
                session_id,
                expired: AtomicBool::new(false),
            }),
        }
    }
}

#[derive(Debug)]
struct SessionInner {
    store: Arc<Store>,
    session_id: u64,
    expired: AtomicBool,
}

impl SessionInner {
    fn expire(&self) {
        if self.expired.swap(true, Ordering::SeqCst) {
            return;
        }
        let removed_parents: Vec<String> = {
            let mut state = self.store.lock();
            let doomed: Vec<String> = state
                .nodes
                .iter()
                .filter(|(_, node)| node.ephemeral_owner == Some(self.session_id))
                .map(|(path, _)| path.clone())
                .collect();
            for path in &doomed {
                state.nodes.remove(path);
            }
            doomed
                .iter()
                .map(|path| parent_of(path).to_string())
                .collect()
        };
        for parent in removed_parents {
            self.store.notify(&parent);
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.expire();
    }
}

/// One session handle onto a [`MemoryCluster`].
#[derive(Debug, Clone)]
pub struct MemorySession {
    inner: Arc<SessionInner>,
}

impl MemorySession {
    /// Expires this session: every ephemeral node it created is removed
    /// and further operations fail with
    /// [`CoordinatorError::SessionExpired`]. Used to simulate process
    /// death.
    pub fn expire(&self) {
        self.inner.expire();
    }

    fn check_alive(&self) -> CoordinatorResult<()> {
        if self.inner.expired.load(Ordering::SeqCst) {
            Err(CoordinatorError::SessionExpired)
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl Coordinator for MemorySession {
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> CoordinatorResult<String> {
        self.check_alive()?;
        validate_path(path)?;

        let (actual_path, parent) = {
            let mut state = self.inner.store.lock();

            let actual_path = if mode.is_sequential() {
                let parent = parent_of(path).to_string();
                let counter = state.counters.entry(parent).or_insert(0);
                let seq = *counter;
                *counter += 1;
                format!("{}{:0width$}", path, seq, width = SEQUENCE_WIDTH)
            } else {
                if state.nodes.contains_key(path) {
                    return Err(CoordinatorError::AlreadyExists {
                        path: path.to_string(),
                    });
                }
                path.to_string()
            };

            // Create missing ancestors as persistent empty nodes.
            let mut ancestor = parent_of(&actual_path).to_string();
            let mut missing = Vec::new();
            while ancestor != "/" && !state.nodes.contains_key(&ancestor) {
                missing.push(ancestor.clone());
                ancestor = parent_of(&ancestor).to_string();
            }
            for ancestor in missing.into_iter().rev() {
                state.nodes.insert(
                    ancestor,
                    Node {
                        data: Vec::new(),
                        version: 0,
                        ephemeral_owner: None,
                    },
                );
            }

            let ephemeral_owner = mode.is_ephemeral().then_some(self.inner.session_id);
            state.nodes.insert(
                actual_path.clone(),
                Node {
                    data,
                    version: 0,
                    ephemeral_owner,
                },
            );

            let parent = parent_of(&actual_path).to_string();
            (actual_path, parent)
        };

        self.inner.store.notify(&parent);
        Ok(actual_path)
    }

    async fn get(&self, path: &str) -> CoordinatorResult<VersionedData> {
        self.check_alive()?;
        let state = self.inner.store.lock();
        state
            .nodes
            .get(path)
            .map(|node| VersionedData {
                data: node.data.clone(),
                version: node.version,
            })
            .ok_or_else(|| CoordinatorError::NotFound {
                path: path.to_string(),
            })
    }

    async fn set(
        &self,
        path: &str,
        data: Vec<u8>,
        expected_version: Option<i64>,
    ) -> CoordinatorResult<i64> {
        self.check_alive()?;
        let new_version = {
            let mut state = self.inner.store.lock();
            let node = state
                .nodes
                .get_mut(path)
                .ok_or_else(|| CoordinatorError::NotFound {
                    path: path.to_string(),
                })?;
            if let Some(expected) = expected_version {
                if node.version != expected {
                    return Err(CoordinatorError::VersionMismatch {
                        path: path.to_string(),
                        expected,
                        actual: node.version,
                    });
                }
            }
            node.data = data;
            node.version += 1;
            node.version
        };
        self.inner.store.notify(parent_of(path));
        Ok(new_version)
    }

    async fn delete(&self, path: &str) -> CoordinatorResult<()> {
        self.check_alive()?;
        {
            let mut state = self.inner.store.lock();
            if state.nodes.remove(path).is_none() {
                return Err(CoordinatorError::NotFound {
                    path: path.to_string(),
                });
            }
        }
        self.inner.store.notify(parent_of(path));
        Ok(())
    }

    async fn exists(&self, path: &str) -> CoordinatorResult<bool> {
        self.check_alive()?;
        let state = self.inner.store.lock();
        Ok(state.nodes.contains_key(path))
    }

    async fn children(&self, path: &str) -> CoordinatorResult<Vec<String>> {
        self.check_alive()?;
        let prefix = format!("{path}/");
        let state = self.inner.store.lock();
        let names = state
            .nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect();
        Ok(names)
    }

    fn watch_children(&self, path: &str) -> broadcast::Receiver<()> {
        let mut state = self.inner.store.lock();
        state
            .watches
            .entry(path.to_string())
            .or_insert_with(|| broadcast::channel(WATCH_CHANNEL_CAPACITY).0)
            .subscribe()
    }
}
