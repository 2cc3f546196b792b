//! Pool of reusable, sanitizable session handles.
//!
//! Resources move between three places: the free stack (LIFO, so the most
//! recently used session is reused first), the in-use map, and a transient
//! retiring state while they are being created or sanitized. Every move is a
//! short check-and-update under a std mutex; the lock is never held across a
//! call into the [`SessionFactory`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::error::PoolError;

/// Identity of a pooled resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(Uuid);

impl ResourceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ResourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0.simple().to_string();
        f.write_str(&s[..8])
    }
}

/// Where a resource currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Free,
    InUse,
    Retiring,
}

/// Creates, sanitizes and tears down sessions of type `S`.
///
/// `sanitize` clears session-local state (cookies, storage, open pages)
/// before the session goes back on the free stack. The default keeps the
/// session as-is; override it for any resource type that carries state
/// between tasks.
#[async_trait]
pub trait SessionFactory<S>: Send + Sync {
    async fn create(&self) -> anyhow::Result<S>;

    async fn sanitize(&self, _session: &S) -> anyhow::Result<()> {
        Ok(())
    }

    async fn teardown(&self, _session: &S) {}
}

/// A session checked out of the pool. Hand it back with [`ResourcePool::release`].
pub struct PooledResource<S> {
    id: ResourceId,
    session: Arc<S>,
}

impl<S> PooledResource<S> {
    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn session(&self) -> &S {
        &self.session
    }
}

impl<S> fmt::Debug for PooledResource<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledResource").field("id", &self.id).finish()
    }
}

/// Diagnostic snapshot of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub free: usize,
    pub in_use: usize,
    pub retiring: usize,
    pub created: u64,
    pub reused: u64,
    pub discarded: u64,
}

struct PoolState<S> {
    free: Vec<(ResourceId, Arc<S>)>,
    in_use: HashMap<ResourceId, Arc<S>>,
    /// Being sanitized on their way back; counted against capacity.
    retiring: HashSet<ResourceId>,
    /// Being created; counted against capacity.
    creating: usize,
    closed: bool,
    created: u64,
    reused: u64,
    discarded: u64,
}

impl<S> PoolState<S> {
    fn occupied(&self) -> usize {
        self.free.len() + self.in_use.len() + self.retiring.len() + self.creating
    }
}

pub struct ResourcePool<S> {
    factory: Arc<dyn SessionFactory<S>>,
    capacity: usize,
    state: Mutex<PoolState<S>>,
}

impl<S: Send + Sync + 'static> ResourcePool<S> {
    pub fn new(factory: Arc<dyn SessionFactory<S>>, capacity: usize) -> Self {
        Self {
            factory,
            capacity,
            state: Mutex::new(PoolState {
                free: Vec::with_capacity(capacity),
                in_use: HashMap::with_capacity(capacity),
                retiring: HashSet::new(),
                creating: 0,
                closed: false,
                created: 0,
                reused: 0,
                discarded: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check out a resource: the most recently released free one, or a new one
    /// if there is room under capacity. Creation failure is reported, not retried.
    pub async fn acquire(&self) -> Result<PooledResource<S>, PoolError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }
            if let Some((id, session)) = state.free.pop() {
                state.in_use.insert(id, Arc::clone(&session));
                state.reused += 1;
                tracing::debug!(resource = %id, "Reusing pooled resource");
                return Ok(PooledResource { id, session });
            }
            if state.occupied() >= self.capacity {
                return Err(PoolError::Exhausted {
                    capacity: self.capacity,
                });
            }
            state.creating += 1;
        }

        let created = self.factory.create().await;

        let outcome = {
            let mut state = self.lock();
            state.creating -= 1;
            match created {
                Ok(session) => {
                    let session = Arc::new(session);
                    if state.closed {
                        state.discarded += 1;
                        Err(session)
                    } else {
                        let id = ResourceId::new();
                        state.in_use.insert(id, Arc::clone(&session));
                        state.created += 1;
                        Ok(PooledResource { id, session })
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to create pooled resource");
                    return Err(PoolError::Creation(e.to_string()));
                }
            }
        };

        match outcome {
            Ok(resource) => {
                tracing::debug!(resource = %resource.id, "Created pooled resource");
                Ok(resource)
            }
            Err(session) => {
                // Pool was cleaned up while we were creating.
                self.factory.teardown(&session).await;
                Err(PoolError::Closed)
            }
        }
    }

    /// Return a resource. It is sanitized first; a session that fails to
    /// sanitize, or that no longer fits under capacity, is torn down instead.
    pub async fn release(&self, resource: PooledResource<S>) {
        let PooledResource { id, session } = resource;
        {
            let mut state = self.lock();
            if state.in_use.remove(&id).is_none() {
                // Already torn down by cleanup().
                tracing::debug!(resource = %id, "Released resource is no longer tracked");
                return;
            }
            state.retiring.insert(id);
        }

        let sanitized = self.factory.sanitize(&session).await;
        if let Err(e) = &sanitized {
            tracing::warn!(resource = %id, error = %e, "Sanitize failed - discarding resource");
        }

        let kept = {
            let mut state = self.lock();
            state.retiring.remove(&id);
            let fits = state.free.len() + state.in_use.len() < self.capacity;
            if sanitized.is_ok() && !state.closed && fits {
                state.free.push((id, Arc::clone(&session)));
                true
            } else {
                state.discarded += 1;
                false
            }
        };

        if !kept {
            self.factory.teardown(&session).await;
        }
    }

    /// Tear down every free and in-use resource and refuse further acquires.
    /// Holders are not awaited; their later `release` is a no-op. Idempotent.
    pub async fn cleanup(&self) {
        let sessions: Vec<Arc<S>> = {
            let mut state = self.lock();
            state.closed = true;
            let mut all: Vec<Arc<S>> = state.free.drain(..).map(|(_, s)| s).collect();
            all.extend(state.in_use.drain().map(|(_, s)| s));
            state.discarded += all.len() as u64;
            all
        };

        if sessions.is_empty() {
            return;
        }
        tracing::info!(count = sessions.len(), "Tearing down pooled resources");
        futures::future::join_all(sessions.iter().map(|s| self.factory.teardown(s))).await;
    }

    pub fn state_of(&self, id: ResourceId) -> Option<ResourceState> {
        let state = self.lock();
        if state.in_use.contains_key(&id) {
            Some(ResourceState::InUse)
        } else if state.free.iter().any(|(free_id, _)| *free_id == id) {
            Some(ResourceState::Free)
        } else if state.retiring.contains(&id) {
            Some(ResourceState::Retiring)
        } else {
            None
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            capacity: self.capacity,
            free: state.free.len(),
            in_use: state.in_use.len(),
            retiring: state.retiring.len() + state.creating,
            created: state.created,
            reused: state.reused,
            discarded: state.discarded,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
