//! Prefetch queue for single-use credentials.
//!
//! A maintenance loop keeps up to `depth` credential fetches queued so a
//! task rarely waits on the provider. Consumers take the oldest fetch first.
//! Provider calls run under a semaphore of `depth` permits, so a fetch that
//! was taken but is still running, and a direct fetch on an empty queue,
//! both count against the same bound. Each fetch walks the provider chain in
//! order and fails only when every provider has failed.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::CredentialError;

/// A disposable external identity, consumed by exactly one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub address: String,
    pub secret: String,
    /// Name of the provider that issued it.
    pub provider: String,
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn request(&self) -> Result<Credential, CredentialError>;
}

/// Providers tried in order until one succeeds.
#[derive(Clone)]
pub struct ProviderChain {
    providers: Vec<Arc<dyn CredentialProvider>>,
}

impl ProviderChain {
    pub fn new(providers: Vec<Arc<dyn CredentialProvider>>) -> Self {
        Self { providers }
    }

    pub async fn fetch(&self) -> Result<Credential, CredentialError> {
        let mut last_error = CredentialError::NoProviders;
        for provider in &self.providers {
            match provider.request().await {
                Ok(credential) => return Ok(credential),
                Err(e) => {
                    tracing::warn!(provider = provider.name(), error = %e, "Credential provider failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

type Fetch = JoinHandle<Result<Credential, CredentialError>>;

pub struct PrefetchQueue {
    chain: Arc<ProviderChain>,
    depth: usize,
    inflight: Mutex<VecDeque<Fetch>>,
    permits: Arc<Semaphore>,
    refill: Notify,
    shutdown: CancellationToken,
}

impl PrefetchQueue {
    pub fn new(chain: ProviderChain, depth: usize) -> Arc<Self> {
        Arc::new(Self {
            chain: Arc::new(chain),
            depth,
            inflight: Mutex::new(VecDeque::with_capacity(depth)),
            permits: Arc::new(Semaphore::new(depth.max(1))),
            refill: Notify::new(),
            shutdown: CancellationToken::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Fetch>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the maintenance loop. It tops the queue up after every `take`
    /// and at least once per `interval`, until [`shutdown`](Self::shutdown).
    pub fn start(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tracing::debug!(depth = queue.depth, "Prefetch loop started");
            loop {
                queue.top_up();
                tokio::select! {
                    _ = queue.shutdown.cancelled() => break,
                    _ = queue.refill.notified() => {}
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            tracing::debug!("Prefetch loop stopped");
        })
    }

    /// Start fetches until `depth` are queued. Never exceeds `depth`.
    pub fn top_up(&self) {
        let mut queue = self.lock();
        // Checked under the lock so a concurrent shutdown() drains whatever we push.
        if self.shutdown.is_cancelled() {
            return;
        }
        while queue.len() < self.depth {
            let chain = Arc::clone(&self.chain);
            let permits = Arc::clone(&self.permits);
            queue.push_back(tokio::spawn(async move {
                bounded_fetch(&chain, permits).await
            }));
        }
    }

    /// Take the oldest in-flight credential, or fetch one directly if the
    /// queue is empty.
    pub async fn take(&self) -> Result<Credential, CredentialError> {
        let next = self.lock().pop_front();
        self.refill.notify_one();

        match next {
            Some(fetch) => match fetch.await {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!(error = %e, "Prefetched credential task did not complete");
                    Err(CredentialError::Aborted)
                }
            },
            None => {
                tracing::debug!("Prefetch queue empty - fetching directly");
                bounded_fetch(&self.chain, Arc::clone(&self.permits)).await
            }
        }
    }

    /// Stop the maintenance loop and abort fetches still in flight.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.permits.close();
        let drained: Vec<Fetch> = self.lock().drain(..).collect();
        for fetch in &drained {
            fetch.abort();
        }
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "Aborted in-flight credential fetches");
        }
    }

    /// Current queue length (in flight or completed but not yet taken).
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn target_depth(&self) -> usize {
        self.depth
    }

    /// Provider calls currently running.
    pub fn fetching(&self) -> usize {
        self.depth.max(1) - self.permits.available_permits()
    }
}

/// Run one chain fetch while holding a permit.
async fn bounded_fetch(
    chain: &ProviderChain,
    permits: Arc<Semaphore>,
) -> Result<Credential, CredentialError> {
    let _permit = permits
        .acquire_owned()
        .await
        .map_err(|_| CredentialError::Aborted)?;
    chain.fetch().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedProvider {
        name: &'static str,
        fail: bool,
        calls: AtomicUsize,
    }

    impl FixedProvider {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CredentialProvider for FixedProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn request(&self) -> Result<Credential, CredentialError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            if self.fail {
                return Err(CredentialError::Unavailable {
                    provider: self.name.into(),
                    message: "HTTP 503".into(),
                });
            }
            Ok(Credential {
                address: format!("user{n}@{}.test", self.name),
                secret: "token".into(),
                provider: self.name.into(),
            })
        }
    }

    fn chain(providers: Vec<Arc<FixedProvider>>) -> ProviderChain {
        ProviderChain::new(
            providers
                .into_iter()
                .map(|p| p as Arc<dyn CredentialProvider>)
                .collect(),
        )
    }

    #[tokio::test]
    async fn chain_falls_back_to_secondary() {
        let primary = FixedProvider::new("primary", true);
        let secondary = FixedProvider::new("secondary", false);
        let chain = chain(vec![primary.clone(), secondary.clone()]);

        let credential = chain.fetch().await.unwrap();
        assert_eq!(credential.provider, "secondary");
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn chain_fails_when_all_fail() {
        let chain = chain(vec![
            FixedProvider::new("primary", true),
            FixedProvider::new("secondary", true),
        ]);
        let err = chain.fetch().await.unwrap_err();
        assert!(matches!(err, CredentialError::Unavailable { provider, .. } if provider == "secondary"));
    }

    #[tokio::test]
    async fn empty_chain_reports_no_providers() {
        let chain = ProviderChain::new(Vec::new());
        assert_eq!(chain.fetch().await.unwrap_err(), CredentialError::NoProviders);
    }

    #[tokio::test]
    async fn take_on_empty_queue_fetches_directly() {
        let provider = FixedProvider::new("primary", false);
        let queue = PrefetchQueue::new(chain(vec![provider.clone()]), 3);

        let credential = queue.take().await.unwrap();
        assert_eq!(credential.provider, "primary");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn top_up_queues_exactly_depth() {
        let queue = PrefetchQueue::new(chain(vec![FixedProvider::new("primary", false)]), 2);
        queue.top_up();
        queue.top_up();
        assert_eq!(queue.len(), queue.target_depth());
    }

    /// Tracks how many requests are running at once.
    struct SlowProvider {
        active: AtomicUsize,
        peak: AtomicUsize,
        served: AtomicUsize,
    }

    #[async_trait]
    impl CredentialProvider for SlowProvider {
        fn name(&self) -> &str {
            "slow"
        }

        async fn request(&self) -> Result<Credential, CredentialError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            let n = self.served.fetch_add(1, Ordering::SeqCst);
            Ok(Credential {
                address: format!("slow{n}@mail.test"),
                secret: "token".into(),
                provider: "slow".into(),
            })
        }
    }

    #[tokio::test]
    async fn concurrent_fetches_never_exceed_depth() {
        let provider = Arc::new(SlowProvider {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            served: AtomicUsize::new(0),
        });
        let queue = PrefetchQueue::new(
            ProviderChain::new(vec![Arc::clone(&provider) as Arc<dyn CredentialProvider>]),
            2,
        );
        let handle = queue.start(Duration::from_millis(5));

        let taken = futures::future::join_all((0..4).map(|_| queue.take())).await;
        assert!(taken.iter().all(Result::is_ok));

        // Let the loop refill after the takes.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(queue.fetching() <= queue.target_depth());

        queue.shutdown();
        handle.await.unwrap();
        assert!(provider.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn direct_fetch_after_shutdown_is_aborted() {
        let queue = PrefetchQueue::new(chain(vec![FixedProvider::new("primary", false)]), 2);
        queue.shutdown();
        assert_eq!(queue.take().await.unwrap_err(), CredentialError::Aborted);
        assert_eq!(queue.fetching(), 0);
    }

    #[tokio::test]
    async fn maintenance_loop_refills_after_take() {
        let provider = FixedProvider::new("primary", false);
        let queue = PrefetchQueue::new(chain(vec![provider.clone()]), 2);
        let handle = queue.start(Duration::from_millis(5));

        for _ in 0..5 {
            queue.top_up();
            queue.take().await.unwrap();
            assert!(queue.len() <= 2);
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while queue.len() < 2 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(queue.len(), 2);

        queue.shutdown();
        handle.await.unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn failed_prefetch_propagates() {
        let queue = PrefetchQueue::new(chain(vec![FixedProvider::new("primary", true)]), 1);
        queue.top_up();
        assert!(matches!(
            queue.take().await,
            Err(CredentialError::Unavailable { .. })
        ));
    }
}
