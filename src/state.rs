// SPDX-License-Identifier: BUSL-1.1

//! `FanoutState`: the shared handle threaded through every transport
//! layer and background task. One `Arc`-wrapped aggregate passed by
//! clone, never behind a lock itself.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::client::ClientPool;
use crate::config::FanoutConfig;
use crate::rate_limiter::{PerIpBuckets, TokenBucket};
use crate::registry::ClientRegistry;
use crate::resource_guard::ResourceGuard;
use crate::subscription::SubscriptionIndex;

#[derive(Clone)]
pub struct FanoutState(Arc<Inner>);

struct Inner {
    config: FanoutConfig,
    registry: ClientRegistry,
    subscriptions: SubscriptionIndex,
    resource_guard: Arc<ResourceGuard>,
    client_pool: ClientPool,
    per_ip_conn_buckets: PerIpBuckets,
    global_conn_bucket: Option<TokenBucket>,
    admission_semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl FanoutState {
    pub fn new(config: FanoutConfig, shutdown: CancellationToken) -> Self {
        let resource_guard = ResourceGuard::new(&config);
        let per_ip_conn_buckets =
            PerIpBuckets::new(config.per_ip_conn_per_sec, config.per_ip_conn_burst as f64);
        let global_conn_bucket = config
            .global_conn_per_sec
            .map(|rate| TokenBucket::new(rate, config.global_conn_burst as f64));
        let admission_semaphore = Arc::new(Semaphore::new(config.max_connections));

        Self(Arc::new(Inner {
            config,
            registry: ClientRegistry::new(),
            subscriptions: SubscriptionIndex::new(),
            resource_guard,
            client_pool: ClientPool::new(),
            per_ip_conn_buckets,
            global_conn_bucket,
            admission_semaphore,
            shutdown,
        }))
    }

    pub fn config(&self) -> &FanoutConfig {
        &self.0.config
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.0.registry
    }

    pub fn subscriptions(&self) -> &SubscriptionIndex {
        &self.0.subscriptions
    }

    pub fn resource_guard(&self) -> &Arc<ResourceGuard> {
        &self.0.resource_guard
    }

    pub fn client_pool(&self) -> &ClientPool {
        &self.0.client_pool
    }

    pub fn per_ip_conn_buckets(&self) -> &PerIpBuckets {
        &self.0.per_ip_conn_buckets
    }

    pub fn global_conn_bucket(&self) -> Option<&TokenBucket> {
        self.0.global_conn_bucket.as_ref()
    }

    pub fn admission_semaphore(&self) -> &Arc<Semaphore> {
        &self.0.admission_semaphore
    }

    pub fn shutdown(&self) -> &CancellationToken {
        &self.0.shutdown
    }

    pub fn is_shutting_down(&self) -> bool {
        self.0.shutdown.is_cancelled()
    }
}
