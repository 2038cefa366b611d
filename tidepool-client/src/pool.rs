//! Per-server channel pool.
//!
//! Holds a fixed number of channels to one server and routes each request to
//! one of them by hashing a caller-supplied routing key, so requests for the
//! same key always ride the same connection.

use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::time::Duration;

use tidepool_core::{Providers, ServerAddress};

use crate::auth::AuthProviderFactory;
use crate::channel::ServerChannel;
use crate::config::ClientConfig;
use crate::ordered::OrderedExecutor;

/// Pool of [`ServerChannel`]s for one server address.
///
/// Construction is split in two: `new` builds an empty pool so the owner can
/// publish it into its lookup map first, then [`initialize`](Self::initialize)
/// builds the channels. A pool that loses the publication race is simply
/// closed without ever being initialized.
pub struct ChannelPool<P: Providers> {
    providers: P,
    addr: ServerAddress,
    config: Rc<ClientConfig>,
    executor: Rc<OrderedExecutor>,
    auth_factory: Rc<dyn AuthProviderFactory>,
    channels: RefCell<Vec<ServerChannel<P>>>,
}

impl<P: Providers> ChannelPool<P> {
    /// Create an empty, uninitialized pool for `addr`.
    pub fn new(
        providers: P,
        addr: ServerAddress,
        config: Rc<ClientConfig>,
        executor: Rc<OrderedExecutor>,
        auth_factory: Rc<dyn AuthProviderFactory>,
    ) -> Self {
        Self {
            providers,
            addr,
            config,
            executor,
            auth_factory,
            channels: RefCell::new(Vec::new()),
        }
    }

    /// Build the pool's channels. Idempotent.
    pub fn initialize(&self) {
        let mut channels = self.channels.borrow_mut();
        if !channels.is_empty() {
            return;
        }
        let count = self.config.connections_per_server.max(1);
        for _ in 0..count {
            channels.push(ServerChannel::new(
                self.providers.clone(),
                self.addr.clone(),
                self.config.clone(),
                self.executor.clone(),
                self.auth_factory.clone(),
            ));
        }
    }

    /// Address this pool serves.
    pub fn addr(&self) -> &ServerAddress {
        &self.addr
    }

    /// Number of channels in the pool.
    pub fn len(&self) -> usize {
        self.channels.borrow().len()
    }

    /// Whether the pool has been initialized.
    pub fn is_empty(&self) -> bool {
        self.channels.borrow().is_empty()
    }

    /// Pick the channel for a routing key: `hash(key) % N`.
    ///
    /// Returns `None` only for a pool that was never initialized.
    pub fn obtain(&self, routing_key: u64) -> Option<ServerChannel<P>> {
        let channels = self.channels.borrow();
        if channels.is_empty() {
            return None;
        }
        let mut hasher = DefaultHasher::new();
        routing_key.hash(&mut hasher);
        let index = (hasher.finish() % channels.len() as u64) as usize;
        Some(channels[index].clone())
    }

    /// Transiently disconnect every channel; the next request reconnects.
    pub fn disconnect(&self) {
        for channel in self.channels.borrow().iter() {
            channel.disconnect();
        }
    }

    /// Permanently close every channel.
    pub fn close(&self) {
        for channel in self.channels.borrow().iter() {
            channel.close();
        }
    }

    /// Sweep every channel's completion tables for expired requests.
    pub fn scan_timeouts(&self, now: Duration) {
        let channels: Vec<ServerChannel<P>> = self.channels.borrow().clone();
        for channel in channels {
            channel.scan_timeouts(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use tidepool_core::TokioProviders;

    use crate::auth::NullAuthFactory;

    use super::*;

    fn run_local<F: std::future::Future>(future: F) -> F::Output {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        tokio::task::LocalSet::new().block_on(&rt, future)
    }

    fn test_pool(connections: usize) -> ChannelPool<TokioProviders> {
        let config = Rc::new(ClientConfig {
            connections_per_server: connections,
            ..ClientConfig::default()
        });
        let providers = TokioProviders::new();
        let executor = Rc::new(OrderedExecutor::new(providers.task(), 1));
        ChannelPool::new(
            providers,
            ServerAddress::new("127.0.0.1", 3181),
            config,
            executor,
            Rc::new(NullAuthFactory),
        )
    }

    #[test]
    fn test_initialize_is_idempotent() {
        run_local(async {
            let pool = test_pool(3);
            assert!(pool.is_empty());
            assert!(pool.obtain(0).is_none());

            pool.initialize();
            assert_eq!(pool.len(), 3);
            pool.initialize();
            assert_eq!(pool.len(), 3);
        });
    }

    #[test]
    fn test_routing_is_stable() {
        run_local(async {
            let pool = test_pool(4);
            pool.initialize();

            for key in 0..32u64 {
                let first = pool.obtain(key).expect("channel");
                let second = pool.obtain(key).expect("channel");
                // same key, same channel
                assert!(std::ptr::eq(
                    first.addr() as *const ServerAddress,
                    second.addr() as *const ServerAddress
                ));
            }
        });
    }

    #[test]
    fn test_zero_connections_clamped_to_one() {
        run_local(async {
            let pool = test_pool(0);
            pool.initialize();
            assert_eq!(pool.len(), 1);
        });
    }
}
