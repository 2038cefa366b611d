//! Client facade.
//!
//! [`StoreClient`] is the object applications hold: it maps server addresses
//! to channel pools, owns the shared ordered executor and the timeout
//! reaper, and exposes the per-entry operations. All operations return
//! immediately; results arrive through the callbacks, which run on the
//! ordered executor keyed by ledger id.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use tidepool_core::{Providers, ServerAddress, TaskProvider, TimeProvider};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::auth::{AuthProviderFactory, NullAuthFactory};
use crate::completion::{ReadCallback, WriteCallback};
use crate::config::ClientConfig;
use crate::error::ErrorCode;
use crate::ordered::OrderedExecutor;
use crate::pool::ChannelPool;
use crate::wire::{EntryId, LedgerId, MasterKey};

/// Client-side endpoint of the storage protocol.
///
/// Create one per process, submit operations against any number of servers,
/// and call [`close`](Self::close) when done: it fails everything still
/// outstanding and waits for every callback to be delivered before
/// returning.
pub struct StoreClient<P: Providers> {
    providers: P,
    config: Rc<ClientConfig>,
    pools: Rc<RefCell<HashMap<ServerAddress, Rc<ChannelPool<P>>>>>,
    closed: Rc<Cell<bool>>,
    executor: Rc<OrderedExecutor>,
    auth_factory: Rc<dyn AuthProviderFactory>,
    reaper_shutdown: RefCell<Option<mpsc::UnboundedSender<()>>>,
    reaper_handle: RefCell<Option<JoinHandle<()>>>,
}

impl<P: Providers> StoreClient<P> {
    /// Create a client with the no-op auth plugin.
    ///
    /// Spawns background tasks, so this must be called from within the
    /// runtime context.
    pub fn new(providers: P, config: ClientConfig) -> Self {
        Self::with_auth_factory(providers, config, Rc::new(NullAuthFactory))
    }

    /// Create a client with a specific auth plugin.
    pub fn with_auth_factory(
        providers: P,
        config: ClientConfig,
        auth_factory: Rc<dyn AuthProviderFactory>,
    ) -> Self {
        let config = Rc::new(config);
        let executor = Rc::new(OrderedExecutor::new(
            providers.task(),
            config.callback_workers,
        ));
        let pools: Rc<RefCell<HashMap<ServerAddress, Rc<ChannelPool<P>>>>> =
            Rc::new(RefCell::new(HashMap::new()));

        // periodic sweep of every channel's completion tables, so requests
        // expire even on connections with no traffic to trigger a read
        // timeout
        let (reaper_tx, mut reaper_rx) = mpsc::unbounded_channel::<()>();
        let reaper_handle = {
            let pools = pools.clone();
            let time = providers.time().clone();
            let tick = config.tick_interval;
            providers.task().spawn_task("timeout-reaper", async move {
                loop {
                    match time.timeout(tick, reaper_rx.recv()).await {
                        Ok(_) => break,
                        Err(_) => {
                            let now = time.now();
                            let snapshot: Vec<Rc<ChannelPool<P>>> =
                                pools.borrow().values().cloned().collect();
                            for pool in snapshot {
                                pool.scan_timeouts(now);
                            }
                        }
                    }
                }
            })
        };

        Self {
            providers,
            config,
            pools,
            closed: Rc::new(Cell::new(false)),
            executor,
            auth_factory,
            reaper_shutdown: RefCell::new(Some(reaper_tx)),
            reaper_handle: RefCell::new(Some(reaper_handle)),
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// Number of per-server pools currently held.
    pub fn pool_count(&self) -> usize {
        self.pools.borrow().len()
    }

    /// Append an entry to a ledger on `addr`.
    ///
    /// The payload is opaque to this layer and travels behind the master
    /// key; `entry_id` doubles as the routing key across the server's
    /// connection pool.
    pub fn add_entry(
        &self,
        addr: &ServerAddress,
        ledger_id: LedgerId,
        master_key: &MasterKey,
        entry_id: EntryId,
        payload: Vec<u8>,
        cb: WriteCallback,
        flags: u16,
    ) {
        let cb = self.shape_write_cb(cb);
        let Some(channel) = self.route(addr, entry_id) else {
            cb(ErrorCode::ServerUnavailable, ledger_id, entry_id, addr);
            return;
        };

        let master_key = *master_key;
        let dispatch = channel.clone();
        let executor = self.executor.clone();
        let addr = addr.clone();
        channel.enqueue_or_dispatch(Box::new(move |rc| {
            if rc.is_ok() {
                dispatch.add_entry(ledger_id, &master_key, entry_id, payload, cb, flags);
            } else if executor.is_shutdown() {
                cb(ErrorCode::Interrupted, ledger_id, entry_id, &addr);
            } else {
                let _ = executor.submit_ordered(
                    ledger_id,
                    Box::new(move || cb(rc, ledger_id, entry_id, &addr)),
                );
            }
        }));
    }

    /// Read an entry from a ledger on `addr`. `entry_id` may be
    /// [`LAST_ADD_CONFIRMED`](crate::wire::LAST_ADD_CONFIRMED).
    pub fn read_entry(
        &self,
        addr: &ServerAddress,
        ledger_id: LedgerId,
        entry_id: EntryId,
        cb: ReadCallback,
    ) {
        let cb = self.shape_read_cb(cb);
        let Some(channel) = self.route(addr, entry_id) else {
            cb(ErrorCode::ServerUnavailable, ledger_id, entry_id, None);
            return;
        };

        let dispatch = channel.clone();
        let executor = self.executor.clone();
        channel.enqueue_or_dispatch(Box::new(move |rc| {
            if rc.is_ok() {
                dispatch.read_entry(ledger_id, entry_id, cb);
            } else if executor.is_shutdown() {
                cb(ErrorCode::Interrupted, ledger_id, entry_id, None);
            } else {
                let _ = executor.submit_ordered(
                    ledger_id,
                    Box::new(move || cb(rc, ledger_id, entry_id, None)),
                );
            }
        }));
    }

    /// Read an entry and mark the ledger fenced on the server, refusing
    /// subsequent writes from other clients.
    pub fn read_entry_and_fence(
        &self,
        addr: &ServerAddress,
        ledger_id: LedgerId,
        master_key: &MasterKey,
        entry_id: EntryId,
        cb: ReadCallback,
    ) {
        let cb = self.shape_read_cb(cb);
        let Some(channel) = self.route(addr, entry_id) else {
            cb(ErrorCode::ServerUnavailable, ledger_id, entry_id, None);
            return;
        };

        let master_key = *master_key;
        let dispatch = channel.clone();
        let executor = self.executor.clone();
        channel.enqueue_or_dispatch(Box::new(move |rc| {
            if rc.is_ok() {
                dispatch.read_entry_and_fence(ledger_id, &master_key, entry_id, cb);
            } else if executor.is_shutdown() {
                cb(ErrorCode::Interrupted, ledger_id, entry_id, None);
            } else {
                let _ = executor.submit_ordered(
                    ledger_id,
                    Box::new(move || cb(rc, ledger_id, entry_id, None)),
                );
            }
        }));
    }

    /// Ask the server to drop entries of `ledger_id` up to `last_entry_id`.
    /// Fire-and-forget: no callback, best effort.
    pub fn trim(
        &self,
        addr: &ServerAddress,
        ledger_id: LedgerId,
        master_key: &MasterKey,
        last_entry_id: EntryId,
        flags: u16,
    ) {
        let Some(channel) = self.route(addr, last_entry_id) else {
            return;
        };
        let master_key = *master_key;
        let dispatch = channel.clone();
        channel.enqueue_or_dispatch(Box::new(move |rc| {
            if rc.is_ok() {
                dispatch.trim(ledger_id, &master_key, last_entry_id, flags);
            }
        }));
    }

    /// Transiently disconnect the listed peers. Outstanding operations fail;
    /// the next request to each peer reconnects. Used by higher layers on
    /// suspected server failure.
    pub fn close_peers(&self, addrs: &[ServerAddress]) {
        let pools: Vec<Rc<ChannelPool<P>>> = {
            let map = self.pools.borrow();
            addrs.iter().filter_map(|a| map.get(a).cloned()).collect()
        };
        for pool in pools {
            pool.disconnect();
        }
    }

    /// Permanent shutdown.
    ///
    /// Marks the client closed, closes every pool (failing outstanding
    /// operations), then waits until every queued callback has run. No
    /// callback fires after this returns.
    pub async fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        let pools: Vec<Rc<ChannelPool<P>>> = {
            self.pools.borrow_mut().drain().map(|(_, pool)| pool).collect()
        };
        for pool in &pools {
            pool.close();
        }
        self.executor.shutdown().await;

        if let Some(tx) = self.reaper_shutdown.borrow_mut().take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.reaper_handle.borrow_mut().take() {
            let _ = handle.await;
        }
    }

    fn route(
        &self,
        addr: &ServerAddress,
        routing_key: u64,
    ) -> Option<crate::channel::ServerChannel<P>> {
        self.lookup_pool(addr)?.obtain(routing_key)
    }

    fn lookup_pool(&self, addr: &ServerAddress) -> Option<Rc<ChannelPool<P>>> {
        if let Some(pool) = self.pools.borrow().get(addr) {
            return Some(pool.clone());
        }
        if self.closed.get() {
            return None;
        }
        let pool = Rc::new(ChannelPool::new(
            self.providers.clone(),
            addr.clone(),
            self.config.clone(),
            self.executor.clone(),
            self.auth_factory.clone(),
        ));
        self.pools.borrow_mut().insert(addr.clone(), pool.clone());
        // publish first, then build the channels
        pool.initialize();
        Some(pool)
    }

    /// Rewrite any failure surfaced after close to `ClientClosed`.
    fn shape_write_cb(&self, cb: WriteCallback) -> WriteCallback {
        let closed = self.closed.clone();
        Box::new(move |rc, ledger_id, entry_id, addr| {
            let rc = if !rc.is_ok() && closed.get() {
                ErrorCode::ClientClosed
            } else {
                rc
            };
            cb(rc, ledger_id, entry_id, addr);
        })
    }

    /// Rewrite any failure surfaced after close to `ClientClosed`.
    fn shape_read_cb(&self, cb: ReadCallback) -> ReadCallback {
        let closed = self.closed.clone();
        Box::new(move |rc, ledger_id, entry_id, body| {
            let rc = if !rc.is_ok() && closed.get() {
                ErrorCode::ClientClosed
            } else {
                rc
            };
            cb(rc, ledger_id, entry_id, body);
        })
    }
}
