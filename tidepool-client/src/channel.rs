//! Per-connection server channel.
//!
//! A [`ServerChannel`] manages one connection slot to one storage node:
//! the connect → authenticate → serve lifecycle, the queue of operations
//! submitted while the connection is coming up, frame encoding/decoding, the
//! completion registry, and response dispatch onto the ordered executor.
//!
//! Reconnection is demand-driven: a lost connection fails everything
//! outstanding and leaves the channel disconnected; the next submitted
//! operation drives a fresh connect.
//!
//! All async I/O for one established connection runs in a single spawned
//! task (`connection_task`) that owns the stream: it flushes the shared
//! write queue when notified and reads with an idle timeout. Everything the
//! task shares with the synchronous entry points lives in
//! `RefCell<ChannelShared>`; connect attempts and transports are tagged with
//! an epoch so a stale completion or teardown can never disturb the live
//! connection.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::mem;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tidepool_core::{
    JsonCodec, MessageCodec, NetworkProvider, Providers, ServerAddress, TaskProvider, TcpOptions,
    TimeProvider,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Notify, mpsc};

use crate::auth::{AuthCompletion, AuthMessage, AuthProviderFactory, ClientAuthProvider};
use crate::completion::{
    AddCompletion, CompletionKey, CompletionRegistry, ExpiredCompletion, ReadCallback,
    ReadCompletion, WriteCallback,
};
use crate::config::ClientConfig;
use crate::error::ErrorCode;
use crate::ordered::OrderedExecutor;
use crate::stats::ChannelStats;
use crate::wire::{
    self, EntryId, FrameDecoder, LedgerId, MAX_FRAME_LENGTH, MasterKey, OpCode, Response, status,
};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and no attempt in progress.
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// Connected; the auth handshake is running.
    Authenticating,
    /// Connected and authenticated; operations dispatch immediately.
    Connected,
    /// Permanently shut down. Terminal.
    Closed,
}

/// A deferred operation captured while the connection is not yet up.
///
/// Invoked exactly once: with [`ErrorCode::Ok`] to perform the actual
/// dispatch, or with a failure code to resolve the operation's callback.
pub type PendingOp = Box<dyn FnOnce(ErrorCode)>;

/// What a queued write resolves if it fails.
enum WriteTag {
    None,
    Add(CompletionKey),
    Read(CompletionKey),
    Auth,
}

struct WriteRequest {
    bytes: Vec<u8>,
    tag: WriteTag,
}

/// Mutable channel state shared between entry points and the I/O task.
struct ChannelShared {
    state: ConnectionState,
    pending_ops: VecDeque<PendingOp>,
    write_queue: VecDeque<WriteRequest>,
    shutdown_tx: Option<mpsc::UnboundedSender<()>>,
    /// Bumped on every connect attempt and teardown; stale tasks check it
    /// and stand down.
    epoch: u64,
    auth_start: Option<Duration>,
}

/// One connection slot to one storage node.
pub struct ServerChannel<P: Providers> {
    core: Rc<ChannelCore<P>>,
}

impl<P: Providers> Clone for ServerChannel<P> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<P: Providers> ServerChannel<P> {
    /// Create a channel for `addr`. No connection is attempted until the
    /// first operation is submitted.
    pub fn new(
        providers: P,
        addr: ServerAddress,
        config: Rc<ClientConfig>,
        executor: Rc<OrderedExecutor>,
        auth_factory: Rc<dyn AuthProviderFactory>,
    ) -> Self {
        let core = Rc::new_cyclic(|weak| ChannelCore {
            weak: weak.clone(),
            providers,
            addr,
            config,
            executor,
            auth_factory,
            registry: CompletionRegistry::new(),
            stats: ChannelStats::default(),
            shared: RefCell::new(ChannelShared {
                state: ConnectionState::Disconnected,
                pending_ops: VecDeque::new(),
                write_queue: VecDeque::new(),
                shutdown_tx: None,
                epoch: 0,
                auth_start: None,
            }),
            data_to_send: Notify::new(),
            auth_provider: RefCell::new(None),
        });
        Self { core }
    }

    /// Address of the server this channel talks to.
    pub fn addr(&self) -> &ServerAddress {
        &self.core.addr
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.core.shared.borrow().state
    }

    /// Statistic streams for this channel.
    pub fn stats(&self) -> ChannelStats {
        self.core.stats.clone()
    }

    /// Number of requests awaiting a response or a timeout.
    pub fn pending_requests(&self) -> usize {
        self.core.registry.pending_count()
    }

    /// Run `op` now if connected, fail it if closed, or queue it and (if
    /// necessary) start a connect attempt.
    pub fn enqueue_or_dispatch(&self, op: PendingOp) {
        self.core.enqueue_or_dispatch(op);
    }

    /// Send an add request. Call only after [`enqueue_or_dispatch`]
    /// signalled OK.
    ///
    /// [`enqueue_or_dispatch`]: Self::enqueue_or_dispatch
    pub fn add_entry(
        &self,
        ledger_id: LedgerId,
        master_key: &MasterKey,
        entry_id: EntryId,
        payload: Vec<u8>,
        cb: WriteCallback,
        flags: u16,
    ) {
        self.core.add_entry(ledger_id, master_key, entry_id, payload, cb, flags);
    }

    /// Send a read request. `entry_id` may be
    /// [`LAST_ADD_CONFIRMED`](crate::wire::LAST_ADD_CONFIRMED).
    pub fn read_entry(&self, ledger_id: LedgerId, entry_id: EntryId, cb: ReadCallback) {
        self.core.read_entry(ledger_id, entry_id, cb);
    }

    /// Send a read request that also fences the ledger on the server.
    pub fn read_entry_and_fence(
        &self,
        ledger_id: LedgerId,
        master_key: &MasterKey,
        entry_id: EntryId,
        cb: ReadCallback,
    ) {
        self.core.read_entry_and_fence(ledger_id, master_key, entry_id, cb);
    }

    /// Send a trim request. Fire-and-forget: no completion is registered.
    pub fn trim(
        &self,
        ledger_id: LedgerId,
        master_key: &MasterKey,
        last_entry_id: EntryId,
        flags: u16,
    ) {
        self.core.trim(ledger_id, master_key, last_entry_id, flags);
    }

    /// Tear down the current transport. The channel stays reusable; the
    /// next operation reconnects.
    pub fn disconnect(&self) {
        self.core.close_internal(false);
    }

    /// Permanent shutdown: fail everything pending and refuse further work.
    pub fn close(&self) {
        self.core.close_internal(true);
    }

    /// Sweep the completion tables for expired requests. Driven by the
    /// channel's own idle-read timeout and by the client-wide reaper.
    pub fn scan_timeouts(&self, now: Duration) {
        self.core.scan_timeouts(now);
    }
}

struct ChannelCore<P: Providers> {
    weak: Weak<ChannelCore<P>>,
    providers: P,
    addr: ServerAddress,
    config: Rc<ClientConfig>,
    executor: Rc<OrderedExecutor>,
    auth_factory: Rc<dyn AuthProviderFactory>,
    registry: CompletionRegistry,
    stats: ChannelStats,
    shared: RefCell<ChannelShared>,
    data_to_send: Notify,
    /// The provider for the in-flight auth session. Kept beside the state
    /// cell, not inside it, so plugin calls never overlap a state borrow;
    /// replaced on each fresh connect attempt.
    auth_provider: RefCell<Option<Box<dyn ClientAuthProvider>>>,
}

enum Dispatch {
    Now(ErrorCode),
    Queued,
    Connect(u64),
}

impl<P: Providers> ChannelCore<P> {
    fn enqueue_or_dispatch(&self, op: PendingOp) {
        // fast path: no state to change while connected
        if self.shared.borrow().state == ConnectionState::Connected {
            op(ErrorCode::Ok);
            return;
        }

        let mut op = Some(op);
        let dispatch = {
            let mut shared = self.shared.borrow_mut();
            match shared.state {
                // state may have flipped between the two borrows
                ConnectionState::Connected => Dispatch::Now(ErrorCode::Ok),
                ConnectionState::Closed => Dispatch::Now(ErrorCode::ServerUnavailable),
                ConnectionState::Connecting | ConnectionState::Authenticating => {
                    if let Some(op) = op.take() {
                        shared.pending_ops.push_back(op);
                    }
                    Dispatch::Queued
                }
                ConnectionState::Disconnected => {
                    if let Some(op) = op.take() {
                        shared.pending_ops.push_back(op);
                    }
                    shared.state = ConnectionState::Connecting;
                    shared.epoch += 1;
                    Dispatch::Connect(shared.epoch)
                }
            }
        };

        match dispatch {
            Dispatch::Now(rc) => {
                if let Some(op) = op.take() {
                    op(rc);
                }
            }
            Dispatch::Queued => {}
            Dispatch::Connect(epoch) => {
                // a fresh session gets a fresh provider
                self.auth_provider.borrow_mut().take();
                self.start_connect(epoch);
            }
        }
    }

    fn start_connect(&self, epoch: u64) {
        tracing::info!(server = %self.addr, "connecting to server");
        let Some(core) = self.weak.upgrade() else {
            return;
        };
        let network = self.providers.network().clone();
        let time = self.providers.time().clone();
        let target = self.addr.to_string();
        let options = TcpOptions {
            nodelay: self.config.tcp_nodelay,
        };
        let connect_timeout = self.config.connect_timeout;
        self.providers.task().spawn_task("channel-connect", async move {
            let result = match time
                .timeout(connect_timeout, network.connect(&target, &options))
                .await
            {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err(error)) => Err(error.to_string()),
                Err(_) => Err("connect attempt timed out".to_string()),
            };
            core.connect_complete(epoch, result);
        });
    }

    fn connect_complete(
        &self,
        epoch: u64,
        result: Result<<P::Network as NetworkProvider>::TcpStream, String>,
    ) {
        match result {
            Ok(stream) => {
                let shutdown_rx = {
                    let mut shared = self.shared.borrow_mut();
                    if shared.epoch == epoch && shared.state == ConnectionState::Connecting {
                        shared.state = ConnectionState::Authenticating;
                        shared.auth_start = Some(self.providers.time().now());
                        shared.write_queue.clear();
                        let (tx, rx) = mpsc::unbounded_channel();
                        shared.shutdown_tx = Some(tx);
                        Some(rx)
                    } else {
                        None
                    }
                };
                match shutdown_rx {
                    Some(rx) => {
                        tracing::info!(server = %self.addr, "connected, authenticating");
                        let Some(core) = self.weak.upgrade() else {
                            return;
                        };
                        self.providers
                            .task()
                            .spawn_task("channel-io", connection_task(core, stream, rx, epoch));
                        self.start_auth();
                    }
                    None => {
                        // a primary connection is already live (or the channel
                        // moved on); close the latecomer untouched
                        tracing::debug!(server = %self.addr, "discarding late connection");
                        drop(stream);
                    }
                }
            }
            Err(reason) => {
                let pending = {
                    let mut shared = self.shared.borrow_mut();
                    if shared.epoch != epoch || shared.state != ConnectionState::Connecting {
                        return;
                    }
                    shared.state = ConnectionState::Disconnected;
                    mem::take(&mut shared.pending_ops)
                };
                tracing::error!(server = %self.addr, %reason, "could not connect to server");
                for op in pending {
                    op(ErrorCode::ServerUnavailable);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Auth handshake
    // ------------------------------------------------------------------

    fn start_auth(&self) {
        let completion: AuthCompletion = {
            let weak = self.weak.clone();
            Rc::new(move |rc| {
                if let Some(core) = weak.upgrade() {
                    core.auth_complete(rc);
                }
            })
        };
        let provider = self.auth_factory.new_provider(&self.addr, completion);
        *self.auth_provider.borrow_mut() = Some(provider);

        let mut slot = self.auth_provider.borrow_mut();
        if let Some(provider) = slot.as_mut() {
            let mut send = self.auth_send_fn();
            provider.init(&mut send);
        }
    }

    fn auth_send_fn(&self) -> impl FnMut(AuthMessage) {
        let weak = self.weak.clone();
        move |message: AuthMessage| {
            if let Some(core) = weak.upgrade() {
                core.send_auth_message(message);
            }
        }
    }

    fn send_auth_message(&self, message: AuthMessage) {
        match JsonCodec.encode(&message) {
            Ok(payload) => {
                let frame = wire::encode_auth_request(&payload);
                if !self.enqueue_write(frame, WriteTag::Auth) {
                    self.auth_complete(ErrorCode::Unauthorized);
                }
            }
            Err(error) => {
                tracing::error!(server = %self.addr, %error, "failed to encode auth message");
                self.auth_complete(ErrorCode::Unauthorized);
            }
        }
    }

    fn handle_auth_message(&self, message: AuthMessage) {
        if message.auth_plugin_name != self.auth_factory.plugin_name() {
            tracing::error!(
                server = %self.addr,
                local = self.auth_factory.plugin_name(),
                remote = %message.auth_plugin_name,
                "message from incompatible auth plugin"
            );
            self.auth_complete(ErrorCode::Unauthorized);
            return;
        }
        let mut slot = self.auth_provider.borrow_mut();
        if let Some(provider) = slot.as_mut() {
            let mut send = self.auth_send_fn();
            provider.process(message, &mut send);
        }
    }

    fn auth_complete(&self, rc: ErrorCode) {
        let pending = {
            let mut shared = self.shared.borrow_mut();
            if shared.state != ConnectionState::Authenticating {
                return;
            }
            if rc.is_ok() {
                tracing::info!(server = %self.addr, "authenticated with server");
                shared.state = ConnectionState::Connected;
            } else {
                tracing::info!(server = %self.addr, code = %rc, "authentication failed");
                Self::teardown_locked(&mut shared);
                shared.state = ConnectionState::Disconnected;
            }
            mem::take(&mut shared.pending_ops)
        };
        for op in pending {
            op(rc);
        }
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    fn add_entry(
        &self,
        ledger_id: LedgerId,
        master_key: &MasterKey,
        entry_id: EntryId,
        payload: Vec<u8>,
        cb: WriteCallback,
        flags: u16,
    ) {
        let now = self.providers.time().now();
        let key = CompletionKey::new(ledger_id, entry_id);
        self.registry.register_add(
            key,
            AddCompletion {
                cb: self.wrap_write_stats(cb, now),
                created_at: now,
                deadline: now + self.config.read_timeout,
            },
        );

        let frame = wire::encode_add_request(master_key, &payload, flags);
        if !self.enqueue_write(frame, WriteTag::Add(key)) {
            self.fail_add_key(key);
        }
    }

    fn read_entry(&self, ledger_id: LedgerId, entry_id: EntryId, cb: ReadCallback) {
        let key = self.register_read(ledger_id, entry_id, cb);
        let frame = wire::encode_read_request(ledger_id, entry_id);
        if !self.enqueue_write(frame, WriteTag::Read(key)) {
            self.fail_read_key(key);
        }
    }

    fn read_entry_and_fence(
        &self,
        ledger_id: LedgerId,
        master_key: &MasterKey,
        entry_id: EntryId,
        cb: ReadCallback,
    ) {
        let key = self.register_read(ledger_id, entry_id, cb);
        let frame = wire::encode_read_fence_request(ledger_id, master_key, entry_id);
        if !self.enqueue_write(frame, WriteTag::Read(key)) {
            self.fail_read_key(key);
        }
    }

    fn register_read(&self, ledger_id: LedgerId, entry_id: EntryId, cb: ReadCallback) -> CompletionKey {
        let now = self.providers.time().now();
        let key = CompletionKey::new(ledger_id, entry_id);
        self.registry.register_read(
            key,
            ReadCompletion {
                cb: self.wrap_read_stats(cb, now),
                created_at: now,
                deadline: now + self.config.read_timeout,
            },
        );
        key
    }

    fn trim(&self, ledger_id: LedgerId, _master_key: &MasterKey, last_entry_id: EntryId, flags: u16) {
        let frame = wire::encode_trim_request(ledger_id, last_entry_id, flags);
        if !self.enqueue_write(frame, WriteTag::None) {
            tracing::warn!(server = %self.addr, ledger_id, "trim dropped, no live connection");
        }
    }

    fn wrap_write_stats(&self, cb: WriteCallback, start: Duration) -> WriteCallback {
        let stats = self.stats.add_op.clone();
        let time = self.providers.time().clone();
        Box::new(move |rc, ledger_id, entry_id, addr| {
            let latency = time.now().saturating_sub(start);
            if rc.is_ok() {
                stats.record_success(latency);
            } else {
                stats.record_failure(latency);
            }
            cb(rc, ledger_id, entry_id, addr);
        })
    }

    fn wrap_read_stats(&self, cb: ReadCallback, start: Duration) -> ReadCallback {
        let stats = self.stats.read_op.clone();
        let time = self.providers.time().clone();
        Box::new(move |rc, ledger_id, entry_id, body| {
            let latency = time.now().saturating_sub(start);
            if rc.is_ok() {
                stats.record_success(latency);
            } else {
                stats.record_failure(latency);
            }
            cb(rc, ledger_id, entry_id, body);
        })
    }

    // ------------------------------------------------------------------
    // Write queue
    // ------------------------------------------------------------------

    fn enqueue_write(&self, bytes: Vec<u8>, tag: WriteTag) -> bool {
        let first = {
            let mut shared = self.shared.borrow_mut();
            if shared.shutdown_tx.is_none() {
                return false;
            }
            let first = shared.write_queue.is_empty();
            shared.write_queue.push_back(WriteRequest { bytes, tag });
            first
        };
        if first {
            self.data_to_send.notify_one();
        }
        true
    }

    fn pop_write(&self, epoch: u64) -> Option<WriteRequest> {
        let mut shared = self.shared.borrow_mut();
        if shared.epoch != epoch {
            return None;
        }
        shared.write_queue.pop_front()
    }

    // ------------------------------------------------------------------
    // Response dispatch
    // ------------------------------------------------------------------

    fn handle_frame(&self, frame: Vec<u8>) {
        let response = match wire::parse_response(&frame) {
            Ok(response) => response,
            Err(error) => {
                tracing::error!(server = %self.addr, %error, "unparseable response, dropping");
                return;
            }
        };

        match response {
            Response::Auth { payload } => {
                if self.auth_provider.borrow().is_none() {
                    tracing::warn!(server = %self.addr, "auth frame outside a handshake, dropping");
                    return;
                }
                match JsonCodec.decode::<AuthMessage>(&payload) {
                    Ok(message) => self.handle_auth_message(message),
                    Err(error) => {
                        tracing::error!(server = %self.addr, %error, "undecodable auth message, dropping");
                    }
                }
            }
            Response::Op {
                header,
                status,
                ledger_id,
                entry_id,
                payload,
            } => {
                let Some(core) = self.weak.upgrade() else {
                    return;
                };
                // user callbacks for one ledger run serialized on one worker
                let submitted = self.executor.submit_ordered(
                    ledger_id,
                    Box::new(move || match header.op() {
                        Some(OpCode::AddEntry) => {
                            core.handle_add_response(ledger_id, entry_id, status);
                        }
                        Some(OpCode::ReadEntry) => {
                            core.handle_read_response(ledger_id, entry_id, status, payload);
                        }
                        _ => {
                            tracing::error!(
                                server = %core.addr,
                                opcode = header.opcode,
                                "unexpected response opcode, ignoring"
                            );
                        }
                    }),
                );
                if submitted.is_err() {
                    tracing::warn!(server = %self.addr, "response dropped, executor shut down");
                }
            }
        }
    }

    fn handle_add_response(&self, ledger_id: LedgerId, entry_id: EntryId, status: u32) {
        let rc = map_add_status(status);
        if rc == ErrorCode::WriteFailure {
            tracing::warn!(server = %self.addr, ledger_id, entry_id, status, "add failed with unknown status");
        }

        let key = CompletionKey::new(ledger_id, entry_id);
        match self.registry.take_add(key) {
            Some(completion) => (completion.cb)(rc, ledger_id, entry_id, &self.addr),
            None => {
                tracing::debug!(server = %self.addr, key = %key, "unexpected add response, ignoring");
            }
        }
    }

    fn handle_read_response(
        &self,
        ledger_id: LedgerId,
        entry_id: EntryId,
        status: u32,
        payload: Vec<u8>,
    ) {
        let rc = map_read_status(status);
        if rc == ErrorCode::ReadFailure {
            tracing::warn!(server = %self.addr, ledger_id, entry_id, status, "read failed with unknown status");
        }

        match self.registry.take_read_or_lac(ledger_id, entry_id) {
            Some(completion) => {
                let body = if rc.is_ok() { Some(payload) } else { None };
                (completion.cb)(rc, ledger_id, entry_id, body);
            }
            None => {
                tracing::debug!(
                    server = %self.addr,
                    ledger_id,
                    entry_id,
                    "unexpected read response, ignoring"
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Failure paths
    // ------------------------------------------------------------------

    fn fail_add_key(&self, key: CompletionKey) {
        if let Some(completion) = self.registry.take_add(key) {
            tracing::error!(server = %self.addr, key = %key, "could not write add request");
            self.complete_add(key, completion, ErrorCode::ServerUnavailable);
        }
    }

    fn fail_read_key(&self, key: CompletionKey) {
        let completions = self.registry.take_reads_at(key);
        if !completions.is_empty() {
            tracing::error!(server = %self.addr, key = %key, "could not write read request");
        }
        for completion in completions {
            self.complete_read(key, completion, ErrorCode::ServerUnavailable);
        }
    }

    fn complete_add(&self, key: CompletionKey, completion: AddCompletion, rc: ErrorCode) {
        if self.executor.is_shutdown() {
            (completion.cb)(rc, key.ledger_id, key.entry_id, &self.addr);
            return;
        }
        let addr = self.addr.clone();
        if self
            .executor
            .submit_ordered(
                key.ledger_id,
                Box::new(move || (completion.cb)(rc, key.ledger_id, key.entry_id, &addr)),
            )
            .is_err()
        {
            tracing::error!(server = %self.addr, key = %key, "add completion dropped at executor");
        }
    }

    fn complete_read(&self, key: CompletionKey, completion: ReadCompletion, rc: ErrorCode) {
        if self.executor.is_shutdown() {
            (completion.cb)(rc, key.ledger_id, key.entry_id, None);
            return;
        }
        if self
            .executor
            .submit_ordered(
                key.ledger_id,
                Box::new(move || (completion.cb)(rc, key.ledger_id, key.entry_id, None)),
            )
            .is_err()
        {
            tracing::error!(server = %self.addr, key = %key, "read completion dropped at executor");
        }
    }

    fn fail_all_outstanding(&self, rc: ErrorCode) {
        for (key, completion) in self.registry.drain_adds() {
            self.complete_add(key, completion, rc);
        }
        for (key, completion) in self.registry.drain_reads() {
            self.complete_read(key, completion, rc);
        }
    }

    // ------------------------------------------------------------------
    // Timeouts
    // ------------------------------------------------------------------

    fn handle_read_timeout(&self) {
        let now = self.providers.time().now();
        let auth_timed_out = {
            let shared = self.shared.borrow();
            shared.state == ConnectionState::Authenticating
                && shared
                    .auth_start
                    .is_some_and(|start| now.saturating_sub(start) > self.config.auth_timeout)
        };
        if auth_timed_out {
            self.auth_complete(ErrorCode::AuthTimeout);
        }
        self.scan_timeouts(now);
    }

    fn scan_timeouts(&self, now: Duration) {
        for expired in self.registry.drain_expired(now) {
            match expired {
                ExpiredCompletion::Add(key, completion) => {
                    self.stats
                        .add_timeout
                        .record_success(now.saturating_sub(completion.created_at));
                    self.complete_add(key, completion, ErrorCode::ServerUnavailable);
                }
                ExpiredCompletion::Read(key, completion) => {
                    self.stats
                        .read_timeout
                        .record_success(now.saturating_sub(completion.created_at));
                    self.complete_read(key, completion, ErrorCode::ServerUnavailable);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Invalidate the live transport. Callers decide the next state and own
    /// the pending-op drain.
    fn teardown_locked(shared: &mut ChannelShared) {
        shared.epoch += 1;
        if let Some(tx) = shared.shutdown_tx.take() {
            let _ = tx.send(());
        }
        shared.write_queue.clear();
        shared.auth_start = None;
    }

    /// Called by the I/O task when its transport dies.
    fn handle_transport_closed(&self, epoch: u64, failed_write: Option<WriteTag>) {
        let (pending, rc) = {
            let mut shared = self.shared.borrow_mut();
            if shared.epoch != epoch {
                // the channel already moved on; nothing here is ours
                return;
            }
            Self::teardown_locked(&mut shared);
            let rc = if shared.state == ConnectionState::Authenticating {
                ErrorCode::Unauthorized
            } else {
                ErrorCode::ServerUnavailable
            };
            if shared.state != ConnectionState::Closed {
                shared.state = ConnectionState::Disconnected;
            }
            (mem::take(&mut shared.pending_ops), rc)
        };
        tracing::info!(server = %self.addr, "disconnected from server");

        match failed_write {
            Some(WriteTag::Add(key)) => self.fail_add_key(key),
            Some(WriteTag::Read(key)) => self.fail_read_key(key),
            _ => {}
        }
        self.fail_all_outstanding(ErrorCode::ServerUnavailable);
        for op in pending {
            op(rc);
        }
    }

    fn close_internal(&self, permanent: bool) {
        let pending = {
            let mut shared = self.shared.borrow_mut();
            if permanent {
                shared.state = ConnectionState::Closed;
            } else if shared.state != ConnectionState::Closed {
                shared.state = ConnectionState::Disconnected;
            }
            Self::teardown_locked(&mut shared);
            mem::take(&mut shared.pending_ops)
        };
        self.fail_all_outstanding(ErrorCode::ServerUnavailable);
        for op in pending {
            op(ErrorCode::ServerUnavailable);
        }
    }
}

/// I/O loop for one established connection.
///
/// Owns the stream exclusively. Flushes the shared write queue when
/// notified, reads with the idle timeout, and reports its own death exactly
/// once through `handle_transport_closed` (which ignores it if the epoch has
/// moved on).
async fn connection_task<P: Providers>(
    core: Rc<ChannelCore<P>>,
    mut stream: <P::Network as NetworkProvider>::TcpStream,
    mut shutdown_rx: mpsc::UnboundedReceiver<()>,
    epoch: u64,
) {
    let time = core.providers.time().clone();
    let read_timeout = core.config.read_timeout;
    let mut decoder = FrameDecoder::new(MAX_FRAME_LENGTH);
    let mut buf = vec![0u8; 8192];
    let mut failed_write: Option<WriteTag> = None;

    'io: loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break 'io,

            _ = core.data_to_send.notified() => {
                while let Some(request) = core.pop_write(epoch) {
                    if let Err(error) = stream.write_all(&request.bytes).await {
                        tracing::debug!(server = %core.addr, %error, "write failed");
                        failed_write = Some(request.tag);
                        break 'io;
                    }
                }
            }

            result = time.timeout(read_timeout, stream.read(&mut buf)) => {
                match result {
                    // idle read window elapsed; scan, connection stays up
                    Err(_) => core.handle_read_timeout(),
                    Ok(Ok(0)) => {
                        tracing::info!(server = %core.addr, "server closed the connection");
                        break 'io;
                    }
                    Ok(Ok(n)) => {
                        decoder.extend(&buf[..n]);
                        loop {
                            match decoder.next_frame() {
                                Ok(Some(frame)) => core.handle_frame(frame),
                                Ok(None) => break,
                                Err(error) => {
                                    tracing::error!(server = %core.addr, %error, "corrupt frame, dropping");
                                }
                            }
                        }
                    }
                    Ok(Err(error)) => {
                        tracing::debug!(server = %core.addr, %error, "read failed");
                        break 'io;
                    }
                }
            }
        }
    }

    core.handle_transport_closed(epoch, failed_write);
}

fn map_add_status(status: u32) -> ErrorCode {
    match status {
        status::EOK => ErrorCode::Ok,
        status::EBADVERSION => ErrorCode::ProtocolVersion,
        status::EFENCED => ErrorCode::LedgerFenced,
        status::EUA => ErrorCode::Unauthorized,
        status::EREADONLY => ErrorCode::ReadOnly,
        _ => ErrorCode::WriteFailure,
    }
}

fn map_read_status(status: u32) -> ErrorCode {
    match status {
        status::EOK => ErrorCode::Ok,
        status::ENOENTRY | status::ENOLEDGER => ErrorCode::NoSuchEntry,
        status::ETRIMMED => ErrorCode::EntryTrimmed,
        status::EBADVERSION => ErrorCode::ProtocolVersion,
        status::EUA => ErrorCode::Unauthorized,
        _ => ErrorCode::ReadFailure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_status_mapping() {
        assert_eq!(map_add_status(status::EOK), ErrorCode::Ok);
        assert_eq!(map_add_status(status::EBADVERSION), ErrorCode::ProtocolVersion);
        assert_eq!(map_add_status(status::EFENCED), ErrorCode::LedgerFenced);
        assert_eq!(map_add_status(status::EUA), ErrorCode::Unauthorized);
        assert_eq!(map_add_status(status::EREADONLY), ErrorCode::ReadOnly);
        // read-side statuses are unknown to the add path
        assert_eq!(map_add_status(status::ENOENTRY), ErrorCode::WriteFailure);
        assert_eq!(map_add_status(9999), ErrorCode::WriteFailure);
    }

    #[test]
    fn test_read_status_mapping() {
        assert_eq!(map_read_status(status::EOK), ErrorCode::Ok);
        assert_eq!(map_read_status(status::ENOENTRY), ErrorCode::NoSuchEntry);
        assert_eq!(map_read_status(status::ENOLEDGER), ErrorCode::NoSuchEntry);
        assert_eq!(map_read_status(status::ETRIMMED), ErrorCode::EntryTrimmed);
        assert_eq!(map_read_status(status::EBADVERSION), ErrorCode::ProtocolVersion);
        assert_eq!(map_read_status(status::EUA), ErrorCode::Unauthorized);
        assert_eq!(map_read_status(status::EFENCED), ErrorCode::ReadFailure);
        assert_eq!(map_read_status(9999), ErrorCode::ReadFailure);
    }
}
