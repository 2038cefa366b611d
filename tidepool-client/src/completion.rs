//! Completion registry: per-connection correlation tables.
//!
//! Every in-flight request is represented by a completion record keyed by
//! (ledger, entry). Adds are keyed uniquely; reads form an insertion-ordered
//! multimap because several concurrent reads of the same key are legal.
//! Whoever removes a record from a table — response dispatch, write-failure
//! handling, the timeout scan, or a teardown drain — owns the exactly-once
//! obligation to invoke its callback.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use tidepool_core::ServerAddress;

use crate::error::ErrorCode;
use crate::wire::{EntryId, LAST_ADD_CONFIRMED, LedgerId};

/// Callback for add operations.
pub type WriteCallback = Box<dyn FnOnce(ErrorCode, LedgerId, EntryId, &ServerAddress)>;

/// Callback for read operations. The payload is an owned copy of the entry
/// bytes on success, `None` otherwise.
pub type ReadCallback = Box<dyn FnOnce(ErrorCode, LedgerId, EntryId, Option<Vec<u8>>)>;

/// Correlation key for a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompletionKey {
    /// Ledger the request addresses.
    pub ledger_id: LedgerId,
    /// Entry the request addresses (possibly [`LAST_ADD_CONFIRMED`]).
    pub entry_id: EntryId,
}

impl CompletionKey {
    /// Create a key.
    pub fn new(ledger_id: LedgerId, entry_id: EntryId) -> Self {
        Self {
            ledger_id,
            entry_id,
        }
    }
}

impl fmt::Display for CompletionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.ledger_id, self.entry_id)
    }
}

/// Pending add operation.
pub struct AddCompletion {
    /// Callback to fire exactly once.
    pub cb: WriteCallback,
    /// Submission timestamp, for latency accounting.
    pub created_at: Duration,
    /// Absolute deadline; the timeout scan removes the record once passed.
    pub deadline: Duration,
}

/// Pending read operation.
pub struct ReadCompletion {
    /// Callback to fire exactly once.
    pub cb: ReadCallback,
    /// Submission timestamp, for latency accounting.
    pub created_at: Duration,
    /// Absolute deadline; the timeout scan removes the record once passed.
    pub deadline: Duration,
}

/// A record removed by the timeout scan.
pub enum ExpiredCompletion {
    /// An expired add.
    Add(CompletionKey, AddCompletion),
    /// An expired read.
    Read(CompletionKey, ReadCompletion),
}

/// The two correlation tables of one channel.
#[derive(Default)]
pub struct CompletionRegistry {
    adds: RefCell<HashMap<CompletionKey, AddCompletion>>,
    reads: RefCell<HashMap<CompletionKey, VecDeque<ReadCompletion>>>,
}

impl CompletionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an add completion.
    ///
    /// Callers must not have two adds in flight for the same key; if they
    /// do, the previous record is overwritten and its callback is abandoned.
    pub fn register_add(&self, key: CompletionKey, completion: AddCompletion) {
        if self.adds.borrow_mut().insert(key, completion).is_some() {
            tracing::error!(key = %key, "duplicate add registration, previous completion abandoned");
        }
    }

    /// Register a read completion; concurrent reads of one key queue in
    /// insertion order.
    pub fn register_read(&self, key: CompletionKey, completion: ReadCompletion) {
        self.reads.borrow_mut().entry(key).or_default().push_back(completion);
    }

    /// Atomically remove the add completion for a key.
    pub fn take_add(&self, key: CompletionKey) -> Option<AddCompletion> {
        self.adds.borrow_mut().remove(&key)
    }

    /// Atomically remove the oldest read completion for a key, falling back
    /// to the sentinel-keyed queue for the same ledger.
    ///
    /// The fallback handles ledger-recovery reads submitted with
    /// [`LAST_ADD_CONFIRMED`] that the server answers with a concrete entry
    /// id; both lookups happen under a single borrow of the read table.
    pub fn take_read_or_lac(&self, ledger_id: LedgerId, entry_id: EntryId) -> Option<ReadCompletion> {
        let mut reads = self.reads.borrow_mut();
        let exact = CompletionKey::new(ledger_id, entry_id);
        if let Some(completion) = Self::pop_front(&mut reads, exact) {
            return Some(completion);
        }
        let lac = CompletionKey::new(ledger_id, LAST_ADD_CONFIRMED);
        Self::pop_front(&mut reads, lac)
    }

    /// Atomically remove every read completion queued for a key.
    pub fn take_reads_at(&self, key: CompletionKey) -> Vec<ReadCompletion> {
        self.reads
            .borrow_mut()
            .remove(&key)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Atomically remove every completion whose deadline has passed.
    pub fn drain_expired(&self, now: Duration) -> Vec<ExpiredCompletion> {
        let mut expired = Vec::new();

        {
            let mut adds = self.adds.borrow_mut();
            let keys: Vec<CompletionKey> = adds
                .iter()
                .filter(|(_, c)| c.deadline <= now)
                .map(|(k, _)| *k)
                .collect();
            for key in keys {
                if let Some(completion) = adds.remove(&key) {
                    expired.push(ExpiredCompletion::Add(key, completion));
                }
            }
        }

        {
            let mut reads = self.reads.borrow_mut();
            let keys: Vec<CompletionKey> = reads.keys().copied().collect();
            for key in keys {
                if let Some(queue) = reads.get_mut(&key) {
                    while queue.front().is_some_and(|c| c.deadline <= now) {
                        if let Some(completion) = queue.pop_front() {
                            expired.push(ExpiredCompletion::Read(key, completion));
                        }
                    }
                    if queue.is_empty() {
                        reads.remove(&key);
                    }
                }
            }
        }

        expired
    }

    /// Atomically drain every pending add.
    pub fn drain_adds(&self) -> Vec<(CompletionKey, AddCompletion)> {
        self.adds.borrow_mut().drain().collect()
    }

    /// Atomically drain every pending read.
    pub fn drain_reads(&self) -> Vec<(CompletionKey, ReadCompletion)> {
        let mut drained = Vec::new();
        for (key, queue) in self.reads.borrow_mut().drain() {
            for completion in queue {
                drained.push((key, completion));
            }
        }
        drained
    }

    /// Total number of pending completions, for tests and diagnostics.
    pub fn pending_count(&self) -> usize {
        self.adds.borrow().len() + self.reads.borrow().values().map(VecDeque::len).sum::<usize>()
    }

    fn pop_front(
        reads: &mut HashMap<CompletionKey, VecDeque<ReadCompletion>>,
        key: CompletionKey,
    ) -> Option<ReadCompletion> {
        let queue = reads.get_mut(&key)?;
        let completion = queue.pop_front();
        if queue.is_empty() {
            reads.remove(&key);
        }
        completion
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;

    fn add_completion(deadline: Duration) -> AddCompletion {
        AddCompletion {
            cb: Box::new(|_, _, _, _| {}),
            created_at: Duration::ZERO,
            deadline,
        }
    }

    fn read_completion_tagged(tag: u32, sink: Rc<Cell<u32>>, deadline: Duration) -> ReadCompletion {
        ReadCompletion {
            cb: Box::new(move |_, _, _, _| sink.set(tag)),
            created_at: Duration::ZERO,
            deadline,
        }
    }

    #[test]
    fn test_take_add_is_exactly_once() {
        let registry = CompletionRegistry::new();
        let key = CompletionKey::new(5, 7);
        registry.register_add(key, add_completion(Duration::from_secs(1)));

        assert!(registry.take_add(key).is_some());
        assert!(registry.take_add(key).is_none());
    }

    #[test]
    fn test_duplicate_add_overwrites() {
        let registry = CompletionRegistry::new();
        let key = CompletionKey::new(5, 7);
        registry.register_add(key, add_completion(Duration::from_secs(1)));
        registry.register_add(key, add_completion(Duration::from_secs(2)));

        let taken = registry.take_add(key).expect("one survivor");
        assert_eq!(taken.deadline, Duration::from_secs(2));
        assert!(registry.take_add(key).is_none());
    }

    #[test]
    fn test_reads_queue_in_insertion_order() {
        let registry = CompletionRegistry::new();
        let key = CompletionKey::new(5, 7);
        let sink = Rc::new(Cell::new(0));
        registry.register_read(key, read_completion_tagged(1, sink.clone(), Duration::MAX));
        registry.register_read(key, read_completion_tagged(2, sink.clone(), Duration::MAX));

        let first = registry.take_read_or_lac(5, 7).expect("first");
        (first.cb)(ErrorCode::Ok, 5, 7, None);
        assert_eq!(sink.get(), 1);

        let second = registry.take_read_or_lac(5, 7).expect("second");
        (second.cb)(ErrorCode::Ok, 5, 7, None);
        assert_eq!(sink.get(), 2);

        assert!(registry.take_read_or_lac(5, 7).is_none());
    }

    #[test]
    fn test_lac_fallback() {
        let registry = CompletionRegistry::new();
        let sink = Rc::new(Cell::new(0));
        let lac_key = CompletionKey::new(5, LAST_ADD_CONFIRMED);
        registry.register_read(lac_key, read_completion_tagged(9, sink.clone(), Duration::MAX));

        // server answered the sentinel read with a concrete entry id
        let taken = registry.take_read_or_lac(5, 42).expect("fallback hit");
        (taken.cb)(ErrorCode::Ok, 5, 42, None);
        assert_eq!(sink.get(), 9);
    }

    #[test]
    fn test_exact_match_wins_over_lac() {
        let registry = CompletionRegistry::new();
        let sink = Rc::new(Cell::new(0));
        registry.register_read(
            CompletionKey::new(5, LAST_ADD_CONFIRMED),
            read_completion_tagged(1, sink.clone(), Duration::MAX),
        );
        registry.register_read(
            CompletionKey::new(5, 42),
            read_completion_tagged(2, sink.clone(), Duration::MAX),
        );

        let taken = registry.take_read_or_lac(5, 42).expect("exact");
        (taken.cb)(ErrorCode::Ok, 5, 42, None);
        assert_eq!(sink.get(), 2);
    }

    #[test]
    fn test_drain_expired_respects_deadlines() {
        let registry = CompletionRegistry::new();
        registry.register_add(CompletionKey::new(1, 1), add_completion(Duration::from_secs(1)));
        registry.register_add(CompletionKey::new(1, 2), add_completion(Duration::from_secs(10)));
        let sink = Rc::new(Cell::new(0));
        registry.register_read(
            CompletionKey::new(2, 1),
            read_completion_tagged(1, sink.clone(), Duration::from_secs(1)),
        );
        registry.register_read(
            CompletionKey::new(2, 1),
            read_completion_tagged(2, sink, Duration::from_secs(10)),
        );

        let expired = registry.drain_expired(Duration::from_secs(5));
        assert_eq!(expired.len(), 2);
        assert_eq!(registry.pending_count(), 2);

        // a second sweep at the same instant finds nothing new
        assert!(registry.drain_expired(Duration::from_secs(5)).is_empty());
    }

    #[test]
    fn test_drain_all() {
        let registry = CompletionRegistry::new();
        registry.register_add(CompletionKey::new(1, 1), add_completion(Duration::MAX));
        let sink = Rc::new(Cell::new(0));
        registry.register_read(
            CompletionKey::new(1, 1),
            read_completion_tagged(1, sink.clone(), Duration::MAX),
        );
        registry.register_read(
            CompletionKey::new(1, 2),
            read_completion_tagged(2, sink, Duration::MAX),
        );

        assert_eq!(registry.drain_adds().len(), 1);
        assert_eq!(registry.drain_reads().len(), 2);
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn test_take_reads_at_removes_whole_queue() {
        let registry = CompletionRegistry::new();
        let key = CompletionKey::new(3, 3);
        let sink = Rc::new(Cell::new(0));
        registry.register_read(key, read_completion_tagged(1, sink.clone(), Duration::MAX));
        registry.register_read(key, read_completion_tagged(2, sink, Duration::MAX));

        assert_eq!(registry.take_reads_at(key).len(), 2);
        assert!(registry.take_read_or_lac(3, 3).is_none());
    }
}
