//! # bytepool
//!
//! A scoped, trie-based interning pool for raw byte keys.
//!
//! Low-cardinality byte sequences (a repeated enumerated column read off a
//! data source, for example) waste memory and allocator time when every
//! occurrence is deserialized into its own instance. A [`BytePool`] returns a
//! single canonical instance per distinct byte sequence: the first caller to
//! present a key pays one materialization, every later caller gets back the
//! same `&V` without allocating anything, not even a wrapper object to
//! perform the lookup, because the trie is keyed structurally on the raw
//! bytes themselves.
//!
//! Unlike a process-wide intern table, a pool is an explicit, caller-owned
//! resource: it grows monotonically while in use and releases every node and
//! every canonical value at once when dropped or
//! [`discard`](BytePool::discard)ed.
//!
//! ## Example
//!
//! ```rust
//! use bytepool::BytePool;
//!
//! let mut pool = BytePool::new(|bytes: &[u8]| std::str::from_utf8(bytes).map(String::from));
//!
//! let a = pool.get_or_create(b"female").unwrap();
//! let b = pool.get_or_create(b"female").unwrap();
//! assert!(std::ptr::eq(a, b));
//!
//! let c = pool.get_or_create(b"male").unwrap();
//! assert!(!std::ptr::eq(a, c));
//! assert_eq!(pool.size().unwrap(), 2);
//!
//! pool.discard().unwrap();
//! assert!(pool.get_or_create(b"female").is_err());
//! ```
//!
//! ## How it works
//!
//! A key is split into fixed-width chunks (8 bytes each by default), and each
//! chunk selects one trie edge. Lookup therefore costs one single-word
//! comparison per level instead of a hash plus a full-content compare of the
//! whole key. A key whose chunk sequence ends at a node is recorded there in
//! a terminal slot keyed by its exact byte length, so keys that differ only
//! in trailing zero bytes (which pack into identical padded chunks) are never
//! confused. Trie depth grows linearly with key length; the structure is
//! built for short, low-cardinality keys.
//!
//! ## Concurrency
//!
//! A shared `&BytePool` may be used from many threads. Structural growth is
//! published with single-slot compare-and-set operations (one dispatch entry
//! or one terminal slot at a time); no lock ever covers the trie or a whole
//! node. Materialization of one key is serialized on that key's terminal
//! slot, so the materializer runs at most once ever per distinct key.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use once_cell::sync::OnceCell;

// =============================================================================
// Configuration
// =============================================================================

/// Default number of key bytes packed into one trie level.
const DEFAULT_CHUNK_WIDTH: usize = 8;

/// Upper bound on the chunk width; chunks are packed into a `u64`.
const MAX_CHUNK_WIDTH: usize = 8;

/// Configuration for a [`BytePool`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of key bytes packed into one trie level, in `1..=8`.
    ///
    /// Smaller widths deepen the trie but keep per-level branching low;
    /// larger widths flatten the trie at the cost of wider dispatch lists.
    pub chunk_width: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_width: DEFAULT_CHUNK_WIDTH,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors reported by [`BytePool`] operations.
///
/// Losing an internal publish race is not an error: the losing caller simply
/// receives the winning canonical value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError<E> {
    /// The pool has already been discarded; it must not be used again.
    Discarded,
    /// The materializer failed for the presented key. No terminal entry was
    /// retained, so retrying the same key re-invokes the materializer.
    Materialize(E),
}

impl<E: fmt::Display> fmt::Display for PoolError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Discarded => write!(f, "pool used after discard"),
            PoolError::Materialize(e) => write!(f, "materialization failed: {e}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for PoolError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PoolError::Discarded => None,
            PoolError::Materialize(e) => Some(e),
        }
    }
}

// =============================================================================
// Materializer
// =============================================================================

/// Converts raw key bytes into the canonical value, once per distinct key.
///
/// The result of the first successful call for a key is shared with every
/// later caller presenting byte-equal content, so materialization must be
/// deterministic with respect to its input: equal bytes must produce
/// equivalent values. The pool does not verify this precondition.
///
/// A materializer must not call back into the same pool for the same key;
/// doing so deadlocks on that key's terminal slot.
///
/// Implemented for any `Fn(&[u8]) -> Result<V, E>` closure.
pub trait Materializer<V> {
    /// Error reported when the bytes cannot be materialized.
    type Error;

    /// Produce the canonical value for `bytes`.
    fn materialize(&self, bytes: &[u8]) -> Result<V, Self::Error>;
}

impl<V, E, F> Materializer<V> for F
where
    F: Fn(&[u8]) -> Result<V, E>,
{
    type Error = E;

    fn materialize(&self, bytes: &[u8]) -> Result<V, E> {
        self(bytes)
    }
}

// =============================================================================
// Chunker
// =============================================================================

/// One trie level's worth of key bytes, packed big-endian into a `u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Chunk {
    /// Packed bytes; a partial final chunk is zero-padded on the right.
    value: u64,
    /// Exact number of key bytes this chunk consumed.
    consumed: usize,
    /// Whether this is the key's last chunk.
    is_final: bool,
}

/// Splits a key into fixed-width chunks without copying it.
///
/// Yields `ceil(len / width)` chunks; the empty key yields none. Padding a
/// partial final chunk loses no information because the pool disambiguates
/// terminal slots by exact key length, not by chunk value.
#[derive(Debug, Clone)]
struct Chunks<'a> {
    key: &'a [u8],
    width: usize,
    pos: usize,
}

impl<'a> Chunks<'a> {
    fn new(key: &'a [u8], width: usize) -> Self {
        debug_assert!((1..=MAX_CHUNK_WIDTH).contains(&width));
        Self { key, width, pos: 0 }
    }
}

impl Iterator for Chunks<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.pos >= self.key.len() {
            return None;
        }
        let take = self.width.min(self.key.len() - self.pos);
        let mut value = 0u64;
        for &b in &self.key[self.pos..self.pos + take] {
            value = (value << 8) | u64::from(b);
        }
        value <<= 8 * (self.width - take);
        self.pos += take;
        Some(Chunk {
            value,
            consumed: take,
            is_final: self.pos == self.key.len(),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = (self.key.len() - self.pos).div_ceil(self.width);
        (n, Some(n))
    }
}

impl ExactSizeIterator for Chunks<'_> {}

// =============================================================================
// Trie nodes
// =============================================================================

/// One published entry in a node's child dispatch list.
struct ChildEdge<V> {
    /// Chunk value selecting this edge.
    chunk: u64,
    /// The child node this edge leads to.
    node: Node<V>,
    /// Next entry in the list; written before publish, immutable after.
    next: AtomicPtr<ChildEdge<V>>,
}

/// A node's record of the canonical value for a key whose chunk sequence
/// ends here with this exact byte length.
///
/// The cell serializes materialization of the one key this slot stands for:
/// concurrent first callers block on it, and a failed materialization leaves
/// it empty for the next attempt.
struct TerminalSlot<V> {
    /// Exact key length in bytes, the final disambiguator.
    len: usize,
    /// The canonical value, set at most once.
    value: OnceCell<V>,
    /// Next slot in the list; written before publish, immutable after.
    next: AtomicPtr<TerminalSlot<V>>,
}

/// A trie vertex, identified implicitly by the chunk path that leads to it.
///
/// Both lists grow only at the head, one compare-and-set per published entry,
/// and nothing is ever unlinked: entries are freed solely in [`Drop`], where
/// exclusive access guarantees no concurrent reader exists. Probes are plain
/// acquire walks, so the read path stays free of write traffic once the pool
/// stabilizes.
struct Node<V> {
    children: AtomicPtr<ChildEdge<V>>,
    terminals: AtomicPtr<TerminalSlot<V>>,
}

// SAFETY: a Node exclusively owns the heap entries behind its raw pointers;
// sending the node sends the values it owns.
unsafe impl<V: Send> Send for Node<V> {}

// SAFETY: shared access mutates only the atomic list heads (single-slot CAS
// publishes) and the per-slot OnceCell, which serializes its own
// initialization. `V: Send` is required because a value materialized on one
// thread is dropped by whichever thread drops the pool.
unsafe impl<V: Send + Sync> Sync for Node<V> {}

impl<V> Node<V> {
    fn new() -> Self {
        Self {
            children: AtomicPtr::new(ptr::null_mut()),
            terminals: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Read-only probe of the child dispatch list.
    fn child(&self, chunk: u64) -> Option<&Node<V>> {
        let mut cur = self.children.load(Ordering::Acquire);
        while !cur.is_null() {
            // SAFETY: published edges stay live until the pool is dropped.
            let edge = unsafe { &*cur };
            if edge.chunk == chunk {
                return Some(&edge.node);
            }
            cur = edge.next.load(Ordering::Acquire);
        }
        None
    }

    /// Return the child for `chunk`, publishing a fresh one if absent.
    ///
    /// Publish granularity is a single compare-and-set on the list head. A
    /// caller that loses the race re-probes only the entries that appeared
    /// since its last scan; if the contested chunk is among them, the
    /// unpublished edge is freed and the winner's child is adopted.
    fn child_or_insert(&self, chunk: u64) -> &Node<V> {
        let mut head = self.children.load(Ordering::Acquire);
        let mut cur = head;
        while !cur.is_null() {
            // SAFETY: published edges stay live until the pool is dropped.
            let edge = unsafe { &*cur };
            if edge.chunk == chunk {
                return &edge.node;
            }
            cur = edge.next.load(Ordering::Acquire);
        }

        let new_edge = Box::into_raw(Box::new(ChildEdge {
            chunk,
            node: Node::new(),
            next: AtomicPtr::new(ptr::null_mut()),
        }));
        loop {
            // SAFETY: new_edge is unpublished and exclusively ours.
            unsafe { (*new_edge).next.store(head, Ordering::Relaxed) };
            match self
                .children
                .compare_exchange(head, new_edge, Ordering::AcqRel, Ordering::Acquire)
            {
                // SAFETY: now published; lives until the pool is dropped.
                Ok(_) => return unsafe { &(*new_edge).node },
                Err(observed) => {
                    // Entries are only ever pushed at the head, so the edges
                    // between `observed` and the stale `head` are exactly the
                    // ones not probed yet.
                    let mut cur = observed;
                    while cur != head {
                        // SAFETY: published edges stay live until drop.
                        let edge = unsafe { &*cur };
                        if edge.chunk == chunk {
                            // SAFETY: never published; still exclusively ours.
                            drop(unsafe { Box::from_raw(new_edge) });
                            return &edge.node;
                        }
                        cur = edge.next.load(Ordering::Acquire);
                    }
                    head = observed;
                }
            }
        }
    }

    /// Read-only probe of the terminal slots.
    fn terminal(&self, len: usize) -> Option<&TerminalSlot<V>> {
        let mut cur = self.terminals.load(Ordering::Acquire);
        while !cur.is_null() {
            // SAFETY: published slots stay live until the pool is dropped.
            let slot = unsafe { &*cur };
            if slot.len == len {
                return Some(slot);
            }
            cur = slot.next.load(Ordering::Acquire);
        }
        None
    }

    /// Return the terminal slot for keys of exactly `len` bytes ending here,
    /// publishing an empty one if absent. Same race discipline as
    /// [`Node::child_or_insert`].
    fn terminal_or_insert(&self, len: usize) -> &TerminalSlot<V> {
        let mut head = self.terminals.load(Ordering::Acquire);
        let mut cur = head;
        while !cur.is_null() {
            // SAFETY: published slots stay live until the pool is dropped.
            let slot = unsafe { &*cur };
            if slot.len == len {
                return slot;
            }
            cur = slot.next.load(Ordering::Acquire);
        }

        let new_slot = Box::into_raw(Box::new(TerminalSlot {
            len,
            value: OnceCell::new(),
            next: AtomicPtr::new(ptr::null_mut()),
        }));
        loop {
            // SAFETY: new_slot is unpublished and exclusively ours.
            unsafe { (*new_slot).next.store(head, Ordering::Relaxed) };
            match self
                .terminals
                .compare_exchange(head, new_slot, Ordering::AcqRel, Ordering::Acquire)
            {
                // SAFETY: now published; lives until the pool is dropped.
                Ok(_) => return unsafe { &*new_slot },
                Err(observed) => {
                    let mut cur = observed;
                    while cur != head {
                        // SAFETY: published slots stay live until drop.
                        let slot = unsafe { &*cur };
                        if slot.len == len {
                            // SAFETY: never published; still exclusively ours.
                            drop(unsafe { Box::from_raw(new_slot) });
                            return slot;
                        }
                        cur = slot.next.load(Ordering::Acquire);
                    }
                    head = observed;
                }
            }
        }
    }
}

impl<V> Drop for Node<V> {
    fn drop(&mut self) {
        // Exclusive access: no concurrent readers can exist. Dropping an edge
        // drops its subtree, so recursion depth equals the trie depth, which
        // is bounded by the longest key's chunk count.
        let mut cur = *self.children.get_mut();
        while !cur.is_null() {
            // SAFETY: published edges are Box-allocated and freed only here.
            let mut edge = unsafe { Box::from_raw(cur) };
            cur = *edge.next.get_mut();
        }
        let mut cur = *self.terminals.get_mut();
        while !cur.is_null() {
            // SAFETY: published slots are Box-allocated and freed only here.
            let mut slot = unsafe { Box::from_raw(cur) };
            cur = *slot.next.get_mut();
        }
    }
}

// =============================================================================
// Pool
// =============================================================================

/// A scoped interning pool keyed on raw byte content.
///
/// One pool serves one interning domain (one column, one enumerated field);
/// independent pools coexist freely, each with its own chunk width and
/// materializer. The pool grows monotonically (no eviction, no per-entry
/// removal) until it is dropped or
/// [`discard`](BytePool::discard)ed, which releases the whole trie and every
/// canonical value at once.
///
/// The pool never retains a caller's key buffer past the call; only values
/// produced by the materializer are kept.
///
/// A shared `&BytePool` is safe to use from many threads; see the
/// [crate-level docs](crate) for the concurrency guarantees.
pub struct BytePool<V, M> {
    root: Node<V>,
    len: AtomicUsize,
    config: Config,
    materializer: M,
    discarded: bool,
}

impl<V, M> BytePool<V, M>
where
    M: Materializer<V>,
{
    /// Create an empty pool with the default chunk width.
    pub fn new(materializer: M) -> Self {
        Self::with_config(materializer, Config::default())
    }

    /// Create an empty pool with the given configuration.
    ///
    /// # Panics
    ///
    /// Panics if `config.chunk_width` is 0 or greater than 8.
    pub fn with_config(materializer: M, config: Config) -> Self {
        assert!(
            (1..=MAX_CHUNK_WIDTH).contains(&config.chunk_width),
            "chunk_width must be in 1..=8, got {}",
            config.chunk_width
        );
        Self {
            root: Node::new(),
            len: AtomicUsize::new(0),
            config,
            materializer,
            discarded: false,
        }
    }

    /// Return the canonical value for `key`, materializing it on first sight.
    ///
    /// Byte-equal keys always resolve to the identical instance for the life
    /// of the pool. The hit path performs no allocation and never invokes the
    /// materializer. On first sight the materializer runs at most once ever
    /// for this key: concurrent first callers block on this one key's
    /// terminal slot (and on nothing else) until the winner finishes.
    ///
    /// `key` is only read during the call and must not be mutated while the
    /// call is running; the pool keeps no reference to it afterwards.
    ///
    /// A materializer error is propagated and leaves no terminal entry
    /// behind, so a later call for the same key retries materialization.
    pub fn get_or_create(&self, key: &[u8]) -> Result<&V, PoolError<M::Error>> {
        if self.discarded {
            return Err(PoolError::Discarded);
        }
        let mut node = &self.root;
        for chunk in Chunks::new(key, self.config.chunk_width) {
            // Only the final chunk may be partial.
            debug_assert!(chunk.consumed == self.config.chunk_width || chunk.is_final);
            node = node.child_or_insert(chunk.value);
        }
        // The empty key descends zero levels and lands on the root.
        let slot = node.terminal_or_insert(key.len());
        let mut created = false;
        let value = slot.value.get_or_try_init(|| {
            let value = self
                .materializer
                .materialize(key)
                .map_err(PoolError::Materialize)?;
            created = true;
            Ok(value)
        })?;
        if created {
            self.len.fetch_add(1, Ordering::Relaxed);
        }
        Ok(value)
    }

    /// Look up the canonical value for `key` without creating one.
    ///
    /// Never allocates and never invokes the materializer, which makes it
    /// suitable for the build-then-freeze regime: populate the pool, then
    /// share it read-only across threads.
    pub fn get(&self, key: &[u8]) -> Result<Option<&V>, PoolError<M::Error>> {
        if self.discarded {
            return Err(PoolError::Discarded);
        }
        let mut node = &self.root;
        for chunk in Chunks::new(key, self.config.chunk_width) {
            match node.child(chunk.value) {
                Some(child) => node = child,
                None => return Ok(None),
            }
        }
        Ok(node.terminal(key.len()).and_then(|slot| slot.value.get()))
    }

    /// Number of distinct keys interned so far.
    pub fn size(&self) -> Result<usize, PoolError<M::Error>> {
        if self.discarded {
            return Err(PoolError::Discarded);
        }
        Ok(self.len.load(Ordering::Relaxed))
    }

    /// Release the entire trie and every canonical value at once.
    ///
    /// The pool must not be used afterwards: every later operation, including
    /// a second `discard`, reports [`PoolError::Discarded`]. Taking
    /// `&mut self` statically excludes a discard racing an in-flight lookup.
    pub fn discard(&mut self) -> Result<(), PoolError<M::Error>> {
        if self.discarded {
            return Err(PoolError::Discarded);
        }
        self.discarded = true;
        self.root = Node::new();
        *self.len.get_mut() = 0;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================


#[cfg(test)]
mod proptests;
