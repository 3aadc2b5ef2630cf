//! Chaotic storage wrapper for fault injection testing
//!
//! Storage wrapper that randomly fails operations to test error handling.
//! Used by chaos tests to check that a failed append is never broadcast and
//! that a failed history load does not corrupt membership.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicUsize, Ordering},
};

use roomcast_core::{Identity, RoomKey};
use roomcast_proto::ChatMessage;

use super::{Storage, StorageError, StoredRoomMetadata};

/// Chaotic storage wrapper that randomly injects failures
///
/// Delegates to an underlying storage implementation but fails operations
/// with probability `failure_rate`. A failed operation never reaches the
/// inner storage, so an injected append failure leaves no trace.
#[derive(Clone)]
pub struct ChaoticStorage<S: Storage> {
    inner: S,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    /// RNG state for deterministic chaos
    rng: Arc<Mutex<ChaoticRng>>,
    operation_count: Arc<AtomicUsize>,
    failure_count: Arc<AtomicUsize>,
}

/// Linear congruential generator; reproducible with the same seed.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Next value in [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // LCG constants from Numerical Recipes
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

impl<S: Storage> ChaoticStorage<S> {
    /// Wrap `inner` with a fixed default seed.
    ///
    /// `failure_rate` is clamped to [0.0, 1.0].
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Wrap `inner` with an explicit seed for reproducible chaos.
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        Self {
            inner,
            failure_rate: failure_rate.clamp(0.0, 1.0),
            rng: Arc::new(Mutex::new(ChaoticRng::new(seed))),
            operation_count: Arc::new(AtomicUsize::new(0)),
            failure_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Underlying storage (for checking invariants after chaos).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Total number of storage operations attempted.
    pub fn operation_count(&self) -> usize {
        self.operation_count.load(Ordering::Relaxed)
    }

    /// Number of operations that were failed on purpose.
    pub fn failure_count(&self) -> usize {
        self.failure_count.load(Ordering::Relaxed)
    }

    /// Count the operation and decide whether it fails.
    fn roll(&self) -> Result<(), StorageError> {
        self.operation_count.fetch_add(1, Ordering::Relaxed);

        let fail = self.rng.lock().unwrap_or_else(PoisonError::into_inner).next() < self.failure_rate;
        if fail {
            self.failure_count.fetch_add(1, Ordering::Relaxed);
            return Err(StorageError::Io("chaotic failure injection".to_string()));
        }
        Ok(())
    }
}

impl<S: Storage> Storage for ChaoticStorage<S> {
    fn append_message(
        &self,
        room: &RoomKey,
        sender: &Identity,
        body: &str,
    ) -> Result<ChatMessage, StorageError> {
        self.roll()?;
        self.inner.append_message(room, sender, body)
    }

    fn recent_messages(
        &self,
        room: &RoomKey,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StorageError> {
        self.roll()?;
        self.inner.recent_messages(room, limit)
    }

    fn latest_seq(&self, room: &RoomKey) -> Result<Option<u64>, StorageError> {
        self.roll()?;
        self.inner.latest_seq(room)
    }

    fn find_or_create_room(
        &self,
        room: &RoomKey,
        metadata: &StoredRoomMetadata,
    ) -> Result<StoredRoomMetadata, StorageError> {
        self.roll()?;
        self.inner.find_or_create_room(room, metadata)
    }

    fn room_metadata(&self, room: &RoomKey) -> Result<Option<StoredRoomMetadata>, StorageError> {
        self.roll()?;
        self.inner.room_metadata(room)
    }

    fn list_rooms(&self) -> Result<Vec<RoomKey>, StorageError> {
        self.roll()?;
        self.inner.list_rooms()
    }
}
