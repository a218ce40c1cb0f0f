use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ports::counter::{AllocatorError, AllocatorKey, CounterStore, IdKind};
use crate::util::now_ms;

/// 2015-01-01T00:00:00Z in unix milliseconds.
pub const EPOCH_MS: u64 = 1_420_070_400_000;

const MACHINE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const TICK_BITS: u32 = 41;

pub const MAX_MACHINE_ID: u16 = (1 << MACHINE_BITS) - 1;
const MAX_SEQUENCE: u16 = (1 << SEQUENCE_BITS) - 1;
const TICK_LIMIT: u64 = 1 << TICK_BITS;

/// Source of wall-clock time in unix milliseconds.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

#[derive(Clone, Debug)]
pub struct AllocatorConfig {
    pub machine_id: u16,
    /// Ticks reserved ahead per persisted horizon write.
    pub reserve_ms: u64,
    pub lease_ttl: Duration,
    /// Lease holder name; unique per process.
    pub owner: String,
}

impl AllocatorConfig {
    pub fn new(machine_id: u16, owner: impl Into<String>) -> Self {
        Self {
            machine_id,
            reserve_ms: 10_000,
            lease_ttl: Duration::from_secs(60),
            owner: owner.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdParts {
    pub tick: u64,
    pub machine_id: u16,
    pub sequence: u16,
}

pub fn compose(tick: u64, machine_id: u16, sequence: u16) -> u64 {
    (tick << (MACHINE_BITS + SEQUENCE_BITS))
        | (u64::from(machine_id & MAX_MACHINE_ID) << SEQUENCE_BITS)
        | u64::from(sequence & MAX_SEQUENCE)
}

pub fn decompose(id: u64) -> IdParts {
    IdParts {
        tick: id >> (MACHINE_BITS + SEQUENCE_BITS),
        machine_id: ((id >> SEQUENCE_BITS) & u64::from(MAX_MACHINE_ID)) as u16,
        sequence: (id & u64::from(MAX_SEQUENCE)) as u16,
    }
}

#[derive(Clone, Copy, Debug)]
struct KeyState {
    /// Persisted horizon found when the lease was taken. Every id minted by
    /// earlier holders has a smaller tick.
    floor: u64,
    last: Option<(u64, u16)>,
    /// Exclusive upper bound of ticks covered by the persisted horizon.
    horizon: u64,
    /// Half of the lease ttl after the last successful acquire or advance.
    /// Nothing is minted past it until the lease is renewed.
    renew_after: Instant,
}

impl KeyState {
    fn candidate(&self, now_tick: u64) -> (u64, u16) {
        let tick = now_tick.max(self.floor);
        match self.last {
            Some((last_tick, sequence)) if tick <= last_tick => {
                if sequence >= MAX_SEQUENCE {
                    (last_tick + 1, 0)
                } else {
                    (last_tick, sequence + 1)
                }
            }
            _ => (tick, 0),
        }
    }
}

/// k-ordered 64-bit id generator: `tick | machine | sequence`, strictly
/// increasing per `(application, kind)` within a process and across restarts.
pub struct IdAllocator {
    store: Arc<dyn CounterStore>,
    config: AllocatorConfig,
    clock: Clock,
    keys: Mutex<HashMap<AllocatorKey, KeyState>>,
    reservations: tokio::sync::Mutex<()>,
    renewal: CancellationToken,
}

impl IdAllocator {
    pub fn new(store: Arc<dyn CounterStore>, config: AllocatorConfig) -> Self {
        Self {
            store,
            config,
            clock: Arc::new(|| now_ms().max(0) as u64),
            keys: Mutex::new(HashMap::new()),
            reservations: tokio::sync::Mutex::new(()),
            renewal: CancellationToken::new(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    fn now_tick(&self) -> u64 {
        (self.clock)().saturating_sub(EPOCH_MS)
    }

    fn reserve_ms(&self) -> u64 {
        self.config.reserve_ms.max(1)
    }

    fn lease_ttl(&self) -> Duration {
        self.config.lease_ttl.max(Duration::from_millis(1))
    }

    fn renew_after(&self, started: Instant) -> Instant {
        started + self.lease_ttl() / 2
    }

    pub async fn next_id(&self, application_id: i64, kind: IdKind) -> Result<u64, AllocatorError> {
        let key = AllocatorKey::new(application_id, kind);
        loop {
            let needed = {
                let now = self.now_tick();
                let mut keys = self.keys.lock();
                match keys.get_mut(&key) {
                    Some(state) => {
                        let (tick, sequence) = state.candidate(now);
                        if tick >= TICK_LIMIT {
                            return Err(AllocatorError::Exhausted(key));
                        }
                        if tick < state.horizon && Instant::now() < state.renew_after {
                            state.last = Some((tick, sequence));
                            return Ok(compose(tick, self.config.machine_id, sequence));
                        }
                        Some(tick)
                    }
                    None => None,
                }
            };
            self.reserve(key, needed).await?;
        }
    }

    /// Takes the lease for each key ahead of the first allocation.
    pub async fn warm_up(&self, keys: &[AllocatorKey]) -> Result<(), AllocatorError> {
        for key in keys {
            if !self.keys.lock().contains_key(key) {
                self.reserve(*key, None).await?;
            }
        }
        Ok(())
    }

    async fn reserve(&self, key: AllocatorKey, needed: Option<u64>) -> Result<(), AllocatorError> {
        let _guard = self.reservations.lock().await;
        let now = self.now_tick();
        let existing = self.keys.lock().get(&key).copied();
        let owner = self.config.owner.as_str();
        let ttl = self.lease_ttl();

        match existing {
            None => {
                let started = Instant::now();
                let floor = self.store.acquire(key, owner, ttl).await?;
                let start = now.max(floor);
                if start >= TICK_LIMIT {
                    return Err(AllocatorError::Exhausted(key));
                }
                let horizon = start.saturating_add(self.reserve_ms()).min(TICK_LIMIT);
                self.store.advance(key, owner, horizon, ttl).await?;
                self.keys.lock().insert(
                    key,
                    KeyState {
                        floor,
                        last: None,
                        horizon,
                        renew_after: self.renew_after(started),
                    },
                );
                debug!(%key, floor, horizon, "id allocator lease acquired");
            }
            Some(state) => {
                let needed = needed.unwrap_or(state.horizon);
                let due = Instant::now() >= state.renew_after;
                if state.horizon > needed && !due {
                    return Ok(());
                }
                let horizon = if state.horizon > needed {
                    state.horizon
                } else {
                    let horizon = needed
                        .max(now)
                        .saturating_add(self.reserve_ms())
                        .min(TICK_LIMIT);
                    if horizon <= needed {
                        return Err(AllocatorError::Exhausted(key));
                    }
                    horizon
                };
                self.extend(key, horizon).await?;
                debug!(%key, horizon, "id allocator horizon advanced");
            }
        }
        Ok(())
    }

    /// Persists `horizon` and renews the lease. A lost lease forgets the key,
    /// so the next allocation has to acquire it again.
    async fn extend(&self, key: AllocatorKey, horizon: u64) -> Result<(), AllocatorError> {
        let started = Instant::now();
        match self
            .store
            .advance(key, &self.config.owner, horizon, self.lease_ttl())
            .await
        {
            Ok(()) => {
                if let Some(state) = self.keys.lock().get_mut(&key) {
                    state.horizon = state.horizon.max(horizon);
                    state.renew_after = self.renew_after(started);
                }
                Ok(())
            }
            Err(err) => {
                if matches!(err, AllocatorError::LeaseLost(_)) {
                    self.keys.lock().remove(&key);
                }
                Err(err)
            }
        }
    }

    /// Renews every held lease that is past half of its ttl.
    pub async fn renew_leases(&self) {
        let _guard = self.reservations.lock().await;
        let now = Instant::now();
        let due: Vec<(AllocatorKey, u64)> = self
            .keys
            .lock()
            .iter()
            .filter(|(_, state)| state.renew_after <= now)
            .map(|(key, state)| (*key, state.horizon))
            .collect();
        for (key, horizon) in due {
            match self.extend(key, horizon).await {
                Ok(()) => debug!(%key, "id allocator lease renewed"),
                Err(err) => warn!(%key, error = %err, "failed to renew id allocator lease"),
            }
        }
    }

    /// Keeps idle leases alive until `release_all`.
    pub fn spawn_renewal(self: &Arc<Self>) -> JoinHandle<()> {
        let allocator = self.clone();
        let stop = self.renewal.clone();
        let period = (self.lease_ttl() / 4).max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => allocator.renew_leases().await,
                }
            }
            info!("id allocator lease renewal stopped");
        })
    }

    /// Releases every lease this process holds.
    pub async fn release_all(&self) {
        self.renewal.cancel();
        let _guard = self.reservations.lock().await;
        let keys: Vec<AllocatorKey> = self.keys.lock().drain().map(|(key, _)| key).collect();
        for key in keys {
            if let Err(err) = self.store.release(key, &self.config.owner).await {
                warn!(%key, error = %err, "failed to release id allocator lease");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryCounterStore;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn fixed_clock(value: Arc<AtomicU64>) -> Clock {
        Arc::new(move || value.load(Ordering::SeqCst))
    }

    fn allocator(store: Arc<InMemoryCounterStore>, owner: &str, clock: Clock) -> IdAllocator {
        let mut config = AllocatorConfig::new(3, owner);
        config.reserve_ms = 5;
        IdAllocator::new(store, config).with_clock(clock)
    }

    #[test]
    fn compose_and_decompose_agree() {
        let id = compose(123_456, 7, 42);
        assert_eq!(
            decompose(id),
            IdParts {
                tick: 123_456,
                machine_id: 7,
                sequence: 42
            }
        );
    }

    #[tokio::test]
    async fn ids_increase_when_the_clock_stands_still() {
        let store = Arc::new(InMemoryCounterStore::new());
        let now = Arc::new(AtomicU64::new(EPOCH_MS + 1_000));
        let allocator = allocator(store, "a", fixed_clock(now));

        let mut last = 0;
        for _ in 0..10_000 {
            let id = allocator.next_id(1, IdKind::Events).await.unwrap();
            assert!(id > last);
            last = id;
        }
        assert_eq!(decompose(last).machine_id, 3);
    }

    #[tokio::test]
    async fn ids_increase_when_the_clock_goes_backwards() {
        let store = Arc::new(InMemoryCounterStore::new());
        let now = Arc::new(AtomicU64::new(EPOCH_MS + 50_000));
        let allocator = allocator(store, "a", fixed_clock(now.clone()));

        let first = allocator.next_id(1, IdKind::Users).await.unwrap();
        now.store(EPOCH_MS + 10_000, Ordering::SeqCst);
        let second = allocator.next_id(1, IdKind::Users).await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn restart_resumes_above_the_persisted_horizon() {
        let store = Arc::new(InMemoryCounterStore::new());
        let now = Arc::new(AtomicU64::new(EPOCH_MS + 90_000));
        let first = allocator(store.clone(), "a", fixed_clock(now.clone()));
        let before = first.next_id(9, IdKind::Users).await.unwrap();
        first.release_all().await;

        now.store(EPOCH_MS + 1_000, Ordering::SeqCst);
        let second = allocator(store, "b", fixed_clock(now));
        let after = second.next_id(9, IdKind::Users).await.unwrap();
        assert!(after > before);
    }

    #[tokio::test]
    async fn live_lease_blocks_a_second_process() {
        let store = Arc::new(InMemoryCounterStore::new());
        let now = Arc::new(AtomicU64::new(EPOCH_MS + 1_000));
        let first = allocator(store.clone(), "a", fixed_clock(now.clone()));
        first.next_id(1, IdKind::Events).await.unwrap();

        let second = allocator(store, "b", fixed_clock(now));
        let err = second.next_id(1, IdKind::Events).await.unwrap_err();
        assert!(matches!(err, AllocatorError::LeaseHeld(_)));
    }

    #[tokio::test]
    async fn renewal_keeps_an_idle_lease_exclusive() {
        let store = Arc::new(InMemoryCounterStore::new());
        let now = Arc::new(AtomicU64::new(EPOCH_MS + 1_000));
        let mut config = AllocatorConfig::new(3, "a");
        config.lease_ttl = Duration::from_millis(40);
        let first = Arc::new(
            IdAllocator::new(store.clone(), config).with_clock(fixed_clock(now.clone())),
        );
        first.next_id(1, IdKind::Events).await.unwrap();
        let renewal = first.spawn_renewal();

        tokio::time::sleep(Duration::from_millis(150)).await;
        let second = allocator(store.clone(), "b", fixed_clock(now.clone()));
        let err = second.next_id(1, IdKind::Events).await.unwrap_err();
        assert!(matches!(err, AllocatorError::LeaseHeld(_)));
        first.next_id(1, IdKind::Events).await.unwrap();

        first.release_all().await;
        renewal.await.unwrap();
        second.next_id(1, IdKind::Events).await.unwrap();
    }

    #[tokio::test]
    async fn lapsed_lease_is_renewed_before_minting() {
        let store = Arc::new(InMemoryCounterStore::new());
        let now = Arc::new(AtomicU64::new(EPOCH_MS + 1_000));
        let mut config = AllocatorConfig::new(3, "a");
        config.lease_ttl = Duration::from_millis(20);
        let first = IdAllocator::new(store.clone(), config).with_clock(fixed_clock(now.clone()));
        first.next_id(1, IdKind::Events).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = allocator(store, "b", fixed_clock(now));
        second.next_id(1, IdKind::Events).await.unwrap();

        let err = first.next_id(1, IdKind::Events).await.unwrap_err();
        assert!(matches!(err, AllocatorError::LeaseLost(_)));
        let err = first.next_id(1, IdKind::Events).await.unwrap_err();
        assert!(matches!(err, AllocatorError::LeaseHeld(_)));
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let store = Arc::new(InMemoryCounterStore::new());
        let now = Arc::new(AtomicU64::new(EPOCH_MS + 1_000));
        let allocator = allocator(store, "a", fixed_clock(now));
        let users = allocator.next_id(1, IdKind::Users).await.unwrap();
        let events = allocator.next_id(1, IdKind::Events).await.unwrap();
        assert_eq!(users, events);
    }

    #[tokio::test]
    async fn exhausted_tick_space_mints_nothing() {
        let store = Arc::new(InMemoryCounterStore::new());
        let now = Arc::new(AtomicU64::new(EPOCH_MS + TICK_LIMIT + 5));
        let allocator = allocator(store, "a", fixed_clock(now));
        let err = allocator.next_id(1, IdKind::Events).await.unwrap_err();
        assert!(matches!(err, AllocatorError::Exhausted(_)));
    }
}
