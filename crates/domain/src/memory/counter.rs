use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::ports::BoxFuture;
use crate::ports::counter::{AllocatorError, AllocatorKey, CounterStore};

#[derive(Clone, Debug)]
struct CounterRow {
    horizon: u64,
    holder: String,
    lease_expires_at: Option<Instant>,
}

#[derive(Clone, Default)]
pub struct InMemoryCounterStore {
    rows: Arc<Mutex<HashMap<AllocatorKey, CounterRow>>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn horizon(&self, key: AllocatorKey) -> Option<u64> {
        self.rows.lock().get(&key).map(|row| row.horizon)
    }

    fn lease_is_live(row: &CounterRow, now: Instant) -> bool {
        !row.holder.is_empty() && row.lease_expires_at.is_some_and(|deadline| deadline > now)
    }
}

impl CounterStore for InMemoryCounterStore {
    fn acquire(
        &self,
        key: AllocatorKey,
        owner: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<u64, AllocatorError>> {
        let owner = owner.to_string();
        let rows = self.rows.clone();
        Box::pin(async move {
            let now = Instant::now();
            let mut rows = rows.lock();
            let row = rows.entry(key).or_insert_with(|| CounterRow {
                horizon: 0,
                holder: String::new(),
                lease_expires_at: None,
            });
            if row.holder != owner && Self::lease_is_live(row, now) {
                return Err(AllocatorError::LeaseHeld(key));
            }
            row.holder = owner;
            row.lease_expires_at = Some(now + ttl);
            Ok(row.horizon)
        })
    }

    fn advance(
        &self,
        key: AllocatorKey,
        owner: &str,
        horizon: u64,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<(), AllocatorError>> {
        let owner = owner.to_string();
        let rows = self.rows.clone();
        Box::pin(async move {
            let mut rows = rows.lock();
            let Some(row) = rows.get_mut(&key) else {
                return Err(AllocatorError::LeaseLost(key));
            };
            if row.holder != owner {
                return Err(AllocatorError::LeaseLost(key));
            }
            row.horizon = row.horizon.max(horizon);
            row.lease_expires_at = Some(Instant::now() + ttl);
            Ok(())
        })
    }

    fn release(&self, key: AllocatorKey, owner: &str) -> BoxFuture<'_, Result<(), AllocatorError>> {
        let owner = owner.to_string();
        let rows = self.rows.clone();
        Box::pin(async move {
            if let Some(row) = rows.lock().get_mut(&key)
                && row.holder == owner
            {
                row.holder.clear();
                row.lease_expires_at = None;
            }
            Ok(())
        })
    }
}
