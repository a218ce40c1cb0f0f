use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::envelope::Sequence;
use crate::ports::BoxFuture;
use crate::ports::cursor::{CursorError, CursorStore};

/// Cursor rows kept in memory, with a log of every persisted position and
/// an optional number of saves to fail.
#[derive(Clone, Default)]
pub struct InMemoryCursorStore {
    rows: Arc<Mutex<HashMap<String, Sequence>>>,
    history: Arc<Mutex<Vec<Sequence>>>,
    failing_saves: Arc<AtomicUsize>,
    creates: Arc<AtomicUsize>,
}

impl InMemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_position(consumer: &str, position: Sequence) -> Self {
        let store = Self::new();
        store.rows.lock().insert(consumer.to_string(), position);
        store
    }

    pub fn position(&self, consumer: &str) -> Option<Sequence> {
        self.rows.lock().get(consumer).cloned()
    }

    /// Every position saved so far, in order.
    pub fn history(&self) -> Vec<Sequence> {
        self.history.lock().clone()
    }

    pub fn create_calls(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn fail_next_saves(&self, count: usize) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }
}

impl CursorStore for InMemoryCursorStore {
    fn load(&self, consumer: &str) -> BoxFuture<'_, Result<Option<Sequence>, CursorError>> {
        let consumer = consumer.to_string();
        let rows = self.rows.clone();
        Box::pin(async move { Ok(rows.lock().get(&consumer).cloned()) })
    }

    fn create(&self, consumer: &str) -> BoxFuture<'_, Result<(), CursorError>> {
        let consumer = consumer.to_string();
        let rows = self.rows.clone();
        let creates = self.creates.clone();
        Box::pin(async move {
            creates.fetch_add(1, Ordering::SeqCst);
            rows.lock().entry(consumer).or_default();
            Ok(())
        })
    }

    fn save(&self, consumer: &str, position: &Sequence) -> BoxFuture<'_, Result<(), CursorError>> {
        let consumer = consumer.to_string();
        let position = position.clone();
        let rows = self.rows.clone();
        let history = self.history.clone();
        let failing = self.failing_saves.clone();
        Box::pin(async move {
            let should_fail = failing
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if should_fail {
                return Err(CursorError::Unavailable("injected save failure".into()));
            }
            let mut rows = rows.lock();
            let Some(row) = rows.get_mut(&consumer) else {
                return Err(CursorError::Missing(consumer));
            };
            *row = position.clone();
            history.lock().push(position);
            Ok(())
        })
    }
}
