use std::time::Duration;

use tapglue_domain::ports::BoxFuture;
use tapglue_domain::ports::counter::{AllocatorError, AllocatorKey, CounterStore};

use crate::db::PostgresClient;

/// Allocator horizons in the `id_allocators` table, one row per key. The
/// lease is a holder name plus an expiry evaluated by the database clock.
#[derive(Clone)]
pub struct PostgresCounterStore {
    client: PostgresClient,
}

impl PostgresCounterStore {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

fn ttl_ms(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

fn allocator_error(err: sqlx::Error) -> AllocatorError {
    match err {
        sqlx::Error::Database(_) => AllocatorError::Operation(err.to_string()),
        other => AllocatorError::Unavailable(other.to_string()),
    }
}

impl CounterStore for PostgresCounterStore {
    fn acquire(
        &self,
        key: AllocatorKey,
        owner: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<u64, AllocatorError>> {
        let owner = owner.to_string();
        Box::pin(async move {
            let row: Option<(i64,)> = sqlx::query_as(
                "INSERT INTO id_allocators (application_id, kind, horizon, holder, lease_expires_at) \
                 VALUES ($1, $2, 0, $3, now() + $4 * interval '1 millisecond') \
                 ON CONFLICT (application_id, kind) DO UPDATE \
                 SET holder = EXCLUDED.holder, lease_expires_at = EXCLUDED.lease_expires_at \
                 WHERE id_allocators.holder = EXCLUDED.holder \
                 OR id_allocators.holder = '' \
                 OR id_allocators.lease_expires_at IS NULL \
                 OR id_allocators.lease_expires_at <= now() \
                 RETURNING horizon",
            )
            .bind(key.application_id)
            .bind(key.kind.as_str())
            .bind(&owner)
            .bind(ttl_ms(ttl))
            .fetch_optional(self.client.main())
            .await
            .map_err(allocator_error)?;

            let Some((horizon,)) = row else {
                return Err(AllocatorError::LeaseHeld(key));
            };
            tracing::debug!(key = %key, owner = %owner, horizon, "allocator lease acquired");
            u64::try_from(horizon)
                .map_err(|_| AllocatorError::Operation(format!("negative horizon for {key}")))
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
        Box::pin(async move {
            let horizon = i64::try_from(horizon).map_err(|_| AllocatorError::Exhausted(key))?;
            let result = sqlx::query(
                "UPDATE id_allocators \
                 SET horizon = GREATEST(horizon, $4), \
                 lease_expires_at = now() + $5 * interval '1 millisecond' \
                 WHERE application_id = $1 AND kind = $2 AND holder = $3",
            )
            .bind(key.application_id)
            .bind(key.kind.as_str())
            .bind(&owner)
            .bind(horizon)
            .bind(ttl_ms(ttl))
            .execute(self.client.main())
            .await
            .map_err(allocator_error)?;
            if result.rows_affected() == 0 {
                return Err(AllocatorError::LeaseLost(key));
            }
            Ok(())
        })
    }

    fn release(&self, key: AllocatorKey, owner: &str) -> BoxFuture<'_, Result<(), AllocatorError>> {
        let owner = owner.to_string();
        Box::pin(async move {
            sqlx::query(
                "UPDATE id_allocators SET holder = '', lease_expires_at = NULL \
                 WHERE application_id = $1 AND kind = $2 AND holder = $3",
            )
            .bind(key.application_id)
            .bind(key.kind.as_str())
            .bind(&owner)
            .execute(self.client.main())
            .await
            .map_err(allocator_error)?;
            Ok(())
        })
    }
}
