use tapglue_domain::envelope::Sequence;
use tapglue_domain::ports::BoxFuture;
use tapglue_domain::ports::cursor::{CursorError, CursorStore};

use crate::db::{PostgresClient, is_unique_violation};

/// The `consumers` row of each logical consumer, always on the main pool.
#[derive(Clone)]
pub struct PostgresCursorStore {
    client: PostgresClient,
}

impl PostgresCursorStore {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

fn cursor_error(err: sqlx::Error) -> CursorError {
    match err {
        sqlx::Error::Database(_) | sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            CursorError::Operation(err.to_string())
        }
        other => CursorError::Unavailable(other.to_string()),
    }
}

impl CursorStore for PostgresCursorStore {
    fn load(&self, consumer: &str) -> BoxFuture<'_, Result<Option<Sequence>, CursorError>> {
        let consumer = consumer.to_string();
        Box::pin(async move {
            let row: Option<(Option<String>,)> = sqlx::query_as(
                "SELECT consumer_position FROM consumers WHERE consumer_name = $1",
            )
            .bind(&consumer)
            .fetch_optional(self.client.main())
            .await
            .map_err(cursor_error)?;
            Ok(row.map(|(position,)| Sequence::new(position.unwrap_or_default())))
        })
    }

    fn create(&self, consumer: &str) -> BoxFuture<'_, Result<(), CursorError>> {
        let consumer = consumer.to_string();
        Box::pin(async move {
            let inserted = sqlx::query(
                "INSERT INTO consumers (consumer_name, consumer_position, updated_at) \
                 VALUES ($1, '', now())",
            )
            .bind(&consumer)
            .execute(self.client.main())
            .await;
            match inserted {
                Ok(_) => {
                    tracing::info!(consumer = %consumer, "cursor row created");
                    Ok(())
                }
                Err(err) if is_unique_violation(&err) => {
                    tracing::debug!(consumer = %consumer, "cursor row created concurrently");
                    Ok(())
                }
                Err(err) => Err(cursor_error(err)),
            }
        })
    }

    fn save(&self, consumer: &str, position: &Sequence) -> BoxFuture<'_, Result<(), CursorError>> {
        let consumer = consumer.to_string();
        let position = position.clone();
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE consumers SET consumer_position = $1, updated_at = now() \
                 WHERE consumer_name = $2",
            )
            .bind(position.as_str())
            .bind(&consumer)
            .execute(self.client.main())
            .await
            .map_err(cursor_error)?;
            if result.rows_affected() == 0 {
                return Err(CursorError::Missing(consumer));
            }
            Ok(())
        })
    }
}
