//! PostgreSQL signature store for the collector

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use eyre::WrapErr;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::error;

use crate::collector::SignatureStore;
use crate::error::{BridgeOutError, Result};
use crate::types::{EntryStatus, UnlockEvent};

pub mod models;

pub use models::*;

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> eyre::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> eyre::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

/// [`SignatureStore`] backed by PostgreSQL
pub struct PgSignatureStore {
    pool: PgPool,
}

impl PgSignatureStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SignatureStore for PgSignatureStore {
    async fn save_entry(&self, event: &UnlockEvent) -> Result<bool> {
        let inserted = sqlx::query_as::<_, (String,)>(
            r#"
            INSERT INTO bridge_out_entries (sequence_number, recipient, token, amount, chain)
            VALUES ($1::NUMERIC, $2, $3, $4::NUMERIC, $5)
            ON CONFLICT (sequence_number) DO NOTHING
            RETURNING sequence_number::TEXT
            "#,
        )
        .bind(event.sequence_number.to_string())
        .bind(event.recipient.to_vec())
        .bind(event.token.to_string())
        .bind(event.amount.to_string())
        .bind(i16::from(event.chain.as_u8()))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!(
                sequence_number = %event.sequence_number,
                "SQL error saving bridge-out entry: {:?}", e
            );
            e
        })?;

        Ok(inserted.is_some())
    }

    async fn load_entry(&self, sequence_number: U256) -> Result<Option<UnlockEvent>> {
        let row = sqlx::query_as::<_, BridgeOutEntryRow>(
            r#"SELECT sequence_number::TEXT as sequence_number, recipient, token,
                      amount::TEXT as amount, chain, status, created_at, updated_at
               FROM bridge_out_entries WHERE sequence_number = $1::NUMERIC"#,
        )
        .bind(sequence_number.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.to_event()).transpose()
    }

    async fn entry_status(&self, sequence_number: U256) -> Result<Option<EntryStatus>> {
        let row = sqlx::query_as::<_, (String,)>(
            "SELECT status FROM bridge_out_entries WHERE sequence_number = $1::NUMERIC",
        )
        .bind(sequence_number.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(status,)| status.parse().map_err(BridgeOutError::Storage))
            .transpose()
    }

    async fn set_status(&self, sequence_number: U256, status: EntryStatus) -> Result<()> {
        sqlx::query(
            r#"UPDATE bridge_out_entries SET status = $2, updated_at = NOW()
               WHERE sequence_number = $1::NUMERIC"#,
        )
        .bind(sequence_number.to_string())
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_signature(
        &self,
        sequence_number: U256,
        validator: Address,
        signature: &[u8],
    ) -> Result<bool> {
        let inserted = sqlx::query_as::<_, (i64,)>(
            r#"
            INSERT INTO bridge_out_signatures (sequence_number, validator, signature)
            VALUES ($1::NUMERIC, $2, $3)
            ON CONFLICT (sequence_number, validator) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(sequence_number.to_string())
        .bind(validator.to_string())
        .bind(signature)
        .fetch_optional(&self.pool)
        .await?;

        Ok(inserted.is_some())
    }

    async fn load_signatures(&self, sequence_number: U256) -> Result<Vec<Vec<u8>>> {
        let rows = sqlx::query_as::<_, SignatureRow>(
            r#"SELECT id, sequence_number::TEXT as sequence_number, validator, signature, created_at
               FROM bridge_out_signatures
               WHERE sequence_number = $1::NUMERIC
               ORDER BY id ASC"#,
        )
        .bind(sequence_number.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.signature).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::unlock_event;

    async fn store() -> Option<PgSignatureStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = create_pool(&url).await.ok()?;
        run_migrations(&pool).await.ok()?;
        Some(PgSignatureStore::new(pool))
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_entry_and_signatures_round_trip() {
        let Some(store) = store().await else {
            return;
        };
        let event = unlock_event(u64::from(std::process::id()));
        store.save_entry(&event).await.unwrap();
        assert!(!store.save_entry(&event).await.unwrap());

        let loaded = store.load_entry(event.sequence_number).await.unwrap().unwrap();
        assert_eq!(loaded.recipient, event.recipient);
        assert_eq!(loaded.amount, event.amount);

        let first = Address::repeat_byte(1);
        let second = Address::repeat_byte(2);
        store
            .save_signature(event.sequence_number, second, &[2u8; 65])
            .await
            .unwrap();
        store
            .save_signature(event.sequence_number, first, &[1u8; 65])
            .await
            .unwrap();
        assert!(!store
            .save_signature(event.sequence_number, first, &[9u8; 65])
            .await
            .unwrap());

        let signatures = store.load_signatures(event.sequence_number).await.unwrap();
        assert_eq!(signatures, vec![vec![2u8; 65], vec![1u8; 65]]);

        store
            .set_status(event.sequence_number, EntryStatus::Processed)
            .await
            .unwrap();
        assert_eq!(
            store.entry_status(event.sequence_number).await.unwrap(),
            Some(EntryStatus::Processed)
        );
    }
}
