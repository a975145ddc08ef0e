//! PostgreSQL action log and cursor store

use super::{ActionLog, ActionStats, CursorStore, Leadership};
use crate::config::DatabaseConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::events::{ChainId, IdempotencyKey, Position};
use crate::relay::{ActionState, ActionTransition, PendingAction};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha3::{Digest, Keccak256};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Connection, Postgres, Row, Transaction};
use tracing::{debug, info, warn};

/// Postgres-backed implementation of [`ActionLog`] and [`CursorStore`]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn new(config: &DatabaseConfig) -> RelayerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> RelayerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chain_cursors (
                chain VARCHAR(16) PRIMARY KEY,
                position BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS relay_actions (
                idempotency_key CHAR(64) PRIMARY KEY,
                source_chain VARCHAR(16) NOT NULL,
                destination_chain VARCHAR(16) NOT NULL,
                source_position BIGINT NOT NULL,
                state VARCHAR(32) NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                tx_handle TEXT,
                record JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_relay_actions_state
            ON relay_actions (state, source_chain)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS relay_action_transitions (
                id BIGSERIAL PRIMARY KEY,
                idempotency_key CHAR(64) NOT NULL,
                from_state VARCHAR(32),
                to_state VARCHAR(32) NOT NULL,
                attempt INTEGER NOT NULL,
                tx_handle TEXT,
                error TEXT,
                recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transitions_key
            ON relay_action_transitions (idempotency_key, id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS archived_actions (
                idempotency_key CHAR(64) PRIMARY KEY,
                record JSONB NOT NULL,
                archived_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Take the advisory lock that grants submission rights for `namespace`.
    ///
    /// The lock lives on a connection detached from the pool and is released
    /// when the returned guard is dropped or the process exits.
    pub async fn acquire_leadership(&self, namespace: &str) -> RelayerResult<LeadershipLock> {
        let lock_key = advisory_key(namespace);
        let mut conn = self.pool.acquire().await?.detach();

        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(lock_key)
            .fetch_one(&mut conn)
            .await?;

        if !acquired {
            return Err(RelayerError::LeadershipUnavailable {
                namespace: namespace.to_string(),
            });
        }

        info!(namespace, lock_key, "Acquired relayer leadership lock");
        Ok(LeadershipLock {
            conn,
            lock_key,
            namespace: namespace.to_string(),
        })
    }

    async fn count_by_state(&self) -> RelayerResult<ActionStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE state = 'discovered') as discovered,
                COUNT(*) FILTER (WHERE state = 'submitting') as submitting,
                COUNT(*) FILTER (WHERE state = 'awaiting_confirmation') as awaiting,
                COUNT(*) FILTER (WHERE state = 'completed') as completed,
                COUNT(*) FILTER (WHERE state = 'failed') as failed
            FROM relay_actions
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(ActionStats {
            discovered: row.try_get::<i64, _>("discovered")? as u64,
            submitting: row.try_get::<i64, _>("submitting")? as u64,
            awaiting_confirmation: row.try_get::<i64, _>("awaiting")? as u64,
            completed: row.try_get::<i64, _>("completed")? as u64,
            failed: row.try_get::<i64, _>("failed")? as u64,
        })
    }

    async fn write_action(
        tx: &mut Transaction<'_, Postgres>,
        action: &PendingAction,
    ) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO relay_actions
                (idempotency_key, source_chain, destination_chain, source_position, state,
                 attempt_count, last_error, tx_handle, record, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (idempotency_key)
            DO UPDATE SET state = $5, attempt_count = $6, last_error = $7, tx_handle = $8,
                          record = $9, updated_at = $11
            "#,
        )
        .bind(action.key.as_str())
        .bind(action.source_event.chain.as_str())
        .bind(action.destination_chain.as_str())
        .bind(action.source_event.position as i64)
        .bind(action.state.as_str())
        .bind(action.attempt_count as i32)
        .bind(action.last_error.as_deref())
        .bind(action.tx_id())
        .bind(serde_json::to_value(action)?)
        .bind(action.created_at)
        .bind(action.updated_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn write_transition(
        tx: &mut Transaction<'_, Postgres>,
        transition: &ActionTransition,
    ) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO relay_action_transitions
                (idempotency_key, from_state, to_state, attempt, tx_handle, error, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(transition.key.as_str())
        .bind(transition.from.map(|s| s.as_str()))
        .bind(transition.to.as_str())
        .bind(transition.attempt as i32)
        .bind(transition.tx_handle.as_deref())
        .bind(transition.error.as_deref())
        .bind(transition.recorded_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn get_archived(&self, key: &IdempotencyKey) -> RelayerResult<Option<PendingAction>> {
        let row = sqlx::query("SELECT record FROM archived_actions WHERE idempotency_key = $1")
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| decode_record(r.try_get("record")?)).transpose()
    }
}

/// Held advisory lock; dropping it closes the session and releases the lock
pub struct LeadershipLock {
    conn: PgConnection,
    lock_key: i64,
    namespace: String,
}

#[async_trait]
impl Leadership for LeadershipLock {
    /// The advisory lock is session scoped, so a live session still holds it
    async fn ping(&mut self) -> RelayerResult<()> {
        self.conn.ping().await?;
        Ok(())
    }
}

impl LeadershipLock {
    pub async fn release(mut self) -> RelayerResult<()> {
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(self.lock_key)
            .execute(&mut self.conn)
            .await?;
        debug!(namespace = %self.namespace, "Released leadership lock");
        self.conn.close().await?;
        Ok(())
    }
}

fn advisory_key(namespace: &str) -> i64 {
    let digest = Keccak256::digest(format!("tokenbridge-relayer:{}", namespace).as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

fn decode_record(value: serde_json::Value) -> RelayerResult<PendingAction> {
    Ok(serde_json::from_value(value)?)
}

#[async_trait]
impl ActionLog for PgStore {
    async fn record_observed(
        &self,
        candidate: PendingAction,
    ) -> RelayerResult<(PendingAction, bool)> {
        if let Some(archived) = self.get_archived(&candidate.key).await? {
            return Ok((archived, false));
        }

        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO relay_actions
                (idempotency_key, source_chain, destination_chain, source_position, state,
                 attempt_count, last_error, tx_handle, record, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NULL, $8, $9, $9)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(candidate.key.as_str())
        .bind(candidate.source_event.chain.as_str())
        .bind(candidate.destination_chain.as_str())
        .bind(candidate.source_event.position as i64)
        .bind(candidate.state.as_str())
        .bind(candidate.attempt_count as i32)
        .bind(candidate.last_error.as_deref())
        .bind(serde_json::to_value(&candidate)?)
        .bind(candidate.created_at)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if inserted {
            Self::write_transition(&mut tx, &candidate.creation()).await?;
            tx.commit().await?;
            return Ok((candidate, true));
        }
        tx.rollback().await?;

        let existing = self.get(&candidate.key).await?.ok_or_else(|| {
            RelayerError::Internal(format!("Action {} vanished after conflict", candidate.key))
        })?;
        Ok((existing, false))
    }

    async fn commit(
        &self,
        action: &PendingAction,
        transition: &ActionTransition,
    ) -> RelayerResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::write_action(&mut tx, action).await?;
        Self::write_transition(&mut tx, transition).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn upsert(&self, action: &PendingAction) -> RelayerResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::write_action(&mut tx, action).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, key: &IdempotencyKey) -> RelayerResult<Option<PendingAction>> {
        let row = sqlx::query("SELECT record FROM relay_actions WHERE idempotency_key = $1")
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(decode_record(row.try_get("record")?)?)),
            None => self.get_archived(key).await,
        }
    }

    async fn list_by_state(&self, state: ActionState) -> RelayerResult<Vec<PendingAction>> {
        let rows = sqlx::query(
            r#"
            SELECT record FROM relay_actions
            WHERE state = $1
            ORDER BY source_position, created_at
            "#,
        )
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut actions = Vec::with_capacity(rows.len());
        for row in rows {
            match decode_record(row.try_get("record")?) {
                Ok(action) => actions.push(action),
                Err(e) => warn!("Skipping undecodable action record: {}", e),
            }
        }
        Ok(actions)
    }

    async fn history(&self, key: &IdempotencyKey) -> RelayerResult<Vec<ActionTransition>> {
        let rows = sqlx::query(
            r#"
            SELECT from_state, to_state, attempt, tx_handle, error, recorded_at
            FROM relay_action_transitions
            WHERE idempotency_key = $1
            ORDER BY id
            "#,
        )
        .bind(key.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> RelayerResult<ActionTransition> {
                let from: Option<String> = row.try_get("from_state")?;
                let to: String = row.try_get("to_state")?;
                Ok(ActionTransition {
                    key: key.clone(),
                    from: from.map(|s| s.parse()).transpose()?,
                    to: to.parse()?,
                    attempt: row.try_get::<i32, _>("attempt")? as u32,
                    tx_handle: row.try_get("tx_handle")?,
                    error: row.try_get("error")?,
                    recorded_at: row.try_get::<DateTime<Utc>, _>("recorded_at")?,
                })
            })
            .collect()
    }

    async fn archive_completed(&self, cutoff: DateTime<Utc>) -> RelayerResult<u64> {
        let result = sqlx::query(
            r#"
            WITH moved AS (
                DELETE FROM relay_actions
                WHERE state = 'completed' AND updated_at < $1
                RETURNING idempotency_key, record
            )
            INSERT INTO archived_actions (idempotency_key, record, archived_at)
            SELECT idempotency_key, record, NOW() FROM moved
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> RelayerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn stats(&self) -> RelayerResult<ActionStats> {
        self.count_by_state().await
    }
}

#[async_trait]
impl CursorStore for PgStore {
    async fn load(&self, chain: ChainId) -> RelayerResult<Option<Position>> {
        let row = sqlx::query("SELECT position FROM chain_cursors WHERE chain = $1")
            .bind(chain.as_str())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row
            .map(|r| r.try_get::<i64, _>("position"))
            .transpose()?
            .map(|p| p as u64))
    }

    async fn advance(&self, chain: ChainId, position: Position) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chain_cursors (chain, position, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (chain)
            DO UPDATE SET position = GREATEST(chain_cursors.position, EXCLUDED.position),
                          updated_at = NOW()
            "#,
        )
        .bind(chain.as_str())
        .bind(position as i64)
        .execute(&self.pool)
        .await?;

        debug!(chain = %chain, position, "Advanced cursor");
        Ok(())
    }

    async fn list(&self) -> RelayerResult<Vec<(ChainId, Position)>> {
        let rows = sqlx::query("SELECT chain, position FROM chain_cursors ORDER BY chain")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| -> RelayerResult<(ChainId, Position)> {
                let chain: String = row.try_get("chain")?;
                let position: i64 = row.try_get("position")?;
                Ok((chain.parse()?, position as u64))
            })
            .collect()
    }
}
