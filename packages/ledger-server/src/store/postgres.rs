//! `PostgreSQL`-backed [`BiTemporalStore`], implementing the literal schema
//! sketched in spec.md §4.1. Optional (`--features postgres`); the default
//! backend is [`super::memory::MemoryStore`] paired with a
//! [`super::log::BlockLog`].

use async_trait::async_trait;
use ledger_core::{
    synthetic, BlockBatch, EntityData, EntityKey, MalformedBatchError, OperationKind, OwnerAddress,
    Predicate, QueryExpr, QueryOptions, StringOrNumeric, INF,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::debug;

use super::engine::{BiTemporalStore, StoreError};

/// `PgStore` owns a connection pool and serializes writers with a
/// transaction-level advisory lock rather than an in-process mutex, since
/// multiple server processes may share one database.
pub struct PgStore {
    pool: PgPool,
    ops_per_tx: u64,
}

const WRITER_LOCK_KEY: i64 = 0x4c45_4447_4552; // "LEDGER" in hex, truncated to fit i64

impl PgStore {
    pub async fn connect(url: &str, ops_per_tx: u64) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        let store = Self { pool, ops_per_tx };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS string_attributes (
                entity_key BYTEA NOT NULL,
                from_block BIGINT NOT NULL,
                to_block BIGINT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (entity_key, key, from_block)
            );
            CREATE INDEX IF NOT EXISTS string_attributes_to_block ON string_attributes (to_block);
            CREATE INDEX IF NOT EXISTS string_attributes_key_value
                ON string_attributes (key, value, from_block DESC, to_block DESC);

            CREATE TABLE IF NOT EXISTS numeric_attributes (
                entity_key BYTEA NOT NULL,
                from_block BIGINT NOT NULL,
                to_block BIGINT NOT NULL,
                key TEXT NOT NULL,
                value BIGINT NOT NULL,
                PRIMARY KEY (entity_key, key, from_block)
            );
            CREATE INDEX IF NOT EXISTS numeric_attributes_to_block ON numeric_attributes (to_block);
            CREATE INDEX IF NOT EXISTS numeric_attributes_key_value
                ON numeric_attributes (key, value, from_block DESC, to_block DESC);

            CREATE TABLE IF NOT EXISTS payloads (
                entity_key BYTEA NOT NULL,
                from_block BIGINT NOT NULL,
                to_block BIGINT NOT NULL,
                payload BYTEA NOT NULL,
                content_type TEXT NOT NULL,
                PRIMARY KEY (entity_key, from_block)
            );
            CREATE INDEX IF NOT EXISTS payloads_to_block ON payloads (to_block);

            CREATE TABLE IF NOT EXISTS last_block (
                id SMALLINT PRIMARY KEY DEFAULT 1,
                block BIGINT NOT NULL
            );
            INSERT INTO last_block (id, block) VALUES (1, 0) ON CONFLICT (id) DO NOTHING;
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn close_active(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        entity_key: &[u8],
        block: i64,
    ) -> Result<Option<i64>, StoreError> {
        let created_at: Option<i64> = sqlx::query_scalar(
            "SELECT value FROM numeric_attributes WHERE entity_key = $1 AND key = $2 AND to_block = $3",
        )
        .bind(entity_key)
        .bind(synthetic::CREATED_AT_BLOCK)
        .bind(INF as i64)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        sqlx::query("UPDATE string_attributes SET to_block = $1 WHERE entity_key = $2 AND to_block = $3")
            .bind(block)
            .bind(entity_key)
            .bind(INF as i64)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        sqlx::query("UPDATE numeric_attributes SET to_block = $1 WHERE entity_key = $2 AND to_block = $3")
            .bind(block)
            .bind(entity_key)
            .bind(INF as i64)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        sqlx::query("UPDATE payloads SET to_block = $1 WHERE entity_key = $2 AND to_block = $3")
            .bind(block)
            .bind(entity_key)
            .bind(INF as i64)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;

        Ok(created_at)
    }

    async fn has_active_row(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        entity_key: &[u8],
    ) -> Result<bool, StoreError> {
        let row: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM string_attributes WHERE entity_key = $1 AND to_block = $2 LIMIT 1",
        )
        .bind(entity_key)
        .bind(INF as i64)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(row.is_some())
    }

    async fn write_version(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        block: i64,
        op_tx_index: i64,
        op_index: i64,
        payload: &ledger_core::OperationPayload,
        created_at_block: Option<i64>,
    ) -> Result<(), StoreError> {
        let entity_key = payload.key.as_bytes();

        for (key, value) in &payload.string_attributes {
            sqlx::query(
                "INSERT INTO string_attributes (entity_key, from_block, to_block, key, value) VALUES ($1,$2,$3,$4,$5)",
            )
            .bind(entity_key.as_slice())
            .bind(block)
            .bind(INF as i64)
            .bind(key)
            .bind(value)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        }
        for (key, value) in &payload.numeric_attributes {
            sqlx::query(
                "INSERT INTO numeric_attributes (entity_key, from_block, to_block, key, value) VALUES ($1,$2,$3,$4,$5)",
            )
            .bind(entity_key.as_slice())
            .bind(block)
            .bind(INF as i64)
            .bind(key)
            .bind(*value as i64)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        }

        let synthetic_strings = [(synthetic::OWNER, payload.owner.to_hex())];
        for (key, value) in synthetic_strings {
            sqlx::query(
                "INSERT INTO string_attributes (entity_key, from_block, to_block, key, value) VALUES ($1,$2,$3,$4,$5)",
            )
            .bind(entity_key.as_slice())
            .bind(block)
            .bind(INF as i64)
            .bind(key)
            .bind(value)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        }

        let synthetic_numerics = [
            (synthetic::EXPIRATION, block + payload.btl as i64),
            (synthetic::CREATED_AT_BLOCK, created_at_block.unwrap_or(block)),
            (synthetic::SEQUENCE, block),
            (synthetic::TX_INDEX, op_tx_index),
            (synthetic::OP_INDEX, op_index),
        ];
        for (key, value) in synthetic_numerics {
            sqlx::query(
                "INSERT INTO numeric_attributes (entity_key, from_block, to_block, key, value) VALUES ($1,$2,$3,$4,$5)",
            )
            .bind(entity_key.as_slice())
            .bind(block)
            .bind(INF as i64)
            .bind(key)
            .bind(value)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        }

        sqlx::query(
            "INSERT INTO payloads (entity_key, from_block, to_block, payload, content_type) VALUES ($1,$2,$3,$4,$5)",
        )
        .bind(entity_key.as_slice())
        .bind(block)
        .bind(INF as i64)
        .bind(payload.content.as_ref())
        .bind(&payload.content_type)
        .execute(&mut **tx)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        Ok(())
    }
}

#[async_trait]
impl BiTemporalStore for PgStore {
    async fn apply_block(&self, batch: &BlockBatch) -> Result<(), StoreError> {
        batch.validate_shape(self.ops_per_tx)?;

        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Backend(e.into()))?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(WRITER_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;

        let last_block: i64 = sqlx::query_scalar("SELECT block FROM last_block WHERE id = 1")
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;

        let first = batch.first_block_number().unwrap_or(0) as i64;
        if first <= last_block {
            return Err(StoreError::MalformedBatch(MalformedBatchError::OutOfOrder));
        }

        for block in &batch.blocks {
            for op in &block.operations {
                let entity_key = op.kind.entity_key();
                match &op.kind {
                    OperationKind::Create(p) => {
                        if Self::has_active_row(&mut tx, entity_key.as_bytes()).await? {
                            return Err(StoreError::AlreadyExists);
                        }
                        Self::write_version(
                            &mut tx,
                            block.number as i64,
                            op.tx_index as i64,
                            op.op_index as i64,
                            p,
                            None,
                        )
                        .await?;
                    }
                    OperationKind::Update(p) => {
                        if !Self::has_active_row(&mut tx, entity_key.as_bytes()).await? {
                            return Err(StoreError::NotFound);
                        }
                        let created_at = Self::close_active(&mut tx, entity_key.as_bytes(), block.number as i64).await?;
                        Self::write_version(
                            &mut tx,
                            block.number as i64,
                            op.tx_index as i64,
                            op.op_index as i64,
                            p,
                            created_at,
                        )
                        .await?;
                    }
                    OperationKind::Delete(k) => {
                        if !Self::has_active_row(&mut tx, k.as_bytes()).await? {
                            return Err(StoreError::NotFound);
                        }
                        Self::close_active(&mut tx, k.as_bytes(), block.number as i64).await?;
                    }
                }
            }
            sqlx::query("UPDATE last_block SET block = $1 WHERE id = 1")
                .bind(block.number as i64)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Backend(e.into()))?;
        }

        tx.commit().await.map_err(|e| StoreError::Backend(e.into()))?;
        debug!(block = batch.blocks.last().map(|b| b.number), "applied block to postgres");
        Ok(())
    }

    async fn query_entities(&self, expr: &QueryExpr, options: &QueryOptions) -> Result<Vec<EntityData>, StoreError> {
        let at_block = match options.at_block {
            Some(b) => b as i64,
            None => self.get_last_block().await as i64,
        };

        if let Some(plaintext_key) = expr.is_key_point_lookup() {
            let key = EntityKey::hash(plaintext_key);
            let active: Option<i32> = sqlx::query_scalar(
                "SELECT 1 FROM string_attributes WHERE entity_key = $1 AND key = $2 AND from_block <= $3 AND $3 < to_block LIMIT 1",
            )
            .bind(key.as_bytes().as_slice())
            .bind(synthetic::KEY)
            .bind(at_block)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;

            return match active {
                Some(_) => Ok(vec![self.materialize(key, at_block, options).await?]),
                None => Ok(Vec::new()),
            };
        }

        let mut candidate_keys: Option<Vec<Vec<u8>>> = None;
        for predicate in &expr.predicates {
            let matched = self.keys_matching(predicate, at_block).await?;
            candidate_keys = Some(match candidate_keys {
                None => matched,
                Some(prev) => prev.into_iter().filter(|k| matched.contains(k)).collect(),
            });
        }
        let keys = candidate_keys.unwrap_or(
            sqlx::query_scalar(
                "SELECT DISTINCT entity_key FROM string_attributes WHERE key = $1 AND from_block <= $2 AND $2 < to_block",
            )
            .bind(synthetic::KEY)
            .bind(at_block)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?,
        );

        let mut results = Vec::new();
        for raw in keys.into_iter().skip(options.offset).take(options.results_per_page) {
            let bytes: [u8; 32] = raw.as_slice().try_into().map_err(|_| StoreError::Backend(anyhow::anyhow!("corrupt entity_key")))?;
            results.push(self.materialize(EntityKey(bytes), at_block, options).await?);
        }
        Ok(results)
    }

    async fn get_last_block(&self) -> u64 {
        sqlx::query_scalar::<_, i64>("SELECT block FROM last_block WHERE id = 1")
            .fetch_one(&self.pool)
            .await
            .unwrap_or(0) as u64
    }

    async fn expired_at(&self, block: u64) -> Vec<EntityKey> {
        let rows: Vec<Vec<u8>> = sqlx::query_scalar(
            "SELECT entity_key FROM numeric_attributes WHERE key = $1 AND value = $2 AND to_block = $3",
        )
        .bind(synthetic::EXPIRATION)
        .bind(block as i64)
        .bind(INF as i64)
        .fetch_all(&self.pool)
        .await
        .unwrap_or_default();
        rows.into_iter()
            .filter_map(|raw| <[u8; 32]>::try_from(raw.as_slice()).ok())
            .map(EntityKey)
            .collect()
    }

    async fn count_active(&self) -> u64 {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(DISTINCT entity_key) FROM string_attributes WHERE key = $1 AND to_block = $2",
        )
        .bind(synthetic::KEY)
        .bind(INF as i64)
        .fetch_one(&self.pool)
        .await
        .unwrap_or(0) as u64
    }

    async fn clean(&self) -> Result<bool, StoreError> {
        sqlx::query("TRUNCATE string_attributes, numeric_attributes, payloads")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        sqlx::query("UPDATE last_block SET block = 0 WHERE id = 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(true)
    }
}

impl PgStore {
    async fn keys_matching(&self, predicate: &Predicate, at_block: i64) -> Result<Vec<Vec<u8>>, StoreError> {
        match predicate {
            Predicate::StringEq { key, value } => sqlx::query_scalar(
                "SELECT entity_key FROM string_attributes WHERE key = $1 AND value = $2 AND from_block <= $3 AND $3 < to_block",
            )
            .bind(key)
            .bind(value)
            .bind(at_block)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into())),
            Predicate::NumericEq { key, value } => sqlx::query_scalar(
                "SELECT entity_key FROM numeric_attributes WHERE key = $1 AND value = $2 AND from_block <= $3 AND $3 < to_block",
            )
            .bind(key)
            .bind(*value as i64)
            .bind(at_block)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into())),
            Predicate::NumericCmp { key, op, value } => {
                let sql_op = match op {
                    ledger_core::ComparisonOp::Lt => "<",
                    ledger_core::ComparisonOp::Le => "<=",
                    ledger_core::ComparisonOp::Gt => ">",
                    ledger_core::ComparisonOp::Ge => ">=",
                    ledger_core::ComparisonOp::Ne => "!=",
                };
                let query = format!(
                    "SELECT entity_key FROM numeric_attributes WHERE key = $1 AND value {sql_op} $2 AND from_block <= $3 AND $3 < to_block"
                );
                sqlx::query_scalar(&query)
                    .bind(key)
                    .bind(*value as i64)
                    .bind(at_block)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(|e| StoreError::Backend(e.into()))
            }
        }
    }

    async fn materialize(&self, key: EntityKey, at_block: i64, options: &QueryOptions) -> Result<EntityData, StoreError> {
        let include = &options.include;
        let mut data = EntityData::default();
        let entity_key = key.as_bytes();

        let string_rows = sqlx::query(
            "SELECT key, value FROM string_attributes WHERE entity_key = $1 AND from_block <= $2 AND $2 < to_block",
        )
        .bind(entity_key.as_slice())
        .bind(at_block)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        if include.key || include.attributes || include.synthetic_attributes {
            data.entity_key = Some(key);
        }

        for row in &string_rows {
            let k: String = row.get("key");
            let v: String = row.get("value");
            if k == synthetic::KEY && include.key {
                data.key = Some(v.clone());
            }
            if k == synthetic::OWNER && include.owner {
                if let Ok(raw) = hex::decode(&v) {
                    if let Ok(bytes) = <[u8; 20]>::try_from(raw.as_slice()) {
                        data.owner = Some(OwnerAddress::from_bytes(bytes));
                    }
                }
            }
            if synthetic::is_synthetic(&k) {
                if include.synthetic_attributes && k != synthetic::OWNER {
                    data.synthetic_attributes.insert(k, StringOrNumeric::String(v));
                }
            } else if include.attributes {
                data.attributes.insert(k, StringOrNumeric::String(v));
            }
        }

        let numeric_rows = sqlx::query(
            "SELECT key, value FROM numeric_attributes WHERE entity_key = $1 AND from_block <= $2 AND $2 < to_block",
        )
        .bind(entity_key.as_slice())
        .bind(at_block)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        for row in &numeric_rows {
            let k: String = row.get("key");
            let v: i64 = row.get("value");
            match k.as_str() {
                synthetic::EXPIRATION if include.expiration => data.expiration = Some(v as u64),
                synthetic::CREATED_AT_BLOCK if include.created_at_block => data.created_at_block = Some(v as u64),
                synthetic::TX_INDEX if include.tx_index => data.tx_index = Some(v as u64),
                synthetic::OP_INDEX if include.op_index => data.op_index = Some(v as u64),
                _ if synthetic::is_synthetic(&k) => {
                    if include.synthetic_attributes {
                        data.synthetic_attributes.insert(k, StringOrNumeric::Numeric(v as u64));
                    }
                }
                _ if include.attributes => {
                    data.attributes.insert(k, StringOrNumeric::Numeric(v as u64));
                }
                _ => {}
            }
        }

        if include.last_modified_at_block {
            let last_modified: Option<i64> = sqlx::query_scalar(
                "SELECT MAX(from_block) FROM (
                    SELECT from_block FROM string_attributes WHERE entity_key = $1 AND from_block <= $2
                    UNION ALL
                    SELECT from_block FROM numeric_attributes WHERE entity_key = $1 AND from_block <= $2
                 ) rows",
            )
            .bind(entity_key.as_slice())
            .bind(at_block)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
            data.last_modified_at_block = last_modified.map(|v| v as u64);
        }

        if include.payload || include.content_type {
            let payload_row = sqlx::query(
                "SELECT payload, content_type FROM payloads WHERE entity_key = $1 AND from_block <= $2 AND $2 < to_block",
            )
            .bind(entity_key.as_slice())
            .bind(at_block)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
            if let Some(row) = payload_row {
                if include.payload {
                    let bytes: Vec<u8> = row.get("payload");
                    data.payload = Some(bytes::Bytes::from(bytes));
                }
                if include.content_type {
                    data.content_type = Some(row.get("content_type"));
                }
            }
        }

        Ok(data)
    }
}
