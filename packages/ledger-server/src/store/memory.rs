//! Default in-memory [`BiTemporalStore`](crate::store::BiTemporalStore)
//! implementation, keyed by entity with a `DashMap` (spec.md §4.1).
//!
//! One concurrent map per logical table, with the store itself providing
//! the single-writer discipline rather than the maps.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use ledger_core::{
    synthetic, BlockBatch, ComparisonOp, EntityData, EntityKey, MalformedBatchError, Operation,
    OperationKind, OwnerAddress, Predicate, QueryExpr, QueryOptions, StringOrNumeric, INF,
};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use super::engine::{BiTemporalStore, StoreError};

#[derive(Debug, Clone)]
struct StringRow {
    from_block: u64,
    to_block: u64,
    value: String,
}

#[derive(Debug, Clone)]
struct NumericRow {
    from_block: u64,
    to_block: u64,
    value: u64,
}

#[derive(Debug, Clone)]
struct PayloadRow {
    from_block: u64,
    to_block: u64,
    content: Bytes,
    content_type: String,
}

#[derive(Debug, Default)]
struct EntityRows {
    string_attrs: HashMap<String, Vec<StringRow>>,
    numeric_attrs: HashMap<String, Vec<NumericRow>>,
    payloads: Vec<PayloadRow>,
}

impl EntityRows {
    fn has_active_row(&self) -> bool {
        self.string_attrs.values().any(|rows| rows.iter().any(|r| r.to_block == INF))
            || self.numeric_attrs.values().any(|rows| rows.iter().any(|r| r.to_block == INF))
    }

    fn string_at(&self, key: &str, at_block: u64) -> Option<&str> {
        self.string_attrs.get(key).and_then(|rows| {
            rows.iter()
                .find(|r| r.from_block <= at_block && at_block < r.to_block)
                .map(|r| r.value.as_str())
        })
    }

    fn numeric_at(&self, key: &str, at_block: u64) -> Option<u64> {
        self.numeric_attrs.get(key).and_then(|rows| {
            rows.iter()
                .find(|r| r.from_block <= at_block && at_block < r.to_block)
                .map(|r| r.value)
        })
    }

    fn payload_at(&self, at_block: u64) -> Option<&PayloadRow> {
        self.payloads
            .iter()
            .find(|r| r.from_block <= at_block && at_block < r.to_block)
    }

    /// Closes every currently-active row at `block`, returning the prior
    /// active `$createdAtBlock` value if one existed (preserved across
    /// Update per spec.md §4.1).
    fn close_active(&mut self, block: u64) -> Option<u64> {
        let created_at = self
            .numeric_attrs
            .get(synthetic::CREATED_AT_BLOCK)
            .and_then(|rows| rows.iter().find(|r| r.to_block == INF))
            .map(|r| r.value);

        for rows in self.string_attrs.values_mut() {
            for row in rows.iter_mut().filter(|r| r.to_block == INF) {
                row.to_block = block;
            }
        }
        for rows in self.numeric_attrs.values_mut() {
            for row in rows.iter_mut().filter(|r| r.to_block == INF) {
                row.to_block = block;
            }
        }
        for row in self.payloads.iter_mut().filter(|r| r.to_block == INF) {
            row.to_block = block;
        }
        created_at
    }

    fn insert_string(&mut self, key: &str, from_block: u64, value: String) {
        self.string_attrs.entry(key.to_string()).or_default().push(StringRow {
            from_block,
            to_block: INF,
            value,
        });
    }

    fn insert_numeric(&mut self, key: &str, from_block: u64, value: u64) {
        self.numeric_attrs.entry(key.to_string()).or_default().push(NumericRow {
            from_block,
            to_block: INF,
            value,
        });
    }
}

/// Default in-memory [`BiTemporalStore`]. Not durable on its own -- pair
/// with a [`super::log::BlockLog`] for restart durability.
pub struct MemoryStore {
    entities: DashMap<EntityKey, EntityRows>,
    /// `$expiration` block -> still-active entities scheduled to close there.
    expiring: DashMap<u64, DashSet<EntityKey>>,
    last_block: AsyncMutex<u64>,
    ops_per_tx: u64,
}

impl MemoryStore {
    #[must_use]
    pub fn new(ops_per_tx: u64) -> Self {
        Self {
            entities: DashMap::new(),
            expiring: DashMap::new(),
            last_block: AsyncMutex::new(0),
            ops_per_tx,
        }
    }

    fn index_expiration(&self, key: EntityKey, expiration: u64) {
        self.expiring.entry(expiration).or_default().insert(key);
    }

    fn unindex_expiration(&self, key: EntityKey, expiration: u64) {
        if let Some(set) = self.expiring.get(&expiration) {
            set.remove(&key);
        }
    }

    fn apply_create(&self, block: u64, op: &Operation, payload: &ledger_core::OperationPayload) -> Result<(), StoreError> {
        let mut entry = self.entities.entry(payload.key).or_default();
        if entry.has_active_row() {
            return Err(StoreError::AlreadyExists);
        }
        write_version(&mut entry, block, op, payload, None);
        drop(entry);
        let expiration = block + payload.btl;
        self.index_expiration(payload.key, expiration);
        Ok(())
    }

    fn apply_update(&self, block: u64, op: &Operation, payload: &ledger_core::OperationPayload) -> Result<(), StoreError> {
        let mut entry = self.entities.get_mut(&payload.key).ok_or(StoreError::NotFound)?;
        if !entry.has_active_row() {
            return Err(StoreError::NotFound);
        }
        let prior_expiration = entry.numeric_at(synthetic::EXPIRATION, block.saturating_sub(1));
        let created_at = entry.close_active(block);
        write_version(&mut entry, block, op, payload, created_at);
        drop(entry);
        if let Some(prior) = prior_expiration {
            self.unindex_expiration(payload.key, prior);
        }
        let expiration = block + payload.btl;
        self.index_expiration(payload.key, expiration);
        Ok(())
    }

    fn apply_delete(&self, block: u64, key: EntityKey) -> Result<(), StoreError> {
        let mut entry = self.entities.get_mut(&key).ok_or(StoreError::NotFound)?;
        if !entry.has_active_row() {
            return Err(StoreError::NotFound);
        }
        let prior_expiration = entry.numeric_at(synthetic::EXPIRATION, block.saturating_sub(1));
        entry.close_active(block);
        drop(entry);
        if let Some(prior) = prior_expiration {
            self.unindex_expiration(key, prior);
        }
        Ok(())
    }

    fn matches(&self, rows: &EntityRows, predicate: &Predicate, at_block: u64) -> bool {
        match predicate {
            Predicate::StringEq { key, value } => rows.string_at(key, at_block) == Some(value.as_str()),
            Predicate::NumericEq { key, value } => rows.numeric_at(key, at_block) == Some(*value),
            Predicate::NumericCmp { key, op, value } => rows
                .numeric_at(key, at_block)
                .is_some_and(|lhs| op.apply(lhs, *value)),
        }
    }

    fn materialize(&self, key: EntityKey, rows: &EntityRows, at_block: u64, options: &QueryOptions) -> EntityData {
        let include = &options.include;
        let mut data = EntityData::default();

        if include.key {
            data.key = rows.string_at(synthetic::KEY, at_block).map(str::to_string);
        }
        if include.key || include.attributes || include.synthetic_attributes {
            data.entity_key = Some(key);
        }
        if include.attributes {
            for (attr_key, rows) in &rows.string_attrs {
                if synthetic::is_synthetic(attr_key) {
                    continue;
                }
                if let Some(row) = rows.iter().find(|r| r.from_block <= at_block && at_block < r.to_block) {
                    data.attributes.insert(attr_key.clone(), StringOrNumeric::String(row.value.clone()));
                }
            }
            for (attr_key, rows) in &rows.numeric_attrs {
                if synthetic::is_synthetic(attr_key) {
                    continue;
                }
                if let Some(row) = rows.iter().find(|r| r.from_block <= at_block && at_block < r.to_block) {
                    data.attributes.insert(attr_key.clone(), StringOrNumeric::Numeric(row.value));
                }
            }
        }
        if include.synthetic_attributes {
            for (attr_key, rows) in &rows.string_attrs {
                if !synthetic::is_synthetic(attr_key) {
                    continue;
                }
                if let Some(row) = rows.iter().find(|r| r.from_block <= at_block && at_block < r.to_block) {
                    data.synthetic_attributes.insert(attr_key.clone(), StringOrNumeric::String(row.value.clone()));
                }
            }
            for (attr_key, rows) in &rows.numeric_attrs {
                if !synthetic::is_synthetic(attr_key) {
                    continue;
                }
                if let Some(row) = rows.iter().find(|r| r.from_block <= at_block && at_block < r.to_block) {
                    data.synthetic_attributes.insert(attr_key.clone(), StringOrNumeric::Numeric(row.value));
                }
            }
        }
        if let Some(payload) = rows.payload_at(at_block) {
            if include.payload {
                data.payload = Some(payload.content.clone());
            }
            if include.content_type {
                data.content_type = Some(payload.content_type.clone());
            }
        }
        if include.expiration {
            data.expiration = rows.numeric_at(synthetic::EXPIRATION, at_block);
        }
        if include.owner {
            data.owner = rows
                .string_at(synthetic::OWNER, at_block)
                .and_then(|hex| hex::decode(hex).ok())
                .and_then(|bytes| <[u8; 20]>::try_from(bytes).ok())
                .map(OwnerAddress::from_bytes);
        }
        if include.created_at_block {
            data.created_at_block = rows.numeric_at(synthetic::CREATED_AT_BLOCK, at_block);
        }
        if include.last_modified_at_block {
            let string_max = rows
                .string_attrs
                .values()
                .flat_map(|r| r.iter())
                .filter(|r| r.from_block <= at_block)
                .map(|r| r.from_block)
                .max();
            let numeric_max = rows
                .numeric_attrs
                .values()
                .flat_map(|r| r.iter())
                .filter(|r| r.from_block <= at_block)
                .map(|r| r.from_block)
                .max();
            data.last_modified_at_block = string_max.into_iter().chain(numeric_max).max();
        }
        if include.tx_index {
            data.tx_index = rows.numeric_at(synthetic::TX_INDEX, at_block);
        }
        if include.op_index {
            data.op_index = rows.numeric_at(synthetic::OP_INDEX, at_block);
        }
        data
    }
}

/// Writes one version (Create or the post-close half of Update) of an
/// entity's rows at `block`.
/// Writes one version of an entity's rows at `block`.
///
/// `payload.string_attributes` is expected to already carry a `$key` entry
/// with the plaintext key string: the wire `OperationPayload` (spec.md
/// §6.1) only carries the SHA-256 hash in its `key` field, so the Write
/// Queue injects the plaintext into the string-attribute map when it
/// builds the operation (see `queue::write_queue`), and this function
/// passes every string/numeric entry through untouched. Everything else
/// synthetic (`$owner`, `$expiration`, `$createdAtBlock`, `$sequence`,
/// `$txIndex`, `$opIndex`) requires apply-time knowledge the producer
/// doesn't have and is computed here.
fn write_version(
    entry: &mut EntityRows,
    block: u64,
    op: &Operation,
    payload: &ledger_core::OperationPayload,
    created_at_block: Option<u64>,
) {
    for (key, value) in &payload.string_attributes {
        entry.insert_string(key, block, value.clone());
    }
    for (key, value) in &payload.numeric_attributes {
        entry.insert_numeric(key, block, *value);
    }

    entry.insert_string(synthetic::OWNER, block, payload.owner.to_hex());
    entry.insert_numeric(synthetic::EXPIRATION, block, block + payload.btl);
    entry.insert_numeric(synthetic::CREATED_AT_BLOCK, block, created_at_block.unwrap_or(block));
    entry.insert_numeric(synthetic::SEQUENCE, block, block);
    entry.insert_numeric(synthetic::TX_INDEX, block, op.tx_index);
    entry.insert_numeric(synthetic::OP_INDEX, block, op.op_index);

    entry.payloads.push(PayloadRow {
        from_block: block,
        to_block: INF,
        content: payload.content.clone(),
        content_type: payload.content_type.clone(),
    });
}

#[async_trait]
impl BiTemporalStore for MemoryStore {
    async fn apply_block(&self, batch: &BlockBatch) -> Result<(), StoreError> {
        batch.validate_shape(self.ops_per_tx)?;

        let mut last_block = self.last_block.lock().await;
        let first = batch.first_block_number().unwrap_or(0);
        if first <= *last_block {
            // Not internally out-of-order (validate_shape already checked
            // that) but stale relative to what this store already committed.
            return Err(StoreError::MalformedBatch(MalformedBatchError::OutOfOrder));
        }

        for block in &batch.blocks {
            for op in &block.operations {
                match &op.kind {
                    OperationKind::Create(p) => self.apply_create(block.number, op, p)?,
                    OperationKind::Update(p) => self.apply_update(block.number, op, p)?,
                    OperationKind::Delete(k) => self.apply_delete(block.number, *k)?,
                }
            }
            *last_block = block.number;
        }
        debug!(block = *last_block, "applied block");
        Ok(())
    }

    async fn query_entities(
        &self,
        expr: &QueryExpr,
        options: &QueryOptions,
    ) -> Result<Vec<EntityData>, StoreError> {
        let at_block = match options.at_block {
            Some(b) => b,
            None => *self.last_block.lock().await,
        };

        if let Some(plaintext_key) = expr.is_key_point_lookup() {
            let key = EntityKey::hash(plaintext_key);
            return Ok(self
                .entities
                .get(&key)
                .filter(|rows| rows.string_at(synthetic::KEY, at_block).is_some())
                .map(|rows| self.materialize(key, &rows, at_block, options))
                .into_iter()
                .collect());
        }

        let mut matches: Vec<(EntityKey, EntityData)> = Vec::new();
        for entry in self.entities.iter() {
            let key = *entry.key();
            let rows = entry.value();
            if !expr.predicates.iter().all(|p| self.matches(rows, p, at_block)) {
                continue;
            }
            if expr.predicates.is_empty() && rows.string_at(synthetic::KEY, at_block).is_none() {
                continue;
            }
            matches.push((key, self.materialize(key, rows, at_block, options)));
        }
        matches.sort_by_key(|(k, _)| k.to_hex());

        let page = matches
            .into_iter()
            .skip(options.offset)
            .take(options.results_per_page)
            .map(|(_, data)| data)
            .collect();
        Ok(page)
    }

    async fn get_last_block(&self) -> u64 {
        *self.last_block.lock().await
    }

    async fn expired_at(&self, block: u64) -> Vec<EntityKey> {
        self.expiring
            .get(&block)
            .map(|set| set.iter().map(|k| *k).collect())
            .unwrap_or_default()
    }

    async fn count_active(&self) -> u64 {
        self.entities.iter().filter(|e| e.value().has_active_row()).count() as u64
    }

    async fn clean(&self) -> Result<bool, StoreError> {
        self.entities.clear();
        self.expiring.clear();
        *self.last_block.lock().await = 0;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use ledger_core::{Block, IncludeMask, Operation, OperationPayload, OwnerAddress};

    fn payload(key: &str, btl: u64, strings: &[(&str, &str)], numerics: &[(&str, u64)]) -> OperationPayload {
        let mut string_attributes: std::collections::BTreeMap<String, String> =
            strings.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        string_attributes.insert(synthetic::KEY.to_string(), key.to_string());
        OperationPayload {
            key: EntityKey::hash(key),
            content_type: "text/plain".to_string(),
            btl,
            owner: OwnerAddress::from_bytes([7u8; 20]),
            content: Bytes::from_static(b"payload"),
            string_attributes,
            numeric_attributes: numerics.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }

    fn single_op_batch(number: u64, op: Operation) -> BlockBatch {
        BlockBatch::single(Block::new(number, vec![op]))
    }

    #[tokio::test]
    async fn create_then_point_lookup() {
        let store = MemoryStore::new(10);
        let p = payload("a", 3, &[("x", "1")], &[("n", 5)]);
        store.apply_block(&single_op_batch(10, Operation::create(0, 0, p))).await.unwrap();

        let expr = QueryExpr::new(vec![Predicate::StringEq {
            key: synthetic::KEY.to_string(),
            value: "a".to_string(),
        }]);
        let results = store.query_entities(&expr, &QueryOptions::default()).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].expiration, Some(13));
    }

    #[tokio::test]
    async fn duplicate_create_is_already_exists() {
        let store = MemoryStore::new(10);
        let p = payload("a", 3, &[], &[]);
        store.apply_block(&single_op_batch(10, Operation::create(0, 0, p.clone()))).await.unwrap();
        let err = store.apply_block(&single_op_batch(11, Operation::create(0, 0, p))).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists));
    }

    #[tokio::test]
    async fn update_replaces_attribute_set() {
        let store = MemoryStore::new(10);
        let create = payload("a", 10, &[("x", "1")], &[]);
        store.apply_block(&single_op_batch(10, Operation::create(0, 0, create))).await.unwrap();

        let update = payload("a", 10, &[("y", "2")], &[]);
        store.apply_block(&single_op_batch(11, Operation::update(0, 0, update))).await.unwrap();

        let expr = QueryExpr::new(vec![]);
        let mut opts = QueryOptions { at_block: Some(10), include: IncludeMask::all(), ..Default::default() };
        let at_10 = store.query_entities(&expr, &opts).await.unwrap();
        assert_eq!(at_10[0].attributes.get("x"), Some(&StringOrNumeric::String("1".to_string())));
        assert!(at_10[0].attributes.get("y").is_none());

        opts.at_block = Some(11);
        let at_11 = store.query_entities(&expr, &opts).await.unwrap();
        assert!(at_11[0].attributes.get("x").is_none());
        assert_eq!(at_11[0].attributes.get("y"), Some(&StringOrNumeric::String("2".to_string())));
    }

    #[tokio::test]
    async fn delete_closes_all_rows() {
        let store = MemoryStore::new(10);
        let create = payload("a", 10, &[("x", "1")], &[]);
        store.apply_block(&single_op_batch(10, Operation::create(0, 0, create))).await.unwrap();
        store
            .apply_block(&single_op_batch(11, Operation::delete(0, 0, EntityKey::hash("a"))))
            .await
            .unwrap();

        let expr = QueryExpr::new(vec![Predicate::StringEq { key: "$key".to_string(), value: "a".to_string() }]);
        let at_10 = store
            .query_entities(&expr, &QueryOptions { at_block: Some(10), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(at_10.len(), 1);

        let at_11 = store
            .query_entities(&expr, &QueryOptions { at_block: Some(11), ..Default::default() })
            .await
            .unwrap();
        assert!(at_11.is_empty());
    }

    #[tokio::test]
    async fn expired_at_tracks_expiration_index() {
        let store = MemoryStore::new(10);
        let create = payload("a", 3, &[], &[]);
        store.apply_block(&single_op_batch(10, Operation::create(0, 0, create))).await.unwrap();
        assert_eq!(store.expired_at(13).await, vec![EntityKey::hash("a")]);
        assert!(store.expired_at(14).await.is_empty());
    }

    #[tokio::test]
    async fn stale_batch_rejected() {
        let store = MemoryStore::new(10);
        let create = payload("a", 3, &[], &[]);
        store.apply_block(&single_op_batch(10, Operation::create(0, 0, create))).await.unwrap();
        let repeat = payload("b", 3, &[], &[]);
        let err = store
            .apply_block(&single_op_batch(10, Operation::create(0, 0, repeat)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MalformedBatch(MalformedBatchError::OutOfOrder)));
    }

    #[tokio::test]
    async fn numeric_range_query() {
        // Each create needs its own block under strict monotonicity.
        let store = MemoryStore::new(10);
        let mut block = 10u64;
        for (key, cpu) in [("a", 4u64), ("b", 8), ("c", 16)] {
            let p = payload(key, 100, &[], &[("cpu", cpu)]);
            store.apply_block(&single_op_batch(block, Operation::create(0, 0, p))).await.unwrap();
            block += 1;
        }

        let expr = QueryExpr::new(vec![Predicate::NumericCmp {
            key: "cpu".to_string(),
            op: ComparisonOp::Ge,
            value: 8,
        }]);
        let results = store
            .query_entities(&expr, &QueryOptions { at_block: Some(block - 1), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
    }

    /// Checks invariants 1 and 2 of the testable-properties list: row
    /// ranges within an attribute table never overlap, and at most one row
    /// per key has `to_block = INF` once the store is quiescent.
    mod invariants {
        use super::*;
        use proptest::prelude::*;

        fn string_payload(key: &str, btl: u64, value: &str) -> OperationPayload {
            let mut string_attributes = std::collections::BTreeMap::new();
            string_attributes.insert(synthetic::KEY.to_string(), key.to_string());
            string_attributes.insert("x".to_string(), value.to_string());
            OperationPayload {
                key: EntityKey::hash(key),
                content_type: "text/plain".to_string(),
                btl,
                owner: OwnerAddress::from_bytes([9u8; 20]),
                content: Bytes::from_static(b"p"),
                string_attributes,
                numeric_attributes: std::collections::BTreeMap::new(),
            }
        }

        fn ranges_are_disjoint(ranges: &[(u64, u64)]) -> bool {
            let mut sorted = ranges.to_vec();
            sorted.sort_by_key(|(from, _)| *from);
            sorted.windows(2).all(|pair| pair[0].1 <= pair[1].0)
        }

        /// Runs a create, `n_updates` updates, and an optional trailing
        /// delete against a fresh store, returning the `"x"` attribute's
        /// row ranges and how many are still open.
        fn run(btl: u64, n_updates: usize, delete_at_end: bool) -> (Vec<(u64, u64)>, usize) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let store = MemoryStore::new(10);
                let mut block = 10u64;
                store
                    .apply_block(&single_op_batch(block, Operation::create(0, 0, string_payload("e", btl, "v0"))))
                    .await
                    .unwrap();

                for i in 0..n_updates {
                    block += 1;
                    let value = format!("v{}", i + 1);
                    store
                        .apply_block(&single_op_batch(block, Operation::update(0, 0, string_payload("e", btl, &value))))
                        .await
                        .unwrap();
                }

                if delete_at_end {
                    block += 1;
                    store
                        .apply_block(&single_op_batch(block, Operation::delete(0, 0, EntityKey::hash("e"))))
                        .await
                        .unwrap();
                }

                let rows = store.entities.get(&EntityKey::hash("e")).unwrap();
                let x_rows = rows.string_attrs.get("x").cloned().unwrap_or_default();
                let ranges: Vec<(u64, u64)> = x_rows.iter().map(|r| (r.from_block, r.to_block)).collect();
                let active = x_rows.iter().filter(|r| r.to_block == INF).count();
                (ranges, active)
            })
        }

        proptest! {
            #[test]
            fn create_update_delete_sequences_keep_rows_disjoint_and_single_active(
                btl in 5u64..50,
                n_updates in 0usize..6,
                delete_at_end in any::<bool>(),
            ) {
                let (ranges, active) = run(btl, n_updates, delete_at_end);
                prop_assert!(ranges_are_disjoint(&ranges));
                if delete_at_end {
                    prop_assert_eq!(active, 0);
                } else {
                    prop_assert_eq!(active, 1);
                }
            }
        }
    }
}
