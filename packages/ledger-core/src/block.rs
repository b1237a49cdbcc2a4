//! Block, Operation, and BlockBatch: the consumer-facing wire schema
//! (spec.md §3.4, §6.1), bit-exact down to field names.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::key::EntityKey;

/// `INF`: the validity-range upper bound meaning "still active" (spec.md §3.2).
pub const INF: u64 = (1u64 << 63) - 1;

/// Default number of op-indices per transaction (spec.md §4.3). Servers MAY
/// parameterize this; [`crate::block::tx_op_index`] takes it as an argument
/// rather than hard-coding it so callers can.
pub const DEFAULT_OPS_PER_TX: u64 = 10;

/// 20-byte owner address, opaque to this system beyond its byte length.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerAddress(#[serde(with = "hex_bytes20")] pub [u8; 20]);

impl OwnerAddress {
    #[must_use]
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for OwnerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OwnerAddress({})", self.to_hex())
    }
}

mod hex_bytes20 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 20], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 20], D::Error> {
        let s = String::deserialize(d)?;
        let raw = hex::decode(&s).map_err(serde::de::Error::custom)?;
        raw.try_into()
            .map_err(|v: Vec<u8>| serde::de::Error::custom(format!("expected 20 bytes, got {}", v.len())))
    }
}

/// Shared field shape of Create and Update operations (spec.md §6.1: "`OPUpdate`
/// = same fields as `OPCreate`").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationPayload {
    pub key: EntityKey,
    pub content_type: String,
    pub btl: u64,
    pub owner: OwnerAddress,
    #[serde(with = "bytes_base64")]
    pub content: Bytes,
    #[serde(default)]
    pub string_attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub numeric_attributes: BTreeMap<String, u64>,
}

mod bytes_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD
            .decode(s)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// Which of the three operation kinds this `Operation` carries.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationKind {
    Create(OperationPayload),
    Update(OperationPayload),
    Delete(EntityKey),
}

impl OperationKind {
    /// The entity key this operation targets, regardless of kind.
    #[must_use]
    pub fn entity_key(&self) -> EntityKey {
        match self {
            Self::Create(p) | Self::Update(p) => p.key,
            Self::Delete(k) => *k,
        }
    }
}

/// A single indexed operation within a [`Block`] (spec.md §3.4, §6.1).
///
/// `op_index` is in `[0, ops_per_tx)`; `tx_index = floor(position / ops_per_tx)`
/// where `position` is this operation's zero-based position in the block.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub tx_index: u64,
    pub op_index: u64,
    pub kind: OperationKind,
}

impl Operation {
    #[must_use]
    pub fn create(tx_index: u64, op_index: u64, payload: OperationPayload) -> Self {
        Self {
            tx_index,
            op_index,
            kind: OperationKind::Create(payload),
        }
    }

    #[must_use]
    pub fn update(tx_index: u64, op_index: u64, payload: OperationPayload) -> Self {
        Self {
            tx_index,
            op_index,
            kind: OperationKind::Update(payload),
        }
    }

    #[must_use]
    pub fn delete(tx_index: u64, op_index: u64, key: EntityKey) -> Self {
        Self {
            tx_index,
            op_index,
            kind: OperationKind::Delete(key),
        }
    }
}

/// Wire-shape mirror of [`Operation`]: exactly one of `create`/`update`/`delete`
/// is populated (spec.md §6.1). Kept as a private shadow type so [`Operation`]
/// itself can expose the more ergonomic [`OperationKind`] enum.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireOperation {
    tx_index: u64,
    op_index: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    create: Option<OperationPayload>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    update: Option<OperationPayload>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    delete: Option<EntityKey>,
}

/// Error decoding a wire [`Operation`] that does not set exactly one variant.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OperationDecodeError {
    #[error("operation must set exactly one of create/update/delete, got none")]
    NoVariantSet,
    #[error("operation must set exactly one of create/update/delete, got more than one")]
    MultipleVariantsSet,
}

impl Serialize for Operation {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let wire = match &self.kind {
            OperationKind::Create(p) => WireOperation {
                tx_index: self.tx_index,
                op_index: self.op_index,
                create: Some(p.clone()),
                update: None,
                delete: None,
            },
            OperationKind::Update(p) => WireOperation {
                tx_index: self.tx_index,
                op_index: self.op_index,
                create: None,
                update: Some(p.clone()),
                delete: None,
            },
            OperationKind::Delete(k) => WireOperation {
                tx_index: self.tx_index,
                op_index: self.op_index,
                create: None,
                update: None,
                delete: Some(*k),
            },
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Operation {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let wire = WireOperation::deserialize(deserializer)?;
        let set_count =
            [wire.create.is_some(), wire.update.is_some(), wire.delete.is_some()]
                .iter()
                .filter(|b| **b)
                .count();
        let kind = match set_count {
            0 => return Err(serde::de::Error::custom(OperationDecodeError::NoVariantSet)),
            1 => {
                if let Some(p) = wire.create {
                    OperationKind::Create(p)
                } else if let Some(p) = wire.update {
                    OperationKind::Update(p)
                } else {
                    OperationKind::Delete(wire.delete.expect("exactly one variant set"))
                }
            }
            _ => return Err(serde::de::Error::custom(OperationDecodeError::MultipleVariantsSet)),
        };
        Ok(Operation {
            tx_index: wire.tx_index,
            op_index: wire.op_index,
            kind,
        })
    }
}

/// Computes `(tx_index, op_index)` for the zero-based `position` of an
/// operation within a block, given `ops_per_tx` (spec.md §3.4).
#[must_use]
pub fn tx_op_index(position: u64, ops_per_tx: u64) -> (u64, u64) {
    (position / ops_per_tx, position % ops_per_tx)
}

/// A logically atomic group of operations with a unique monotonic `number`
/// (spec.md §3.4, GLOSSARY).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub number: u64,
    pub operations: Vec<Operation>,
}

impl Block {
    #[must_use]
    pub fn new(number: u64, operations: Vec<Operation>) -> Self {
        Self { number, operations }
    }
}

/// A finite ordered list of blocks with strictly increasing `number`.
/// Always of length one in this system; the wrapper is retained so a future
/// multi-block batching scheme can reuse the same consumer contract
/// (spec.md §9 Open Question a).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockBatch {
    pub blocks: Vec<Block>,
}

/// Error validating the shape of a [`BlockBatch`] (spec.md §4.1).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedBatchError {
    #[error("block numbers must be strictly increasing within a batch")]
    OutOfOrder,
    #[error("operation {index} has op_index {op_index} outside [0, {max})")]
    OpIndexOutOfRange { index: usize, op_index: u64, max: u64 },
    #[error("operation {index} has an empty entity key")]
    EmptyEntityKey { index: usize },
}

impl BlockBatch {
    #[must_use]
    pub fn single(block: Block) -> Self {
        Self { blocks: vec![block] }
    }

    /// The block number of the first block, if any.
    #[must_use]
    pub fn first_block_number(&self) -> Option<u64> {
        self.blocks.first().map(|b| b.number)
    }

    /// Validates the shape rules spec.md §4.1 assigns to `apply_block`:
    /// strictly increasing block numbers, `op_index` within range, and
    /// non-empty entity keys. Does not check ordering of create/update/delete
    /// within a block -- that is C2's job (spec.md §4.2).
    pub fn validate_shape(&self, ops_per_tx: u64) -> Result<(), MalformedBatchError> {
        let mut prev: Option<u64> = None;
        for block in &self.blocks {
            if let Some(p) = prev {
                if block.number <= p {
                    return Err(MalformedBatchError::OutOfOrder);
                }
            }
            prev = Some(block.number);

            for (index, op) in block.operations.iter().enumerate() {
                if op.op_index >= ops_per_tx {
                    return Err(MalformedBatchError::OpIndexOutOfRange {
                        index,
                        op_index: op.op_index,
                        max: ops_per_tx,
                    });
                }
                if op.kind.entity_key().as_bytes() == &[0u8; 32] {
                    return Err(MalformedBatchError::EmptyEntityKey { index });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(key: &str) -> OperationPayload {
        OperationPayload {
            key: EntityKey::hash(key),
            content_type: "text/plain".to_string(),
            btl: 3,
            owner: OwnerAddress::from_bytes([1u8; 20]),
            content: Bytes::from_static(b"hello"),
            string_attributes: BTreeMap::new(),
            numeric_attributes: BTreeMap::new(),
        }
    }

    #[test]
    fn tx_op_index_wraps_every_ten_by_default() {
        assert_eq!(tx_op_index(0, 10), (0, 0));
        assert_eq!(tx_op_index(9, 10), (0, 9));
        assert_eq!(tx_op_index(10, 10), (1, 0));
        assert_eq!(tx_op_index(14, 10), (1, 4));
    }

    #[test]
    fn operation_json_roundtrips_create() {
        let op = Operation::create(0, 0, payload("a"));
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("\"create\""));
        assert!(!json.contains("\"update\""));
        let decoded: Operation = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, op);
    }

    #[test]
    fn operation_json_roundtrips_delete() {
        let op = Operation::delete(1, 2, EntityKey::hash("a"));
        let json = serde_json::to_string(&op).unwrap();
        let decoded: Operation = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, op);
    }

    #[test]
    fn decode_rejects_no_variant() {
        let json = r#"{"txIndex":0,"opIndex":0}"#;
        let err = serde_json::from_str::<Operation>(json).unwrap_err();
        assert!(err.to_string().contains("exactly one"));
    }

    #[test]
    fn decode_rejects_multiple_variants() {
        let create = payload("a");
        let json = format!(
            r#"{{"txIndex":0,"opIndex":0,"create":{},"delete":"{}"}}"#,
            serde_json::to_string(&create).unwrap(),
            EntityKey::hash("a").to_hex(),
        );
        let err = serde_json::from_str::<Operation>(&json).unwrap_err();
        assert!(err.to_string().contains("exactly one"));
    }

    #[test]
    fn validate_shape_detects_out_of_order_blocks() {
        let batch = BlockBatch {
            blocks: vec![Block::new(5, vec![]), Block::new(4, vec![])],
        };
        assert_eq!(batch.validate_shape(10), Err(MalformedBatchError::OutOfOrder));
    }

    #[test]
    fn validate_shape_detects_op_index_out_of_range() {
        let op = Operation::create(0, 10, payload("a"));
        let batch = BlockBatch::single(Block::new(1, vec![op]));
        assert!(matches!(
            batch.validate_shape(10),
            Err(MalformedBatchError::OpIndexOutOfRange { op_index: 10, max: 10, .. })
        ));
    }

    #[test]
    fn validate_shape_accepts_well_formed_batch() {
        let ops = vec![
            Operation::create(0, 0, payload("a")),
            Operation::update(0, 1, payload("b")),
            Operation::delete(0, 2, EntityKey::hash("c")),
        ];
        let batch = BlockBatch::single(Block::new(10, ops));
        assert!(batch.validate_shape(10).is_ok());
    }
}
