//! Result shape returned by the query layer (spec.md §4.5).

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::block::OwnerAddress;
use crate::key::EntityKey;

/// One matching entity, with only the fields the request's `IncludeMask`
/// selected populated. Missing fields are omitted from JSON, never nulled
/// (spec.md §4.5).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityData {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub entity_key: Option<EntityKey>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub attributes: BTreeMap<String, StringOrNumeric>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub synthetic_attributes: BTreeMap<String, StringOrNumeric>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[serde(with = "payload_base64")]
    pub payload: Option<Bytes>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub content_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expiration: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub owner: Option<OwnerAddress>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub created_at_block: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_modified_at_block: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tx_index: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub op_index: Option<u64>,
}

mod payload_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Bytes>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_str(&STANDARD.encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Bytes>, D::Error> {
        let s: Option<String> = Option::deserialize(d)?;
        match s {
            Some(s) => STANDARD
                .decode(s)
                .map(|v| Some(Bytes::from(v)))
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// A value reported back in an [`EntityData`]'s attribute maps: either its
/// string or numeric attribute-table origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrNumeric {
    String(String),
    Numeric(u64),
}
