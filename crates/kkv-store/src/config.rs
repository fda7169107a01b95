//! Schema metadata of a KKV index.
//!
//! The config is loaded from JSON:
//!
//! ```json
//! {
//!     "index_name": "kkv",
//!     "prefix_key": { "name": "uid", "field_type": "string" },
//!     "suffix_key": { "name": "item_id", "field_type": "u_int64" },
//!     "value_fields": [{ "name": "price", "field_type": "int32" }],
//!     "ttl": 3600,
//!     "shard_count": 4
//! }
//! ```
use kkv_common::{KkvError, KkvResult, SchemaId};
use serde::{Deserialize, Serialize};

use crate::compress::CompressionType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    String,
}

impl FieldType {
    pub fn is_integer(&self) -> bool {
        !matches!(self, FieldType::String)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldConfig {
    pub name: String,
    pub field_type: FieldType,
}

impl FieldConfig {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    SKey,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortParam {
    pub field: SortField,
    pub order: SortOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashFunctionType {
    /// xxh64 over the raw key bytes.
    #[default]
    Default,
    /// Integer keys are their own hash.
    NumberHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePriority {
    #[default]
    Low,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueCompression {
    #[default]
    None,
    Lz4,
}

impl From<ValueCompression> for CompressionType {
    fn from(value: ValueCompression) -> Self {
        match value {
            ValueCompression::None => CompressionType::None,
            ValueCompression::Lz4 => CompressionType::LZ4,
        }
    }
}

const DEFAULT_SHARD_COUNT: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KkvIndexConfig {
    pub index_name: String,
    pub prefix_key: FieldConfig,
    pub suffix_key: FieldConfig,
    #[serde(default)]
    pub value_fields: Vec<FieldConfig>,
    /// Seconds, `None` disables ttl.
    #[serde(default)]
    pub ttl: Option<u32>,
    #[serde(default)]
    pub store_expire_time: bool,
    #[serde(default)]
    pub fixed_value_len: Option<u32>,
    #[serde(default)]
    pub value_compression: ValueCompression,
    #[serde(default)]
    pub skey_count_limit: Option<u32>,
    #[serde(default)]
    pub enable_sort_skey: bool,
    #[serde(default)]
    pub sort_params: Vec<SortParam>,
    #[serde(default)]
    pub optimize_store_skey: bool,
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,
    #[serde(default)]
    pub hash_function: HashFunctionType,
    #[serde(default)]
    pub cache_priority: CachePriority,
    #[serde(default)]
    pub schema_id: SchemaId,
}

fn default_shard_count() -> u32 {
    DEFAULT_SHARD_COUNT
}

impl KkvIndexConfig {
    pub fn new(
        index_name: impl Into<String>,
        prefix_key: FieldConfig,
        suffix_key: FieldConfig,
    ) -> Self {
        Self {
            index_name: index_name.into(),
            prefix_key,
            suffix_key,
            value_fields: Vec::new(),
            ttl: None,
            store_expire_time: false,
            fixed_value_len: None,
            value_compression: ValueCompression::None,
            skey_count_limit: None,
            enable_sort_skey: false,
            sort_params: Vec::new(),
            optimize_store_skey: false,
            shard_count: DEFAULT_SHARD_COUNT,
            hash_function: HashFunctionType::Default,
            cache_priority: CachePriority::Low,
            schema_id: 0,
        }
    }

    /// # Errors
    /// - [KkvError::ConfigError] when the json is malformed or the schema is unusable
    /// - [KkvError::InvalidArgs] when the shard count is not a power of two
    pub fn from_json(json: &str) -> KkvResult<Self> {
        let config: KkvIndexConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> KkvResult<String> {
        serde_json::to_string(self).map_err(KkvError::from)
    }

    pub fn validate(&self) -> KkvResult<()> {
        if self.shard_count == 0 || !self.shard_count.is_power_of_two() {
            return Err(KkvError::InvalidArgs(
                format!("shard count {} is not a power of two", self.shard_count).into(),
            ));
        }
        if self.index_name.is_empty() {
            return Err(KkvError::ConfigError("index name is empty".into()));
        }
        if self.prefix_key.name == self.suffix_key.name {
            return Err(KkvError::ConfigError(
                format!(
                    "prefix key and suffix key share the field name {}",
                    self.prefix_key.name
                )
                .into(),
            ));
        }
        if self.hash_function == HashFunctionType::NumberHash
            && !self.prefix_key.field_type.is_integer()
        {
            return Err(KkvError::ConfigError(
                "number hash requires an integer prefix key".into(),
            ));
        }
        if self.enable_sort_skey && self.sort_params.is_empty() {
            return Err(KkvError::ConfigError(
                "enable_sort_skey is set without sort params".into(),
            ));
        }
        if self
            .sort_params
            .iter()
            .any(|p| p.field == SortField::SKey && !self.suffix_key.field_type.is_integer())
        {
            return Err(KkvError::ConfigError(
                "cannot sort by a hashed string suffix key".into(),
            ));
        }
        if self.fixed_value_len == Some(0) {
            return Err(KkvError::ConfigError("fixed value length must be positive".into()));
        }
        Ok(())
    }

    pub fn skey_field_name(&self) -> &str {
        &self.suffix_key.name
    }
}
