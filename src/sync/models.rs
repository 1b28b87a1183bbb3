//! Sync data models
//!
//! Defines the records exchanged between the local store, the durable
//! mutation log and the remote GraphQL service:
//! - `AnyModel`: a type-erased model instance routed by model name
//! - `MutationEvent`: one pending local create/update/delete
//! - `MutationSyncMetadata`: per-instance version bookkeeping
//! - `MutationSync`: a model paired with its sync metadata

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::{DataStoreError, DataStoreResult};

/// Reserved AppSync fields carried next to model fields on the wire
pub const VERSION_FIELD: &str = "_version";
pub const DELETED_FIELD: &str = "_deleted";
pub const LAST_CHANGED_AT_FIELD: &str = "_lastChangedAt";
pub const TYPENAME_FIELD: &str = "__typename";

/// A concrete model type known at compile time.
pub trait Model: Serialize + DeserializeOwned + Send + Sync {
    const MODEL_NAME: &'static str;

    fn id(&self) -> &str;
}

/// Type-erased model instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnyModel {
    pub model_name: String,
    pub id: String,
    pub instance: Value,
}

impl AnyModel {
    pub fn new(model_name: impl Into<String>, id: impl Into<String>, instance: Value) -> Self {
        Self {
            model_name: model_name.into(),
            id: id.into(),
            instance,
        }
    }

    pub fn from_model<M: Model>(model: &M) -> DataStoreResult<Self> {
        let instance = serde_json::to_value(model)?;
        Ok(Self::new(M::MODEL_NAME, model.id(), instance))
    }

    /// Decode into a concrete model type, checking the model name first.
    pub fn decode<M: Model>(&self) -> DataStoreResult<M> {
        if self.model_name != M::MODEL_NAME {
            return Err(DataStoreError::Decoding(format!(
                "Expected model {} but found {}",
                M::MODEL_NAME,
                self.model_name
            )));
        }
        Ok(serde_json::from_value(self.instance.clone())?)
    }

    pub fn to_json_string(&self) -> DataStoreResult<String> {
        Ok(serde_json::to_string(&self.instance)?)
    }
}

/// Kind of local change recorded in a mutation event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationType {
    Create,
    Update,
    Delete,
}

impl MutationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationType::Create => "create",
            MutationType::Update => "update",
            MutationType::Delete => "delete",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "create" => Ok(MutationType::Create),
            "update" => Ok(MutationType::Update),
            "delete" => Ok(MutationType::Delete),
            _ => Err(format!("Invalid mutation type: {}", s)),
        }
    }
}

/// Durable record of one local create/update/delete awaiting delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationEvent {
    pub id: String,
    pub model_id: String,
    pub model_name: String,
    /// Serialized model payload
    pub json: String,
    pub mutation_type: MutationType,
    pub created_at: DateTime<Utc>,
    /// Version the mutation was made against; `None` for brand-new creates
    pub version: Option<i64>,
    pub in_process: bool,
    /// Serialized GraphQL condition input
    pub graphql_filter_json: Option<String>,
}

impl MutationEvent {
    pub fn new(model: &AnyModel, mutation_type: MutationType, version: Option<i64>) -> DataStoreResult<Self> {
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            model_id: model.id.clone(),
            model_name: model.model_name.clone(),
            json: model.to_json_string()?,
            mutation_type,
            created_at: Utc::now(),
            version,
            in_process: false,
            graphql_filter_json: None,
        })
    }

    pub fn from_model<M: Model>(model: &M, mutation_type: MutationType, version: Option<i64>) -> DataStoreResult<Self> {
        Self::new(&AnyModel::from_model(model)?, mutation_type, version)
    }

    pub fn with_condition(mut self, condition: &Value) -> DataStoreResult<Self> {
        self.graphql_filter_json = Some(serde_json::to_string(condition)?);
        Ok(self)
    }

    /// Decode the stored payload back into a type-erased model.
    pub fn decode_model(&self) -> DataStoreResult<AnyModel> {
        let instance: Value = serde_json::from_str(&self.json)?;
        Ok(AnyModel::new(self.model_name.clone(), self.model_id.clone(), instance))
    }

    pub fn condition(&self) -> DataStoreResult<Option<Value>> {
        match &self.graphql_filter_json {
            Some(json) => Ok(Some(serde_json::from_str(json)?)),
            None => Ok(None),
        }
    }

    /// Fixed-width timestamp so lexical order matches creation order
    pub fn created_at_key(&self) -> String {
        self.created_at.to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}

/// Per-instance version and tombstone state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationSyncMetadata {
    pub model_id: String,
    pub model_name: String,
    pub deleted: bool,
    pub last_changed_at: i64,
    pub version: i64,
}

impl MutationSyncMetadata {
    pub fn new(model_name: impl Into<String>, model_id: impl Into<String>, version: i64, deleted: bool) -> Self {
        Self {
            model_id: model_id.into(),
            model_name: model_name.into(),
            deleted,
            last_changed_at: Utc::now().timestamp_millis(),
            version,
        }
    }

    pub fn identifier(&self) -> String {
        format!("{}|{}", self.model_name, self.model_id)
    }
}

/// A model paired with its sync metadata
#[derive(Debug, Clone, PartialEq)]
pub struct MutationSync {
    pub model: AnyModel,
    pub sync_metadata: MutationSyncMetadata,
}

impl MutationSync {
    pub fn new(model: AnyModel, sync_metadata: MutationSyncMetadata) -> Self {
        Self { model, sync_metadata }
    }

    pub fn model_id(&self) -> &str {
        &self.model.id
    }

    pub fn version(&self) -> i64 {
        self.sync_metadata.version
    }

    pub fn is_deleted(&self) -> bool {
        self.sync_metadata.deleted
    }

    /// Decode the AppSync wire shape: model fields plus `_version`,
    /// `_deleted`, `_lastChangedAt` and `__typename`.
    pub fn from_graphql_value(value: &Value, fallback_model_name: &str) -> DataStoreResult<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| DataStoreError::Decoding("Expected a JSON object for a synced model".to_string()))?;

        let id = object
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| DataStoreError::Decoding("Synced model is missing `id`".to_string()))?
            .to_string();
        let version = object
            .get(VERSION_FIELD)
            .and_then(Value::as_i64)
            .ok_or_else(|| DataStoreError::Decoding(format!("Synced model {} is missing `{}`", id, VERSION_FIELD)))?;
        let deleted = object.get(DELETED_FIELD).and_then(Value::as_bool).unwrap_or(false);
        let last_changed_at = object.get(LAST_CHANGED_AT_FIELD).and_then(Value::as_i64).unwrap_or(0);
        let model_name = object
            .get(TYPENAME_FIELD)
            .and_then(Value::as_str)
            .unwrap_or(fallback_model_name)
            .to_string();

        let instance: Map<String, Value> = object
            .iter()
            .filter(|(key, _)| !matches!(key.as_str(), VERSION_FIELD | DELETED_FIELD | LAST_CHANGED_AT_FIELD | TYPENAME_FIELD))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(Self {
            model: AnyModel::new(model_name.clone(), id.clone(), Value::Object(instance)),
            sync_metadata: MutationSyncMetadata {
                model_id: id,
                model_name,
                deleted,
                last_changed_at,
                version,
            },
        })
    }

    pub fn to_graphql_value(&self) -> Value {
        let mut object = match &self.model.instance {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        object.insert("id".to_string(), Value::String(self.model.id.clone()));
        object.insert(TYPENAME_FIELD.to_string(), Value::String(self.model.model_name.clone()));
        object.insert(VERSION_FIELD.to_string(), Value::from(self.sync_metadata.version));
        object.insert(DELETED_FIELD.to_string(), Value::Bool(self.sync_metadata.deleted));
        object.insert(LAST_CHANGED_AT_FIELD.to_string(), Value::from(self.sync_metadata.last_changed_at));
        Value::Object(object)
    }
}

/// Local and remote sides of a version conflict
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictData {
    pub local: AnyModel,
    pub remote: AnyModel,
}

/// Outcome chosen by a conflict handler
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictResolution {
    /// Accept the remote value and persist it locally
    ApplyRemote,
    /// Re-send the local value at the remote version
    RetryLocal,
    /// Re-send the given replacement at the remote version
    Retry(AnyModel),
}
