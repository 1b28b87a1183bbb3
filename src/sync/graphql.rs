//! GraphQL request and response types for AppSync-style mutations
//!
//! - `GraphQLRequest` is built from a mutation event and rendered into a
//!   document plus variables by the transport
//! - `GraphQLResponseError` / `GraphQLError` carry server-side errors
//! - `AppSyncErrorType` classifies the `errorType` extension

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::api::{ApiError, AuthType};
use super::error::{DataStoreError, DataStoreResult};
use super::models::{
    AnyModel, MutationEvent, MutationSync, MutationType, DELETED_FIELD, LAST_CHANGED_AT_FIELD,
    TYPENAME_FIELD, VERSION_FIELD,
};

/// A single error entry from a GraphQL response. AppSync puts `errorType`,
/// `errorInfo` and `data` next to `message`; on decode, such keys are folded
/// into `extensions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireGraphQLError")]
pub struct GraphQLError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
struct WireGraphQLError {
    message: String,
    #[serde(default)]
    locations: Option<Vec<Value>>,
    #[serde(default)]
    path: Option<Vec<Value>>,
    #[serde(default)]
    extensions: Option<Map<String, Value>>,
    #[serde(flatten)]
    other: Map<String, Value>,
}

impl From<WireGraphQLError> for GraphQLError {
    fn from(wire: WireGraphQLError) -> Self {
        let mut extensions = wire.extensions;
        if !wire.other.is_empty() {
            let merged = extensions.get_or_insert_with(Map::new);
            for (key, value) in wire.other {
                merged.entry(key).or_insert(value);
            }
        }

        Self {
            message: wire.message,
            locations: wire.locations,
            path: wire.path,
            extensions,
        }
    }
}

impl GraphQLError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            locations: None,
            path: None,
            extensions: None,
        }
    }

    pub fn with_extensions(mut self, extensions: Map<String, Value>) -> Self {
        self.extensions = Some(extensions);
        self
    }

    /// `extensions.errorType`, if present
    pub fn error_type(&self) -> Option<AppSyncErrorType> {
        self.extensions
            .as_ref()?
            .get("errorType")?
            .as_str()
            .map(AppSyncErrorType::from_str)
    }
}

/// Server-signalled error conditions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppSyncErrorType {
    ConditionalCheck,
    ConflictUnhandled,
    Unauthorized,
    OperationDisabled,
    Unknown(String),
}

impl AppSyncErrorType {
    pub fn from_str(value: &str) -> Self {
        match value {
            "ConditionalCheckFailedException" => AppSyncErrorType::ConditionalCheck,
            "ConflictUnhandled" => AppSyncErrorType::ConflictUnhandled,
            "Unauthorized" => AppSyncErrorType::Unauthorized,
            "OperationDisabled" => AppSyncErrorType::OperationDisabled,
            other => AppSyncErrorType::Unknown(other.to_string()),
        }
    }
}

/// A GraphQL-level failure returned alongside a transport success
#[derive(Debug, Clone, PartialEq)]
pub enum GraphQLResponseError {
    Error(Vec<GraphQLError>),
    PartialResult { partial: Value, errors: Vec<GraphQLError> },
    TransformationError { raw: String, message: String },
}

impl GraphQLResponseError {
    pub fn errors(&self) -> &[GraphQLError] {
        match self {
            GraphQLResponseError::Error(errors) => errors,
            GraphQLResponseError::PartialResult { errors, .. } => errors,
            GraphQLResponseError::TransformationError { .. } => &[],
        }
    }
}

impl fmt::Display for GraphQLResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphQLResponseError::Error(errors) | GraphQLResponseError::PartialResult { errors, .. } => {
                let messages: Vec<&str> = errors.iter().map(|e| e.message.as_str()).collect();
                write!(f, "{}", messages.join("; "))
            }
            GraphQLResponseError::TransformationError { message, .. } => {
                write!(f, "Failed to decode response: {}", message)
            }
        }
    }
}

/// Result of a mutation that reached the service
pub type GraphQLResponse = Result<MutationSync, GraphQLResponseError>;

/// Definitive failure of a mutation, handed to conflict processing
#[derive(Debug, Clone)]
pub enum CloudFailure {
    Api(ApiError),
    GraphQL(GraphQLResponseError),
}

impl CloudFailure {
    pub fn is_unauthorized(&self) -> bool {
        match self {
            CloudFailure::Api(e) => e.is_auth_error(),
            CloudFailure::GraphQL(e) => e
                .errors()
                .iter()
                .any(|error| error.error_type() == Some(AppSyncErrorType::Unauthorized)),
        }
    }
}

impl From<CloudFailure> for DataStoreError {
    fn from(failure: CloudFailure) -> Self {
        match failure {
            CloudFailure::Api(e) => DataStoreError::Api(e),
            CloudFailure::GraphQL(e) => DataStoreError::GraphQL(e.to_string()),
        }
    }
}

/// A model mutation ready to be rendered by a transport
#[derive(Debug, Clone, PartialEq)]
pub struct GraphQLRequest {
    pub model_name: String,
    pub mutation_type: MutationType,
    pub input: Value,
    pub condition: Option<Value>,
    pub auth_type: Option<AuthType>,
}

impl GraphQLRequest {
    pub fn mutation(model: &AnyModel, mutation_type: MutationType, version: Option<i64>, condition: Option<Value>) -> Self {
        let mut input = match (mutation_type, &model.instance) {
            (MutationType::Delete, _) => Map::new(),
            (_, Value::Object(fields)) => fields.clone(),
            _ => Map::new(),
        };
        input.insert("id".to_string(), Value::String(model.id.clone()));
        if let Some(version) = version {
            input.insert(VERSION_FIELD.to_string(), Value::from(version));
        }

        Self {
            model_name: model.model_name.clone(),
            mutation_type,
            input: Value::Object(input),
            condition,
            auth_type: None,
        }
    }

    pub fn from_mutation_event(event: &MutationEvent) -> DataStoreResult<Self> {
        let model = event.decode_model()?;
        Ok(Self::mutation(&model, event.mutation_type, event.version, event.condition()?))
    }

    pub fn with_auth_type(mut self, auth_type: Option<AuthType>) -> Self {
        self.auth_type = auth_type;
        self
    }

    pub fn version(&self) -> Option<i64> {
        self.input.get(VERSION_FIELD).and_then(Value::as_i64)
    }

    pub fn model_id(&self) -> Option<&str> {
        self.input.get("id").and_then(Value::as_str)
    }

    /// e.g. `updatePost`
    pub fn field_name(&self) -> String {
        format!("{}{}", self.mutation_type.as_str(), self.model_name)
    }

    /// e.g. `UpdatePost`
    pub fn operation_name(&self) -> String {
        let verb = self.mutation_type.as_str();
        let mut chars = verb.chars();
        let capitalized = match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
            None => String::new(),
        };
        format!("{}{}", capitalized, self.model_name)
    }

    pub fn document(&self, fields: &[String]) -> String {
        let mut selection: Vec<&str> = vec!["id"];
        selection.extend(fields.iter().map(String::as_str).filter(|f| *f != "id"));
        selection.extend([TYPENAME_FIELD, VERSION_FIELD, DELETED_FIELD, LAST_CHANGED_AT_FIELD]);

        let operation = self.operation_name();
        let body = selection
            .iter()
            .map(|field| format!("    {}", field))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "mutation {op}($input: {op}Input!, $condition: Model{model}ConditionInput) {{\n  {field}(input: $input, condition: $condition) {{\n{body}\n  }}\n}}",
            op = operation,
            model = self.model_name,
            field = self.field_name(),
            body = body,
        )
    }

    pub fn variables(&self) -> Value {
        match &self.condition {
            Some(condition) => json!({ "input": self.input, "condition": condition }),
            None => json!({ "input": self.input }),
        }
    }
}
