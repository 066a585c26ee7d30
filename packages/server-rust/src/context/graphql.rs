//! GraphQL request extraction.

use serde_json::{Map, Value};

use super::BaseContext;

/// The three fields of a GraphQL request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphQLInfo {
    pub query: String,
    pub variables: Map<String, Value>,
    pub operation_name: Option<String>,
}

impl GraphQLInfo {
    /// Reads the request from a JSON body, falling back to query parameters
    /// (`query`, `variables` as JSON text, `operationName`).
    ///
    /// Missing or malformed fields become empty values.
    #[must_use]
    pub fn from_request(base: &BaseContext) -> Self {
        if let Ok(Value::Object(body)) = serde_json::from_slice::<Value>(&base.body) {
            return Self::from_object(&body);
        }

        let params = base.query();
        let variables = params
            .get("variables")
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
            .and_then(|v| match v {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .unwrap_or_default();

        Self {
            query: params.get("query").cloned().unwrap_or_default(),
            variables,
            operation_name: params.get("operationName").cloned(),
        }
    }

    fn from_object(body: &Map<String, Value>) -> Self {
        Self {
            query: body
                .get("query")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            variables: body
                .get("variables")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
            operation_name: body
                .get("operationName")
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }
}
