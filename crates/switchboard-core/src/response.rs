//! The GraphQL response wire type.

use crate::json_ext::Object;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use typed_builder::TypedBuilder;

/// A graphql response.
/// Used for gateway responses and for parsing subgraph answers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(setter(into)))]
pub struct Response {
    /// The response data.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default)]
    pub data: Option<Value>,

    /// The optional graphql errors encountered.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    #[builder(default)]
    pub errors: Vec<Error>,
}

impl Response {
    /// A successful response carrying `data`.
    pub fn from_data(data: Object) -> Self {
        Response::builder().data(Some(Value::Object(data))).build()
    }

    /// A failed response carrying a single error and `"data": null`.
    pub fn from_error(error: Error) -> Self {
        Response::builder()
            .data(Some(Value::Null))
            .errors(vec![error])
            .build()
    }
}

/// A graphql error entry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Error {
    /// The error message.
    pub message: String,

    /// The path in the response the error applies to, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default)]
    pub path: Option<Value>,

    /// Additional machine-readable details.
    #[serde(skip_serializing_if = "Object::is_empty", default)]
    #[builder(default)]
    pub extensions: Object,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serialize_skips_empty_fields() {
        let response = Response::from_data(
            json!({"hello": "world"}).as_object().cloned().unwrap(),
        );
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"data": {"hello": "world"}}),
        );
    }

    #[test]
    fn deserialize_upstream_errors() {
        let response: Response = serde_json::from_value(json!({
            "data": null,
            "errors": [{"message": "boom", "extensions": {"code": "TEAPOT"}}],
        }))
        .unwrap();
        assert_eq!(response.data, Some(Value::Null));
        assert_eq!(response.errors.len(), 1);
        assert_eq!(response.errors[0].message, "boom");
    }
}
