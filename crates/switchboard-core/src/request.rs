//! The GraphQL request wire type.

use crate::json_ext::Object;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

/// A graphql request.
/// Used for client requests and subgraph queries alike.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(setter(into)))]
pub struct Request {
    /// The graphql query.
    pub query: String,

    /// The optional operation to run when the document contains several.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default)]
    pub operation_name: Option<String>,

    /// The optional variables in the form of a json object.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default)]
    pub variables: Option<Object>,
}

impl Request {
    /// The variables, defaulting to an empty object.
    pub fn variables_or_default(&self) -> Object {
        self.variables.clone().unwrap_or_default()
    }
}
