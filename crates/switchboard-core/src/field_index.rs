//! The field-location index: which services can resolve which fields.

use crate::error::GatewayError;
use crate::schema::RemoteSchema;
use apollo_compiler::schema::ExtendedType;
use std::collections::HashMap;

/// Maps `"ParentType.field"` to the ordered list of service locations able to
/// resolve it. A field defined by several services keeps every location; the
/// order decides tie-breaks during planning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldIndex {
    locations: HashMap<String, Vec<String>>,
}

impl FieldIndex {
    pub fn new() -> Self {
        FieldIndex::default()
    }

    fn key_for(parent: &str, field: &str) -> String {
        format!("{parent}.{field}")
    }

    /// Add a location to the list of places `parent.field` can be found.
    pub fn register(&mut self, parent: &str, field: &str, location: impl Into<String>) {
        self.locations
            .entry(Self::key_for(parent, field))
            .or_default()
            .push(location.into());
    }

    /// The list of locations one can find `parent.field`.
    pub fn lookup(&self, parent: &str, field: &str) -> Result<&[String], GatewayError> {
        self.locations
            .get(&Self::key_for(parent, field))
            .map(Vec::as_slice)
            .ok_or_else(|| GatewayError::UnknownField {
                parent_type: parent.to_string(),
                field: field.to_string(),
            })
    }

    /// Merge another index into this one, key-wise and order-preserving.
    pub fn concat(mut self, other: FieldIndex) -> FieldIndex {
        for (key, mut locations) in other.locations {
            self.locations
                .entry(key)
                .or_default()
                .append(&mut locations);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

/// Build the index for a set of source schemas.
///
/// When `strip_internal` is set, introspection machinery is kept out of the
/// index: types whose name starts with `__` are skipped entirely, as are the
/// `__`-prefixed meta fields of `Query`. The internal schema is indexed with
/// `strip_internal` unset so that the gateway's own introspection service is
/// the only location those fields resolve to.
pub fn field_locations(sources: &[RemoteSchema], strip_internal: bool) -> FieldIndex {
    let mut index = FieldIndex::new();

    for remote in sources {
        for (type_name, type_def) in &remote.schema.types {
            if strip_internal && type_name.as_str().starts_with("__") {
                continue;
            }

            let fields: Vec<&str> = match type_def {
                ExtendedType::Object(object) => {
                    object.fields.keys().map(|name| name.as_str()).collect()
                }
                ExtendedType::Interface(interface) => {
                    interface.fields.keys().map(|name| name.as_str()).collect()
                }
                _ => continue,
            };

            for field in fields {
                if strip_internal && type_name.as_str() == "Query" && field.starts_with("__") {
                    continue;
                }
                index.register(type_name.as_str(), field, remote.url.clone());
            }
        }
    }

    index
}
