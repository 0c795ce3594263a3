//! The gateway's in-process introspection service.
//!
//! Federation has to re-expose introspection as if the gateway were a single
//! GraphQL server, so `__schema` and `__type` are answered here, against the
//! merged schema, rather than forwarded to any upstream.

use crate::error::GatewayError;
use crate::json_ext::Object;
use crate::planner::{apply_fragments, selected_fields};
use crate::queryer::{QueryInput, Queryer, RequestContext};
use crate::schema::INTROSPECTION_LOCATION;
use apollo_compiler::ast;
use apollo_compiler::schema::{ExtendedType, FieldDefinition, InputValueDefinition, Schema};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// A queryer that resolves a query by walking a schema instead of hitting
/// the network.
#[derive(Debug, Clone)]
pub struct IntrospectionQueryer {
    schema: Arc<Schema>,
}

impl IntrospectionQueryer {
    pub fn new(schema: Arc<Schema>) -> Self {
        IntrospectionQueryer { schema }
    }
}

#[async_trait]
impl Queryer for IntrospectionQueryer {
    fn url(&self) -> &str {
        INTROSPECTION_LOCATION
    }

    async fn query(
        &self,
        _ctx: &RequestContext,
        input: QueryInput,
    ) -> Result<Object, GatewayError> {
        let document = match input.document {
            Some(document) => document,
            None => ast::Document::parse(input.query.clone(), "introspection.graphql").map_err(
                |err| GatewayError::InvalidQuery {
                    reason: err.to_string(),
                },
            )?,
        };

        let operation = document
            .definitions
            .iter()
            .find_map(|definition| match definition {
                ast::Definition::OperationDefinition(operation) => Some(operation),
                _ => None,
            })
            .ok_or_else(|| GatewayError::InvalidQuery {
                reason: "introspection document has no operation".to_string(),
            })?;

        let fragments: Vec<_> = document
            .definitions
            .iter()
            .filter_map(|definition| match definition {
                ast::Definition::FragmentDefinition(fragment) => Some(fragment.clone()),
                _ => None,
            })
            .collect();
        let selection_set = apply_fragments(&operation.selection_set, &fragments);

        let mut result = Object::new();
        for field in selected_fields(&selection_set) {
            let key = response_key(field);
            match field.name.as_str() {
                "__schema" => {
                    result.insert(key, self.introspect_schema(&field.selection_set));
                }
                "__type" => {
                    let name = field
                        .arguments
                        .iter()
                        .find(|argument| argument.name.as_str() == "name")
                        .and_then(|argument| match argument.value.as_ref() {
                            ast::Value::String(name) => Some(name.clone()),
                            _ => None,
                        });
                    let value = match name {
                        Some(name) if self.schema.types.contains_key(name.as_str()) => {
                            self.introspect_named_type(&name, &field.selection_set)
                        }
                        _ => Value::Null,
                    };
                    result.insert(key, value);
                }
                _ => {}
            }
        }

        Ok(result)
    }
}

impl IntrospectionQueryer {
    fn introspect_schema(&self, selection_set: &[ast::Selection]) -> Value {
        let mut result = Object::new();
        for field in selected_fields(selection_set) {
            let key = response_key(field);
            let value = match field.name.as_str() {
                "types" => Value::Array(
                    self.schema
                        .types
                        .keys()
                        .map(|name| self.introspect_named_type(name.as_str(), &field.selection_set))
                        .collect(),
                ),
                "queryType" => self.introspect_root_type("Query", &field.selection_set),
                "mutationType" => self.introspect_root_type("Mutation", &field.selection_set),
                "subscriptionType" => {
                    self.introspect_root_type("Subscription", &field.selection_set)
                }
                "directives" => Value::Array(
                    self.schema
                        .directive_definitions
                        .values()
                        .map(|directive| self.introspect_directive(directive, &field.selection_set))
                        .collect(),
                ),
                _ => Value::Null,
            };
            result.insert(key, value);
        }
        Value::Object(result)
    }

    fn introspect_root_type(&self, conventional: &str, selection_set: &[ast::Selection]) -> Value {
        let definition = &self.schema.schema_definition;
        let name = match conventional {
            "Query" => definition.query.as_ref().map(|root| root.name.to_string()),
            "Mutation" => definition.mutation.as_ref().map(|root| root.name.to_string()),
            _ => definition
                .subscription
                .as_ref()
                .map(|root| root.name.to_string()),
        }
        .or_else(|| {
            self.schema
                .types
                .contains_key(conventional)
                .then(|| conventional.to_string())
        });

        match name {
            Some(name) => self.introspect_named_type(&name, selection_set),
            None => Value::Null,
        }
    }

    fn introspect_named_type(&self, name: &str, selection_set: &[ast::Selection]) -> Value {
        let Some(type_def) = self.schema.types.get(name) else {
            return Value::Null;
        };

        let mut result = Object::new();
        for field in selected_fields(selection_set) {
            let key = response_key(field);
            let include_deprecated = include_deprecated(field);
            let value = match field.name.as_str() {
                "kind" => Value::String(type_kind(type_def).to_string()),
                "name" => Value::String(name.to_string()),
                "description" => description_value(match type_def {
                    ExtendedType::Scalar(def) => def.description.as_deref(),
                    ExtendedType::Object(def) => def.description.as_deref(),
                    ExtendedType::Interface(def) => def.description.as_deref(),
                    ExtendedType::Union(def) => def.description.as_deref(),
                    ExtendedType::Enum(def) => def.description.as_deref(),
                    ExtendedType::InputObject(def) => def.description.as_deref(),
                }),
                "fields" => self.introspect_fields(type_def, include_deprecated, &field.selection_set),
                "interfaces" => self.introspect_interfaces(type_def, &field.selection_set),
                "possibleTypes" => self.introspect_possible_types(name, type_def, &field.selection_set),
                "enumValues" => self.introspect_enum_values(type_def, include_deprecated, &field.selection_set),
                "inputFields" => self.introspect_input_fields(type_def, &field.selection_set),
                // a named type is never a wrapper
                "ofType" => Value::Null,
                _ => Value::Null,
            };
            result.insert(key, value);
        }
        Value::Object(result)
    }

    fn introspect_fields(
        &self,
        type_def: &ExtendedType,
        include_deprecated: bool,
        selection_set: &[ast::Selection],
    ) -> Value {
        let fields: Vec<&FieldDefinition> = match type_def {
            ExtendedType::Object(object) => object
                .fields
                .values()
                .map(|component| &component.node)
                .map(|node| &**node)
                .collect(),
            ExtendedType::Interface(interface) => interface
                .fields
                .values()
                .map(|component| &component.node)
                .map(|node| &**node)
                .collect(),
            _ => return Value::Null,
        };

        Value::Array(
            fields
                .into_iter()
                .filter(|field| include_deprecated || deprecation_reason(&field.directives).is_none())
                .map(|field| self.introspect_field(field, selection_set))
                .collect(),
        )
    }

    fn introspect_field(
        &self,
        field_def: &FieldDefinition,
        selection_set: &[ast::Selection],
    ) -> Value {
        let deprecation = deprecation_reason(&field_def.directives);
        let mut result = Object::new();
        for field in selected_fields(selection_set) {
            let key = response_key(field);
            let value = match field.name.as_str() {
                "name" => Value::String(field_def.name.to_string()),
                "description" => description_value(field_def.description.as_deref()),
                "args" => Value::Array(
                    field_def
                        .arguments
                        .iter()
                        .map(|argument| self.introspect_input_value(argument, &field.selection_set))
                        .collect(),
                ),
                "type" => self.introspect_type_ref(&field_def.ty, &field.selection_set),
                "isDeprecated" => Value::Bool(deprecation.is_some()),
                "deprecationReason" => deprecation
                    .clone()
                    .map(Value::String)
                    .unwrap_or(Value::Null),
                _ => Value::Null,
            };
            result.insert(key, value);
        }
        Value::Object(result)
    }

    fn introspect_input_value(
        &self,
        input: &InputValueDefinition,
        selection_set: &[ast::Selection],
    ) -> Value {
        let mut result = Object::new();
        for field in selected_fields(selection_set) {
            let key = response_key(field);
            let value = match field.name.as_str() {
                "name" => Value::String(input.name.to_string()),
                "description" => description_value(input.description.as_deref()),
                "type" => self.introspect_type_ref(&input.ty, &field.selection_set),
                "defaultValue" => input
                    .default_value
                    .as_ref()
                    .map(|value| Value::String(value.to_string()))
                    .unwrap_or(Value::Null),
                _ => Value::Null,
            };
            result.insert(key, value);
        }
        Value::Object(result)
    }

    fn introspect_interfaces(
        &self,
        type_def: &ExtendedType,
        selection_set: &[ast::Selection],
    ) -> Value {
        let interfaces = match type_def {
            ExtendedType::Object(object) => &object.implements_interfaces,
            ExtendedType::Interface(interface) => &interface.implements_interfaces,
            _ => return Value::Null,
        };
        Value::Array(
            interfaces
                .iter()
                .map(|interface| self.introspect_named_type(interface.as_str(), selection_set))
                .collect(),
        )
    }

    fn introspect_possible_types(
        &self,
        name: &str,
        type_def: &ExtendedType,
        selection_set: &[ast::Selection],
    ) -> Value {
        match type_def {
            ExtendedType::Union(union) => Value::Array(
                union
                    .members
                    .iter()
                    .map(|member| self.introspect_named_type(member.as_str(), selection_set))
                    .collect(),
            ),
            ExtendedType::Interface(_) => Value::Array(
                self.schema
                    .types
                    .iter()
                    .filter_map(|(candidate, candidate_def)| match candidate_def {
                        ExtendedType::Object(object)
                            if object
                                .implements_interfaces
                                .iter()
                                .any(|interface| interface.as_str() == name) =>
                        {
                            Some(self.introspect_named_type(candidate.as_str(), selection_set))
                        }
                        _ => None,
                    })
                    .collect(),
            ),
            _ => Value::Null,
        }
    }

    fn introspect_enum_values(
        &self,
        type_def: &ExtendedType,
        include_deprecated: bool,
        selection_set: &[ast::Selection],
    ) -> Value {
        let ExtendedType::Enum(enum_def) = type_def else {
            return Value::Null;
        };

        Value::Array(
            enum_def
                .values
                .values()
                .filter(|value| {
                    include_deprecated || deprecation_reason(&value.directives).is_none()
                })
                .map(|value_def| {
                    let deprecation = deprecation_reason(&value_def.directives);
                    let mut result = Object::new();
                    for field in selected_fields(selection_set) {
                        let key = response_key(field);
                        let value = match field.name.as_str() {
                            "name" => Value::String(value_def.value.to_string()),
                            "description" => description_value(value_def.description.as_deref()),
                            "isDeprecated" => Value::Bool(deprecation.is_some()),
                            "deprecationReason" => deprecation
                                .clone()
                                .map(Value::String)
                                .unwrap_or(Value::Null),
                            _ => Value::Null,
                        };
                        result.insert(key, value);
                    }
                    Value::Object(result)
                })
                .collect(),
        )
    }

    fn introspect_input_fields(
        &self,
        type_def: &ExtendedType,
        selection_set: &[ast::Selection],
    ) -> Value {
        let ExtendedType::InputObject(input) = type_def else {
            return Value::Null;
        };
        Value::Array(
            input
                .fields
                .values()
                .map(|field_def| self.introspect_input_value(field_def, selection_set))
                .collect(),
        )
    }

    fn introspect_directive(
        &self,
        directive: &ast::DirectiveDefinition,
        selection_set: &[ast::Selection],
    ) -> Value {
        let mut result = Object::new();
        for field in selected_fields(selection_set) {
            let key = response_key(field);
            let value = match field.name.as_str() {
                "name" => Value::String(directive.name.to_string()),
                "description" => description_value(directive.description.as_deref()),
                "locations" => Value::Array(
                    directive
                        .locations
                        .iter()
                        .map(|location| Value::String(location.name().to_string()))
                        .collect(),
                ),
                "args" => Value::Array(
                    directive
                        .arguments
                        .iter()
                        .map(|argument| self.introspect_input_value(argument, &field.selection_set))
                        .collect(),
                ),
                _ => Value::Null,
            };
            result.insert(key, value);
        }
        Value::Object(result)
    }

    /// Emit a type reference, unrolling list and non-null wrappers into the
    /// `ofType` chain the introspection contract requires.
    fn introspect_type_ref(&self, ty: &ast::Type, selection_set: &[ast::Selection]) -> Value {
        match ty {
            ast::Type::Named(name) => self.introspect_named_type(name.as_str(), selection_set),
            ast::Type::NonNullNamed(name) => {
                self.introspect_wrapper("NON_NULL", &ast::Type::Named(name.clone()), selection_set)
            }
            ast::Type::List(inner) => self.introspect_wrapper("LIST", inner, selection_set),
            ast::Type::NonNullList(inner) => {
                self.introspect_wrapper("NON_NULL", &ast::Type::List(inner.clone()), selection_set)
            }
        }
    }

    fn introspect_wrapper(
        &self,
        kind: &str,
        inner: &ast::Type,
        selection_set: &[ast::Selection],
    ) -> Value {
        let mut result = Object::new();
        for field in selected_fields(selection_set) {
            let key = response_key(field);
            let value = match field.name.as_str() {
                "kind" => Value::String(kind.to_string()),
                "ofType" => self.introspect_type_ref(inner, &field.selection_set),
                _ => Value::Null,
            };
            result.insert(key, value);
        }
        Value::Object(result)
    }
}

fn response_key(field: &ast::Field) -> String {
    field
        .alias
        .as_ref()
        .unwrap_or(&field.name)
        .to_string()
}

fn include_deprecated(field: &ast::Field) -> bool {
    field
        .arguments
        .iter()
        .find(|argument| argument.name.as_str() == "includeDeprecated")
        .map(|argument| matches!(argument.value.as_ref(), ast::Value::Boolean(true)))
        .unwrap_or(false)
}

fn deprecation_reason(directives: &ast::DirectiveList) -> Option<String> {
    let directive = directives
        .iter()
        .find(|directive| directive.name.as_str() == "deprecated")?;
    let reason = directive
        .arguments
        .iter()
        .find(|argument| argument.name.as_str() == "reason")
        .and_then(|argument| match argument.value.as_ref() {
            ast::Value::String(reason) => Some(reason.clone()),
            _ => None,
        })
        .unwrap_or_else(|| "No longer supported".to_string());
    Some(reason)
}

fn type_kind(type_def: &ExtendedType) -> &'static str {
    match type_def {
        ExtendedType::Scalar(_) => "SCALAR",
        ExtendedType::Object(_) => "OBJECT",
        ExtendedType::Interface(_) => "INTERFACE",
        ExtendedType::Union(_) => "UNION",
        ExtendedType::Enum(_) => "ENUM",
        ExtendedType::InputObject(_) => "INPUT_OBJECT",
    }
}

fn description_value(description: Option<&str>) -> Value {
    description
        .map(|text| Value::String(text.to_string()))
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::load_schema;
    use serde_json::json;

    async fn introspect(sdl: &str, query: &str) -> Object {
        let schema = Arc::new(load_schema(sdl).unwrap());
        IntrospectionQueryer::new(schema)
            .query(&RequestContext::default(), QueryInput::new(query))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn query_type_name() {
        let result = introspect(
            "type Query { foo: Boolean }",
            "{ __schema { queryType { name } } }",
        )
        .await;
        assert_eq!(
            Value::Object(result),
            json!({"__schema": {"queryType": {"name": "Query"}}}),
        );
    }

    #[tokio::test]
    async fn aliases_are_honoured() {
        let result = introspect(
            "type Query { foo: Boolean }",
            "{ schema: __schema { root: queryType { title: name } } }",
        )
        .await;
        assert_eq!(
            Value::Object(result),
            json!({"schema": {"root": {"title": "Query"}}}),
        );
    }

    #[tokio::test]
    async fn type_lookup_walks_fields_and_wrappers() {
        let result = introspect(
            r#"
            type User { friends: [User!]! }
            type Query { me: User }
            "#,
            r#"{
                __type(name: "User") {
                    kind
                    name
                    fields {
                        name
                        type { kind ofType { kind ofType { kind name } } }
                    }
                }
            }"#,
        )
        .await;

        assert_eq!(
            Value::Object(result),
            json!({
                "__type": {
                    "kind": "OBJECT",
                    "name": "User",
                    "fields": [{
                        "name": "friends",
                        "type": {
                            "kind": "NON_NULL",
                            "ofType": {
                                "kind": "LIST",
                                "ofType": {"kind": "NON_NULL", "name": null},
                            },
                        },
                    }],
                },
            }),
        );
    }

    #[tokio::test]
    async fn unknown_type_is_null() {
        let result = introspect(
            "type Query { foo: Boolean }",
            r#"{ __type(name: "Missing") { name } }"#,
        )
        .await;
        assert_eq!(Value::Object(result), json!({"__type": null}));
    }

    #[tokio::test]
    async fn deprecated_fields_are_gated() {
        let sdl = r#"
            type Query {
                fresh: Boolean
                stale: Boolean @deprecated(reason: "gone")
            }
        "#;

        let without = introspect(sdl, r#"{ __type(name: "Query") { fields { name } } }"#).await;
        let names: Vec<&str> = without["__type"]["fields"]
            .as_array()
            .unwrap()
            .iter()
            .map(|field| field["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["fresh"]);

        let with = introspect(
            sdl,
            r#"{ __type(name: "Query") { fields(includeDeprecated: true) { name deprecationReason } } }"#,
        )
        .await;
        let fields = with["__type"]["fields"].as_array().unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[1]["deprecationReason"], json!("gone"));
    }

    #[tokio::test]
    async fn enum_values_and_possible_types() {
        let result = introspect(
            r#"
            enum Species { CAT DOG }
            interface Pet { name: String }
            type Cat implements Pet { name: String }
            type Query { pet: Pet species: Species }
            "#,
            r#"{
                species: __type(name: "Species") { enumValues { name } }
                pet: __type(name: "Pet") { possibleTypes { name } }
            }"#,
        )
        .await;

        assert_eq!(
            Value::Object(result),
            json!({
                "species": {"enumValues": [{"name": "CAT"}, {"name": "DOG"}]},
                "pet": {"possibleTypes": [{"name": "Cat"}]},
            }),
        );
    }
}
