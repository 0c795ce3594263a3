//! Discovering the schema of a remote service through introspection.

use crate::error::SchemaError;
use crate::schema::{load_schema, RemoteSchema};
use serde::Deserialize;
use std::fmt::Write;

/// The introspection query sent to every service at startup.
pub const INTROSPECTION_QUERY: &str = r#"
query IntrospectionQuery {
    __schema {
        queryType { name }
        mutationType { name }
        subscriptionType { name }
        types {
            ...FullType
        }
    }
}

fragment FullType on __Type {
    kind
    name
    description
    fields(includeDeprecated: true) {
        name
        description
        args {
            ...InputValue
        }
        type {
            ...TypeRef
        }
        isDeprecated
        deprecationReason
    }
    inputFields {
        ...InputValue
    }
    interfaces {
        ...TypeRef
    }
    enumValues(includeDeprecated: true) {
        name
        description
        isDeprecated
        deprecationReason
    }
    possibleTypes {
        ...TypeRef
    }
}

fragment InputValue on __InputValue {
    name
    description
    type { ...TypeRef }
    defaultValue
}

fragment TypeRef on __Type {
    kind
    name
    ofType {
        kind
        name
        ofType {
            kind
            name
            ofType {
                kind
                name
                ofType {
                    kind
                    name
                    ofType {
                        kind
                        name
                        ofType {
                            kind
                            name
                            ofType {
                                kind
                                name
                            }
                        }
                    }
                }
            }
        }
    }
}
"#;

// types the services define implicitly; they never re-enter the SDL
const BUILT_IN_SCALARS: [&str; 5] = ["Boolean", "Float", "String", "Int", "ID"];

#[derive(Debug, Deserialize)]
struct IntrospectionResponse {
    data: Option<IntrospectionData>,
}

#[derive(Debug, Deserialize)]
struct IntrospectionData {
    #[serde(rename = "__schema")]
    schema: IntrospectionSchema,
}

/// The shape of a standard `__schema` introspection result.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntrospectionSchema {
    query_type: Option<NamedTypeRef>,
    mutation_type: Option<NamedTypeRef>,
    subscription_type: Option<NamedTypeRef>,
    #[serde(default)]
    types: Vec<FullType>,
}

#[derive(Debug, Deserialize)]
struct NamedTypeRef {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FullType {
    kind: String,
    name: Option<String>,
    #[serde(default)]
    fields: Option<Vec<IntrospectionField>>,
    #[serde(default)]
    input_fields: Option<Vec<InputValue>>,
    #[serde(default)]
    interfaces: Option<Vec<TypeRef>>,
    #[serde(default)]
    enum_values: Option<Vec<EnumValue>>,
    #[serde(default)]
    possible_types: Option<Vec<TypeRef>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntrospectionField {
    name: String,
    #[serde(default)]
    args: Vec<InputValue>,
    #[serde(rename = "type")]
    ty: TypeRef,
    #[serde(default)]
    is_deprecated: bool,
    deprecation_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InputValue {
    name: String,
    #[serde(rename = "type")]
    ty: TypeRef,
    default_value: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnumValue {
    name: String,
    #[serde(default)]
    is_deprecated: bool,
    deprecation_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypeRef {
    kind: String,
    name: Option<String>,
    of_type: Option<Box<TypeRef>>,
}

impl TypeRef {
    fn to_sdl(&self) -> String {
        match (self.kind.as_str(), &self.of_type) {
            ("NON_NULL", Some(inner)) => format!("{}!", inner.to_sdl()),
            ("LIST", Some(inner)) => format!("[{}]", inner.to_sdl()),
            _ => self.name.clone().unwrap_or_default(),
        }
    }
}

/// Introspect the service at `url` and parse the schema it serves.
pub async fn introspect_remote_schema(url: &str) -> Result<RemoteSchema, SchemaError> {
    let body = serde_json::json!({ "query": INTROSPECTION_QUERY });
    let response = reqwest::Client::new()
        .post(url)
        .json(&body)
        .send()
        .await
        .map_err(|err| SchemaError::Introspection {
            url: url.to_string(),
            reason: err.to_string(),
        })?
        .json::<IntrospectionResponse>()
        .await
        .map_err(|err| SchemaError::Introspection {
            url: url.to_string(),
            reason: format!("malformed introspection response: {err}"),
        })?;

    let data = response.data.ok_or_else(|| SchemaError::Introspection {
        url: url.to_string(),
        reason: "introspection response carried no data".to_string(),
    })?;

    let schema = schema_from_introspection(&data.schema)?;
    tracing::info!(service = url, "introspected remote schema");
    Ok(RemoteSchema::new(url, schema))
}

/// Introspect several services concurrently.
pub async fn introspect_remote_schemas(urls: &[&str]) -> Result<Vec<RemoteSchema>, SchemaError> {
    futures::future::try_join_all(urls.iter().map(|url| introspect_remote_schema(url))).await
}

/// Rebuild a parsed schema from an introspection result.
pub fn schema_from_introspection(
    schema: &IntrospectionSchema,
) -> Result<apollo_compiler::Schema, SchemaError> {
    load_schema(&encode_sdl(schema))
}

fn encode_sdl(schema: &IntrospectionSchema) -> String {
    let mut sdl = String::new();

    let query_name = schema
        .query_type
        .as_ref()
        .and_then(|ty| ty.name.as_deref());
    if let Some(query_name) = query_name {
        let _ = writeln!(sdl, "schema {{");
        let _ = writeln!(sdl, "  query: {query_name}");
        if let Some(name) = schema
            .mutation_type
            .as_ref()
            .and_then(|ty| ty.name.as_deref())
        {
            let _ = writeln!(sdl, "  mutation: {name}");
        }
        if let Some(name) = schema
            .subscription_type
            .as_ref()
            .and_then(|ty| ty.name.as_deref())
        {
            let _ = writeln!(sdl, "  subscription: {name}");
        }
        let _ = writeln!(sdl, "}}");
    }

    for ty in &schema.types {
        let Some(name) = ty.name.as_deref() else {
            continue;
        };
        if name.starts_with("__") || BUILT_IN_SCALARS.contains(&name) {
            continue;
        }

        let _ = writeln!(sdl);
        match ty.kind.as_str() {
            "OBJECT" | "INTERFACE" => {
                let keyword = if ty.kind == "OBJECT" { "type" } else { "interface" };
                let _ = write!(sdl, "{keyword} {name}");
                if let Some(interfaces) = ty.interfaces.as_deref() {
                    let implemented: Vec<String> = interfaces
                        .iter()
                        .filter_map(|interface| interface.name.clone())
                        .collect();
                    if !implemented.is_empty() {
                        let _ = write!(sdl, " implements {}", implemented.join(" & "));
                    }
                }
                let _ = writeln!(sdl, " {{");
                for field in ty.fields.as_deref().unwrap_or_default() {
                    let _ = write!(sdl, "  {}", field.name);
                    write_arguments(&mut sdl, &field.args);
                    let _ = write!(sdl, ": {}", field.ty.to_sdl());
                    write_deprecation(&mut sdl, field.is_deprecated, &field.deprecation_reason);
                    let _ = writeln!(sdl);
                }
                let _ = writeln!(sdl, "}}");
            }
            "UNION" => {
                let members: Vec<String> = ty
                    .possible_types
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|member| member.name.clone())
                    .collect();
                let _ = writeln!(sdl, "union {name} = {}", members.join(" | "));
            }
            "ENUM" => {
                let _ = writeln!(sdl, "enum {name} {{");
                for value in ty.enum_values.as_deref().unwrap_or_default() {
                    let _ = write!(sdl, "  {}", value.name);
                    write_deprecation(&mut sdl, value.is_deprecated, &value.deprecation_reason);
                    let _ = writeln!(sdl);
                }
                let _ = writeln!(sdl, "}}");
            }
            "INPUT_OBJECT" => {
                let _ = writeln!(sdl, "input {name} {{");
                for field in ty.input_fields.as_deref().unwrap_or_default() {
                    let _ = write!(sdl, "  {}: {}", field.name, field.ty.to_sdl());
                    if let Some(default) = &field.default_value {
                        let _ = write!(sdl, " = {default}");
                    }
                    let _ = writeln!(sdl);
                }
                let _ = writeln!(sdl, "}}");
            }
            "SCALAR" => {
                let _ = writeln!(sdl, "scalar {name}");
            }
            _ => {}
        }
    }

    sdl
}

fn write_arguments(sdl: &mut String, args: &[InputValue]) {
    if args.is_empty() {
        return;
    }
    let rendered: Vec<String> = args
        .iter()
        .map(|arg| {
            let mut rendered = format!("{}: {}", arg.name, arg.ty.to_sdl());
            if let Some(default) = &arg.default_value {
                let _ = write!(rendered, " = {default}");
            }
            rendered
        })
        .collect();
    let _ = write!(sdl, "({})", rendered.join(", "));
}

fn write_deprecation(sdl: &mut String, is_deprecated: bool, reason: &Option<String>) {
    if !is_deprecated {
        return;
    }
    match reason {
        Some(reason) => {
            let escaped = reason.replace('"', "\\\"");
            let _ = write!(sdl, " @deprecated(reason: \"{escaped}\")");
        }
        None => {
            let _ = write!(sdl, " @deprecated");
        }
    }
}
