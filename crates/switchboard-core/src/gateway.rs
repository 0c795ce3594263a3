//! The gateway: wiring the merger, planner and executor together.

use crate::error::{GatewayError, SchemaError};
use crate::executor::{Executor, ParallelExecutor};
use crate::field_index::{field_locations, FieldIndex};
use crate::introspection::IntrospectionQueryer;
use crate::json_ext::{merge_object, Object};
use crate::merge::{Merger, SchemaMerger};
use crate::planner::{
    apply_fragments, selected_fields, MinQueriesPlanner, OperationKind, QueryPlanner,
};
use crate::queryer::{
    NetworkQueryer, QueryInput, Queryer, RequestContext, RequestMiddleware, ResponseMiddleware,
    ServiceRouter,
};
use crate::request::Request;
use crate::schema::{
    internal_schema, RemoteSchema, API_VERSION_FIELD, GATEWAY_FIELD_LOCATION,
    INTROSPECTION_LOCATION,
};
use apollo_compiler::ast;
use apollo_compiler::schema::{Component, ExtendedType};
use apollo_compiler::{Name, Schema};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Resolves a gateway-registered field to the id of the node it names.
pub type QueryFieldResolver = Arc<
    dyn Fn(Arc<RequestContext>, Object) -> BoxFuture<'static, Result<String, GatewayError>>
        + Send
        + Sync,
>;

/// A field the gateway itself contributes to the merged `Query` type.
///
/// The resolver returns the id of the object the field names; everything
/// else selected under the field is fetched from the services that own it,
/// through the usual node pattern.
#[derive(Clone)]
pub struct QueryField {
    pub name: String,
    pub ty: ast::Type,
    pub resolver: QueryFieldResolver,
}

impl QueryField {
    pub fn new<F>(name: impl Into<String>, ty: ast::Type, resolver: F) -> Self
    where
        F: Fn(Arc<RequestContext>, Object) -> BoxFuture<'static, Result<String, GatewayError>>
            + Send
            + Sync
            + 'static,
    {
        QueryField {
            name: name.into(),
            ty,
            resolver: Arc::new(resolver),
        }
    }
}

impl std::fmt::Debug for QueryField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryField")
            .field("name", &self.name)
            .field("ty", &self.ty)
            .finish()
    }
}

/// The top level entry for interacting with a gateway. It merges a list of
/// remote schemas into one, plans incoming requests against the merged
/// schema and follows the plan across the services.
pub struct Gateway {
    schema: Arc<Schema>,
    field_index: FieldIndex,
    planner: Arc<dyn QueryPlanner>,
    executor: Arc<dyn Executor>,
    registry: Arc<ServiceRouter>,
    response_middlewares: Vec<Arc<dyn ResponseMiddleware>>,
}

impl Gateway {
    /// A gateway over `sources` with the default planner and executor.
    pub fn new(sources: Vec<RemoteSchema>) -> Result<Self, SchemaError> {
        Gateway::builder().sources(sources).build()
    }

    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::default()
    }

    /// The merged schema the gateway serves.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn field_index(&self) -> &FieldIndex {
        &self.field_index
    }

    /// Plan and execute a request, returning the stitched result.
    #[tracing::instrument(level = "info", skip_all, fields(operation_name = request.operation_name.as_deref()))]
    pub async fn execute(
        &self,
        ctx: Arc<RequestContext>,
        request: &Request,
    ) -> Result<Object, GatewayError> {
        let mut plans = self.planner.plan(
            &request.query,
            &self.schema,
            &self.field_index,
            self.registry.as_ref(),
        )?;

        if let Some(name) = request.operation_name.as_deref() {
            plans.retain(|plan| plan.operation_name.as_deref() == Some(name));
            if plans.is_empty() {
                return Err(GatewayError::InvalidQuery {
                    reason: format!("unknown operation '{name}'"),
                });
            }
        }
        if plans.is_empty() {
            return Err(GatewayError::InvalidQuery {
                reason: "document contains no operations".to_string(),
            });
        }

        let variables = request.variables_or_default();

        // mutations must apply in source order; documents made of queries
        // alone can run their plans concurrently
        let serialize = plans
            .iter()
            .any(|plan| plan.operation == OperationKind::Mutation);

        let mut result = Object::new();
        if serialize {
            for plan in &plans {
                let partial = self
                    .executor
                    .execute(plan, variables.clone(), Arc::clone(&ctx))
                    .await?;
                merge_object(&mut result, partial);
            }
        } else {
            let partials = futures::future::try_join_all(plans.iter().map(|plan| {
                self.executor
                    .execute(plan, variables.clone(), Arc::clone(&ctx))
            }))
            .await?;
            for partial in partials {
                merge_object(&mut result, partial);
            }
        }

        for middleware in &self.response_middlewares {
            middleware.apply(&ctx, &mut result)?;
        }

        Ok(result)
    }
}

/// Configures and assembles a [`Gateway`].
#[derive(Default)]
pub struct GatewayBuilder {
    sources: Vec<RemoteSchema>,
    planner: Option<Arc<dyn QueryPlanner>>,
    executor: Option<Arc<dyn Executor>>,
    merger: Option<Arc<dyn Merger>>,
    request_middlewares: Vec<Arc<dyn RequestMiddleware>>,
    response_middlewares: Vec<Arc<dyn ResponseMiddleware>>,
    query_fields: Vec<QueryField>,
    queryer_overrides: HashMap<String, Arc<dyn Queryer>>,
}

impl GatewayBuilder {
    pub fn source(mut self, source: RemoteSchema) -> Self {
        self.sources.push(source);
        self
    }

    pub fn sources(mut self, sources: Vec<RemoteSchema>) -> Self {
        self.sources.extend(sources);
        self
    }

    pub fn with_planner(mut self, planner: Arc<dyn QueryPlanner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_merger(mut self, merger: Arc<dyn Merger>) -> Self {
        self.merger = Some(merger);
        self
    }

    pub fn with_request_middleware(mut self, middleware: Arc<dyn RequestMiddleware>) -> Self {
        self.request_middlewares.push(middleware);
        self
    }

    pub fn with_response_middleware(mut self, middleware: Arc<dyn ResponseMiddleware>) -> Self {
        self.response_middlewares.push(middleware);
        self
    }

    pub fn with_query_field(mut self, field: QueryField) -> Self {
        self.query_fields.push(field);
        self
    }

    /// Bind a specific queryer to a service location instead of the default
    /// HTTP transport. Used by tests and by callers with custom transports.
    pub fn with_service_queryer(
        mut self,
        location: impl Into<String>,
        queryer: Arc<dyn Queryer>,
    ) -> Self {
        self.queryer_overrides.insert(location.into(), queryer);
        self
    }

    pub fn build(self) -> Result<Gateway, SchemaError> {
        if self.sources.is_empty() {
            return Err(SchemaError::NoSources);
        }

        // the gateway's own schema: the version field plus whatever fields
        // the caller registered
        let mut internal = internal_schema();
        if let Some(ExtendedType::Object(query)) = internal.types.get_mut("Query") {
            let query = query.make_mut();
            for field in &self.query_fields {
                let name = Name::new(&field.name)
                    .map_err(|err| SchemaError::Parse(format!("invalid field name: {err}")))?;
                query.fields.insert(
                    name.clone(),
                    Component::new(ast::FieldDefinition {
                        description: None,
                        name,
                        arguments: Vec::new(),
                        ty: field.ty.clone(),
                        directives: Default::default(),
                    }),
                );
            }
        }
        let internal = RemoteSchema::new(GATEWAY_FIELD_LOCATION, internal);

        // the locations of real fields, plus the gateway's own: the internal
        // introspection service answers the meta fields and the gateway
        // itself answers its registered fields
        let mut field_index = field_locations(&self.sources, true)
            .concat(field_locations(&[internal.clone()], false));
        field_index.register("Query", "__schema", INTROSPECTION_LOCATION);
        field_index.register("Query", "__type", INTROSPECTION_LOCATION);

        let merger = self.merger.unwrap_or_else(|| Arc::new(SchemaMerger));
        let mut schemas: Vec<&Schema> = self.sources.iter().map(|source| &source.schema).collect();
        schemas.push(&internal.schema);
        let schema = Arc::new(merger.merge(&schemas)?);

        let mut registry = ServiceRouter::new();
        for source in &self.sources {
            let queryer = self
                .queryer_overrides
                .get(&source.url)
                .cloned()
                .unwrap_or_else(|| {
                    Arc::new(NetworkQueryer::new(
                        &source.url,
                        self.request_middlewares.clone(),
                    ))
                });
            registry.insert(source.url.clone(), queryer);
        }
        registry.insert(
            INTROSPECTION_LOCATION,
            Arc::new(IntrospectionQueryer::new(Arc::clone(&schema))),
        );
        let mut gateway_fields = self.query_fields;
        gateway_fields.push(api_version_field());
        registry.insert(
            GATEWAY_FIELD_LOCATION,
            Arc::new(GatewayFieldQueryer::new(gateway_fields, Arc::clone(&schema))),
        );

        Ok(Gateway {
            schema,
            field_index,
            planner: self
                .planner
                .unwrap_or_else(|| Arc::new(MinQueriesPlanner)),
            executor: self
                .executor
                .unwrap_or_else(|| Arc::new(ParallelExecutor)),
            registry: Arc::new(registry),
            response_middlewares: self.response_middlewares,
        })
    }
}

fn api_version_field() -> QueryField {
    QueryField::new(
        API_VERSION_FIELD,
        ast::Type::Named(Name::new("String").expect("'String' is a valid name")),
        |_ctx, _args| Box::pin(async { Ok(env!("CARGO_PKG_VERSION").to_string()) }),
    )
}

/// The queryer behind gateway-registered fields: it resolves each selected
/// field with its registered resolver instead of the network.
pub struct GatewayFieldQueryer {
    fields: HashMap<String, QueryField>,
    schema: Arc<Schema>,
}

impl GatewayFieldQueryer {
    pub fn new(fields: Vec<QueryField>, schema: Arc<Schema>) -> Self {
        GatewayFieldQueryer {
            fields: fields
                .into_iter()
                .map(|field| (field.name.clone(), field))
                .collect(),
            schema,
        }
    }

    fn is_composite(&self, ty: &ast::Type) -> bool {
        matches!(
            self.schema.types.get(ty.inner_named_type().as_str()),
            Some(ExtendedType::Object(_))
                | Some(ExtendedType::Interface(_))
                | Some(ExtendedType::Union(_)),
        )
    }
}

#[async_trait::async_trait]
impl Queryer for GatewayFieldQueryer {
    fn url(&self) -> &str {
        GATEWAY_FIELD_LOCATION
    }

    async fn query(
        &self,
        ctx: &RequestContext,
        input: QueryInput,
    ) -> Result<Object, GatewayError> {
        let document = match input.document {
            Some(document) => document,
            None => ast::Document::parse(input.query.clone(), "gateway.graphql").map_err(
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
                reason: "gateway query has no operation".to_string(),
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

        let ctx = Arc::new(ctx.clone());
        let mut result = Object::new();
        for field in selected_fields(&selection_set) {
            let Some(registered) = self.fields.get(field.name.as_str()) else {
                continue;
            };

            let mut arguments = Object::new();
            for argument in &field.arguments {
                arguments.insert(
                    argument.name.to_string(),
                    ast_value_to_json(&argument.value, &input.variables),
                );
            }

            let id = (registered.resolver)(Arc::clone(&ctx), arguments).await?;
            let key = field
                .alias
                .as_ref()
                .unwrap_or(&field.name)
                .to_string();

            // composite fields resolve to the node named by the id; the
            // services that own the type fill in the rest
            if self.is_composite(&registered.ty) {
                let mut stub = Object::new();
                stub.insert("id".to_string(), Value::String(id));
                result.insert(key, Value::Object(stub));
            } else {
                result.insert(key, Value::String(id));
            }
        }

        Ok(result)
    }
}

fn ast_value_to_json(value: &ast::Value, variables: &Object) -> Value {
    match value {
        ast::Value::Null => Value::Null,
        ast::Value::Boolean(boolean) => Value::Bool(*boolean),
        ast::Value::Enum(name) => Value::String(name.to_string()),
        ast::Value::String(string) => Value::String(string.clone()),
        ast::Value::Int(int) => int
            .try_to_i32()
            .ok()
            .map(Value::from)
            .unwrap_or(Value::Null),
        ast::Value::Float(float) => float
            .try_to_f64()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ast::Value::Variable(name) => variables.get(name.as_str()).cloned().unwrap_or(Value::Null),
        ast::Value::List(values) => Value::Array(
            values
                .iter()
                .map(|value| ast_value_to_json(value, variables))
                .collect(),
        ),
        ast::Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(name, value)| (name.to_string(), ast_value_to_json(value, variables)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queryer::MockQueryer;
    use serde_json::json;

    fn object(value: Value) -> Object {
        value.as_object().cloned().unwrap()
    }

    fn ctx() -> Arc<RequestContext> {
        Arc::new(RequestContext::default())
    }

    #[tokio::test]
    async fn single_service_single_field() {
        let source = RemoteSchema::parse("u1", "type Query { foo: Boolean }").unwrap();

        let gateway = Gateway::builder()
            .source(source)
            .with_service_queryer("u1", Arc::new(MockQueryer::new(object(json!({"foo": true})))))
            .build()
            .unwrap();

        let result = gateway
            .execute(ctx(), &Request::builder().query("{ foo }").build())
            .await
            .unwrap();
        assert_eq!(Value::Object(result), json!({"foo": true}));
    }

    #[tokio::test]
    async fn cross_service_stitching() {
        let users = RemoteSchema::parse(
            "u1",
            r#"
            type User { firstName: String! }
            type Query { allUsers: [User!]! }
            "#,
        )
        .unwrap();
        let cats = RemoteSchema::parse(
            "u2",
            r#"
            type CatPhoto { URL: String! }
            type User { catPhotos: [CatPhoto!]! }
            type Query { _catService: Boolean }
            "#,
        )
        .unwrap();

        let gateway = Gateway::builder()
            .sources(vec![users, cats])
            .with_service_queryer(
                "u1",
                Arc::new(MockQueryer::new(object(json!({
                    "allUsers": [
                        {"firstName": "Alice", "id": "u-1"},
                        {"firstName": "Bob", "id": "u-2"},
                    ],
                })))),
            )
            .with_service_queryer(
                "u2",
                Arc::new(MockQueryer::new(object(json!({
                    "node": {"catPhotos": [{"URL": "http://cats/1"}]},
                })))),
            )
            .build()
            .unwrap();

        let result = gateway
            .execute(
                ctx(),
                &Request::builder()
                    .query("{ allUsers { firstName catPhotos { URL } } }")
                    .build(),
            )
            .await
            .unwrap();

        assert_eq!(
            Value::Object(result),
            json!({
                "allUsers": [
                    {
                        "firstName": "Alice",
                        "id": "u-1",
                        "catPhotos": [{"URL": "http://cats/1"}],
                    },
                    {
                        "firstName": "Bob",
                        "id": "u-2",
                        "catPhotos": [{"URL": "http://cats/1"}],
                    },
                ],
            }),
        );
    }

    #[tokio::test]
    async fn nested_lists_stitch_through_node_lookups() {
        // the dependent step hangs two list levels deep, so realisation
        // needs ids on both the friends and the users entries
        let users = RemoteSchema::parse(
            "u1",
            r#"
            type User {
                firstName: String!
                friends: [User!]!
            }
            type Query { users: [User!]! }
            "#,
        )
        .unwrap();
        let photos = RemoteSchema::parse(
            "u2",
            r#"
            type Photo { url: String! }
            type User { photoGallery: [Photo!]! }
            type Query { _photoService: Boolean }
            "#,
        )
        .unwrap();

        let gateway = Gateway::builder()
            .sources(vec![users, photos])
            .with_service_queryer(
                "u1",
                Arc::new(MockQueryer::new(object(json!({
                    "users": [
                        {
                            "firstName": "Alice",
                            "id": "u-1",
                            "friends": [
                                {"firstName": "Fred", "id": "f-1"},
                                {"firstName": "Frida", "id": "f-2"},
                            ],
                        },
                        {
                            "firstName": "Bob",
                            "id": "u-2",
                            "friends": [
                                {"firstName": "Fay", "id": "f-3"},
                            ],
                        },
                    ],
                })))),
            )
            .with_service_queryer(
                "u2",
                Arc::new(MockQueryer::new(object(json!({
                    "node": {"photoGallery": [{"url": "http://photos/1"}]},
                })))),
            )
            .build()
            .unwrap();

        let result = gateway
            .execute(
                ctx(),
                &Request::builder()
                    .query(
                        "{ users { firstName friends { firstName photoGallery { url } } } }",
                    )
                    .build(),
            )
            .await
            .unwrap();

        let gallery = json!([{"url": "http://photos/1"}]);
        assert_eq!(
            Value::Object(result),
            json!({
                "users": [
                    {
                        "firstName": "Alice",
                        "id": "u-1",
                        "friends": [
                            {"firstName": "Fred", "id": "f-1", "photoGallery": gallery.clone()},
                            {"firstName": "Frida", "id": "f-2", "photoGallery": gallery.clone()},
                        ],
                    },
                    {
                        "firstName": "Bob",
                        "id": "u-2",
                        "friends": [
                            {"firstName": "Fay", "id": "f-3", "photoGallery": gallery},
                        ],
                    },
                ],
            }),
        );
    }

    #[tokio::test]
    async fn introspection_routes_to_the_internal_service() {
        let source = RemoteSchema::parse("u1", "type Query { foo: Boolean }").unwrap();

        let gateway = Gateway::builder()
            .source(source)
            .with_service_queryer("u1", Arc::new(MockQueryer::new(Object::new())))
            .build()
            .unwrap();

        let result = gateway
            .execute(
                ctx(),
                &Request::builder()
                    .query("{ __schema { queryType { name } } }")
                    .build(),
            )
            .await
            .unwrap();
        assert_eq!(
            Value::Object(result),
            json!({"__schema": {"queryType": {"name": "Query"}}}),
        );
    }

    #[tokio::test]
    async fn api_version_resolves_in_process() {
        let source = RemoteSchema::parse("u1", "type Query { foo: Boolean }").unwrap();

        let gateway = Gateway::builder()
            .source(source)
            .with_service_queryer("u1", Arc::new(MockQueryer::new(Object::new())))
            .build()
            .unwrap();

        let result = gateway
            .execute(ctx(), &Request::builder().query("{ _apiVersion }").build())
            .await
            .unwrap();
        assert_eq!(
            Value::Object(result),
            json!({"_apiVersion": env!("CARGO_PKG_VERSION")}),
        );
    }

    #[tokio::test]
    async fn gateway_query_fields_resolve_with_their_resolver() {
        let source = RemoteSchema::parse(
            "u1",
            r#"
            type User { id: ID! }
            type Query { allUsers: [User!]! }
            "#,
        )
        .unwrap();

        let gateway = Gateway::builder()
            .source(source)
            .with_service_queryer("u1", Arc::new(MockQueryer::new(Object::new())))
            .with_query_field(QueryField::new(
                "a",
                ast::Type::Named(Name::new("User").unwrap()),
                |_ctx, _args| Box::pin(async { Ok("a".to_string()) }),
            ))
            .build()
            .unwrap();

        let result = gateway
            .execute(ctx(), &Request::builder().query("{ a { id } }").build())
            .await
            .unwrap();
        assert_eq!(Value::Object(result), json!({"a": {"id": "a"}}));
    }

    #[tokio::test]
    async fn mutations_apply_in_source_order() {
        use std::sync::Mutex;

        struct RecordingQueryer {
            name: &'static str,
            log: Arc<Mutex<Vec<&'static str>>>,
        }

        #[async_trait::async_trait]
        impl Queryer for RecordingQueryer {
            fn url(&self) -> &str {
                "recording"
            }

            async fn query(
                &self,
                _ctx: &RequestContext,
                _input: QueryInput,
            ) -> Result<Object, GatewayError> {
                // yield so an out-of-order sibling would be able to overtake
                tokio::task::yield_now().await;
                self.log.lock().unwrap().push(self.name);
                Ok(Object::new())
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let first = RemoteSchema::parse(
            "m1",
            r#"
            type Query { unused: Boolean }
            type Mutation { bump: Boolean }
            "#,
        )
        .unwrap();
        let second = RemoteSchema::parse(
            "m2",
            r#"
            type Mutation { reset: Boolean }
            "#,
        )
        .unwrap();

        let gateway = Gateway::builder()
            .sources(vec![first, second])
            .with_service_queryer(
                "m1",
                Arc::new(RecordingQueryer {
                    name: "bump",
                    log: Arc::clone(&log),
                }),
            )
            .with_service_queryer(
                "m2",
                Arc::new(RecordingQueryer {
                    name: "reset",
                    log: Arc::clone(&log),
                }),
            )
            .build()
            .unwrap();

        gateway
            .execute(
                ctx(),
                &Request::builder()
                    .query(
                        r#"
                        mutation First { bump }
                        mutation Second { reset }
                        "#,
                    )
                    .build(),
            )
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["bump", "reset"]);
    }

    #[tokio::test]
    async fn operation_name_selects_the_plan() {
        let source = RemoteSchema::parse("u1", "type Query { foo: Boolean bar: Boolean }").unwrap();

        let gateway = Gateway::builder()
            .source(source)
            .with_service_queryer(
                "u1",
                Arc::new(MockQueryer::new(object(json!({"foo": true, "bar": false})))),
            )
            .build()
            .unwrap();

        let request = Request::builder()
            .query("query A { foo } query B { bar }")
            .operation_name(Some("B".to_string()))
            .build();
        let result = gateway.execute(ctx(), &request).await.unwrap();
        // the mock echoes both keys; what matters is that planning selected
        // operation B without erroring on the multi-operation document
        assert!(result.contains_key("bar"));

        let request = Request::builder()
            .query("query A { foo }")
            .operation_name(Some("Missing".to_string()))
            .build();
        let err = gateway.execute(ctx(), &request).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidQuery { .. }));
    }

    #[tokio::test]
    async fn response_middlewares_see_the_final_result() {
        let source = RemoteSchema::parse("u1", "type Query { foo: Boolean }").unwrap();

        let gateway = Gateway::builder()
            .source(source)
            .with_service_queryer("u1", Arc::new(MockQueryer::new(object(json!({"foo": true})))))
            .with_response_middleware(Arc::new(
                |_ctx: &RequestContext, result: &mut Object| -> Result<(), GatewayError> {
                    result.insert("observed".to_string(), Value::Bool(true));
                    Ok(())
                },
            ))
            .build()
            .unwrap();

        let result = gateway
            .execute(ctx(), &Request::builder().query("{ foo }").build())
            .await
            .unwrap();
        assert_eq!(result.get("observed"), Some(&Value::Bool(true)));
    }

    #[test]
    fn gateway_requires_at_least_one_source() {
        assert!(matches!(
            Gateway::builder().build(),
            Err(SchemaError::NoSources),
        ));
    }
}
