//! The queryer capability: issuing one GraphQL request to one endpoint.

use crate::error::GatewayError;
use crate::json_ext::Object;
use crate::request::Request;
use crate::response::Response;
use apollo_compiler::ast;
use async_trait::async_trait;
use derivative::Derivative;
use http::HeaderMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything a queryer needs to execute one sub-query.
#[derive(Debug, Clone)]
pub struct QueryInput {
    /// The serialized query.
    pub query: String,

    /// The parsed form of the same query. In-process queryers walk this
    /// instead of re-parsing the string.
    pub document: Option<ast::Document>,

    /// The variable values referenced by the query.
    pub variables: Object,
}

impl QueryInput {
    pub fn new(query: impl Into<String>) -> Self {
        QueryInput {
            query: query.into(),
            document: None,
            variables: Object::new(),
        }
    }

    pub fn with_document(mut self, document: ast::Document) -> Self {
        self.document = Some(document);
        self
    }

    pub fn with_variables(mut self, variables: Object) -> Self {
        self.variables = variables;
        self
    }
}

/// Per-request state threaded from the client request into every upstream
/// call, so middlewares can forward identity such as auth headers.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Headers of the originating client request.
    pub headers: HeaderMap,
}

impl RequestContext {
    pub fn new(headers: HeaderMap) -> Self {
        RequestContext { headers }
    }
}

/// Mutates an outbound upstream request before it is sent. Middlewares are
/// applied in registration order.
pub trait RequestMiddleware: Send + Sync {
    fn apply(
        &self,
        ctx: &RequestContext,
        request: &mut reqwest::Request,
    ) -> Result<(), GatewayError>;
}

impl<F> RequestMiddleware for F
where
    F: Fn(&RequestContext, &mut reqwest::Request) -> Result<(), GatewayError> + Send + Sync,
{
    fn apply(
        &self,
        ctx: &RequestContext,
        request: &mut reqwest::Request,
    ) -> Result<(), GatewayError> {
        self(ctx, request)
    }
}

/// Observes (and may mutate) the final stitched result before it is returned
/// to the client.
pub trait ResponseMiddleware: Send + Sync {
    fn apply(&self, ctx: &RequestContext, result: &mut Object) -> Result<(), GatewayError>;
}

impl<F> ResponseMiddleware for F
where
    F: Fn(&RequestContext, &mut Object) -> Result<(), GatewayError> + Send + Sync,
{
    fn apply(&self, ctx: &RequestContext, result: &mut Object) -> Result<(), GatewayError> {
        self(ctx, result)
    }
}

/// The capability of resolving a single GraphQL request against one endpoint,
/// real or synthetic.
#[async_trait]
pub trait Queryer: Send + Sync {
    /// The location this queryer answers for.
    fn url(&self) -> &str;

    /// Execute the query and return the value of the response's `data` key.
    async fn query(
        &self,
        ctx: &RequestContext,
        input: QueryInput,
    ) -> Result<Object, GatewayError>;
}

/// Resolves plan-step locations to the queryer bound to them.
pub trait ServiceRegistry: Send + Sync {
    fn get(&self, location: &str) -> Option<Arc<dyn Queryer>>;

    fn has(&self, location: &str) -> bool {
        self.get(location).is_some()
    }
}

/// The registry the gateway assembles at construction time: one network
/// queryer per source service plus the in-process ones.
#[derive(Default)]
pub struct ServiceRouter {
    services: HashMap<String, Arc<dyn Queryer>>,
}

impl ServiceRouter {
    pub fn new() -> Self {
        ServiceRouter::default()
    }

    pub fn insert(&mut self, location: impl Into<String>, queryer: Arc<dyn Queryer>) {
        self.services.insert(location.into(), queryer);
    }
}

impl ServiceRegistry for ServiceRouter {
    fn get(&self, location: &str) -> Option<Arc<dyn Queryer>> {
        self.services.get(location).cloned()
    }
}

/// A queryer that sends the request over HTTP as a standard
/// `{query, variables}` POST body.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct NetworkQueryer {
    url: String,
    #[derivative(Debug = "ignore")]
    client: reqwest::Client,
    #[derivative(Debug = "ignore")]
    middlewares: Vec<Arc<dyn RequestMiddleware>>,
}

impl NetworkQueryer {
    pub fn new(url: impl Into<String>, middlewares: Vec<Arc<dyn RequestMiddleware>>) -> Self {
        NetworkQueryer {
            url: url.into(),
            client: reqwest::Client::new(),
            middlewares,
        }
    }
}

#[async_trait]
impl Queryer for NetworkQueryer {
    fn url(&self) -> &str {
        &self.url
    }

    async fn query(
        &self,
        ctx: &RequestContext,
        input: QueryInput,
    ) -> Result<Object, GatewayError> {
        let body = Request::builder()
            .query(input.query)
            .variables(Some(input.variables))
            .build();

        let mut request = self
            .client
            .post(&self.url)
            .json(&body)
            .build()
            .map_err(|err| GatewayError::UpstreamHttp {
                service: self.url.clone(),
                reason: err.to_string(),
            })?;

        for middleware in &self.middlewares {
            middleware.apply(ctx, &mut request)?;
        }

        let response = self
            .client
            .execute(request)
            .await
            .map_err(|err| {
                tracing::error!(fetch_error = %err, service = %self.url);
                GatewayError::UpstreamHttp {
                    service: self.url.clone(),
                    reason: err.to_string(),
                }
            })?
            .json::<Response>()
            .await
            .map_err(|err| GatewayError::UpstreamHttp {
                service: self.url.clone(),
                reason: format!("malformed response: {err}"),
            })?;

        if !response.errors.is_empty() {
            return Err(GatewayError::UpstreamErrors {
                service: self.url.clone(),
                messages: response
                    .errors
                    .into_iter()
                    .map(|error| error.message)
                    .collect(),
            });
        }

        match response.data {
            Some(serde_json::Value::Object(data)) => Ok(data),
            _ => Err(GatewayError::UpstreamHttp {
                service: self.url.clone(),
                reason: "response did not carry an object under 'data'".to_string(),
            }),
        }
    }
}

/// A queryer that answers every query with a fixed value. Test-only in
/// spirit, but exported so integration tests and examples can stub services
/// out.
#[derive(Debug, Clone)]
pub struct MockQueryer {
    url: String,
    value: Object,
}

impl MockQueryer {
    pub fn new(value: Object) -> Self {
        MockQueryer {
            url: "mock".to_string(),
            value,
        }
    }

    pub fn at(url: impl Into<String>, value: Object) -> Self {
        MockQueryer {
            url: url.into(),
            value,
        }
    }
}

#[async_trait]
impl Queryer for MockQueryer {
    fn url(&self) -> &str {
        &self.url
    }

    async fn query(
        &self,
        _ctx: &RequestContext,
        _input: QueryInput,
    ) -> Result<Object, GatewayError> {
        Ok(self.value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn mock_queryer_returns_fixed_value() {
        let queryer = MockQueryer::new(
            json!({"values": ["hello", "world"]})
                .as_object()
                .cloned()
                .unwrap(),
        );
        let result = queryer
            .query(&RequestContext::default(), QueryInput::new("{ values }"))
            .await
            .unwrap();
        assert_eq!(result["values"], json!(["hello", "world"]));
    }

    #[test]
    fn service_router_resolves_locations() {
        let mut router = ServiceRouter::new();
        router.insert("url1", Arc::new(MockQueryer::new(Object::new())));

        assert!(router.has("url1"));
        assert!(!router.has("url2"));
        assert_eq!(router.get("url1").unwrap().url(), "mock");
    }
}
