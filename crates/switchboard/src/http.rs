//! The `/graphql` endpoint.
//!
//! `POST` accepts a single `{query, variables?, operationName?}` body or a
//! JSON array of them (batched; the response array preserves input order).
//! `GET` accepts the same fields as query parameters, and serves the
//! playground to browsers that ask for HTML instead.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::header::ACCEPT;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response as AxumResponse};
use axum::routing::get;
use axum::Router;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use switchboard_core::{Error, Gateway, GatewayError, Request, RequestContext, Response};

static PLAYGROUND: &str = include_str!("playground.html");

/// The router serving the gateway.
pub fn app(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/graphql", get(handle_get).post(handle_post))
        .with_state(gateway)
}

async fn handle_post(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    body: Bytes,
) -> AxumResponse {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            return malformed(format!("encountered error parsing body: {err}"));
        }
    };
    let ctx = Arc::new(RequestContext::new(headers));

    match payload {
        // a batch executes every entry and answers in input order
        Value::Array(entries) => {
            let mut responses = Vec::with_capacity(entries.len());
            for entry in entries {
                let response = match serde_json::from_value::<Request>(entry) {
                    Ok(request) => run_request(&gateway, Arc::clone(&ctx), &request).await.1,
                    Err(err) => Response::from_error(
                        Error::builder()
                            .message(format!("encountered error parsing body: {err}"))
                            .build(),
                    ),
                };
                responses.push(response);
            }
            encode(StatusCode::OK, &Value::Array(
                responses
                    .into_iter()
                    .map(|response| serde_json::to_value(response).unwrap_or(Value::Null))
                    .collect(),
            ))
        }
        entry => match serde_json::from_value::<Request>(entry) {
            Ok(request) => {
                let (status, response) = run_request(&gateway, ctx, &request).await;
                respond(status, &response)
            }
            Err(err) => malformed(format!("encountered error parsing body: {err}")),
        },
    }
}

async fn handle_get(
    State(gateway): State<Arc<Gateway>>,
    Query(parameters): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> AxumResponse {
    let Some(query) = parameters.get("query") else {
        // browsers looking at the endpoint get the playground
        if prefers_html(&headers) {
            return Html(PLAYGROUND).into_response();
        }
        return malformed("must include query as parameter".to_string());
    };

    let variables = match parameters.get("variables") {
        None => None,
        Some(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(variables)) => Some(variables),
            _ => {
                return malformed("variables must be a json object".to_string());
            }
        },
    };

    let request = Request::builder()
        .query(query.clone())
        .operation_name(parameters.get("operationName").cloned())
        .variables(variables)
        .build();

    let ctx = Arc::new(RequestContext::new(headers));
    let (status, response) = run_request(&gateway, ctx, &request).await;
    respond(status, &response)
}

/// Execute one request and decide the HTTP status that goes with the result.
async fn run_request(
    gateway: &Gateway,
    ctx: Arc<RequestContext>,
    request: &Request,
) -> (StatusCode, Response) {
    if request.query.is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Response::from_error(
                Error::builder()
                    .message("Could not find a query in request payload.")
                    .build(),
            ),
        );
    }

    match gateway.execute(ctx, request).await {
        Ok(data) => (StatusCode::OK, Response::from_data(data)),
        Err(err) => (status_for(&err), Response::from_error(err.to_graphql_error(None))),
    }
}

/// Malformed requests are the client's fault; resolution failures stay
/// in-band with a successful status.
fn status_for(err: &GatewayError) -> StatusCode {
    if err.is_client_error() {
        StatusCode::UNPROCESSABLE_ENTITY
    } else {
        StatusCode::OK
    }
}

fn malformed(message: String) -> AxumResponse {
    respond(
        StatusCode::UNPROCESSABLE_ENTITY,
        &Response::from_error(Error::builder().message(message).build()),
    )
}

fn respond(status: StatusCode, response: &Response) -> AxumResponse {
    match serde_json::to_value(response) {
        Ok(value) => encode(status, &value),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Encountered error marshaling response: {err}"),
        )
            .into_response(),
    }
}

fn encode(status: StatusCode, value: &Value) -> AxumResponse {
    match serde_json::to_vec(value) {
        Ok(bytes) => (
            status,
            [(http::header::CONTENT_TYPE, "application/json")],
            bytes,
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Encountered error marshaling response: {err}"),
        )
            .into_response(),
    }
}

fn prefers_html(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT)
        .and_then(|accept| accept.to_str().ok())
        .map(|accept| accept.contains("text/html"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use apollo_compiler::ast;
    use apollo_compiler::Name;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use serde_json::json;
    use switchboard_core::{MockQueryer, Object, QueryField, QueryInput, Queryer, RemoteSchema};
    use tower::ServiceExt;

    fn object(value: Value) -> Object {
        value.as_object().cloned().unwrap_or_default()
    }

    fn simple_gateway() -> Arc<Gateway> {
        let source = RemoteSchema::parse(
            "url1",
            r#"
            type Query { allUsers: [String!]! }
            "#,
        )
        .unwrap();

        Arc::new(
            Gateway::builder()
                .source(source)
                .with_service_queryer(
                    "url1",
                    Arc::new(MockQueryer::at(
                        "url1",
                        object(json!({"allUsers": ["Alice", "Bob"]})),
                    )),
                )
                .build()
                .unwrap(),
        )
    }

    async fn send(app: Router, request: http::Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn post(body: &str) -> http::Request<Body> {
        http::Request::builder()
            .method("POST")
            .uri("/graphql")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> http::Request<Body> {
        http::Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn post_missing_query_is_unprocessable() {
        let app = app(simple_gateway());
        let (status, _) = send(app, post(r#"{"query": ""}"#)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn post_invalid_json_is_unprocessable() {
        let app = app(simple_gateway());
        let (status, _) = send(app, post("{")).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn get_missing_query_is_unprocessable() {
        let app = app(simple_gateway());
        let (status, _) = send(app, get("/graphql")).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn get_non_object_variables_fails() {
        let app = app(simple_gateway());
        let (status, _) = send(
            app,
            get("/graphql?query=%7BallUsers%7D&variables=true"),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn get_object_variables_succeeds() {
        let app = app(simple_gateway());
        let (status, body) = send(
            app,
            get("/graphql?query=%7BallUsers%7D&variables=%7B%22foo%22%3A2%7D"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["allUsers"], json!(["Alice", "Bob"]));
    }

    #[tokio::test]
    async fn get_with_operation_name_succeeds() {
        let app = app(simple_gateway());
        let (status, _) = send(
            app,
            get("/graphql?query=query%20Hello%20%7BallUsers%7D&operationName=Hello"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_fields_are_unprocessable() {
        let app = app(simple_gateway());
        let (status, body) = send(app, post(r#"{"query": "{ missing }"}"#)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["errors"][0]["message"]
            .as_str()
            .unwrap()
            .contains("Query.missing"));
    }

    #[tokio::test]
    async fn upstream_failures_stay_in_band() {
        struct FailingQueryer;

        #[async_trait::async_trait]
        impl Queryer for FailingQueryer {
            fn url(&self) -> &str {
                "url1"
            }

            async fn query(
                &self,
                _ctx: &RequestContext,
                _input: QueryInput,
            ) -> Result<Object, GatewayError> {
                Err(GatewayError::UpstreamHttp {
                    service: "url1".to_string(),
                    reason: "connection refused".to_string(),
                })
            }
        }

        let source = RemoteSchema::parse("url1", "type Query { allUsers: [String!]! }").unwrap();
        let gateway = Arc::new(
            Gateway::builder()
                .source(source)
                .with_service_queryer("url1", Arc::new(FailingQueryer))
                .build()
                .unwrap(),
        );

        let (status, body) = send(app(gateway), post(r#"{"query": "{ allUsers }"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], Value::Null);
        assert!(!body["errors"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn batched_requests_answer_in_order() {
        let source = RemoteSchema::parse(
            "url1",
            r#"
            type User { id: ID! }
            type Query { allUsers: [User!]! }
            "#,
        )
        .unwrap();

        let gateway = Arc::new(
            Gateway::builder()
                .source(source)
                .with_service_queryer("url1", Arc::new(MockQueryer::at("url1", Object::new())))
                .with_query_field(QueryField::new(
                    "a",
                    ast::Type::Named(Name::new("User").unwrap()),
                    |_ctx, _args| Box::pin(async { Ok("a".to_string()) }),
                ))
                .with_query_field(QueryField::new(
                    "b",
                    ast::Type::Named(Name::new("User").unwrap()),
                    |_ctx, _args| Box::pin(async { Ok("b".to_string()) }),
                ))
                .build()
                .unwrap(),
        );

        let (status, body) = send(
            app(gateway),
            post(r#"[{"query": "{ a { id } }"}, {"query": "{ b { id } }"}]"#),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!([
                {"data": {"a": {"id": "a"}}},
                {"data": {"b": {"id": "b"}}},
            ]),
        );
    }

    #[tokio::test]
    async fn planner_failures_map_to_unprocessable() {
        use switchboard_core::MockErrPlanner;

        let source = RemoteSchema::parse("url1", "type Query { allUsers: [String!]! }").unwrap();
        let gateway = Arc::new(
            Gateway::builder()
                .source(source)
                .with_planner(Arc::new(MockErrPlanner(GatewayError::InvalidQuery {
                    reason: "planning error".to_string(),
                })))
                .with_service_queryer("url1", Arc::new(MockQueryer::at("url1", Object::new())))
                .build()
                .unwrap(),
        );

        let (status, body) = send(app(gateway), post(r#"{"query": "{ allUsers }"}"#)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["errors"][0]["message"]
            .as_str()
            .unwrap()
            .contains("planning error"));
    }

    #[tokio::test]
    async fn browsers_get_the_playground() {
        let app = app(simple_gateway());
        let response = app
            .oneshot(
                http::Request::builder()
                    .method("GET")
                    .uri("/graphql")
                    .header("accept", "text/html")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let page = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(page.contains("<!DOCTYPE html>"));
    }

    #[tokio::test]
    async fn introspection_serves_the_merged_schema() {
        let app = app(simple_gateway());
        let (status, body) = send(
            app,
            post(r#"{"query": "{ __schema { queryType { name } } }"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["__schema"]["queryType"]["name"], json!("Query"));
    }
}
