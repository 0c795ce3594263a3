//! Gateway errors.

use crate::json_ext::InsertionPoint;
use crate::response::Error;
use serde_json::json;
use thiserror::Error as ThisError;

/// Construction-time schema errors.
///
/// These abort gateway startup; they are never surfaced to clients.
#[derive(Debug, ThisError)]
pub enum SchemaError {
    /// The SDL of a source schema did not parse.
    #[error("could not parse schema: {0}")]
    Parse(String),

    /// Two source schemas disagree in a way that cannot be merged.
    #[error("schema conflict: {reason}")]
    Conflict { reason: String },

    /// A gateway must wrap at least one source schema.
    #[error("a gateway must have at least one schema")]
    NoSources,

    /// Fetching a remote schema over the wire failed.
    #[error("could not introspect '{url}': {reason}")]
    Introspection { url: String, reason: String },
}

/// Error types for planning and execution.
///
/// These are converted to JSON for the `errors` entry of a response with
/// [`GatewayError::to_graphql_error`]; the HTTP layer decides which of them
/// are malformed-request errors and which surface in-band.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum GatewayError {
    /// The client query did not parse.
    #[error("could not parse query: {reason}")]
    InvalidQuery {
        /// The parser diagnostics, joined.
        reason: String,
    },

    /// A requested field is not resolvable by any known service.
    #[error("could not find location for {parent_type}.{field}")]
    UnknownField {
        parent_type: String,
        field: String,
    },

    /// A plan step referenced a service the gateway does not know about.
    #[error("could not find queryer for service '{service}'")]
    UnknownService { service: String },

    /// A non-null variable without a default was not provided.
    #[error("missing value for required variable '{name}'")]
    MissingVariable { name: String },

    /// The executor was handed a plan with no root steps.
    #[error("was given empty plan")]
    EmptyPlan,

    /// The HTTP round trip to a service failed.
    #[error("fetch from '{service}' failed: {reason}")]
    UpstreamHttp { service: String, reason: String },

    /// A service answered with in-band GraphQL errors.
    #[error("service '{service}' returned errors: {}", messages.join(", "))]
    UpstreamErrors {
        service: String,
        messages: Vec<String>,
    },

    /// The shape of an upstream result did not line up with its insertion
    /// point.
    #[error("could not stitch result: {reason}")]
    Stitch { reason: String },

    /// The caller went away before the plan finished.
    #[error("execution was cancelled")]
    Cancelled,
}

impl GatewayError {
    pub(crate) fn stitch(reason: impl Into<String>) -> Self {
        GatewayError::Stitch {
            reason: reason.into(),
        }
    }

    /// The machine-readable code attached to the error extensions.
    pub fn extension_code(&self) -> &'static str {
        match self {
            GatewayError::InvalidQuery { .. } => "GRAPHQL_PARSE_FAILED",
            GatewayError::UnknownField { .. } => "UNKNOWN_FIELD",
            GatewayError::UnknownService { .. } => "UNKNOWN_SERVICE",
            GatewayError::MissingVariable { .. } => "MISSING_VARIABLE",
            GatewayError::EmptyPlan => "EMPTY_PLAN",
            GatewayError::UpstreamHttp { .. } => "UPSTREAM_HTTP_ERROR",
            GatewayError::UpstreamErrors { .. } => "UPSTREAM_ERROR",
            GatewayError::Stitch { .. } => "STITCH_ERROR",
            GatewayError::Cancelled => "CANCELLED",
        }
    }

    /// True for errors caused by a malformed request rather than a failure
    /// while resolving it.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            GatewayError::InvalidQuery { .. }
                | GatewayError::UnknownField { .. }
                | GatewayError::MissingVariable { .. }
        )
    }

    /// Convert the error to a GraphQL error entry.
    pub fn to_graphql_error(&self, path: Option<&InsertionPoint>) -> Error {
        Error::builder()
            .message(self.to_string())
            .path(path.map(|p| json!(p.to_string())))
            .extensions(
                json!({ "code": self.extension_code() })
                    .as_object()
                    .cloned()
                    .unwrap_or_default(),
            )
            .build()
    }
}
