//! Core engine for the switchboard GraphQL federation gateway.
//!
//! The gateway fronts a set of downstream GraphQL services and presents them
//! as a single schema. The pieces in this crate are assembled by
//! [`Gateway`]:
//!
//! * [`merge_schemas`] unions the source schemas (plus the gateway's own
//!   internal schema) into one, and [`field_locations`] records which service
//!   can resolve every `Type.field` pair.
//! * [`MinQueriesPlanner`] compiles an incoming query into a [`QueryPlan`]:
//!   a tree of steps, each bound to a single service, annotated with the
//!   insertion point where its result belongs.
//! * [`ParallelExecutor`] walks that tree concurrently, fans sub-queries out
//!   through [`Queryer`] implementations and stitches the responses back
//!   into one result object.

mod error;
mod executor;
mod field_index;
mod gateway;
mod introspection;
mod json_ext;
mod merge;
mod planner;
mod queryer;
mod remote;
mod request;
mod response;
mod schema;

pub use error::*;
pub use executor::*;
pub use field_index::*;
pub use gateway::*;
pub use introspection::*;
pub use json_ext::*;
pub use merge::*;
pub use planner::*;
pub use queryer::*;
pub use remote::*;
pub use request::*;
pub use response::*;
pub use schema::*;
