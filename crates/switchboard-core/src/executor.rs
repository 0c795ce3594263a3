//! Executing a query plan and stitching the results into one response.

use crate::error::GatewayError;
use crate::json_ext::{
    insert_value, value_as_id_string, InsertionPoint, Object, PathSegment,
};
use crate::planner::{
    build_query_document, is_root_type, response_key, selected_fields, OperationKind, QueryPlan,
    QueryPlanStep,
};
use crate::queryer::{QueryInput, RequestContext};
use apollo_compiler::ast;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// The capability of resolving a plan against the upstream services.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        plan: &QueryPlan,
        variables: Object,
        ctx: Arc<RequestContext>,
    ) -> Result<Object, GatewayError>;
}

/// Executes a plan by walking the step tree with one concurrent worker per
/// step instance. Workers never touch the accumulator themselves: every
/// result is sent over a channel to the single aggregator loop, which is the
/// only writer, so stitching needs no locks.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParallelExecutor;

/// What a worker hands to the aggregator.
#[derive(Debug)]
struct StepResult {
    insertion_point: InsertionPoint,
    result: Object,
    strip_node: bool,
}

type StepMessage = Result<StepResult, GatewayError>;

#[async_trait]
impl Executor for ParallelExecutor {
    #[tracing::instrument(level = "debug", skip_all)]
    async fn execute(
        &self,
        plan: &QueryPlan,
        variables: Object,
        ctx: Arc<RequestContext>,
    ) -> Result<Object, GatewayError> {
        if plan.root_steps.is_empty() {
            return Err(GatewayError::EmptyPlan);
        }

        let (tx, mut rx) = mpsc::channel::<StepMessage>(10);
        let variables = Arc::new(variables);

        for step in &plan.root_steps {
            spawn_step(
                Arc::clone(step),
                plan.operation,
                step.insertion_point.clone(),
                Arc::clone(&variables),
                Arc::clone(&ctx),
                tx.clone(),
            );
        }
        drop(tx);

        // the aggregator: the only writer of the accumulator. The loop ends
        // once every worker has reported and dropped its sender; returning
        // early on the first error closes the channel, which signals the
        // remaining workers to stop.
        let mut accumulator = Object::new();
        while let Some(message) = rx.recv().await {
            let record = message?;
            tracing::trace!(insertion_point = %record.insertion_point, "stitching result");
            stitch(&mut accumulator, record)?;
        }

        Ok(accumulator)
    }
}

fn spawn_step(
    step: Arc<QueryPlanStep>,
    operation: OperationKind,
    insertion_point: InsertionPoint,
    variables: Arc<Object>,
    ctx: Arc<RequestContext>,
    tx: mpsc::Sender<StepMessage>,
) {
    let task: BoxFuture<'static, ()> = Box::pin(async move {
        if let Err(err) = execute_step(
            step,
            operation,
            insertion_point,
            variables,
            ctx,
            tx.clone(),
        )
        .await
        {
            // a closed channel means the executor already returned
            let _ = tx.send(Err(err)).await;
        }
    });
    tokio::spawn(task);
}

async fn execute_step(
    step: Arc<QueryPlanStep>,
    operation: OperationKind,
    insertion_point: InsertionPoint,
    variables: Arc<Object>,
    ctx: Arc<RequestContext>,
    tx: mpsc::Sender<StepMessage>,
) -> Result<(), GatewayError> {
    tracing::debug!(
        parent_type = %step.parent_type,
        insertion_point = %insertion_point,
        "executing step",
    );

    // the object this step queries is named by the realised insertion point
    let node_id = insertion_point.node_id().map(str::to_string);

    // collect the values for the variables the step depends on
    let mut step_variables = Object::new();
    for name in &step.variables {
        match variables.get(name) {
            Some(value) => {
                step_variables.insert(name.clone(), value.clone());
            }
            None => {
                let required = step
                    .variable_definitions
                    .iter()
                    .find(|definition| definition.name.as_str() == name)
                    .map(|definition| {
                        definition.default_value.is_none()
                            && matches!(
                                definition.ty.as_ref(),
                                ast::Type::NonNullNamed(_) | ast::Type::NonNullList(_)
                            )
                    })
                    .unwrap_or(false);
                if required {
                    return Err(GatewayError::MissingVariable { name: name.clone() });
                }
            }
        }
    }

    // root steps send their cached document as-is; dependent steps re-bind
    // the node id to this parent instance
    let document = if is_root_type(&step.parent_type) {
        match &step.query_document {
            Some(document) => document.clone(),
            None => build_query_document(
                operation,
                &step.parent_type,
                None,
                &step.variable_definitions,
                &step.selection_set,
            )?,
        }
    } else {
        // a variable definition for $id only makes sense while the id is
        // bound as a variable; with the id inlined it would go unused
        let definitions: Vec<_> = step
            .variable_definitions
            .iter()
            .filter(|definition| {
                definition.name.as_str() != "id" || step.variables.contains("id")
            })
            .cloned()
            .collect();
        build_query_document(
            operation,
            &step.parent_type,
            Some(node_id.as_deref().unwrap_or_default()),
            &definitions,
            &step.selection_set,
        )?
    };

    let query = document.serialize().no_indent().to_string();
    tracing::debug!(service = step.queryer.url(), %query, "sending query");

    let input = QueryInput {
        query,
        document: Some(document),
        variables: step_variables,
    };

    // the fetch aborts as soon as the executor stops listening
    let result = tokio::select! {
        result = step.queryer.query(&ctx, input) => result?,
        _ = tx.closed() => return Err(GatewayError::Cancelled),
    };

    // node unwrapping applies exactly when the step queried through the
    // node pattern
    let strip_node = !is_root_type(&step.parent_type);

    // realise the insertion points of every dependent step against this
    // result before handing the result itself to the aggregator
    let mut expansions: Vec<(Arc<QueryPlanStep>, Vec<InsertionPoint>)> = Vec::new();
    for dependent in &step.then {
        let mut starting = insertion_point.clone();
        if matches!(
            starting.last(),
            Some(segment) if segment.index.is_none() && segment.id.is_none()
        ) {
            starting.pop();
        }

        let points = find_insertion_points(
            &dependent.insertion_point,
            &step.selection_set,
            &result,
            vec![starting],
            strip_node,
        )?;
        expansions.push((Arc::clone(dependent), points));
    }

    // publishing before the dependents spawn keeps stitching ordered:
    // a parent is always in the accumulator before anything merges into it
    let _ = tx
        .send(Ok(StepResult {
            insertion_point,
            result,
            strip_node,
        }))
        .await;

    for (dependent, points) in expansions {
        for point in points {
            tracing::debug!(insertion_point = %point, "spawning dependent step");
            spawn_step(
                Arc::clone(&dependent),
                operation,
                point,
                Arc::clone(&variables),
                Arc::clone(&ctx),
                tx.clone(),
            );
        }
    }

    Ok(())
}

/// Stitch one step result into the accumulator.
fn stitch(accumulator: &mut Object, record: StepResult) -> Result<(), GatewayError> {
    let StepResult {
        insertion_point,
        mut result,
        strip_node,
    } = record;

    let value = if strip_node {
        let node = result
            .remove("node")
            .ok_or_else(|| GatewayError::stitch("could not find top level node value"))?;
        let mut node = match node {
            Value::Object(object) => object,
            _ => return Err(GatewayError::stitch("node value was not an object")),
        };
        match insertion_point.last() {
            // a trailing plain segment names the field the result belongs
            // under, so pull that field out of the node
            Some(segment) if segment.index.is_none() && segment.id.is_none() => {
                node.remove(&segment.field).ok_or_else(|| {
                    GatewayError::stitch(format!(
                        "could not find value for '{}' in the node result",
                        segment.field
                    ))
                })?
            }
            // otherwise the insertion point names the parent object itself
            // and the whole node merges into it
            _ => Value::Object(node),
        }
    } else {
        Value::Object(result)
    };

    insert_value(accumulator, &insertion_point, value)
}

/// Realise a dependent step's planned path against the parent's selection
/// set and result.
///
/// Walking the path, every list in the result fans the walk out over its
/// elements, adding a `:index` to the segment; the segment a dependent step
/// will query through picks up the `#id` of the object it refers to. The
/// result is one fully realised insertion point per object the dependent
/// step must resolve.
pub(crate) fn find_insertion_points(
    target: &InsertionPoint,
    selection_set: &[ast::Selection],
    result: &Object,
    starting_points: Vec<InsertionPoint>,
    strip_node: bool,
) -> Result<Vec<InsertionPoint>, GatewayError> {
    let branches = if starting_points.is_empty() {
        vec![InsertionPoint::empty()]
    } else {
        starting_points
    };
    let start_index = branches[0].len();
    walk_insertion_points(
        target.segments(),
        start_index,
        selection_set,
        result,
        branches,
        strip_node,
    )
}

fn walk_insertion_points(
    segments: &[PathSegment],
    index: usize,
    selection_set: &[ast::Selection],
    chunk: &Object,
    branches: Vec<InsertionPoint>,
    strip_node: bool,
) -> Result<Vec<InsertionPoint>, GatewayError> {
    let Some(segment) = segments.get(index) else {
        return Ok(branches);
    };
    let is_terminal = index == segments.len() - 1;
    let binds_node_id = index + 2 == segments.len();

    // the result of a node-wrapped query holds the parent object under
    // `node`; everything below is unwrapped
    let source: &Object = if strip_node {
        chunk
            .get("node")
            .and_then(Value::as_object)
            .ok_or_else(|| GatewayError::stitch("could not find top level node value"))?
    } else {
        chunk
    };

    if is_terminal {
        // the last planned segment: realise it against whatever the parent
        // result holds for it
        return match source.get(&segment.field) {
            // a list of parent objects, one branch per element
            Some(Value::Array(entries)) => {
                let mut points = Vec::new();
                for (position, entry) in entries.iter().enumerate() {
                    let object = entry.as_object().ok_or_else(|| {
                        GatewayError::stitch("entry in result wasn't an object")
                    })?;
                    let id = object.get("id").ok_or_else(|| {
                        GatewayError::stitch("could not find the id for elements in target list")
                    })?;
                    let realized = PathSegment::field(&segment.field)
                        .with_index(position)
                        .with_id(value_as_id_string(id));
                    for branch in &branches {
                        points.push(branch.join(realized.clone()));
                    }
                }
                Ok(points)
            }
            // a single parent object
            Some(Value::Object(object)) => {
                let realized = match object.get("id") {
                    Some(id) => {
                        PathSegment::field(&segment.field).with_id(value_as_id_string(id))
                    }
                    None => PathSegment::field(&segment.field),
                };
                Ok(branches
                    .into_iter()
                    .map(|branch| branch.join(realized.clone()))
                    .collect())
            }
            // the field is not part of this result; the segment stays plain
            // and names where the dependent result will be written
            _ => {
                let realized = PathSegment::field(&segment.field);
                Ok(branches
                    .into_iter()
                    .map(|branch| branch.join(realized.clone()))
                    .collect())
            }
        };
    }

    // there should be a field in the root selection set for this point
    let selection = selected_fields(selection_set)
        .into_iter()
        .find(|field| {
            response_key(field) == segment.field || field.name.as_str() == segment.field
        })
        .ok_or_else(|| {
            GatewayError::stitch(format!("could not find selection for '{}'", segment.field))
        })?;

    let value = source.get(&segment.field).ok_or_else(|| {
        GatewayError::stitch(format!(
            "root value of result chunk could not be found for '{}'",
            segment.field
        ))
    })?;

    match value {
        Value::Array(entries) => {
            let mut points = Vec::new();
            for (position, entry) in entries.iter().enumerate() {
                let object = entry
                    .as_object()
                    .ok_or_else(|| GatewayError::stitch("entry in result wasn't an object"))?;

                let mut realized = PathSegment::field(&segment.field).with_index(position);
                if binds_node_id {
                    let id = object.get("id").ok_or_else(|| {
                        GatewayError::stitch("could not find the id for elements in target list")
                    })?;
                    realized = realized.with_id(value_as_id_string(id));
                }

                let extended: Vec<InsertionPoint> = branches
                    .iter()
                    .map(|branch| branch.join(realized.clone()))
                    .collect();
                points.extend(walk_insertion_points(
                    segments,
                    index + 1,
                    &selection.selection_set,
                    object,
                    extended,
                    false,
                )?);
            }
            Ok(points)
        }
        Value::Object(object) => {
            let mut realized = PathSegment::field(&segment.field);
            if binds_node_id {
                let id = object.get("id").ok_or_else(|| {
                    GatewayError::stitch("could not find the id for the object")
                })?;
                realized = realized.with_id(value_as_id_string(id));
            }

            let extended: Vec<InsertionPoint> = branches
                .into_iter()
                .map(|branch| branch.join(realized.clone()))
                .collect();
            walk_insertion_points(
                segments,
                index + 1,
                &selection.selection_set,
                object,
                extended,
                false,
            )
        }
        // a null parent resolves nothing, so the dependent step has no
        // objects to run against
        Value::Null => Ok(Vec::new()),
        other => Err(GatewayError::stitch(format!(
            "root value of result chunk was not an object or list: {other}"
        ))),
    }
}
