//! Compiling client queries into query plans.

use crate::error::GatewayError;
use crate::field_index::FieldIndex;
use crate::json_ext::{InsertionPoint, PathSegment};
use crate::queryer::{Queryer, ServiceRegistry};
use apollo_compiler::ast;
use apollo_compiler::{Name, Node, Schema};
use derivative::Derivative;
use std::collections::BTreeSet;
use std::sync::Arc;

/// The kind of operation a plan executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Query,
    Mutation,
}

impl OperationKind {
    /// The conventional name of the root type this operation starts at.
    pub fn root_type_name(&self) -> &'static str {
        match self {
            OperationKind::Query => "Query",
            OperationKind::Mutation => "Mutation",
        }
    }
}

/// Whether `parent_type` is one of the root operation types. Steps whose
/// parent is not a root type are sent wrapped in the node pattern.
pub(crate) fn is_root_type(parent_type: &str) -> bool {
    parent_type == "Query" || parent_type == "Mutation"
}

/// A unit of upstream work: one query, one service, one place to put the
/// result.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct QueryPlanStep {
    /// The type whose instances this step resolves fields for. `Query` or
    /// `Mutation` at the root, an object or interface type otherwise.
    pub parent_type: String,

    /// The sub-query sent to the service for each parent instance.
    pub selection_set: Vec<ast::Selection>,

    /// Where in the accumulated result this step's output belongs: the path
    /// from the plan root to the field the selection hangs off of. Empty for
    /// root steps; list indices are realised at execution time.
    pub insertion_point: InsertionPoint,

    /// The variable names the selection set references.
    pub variables: BTreeSet<String>,

    /// The subset of the document's variable definitions this step declares,
    /// plus `$id: ID!` when the step is wrapped in the node pattern.
    pub variable_definitions: Vec<Node<ast::VariableDefinition>>,

    /// The compiled operation for this step. Child steps re-bind the node id
    /// per parent instance at execution time.
    pub query_document: Option<ast::Document>,

    /// The service this step queries.
    #[derivative(Debug = "ignore")]
    pub queryer: Arc<dyn Queryer>,

    /// Steps that can only run once this one has resolved.
    pub then: Vec<Arc<QueryPlanStep>>,
}

// plan equality is structural; the queryer carries transport handles and is
// deliberately left out
impl PartialEq for QueryPlanStep {
    fn eq(&self, other: &Self) -> bool {
        self.parent_type == other.parent_type
            && self.selection_set == other.selection_set
            && self.insertion_point == other.insertion_point
            && self.variables == other.variables
            && self.variable_definitions == other.variable_definitions
            && self.then == other.then
    }
}

/// A compiled plan for one operation of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub operation: OperationKind,
    pub operation_name: Option<String>,

    /// The variable definitions of the source operation.
    pub variable_definitions: Vec<Node<ast::VariableDefinition>>,

    /// The concurrent steps execution starts with.
    pub root_steps: Vec<Arc<QueryPlanStep>>,
}

/// The capability of turning a query string into a list of plans, one per
/// operation in the document.
pub trait QueryPlanner: Send + Sync {
    fn plan(
        &self,
        query: &str,
        schema: &Schema,
        index: &FieldIndex,
        registry: &dyn ServiceRegistry,
    ) -> Result<Vec<QueryPlan>, GatewayError>;
}

/// A planner that generates the minimum number of sub-queries: at every
/// field it prefers the service it is already talking to, and only spawns a
/// dependent step when the current service cannot resolve the field.
#[derive(Debug, Default, Clone, Copy)]
pub struct MinQueriesPlanner;

/// A planner that always fails. Useful to exercise error paths in tests.
#[derive(Debug, Clone)]
pub struct MockErrPlanner(pub GatewayError);

impl QueryPlanner for MockErrPlanner {
    fn plan(
        &self,
        _query: &str,
        _schema: &Schema,
        _index: &FieldIndex,
        _registry: &dyn ServiceRegistry,
    ) -> Result<Vec<QueryPlan>, GatewayError> {
        Err(self.0.clone())
    }
}

struct StepDraft {
    parent_type: String,
    location: String,
    selection_set: Vec<ast::Selection>,
    insertion_point: InsertionPoint,
    variables: BTreeSet<String>,
    then: Vec<StepDraft>,
}

impl StepDraft {
    fn new(parent_type: &str, location: String, insertion_point: InsertionPoint) -> Self {
        StepDraft {
            parent_type: parent_type.to_string(),
            location,
            selection_set: Vec::new(),
            insertion_point,
            variables: BTreeSet::new(),
            then: Vec::new(),
        }
    }
}

impl QueryPlanner for MinQueriesPlanner {
    #[tracing::instrument(level = "debug", skip_all)]
    fn plan(
        &self,
        query: &str,
        schema: &Schema,
        index: &FieldIndex,
        registry: &dyn ServiceRegistry,
    ) -> Result<Vec<QueryPlan>, GatewayError> {
        let document = ast::Document::parse(query.to_string(), "query.graphql").map_err(|err| {
            GatewayError::InvalidQuery {
                reason: err.to_string(),
            }
        })?;

        let fragments: Vec<Node<ast::FragmentDefinition>> = document
            .definitions
            .iter()
            .filter_map(|definition| match definition {
                ast::Definition::FragmentDefinition(fragment) => Some(fragment.clone()),
                _ => None,
            })
            .collect();

        let mut plans = Vec::new();
        for definition in &document.definitions {
            let ast::Definition::OperationDefinition(operation) = definition else {
                continue;
            };
            let kind = match operation.operation_type {
                ast::OperationType::Query => OperationKind::Query,
                ast::OperationType::Mutation => OperationKind::Mutation,
                ast::OperationType::Subscription => {
                    return Err(GatewayError::InvalidQuery {
                        reason: "subscriptions are not supported".to_string(),
                    })
                }
            };

            let selection_set = apply_fragments(&operation.selection_set, &fragments);

            let mut root_drafts: Vec<StepDraft> = Vec::new();
            for field in selected_fields(&selection_set) {
                let locations = index.lookup(kind.root_type_name(), field.name.as_str())?;
                if locations.is_empty() {
                    return Err(GatewayError::UnknownField {
                        parent_type: kind.root_type_name().to_string(),
                        field: field.name.to_string(),
                    });
                }

                // top-level fields that share a location fold into one step
                let position = root_drafts
                    .iter()
                    .position(|draft| locations.contains(&draft.location));
                let position = match position {
                    Some(position) => position,
                    None => {
                        root_drafts.push(StepDraft::new(
                            kind.root_type_name(),
                            locations[0].clone(),
                            InsertionPoint::empty(),
                        ));
                        root_drafts.len() - 1
                    }
                };

                let path = InsertionPoint::empty().join(PathSegment::field(response_key(field)));
                let draft = &mut root_drafts[position];
                let (processed, _) =
                    process_field(schema, index, draft, kind.root_type_name(), field, path)?;
                draft.selection_set.push(processed);
            }

            let root_steps = root_drafts
                .into_iter()
                .map(|draft| finalize_step(draft, kind, &operation.variables, registry))
                .collect::<Result<Vec<_>, _>>()?;

            plans.push(QueryPlan {
                operation: kind,
                operation_name: operation.name.as_ref().map(|name| name.to_string()),
                variable_definitions: operation.variables.clone(),
                root_steps,
            });
        }

        Ok(plans)
    }
}

/// Fold a field into `draft`, pushing the parts of its selection the draft's
/// service cannot resolve down into dependent steps.
///
/// `path` is the path from the plan root to the field itself; it becomes the
/// insertion point of any step spawned by the field's children.
///
/// Returns the rewritten field plus whether a dependent step hangs directly
/// off it. Insertion-point realisation reads ids from the last two segments
/// of a dependent's path, so `id` is asked for both on the spawning field
/// itself and, through the returned flag, on the selection one level above
/// it.
fn process_field(
    schema: &Schema,
    index: &FieldIndex,
    draft: &mut StepDraft,
    parent_type: &str,
    field: &ast::Field,
    path: InsertionPoint,
) -> Result<(ast::Selection, bool), GatewayError> {
    draft.variables.extend(extract_variables(&field.arguments));
    for directive in field.directives.iter() {
        draft.variables.extend(extract_variables(&directive.arguments));
    }

    // meta fields are answered wholesale by the introspection service, so
    // their subtrees never split across steps
    if field.name.as_str().starts_with("__") {
        collect_subtree_variables(&field.selection_set, draft);
        return Ok((ast::Selection::Field(Node::new(field.clone())), false));
    }

    let mut children: Vec<ast::Selection> = Vec::new();
    let mut spawned_child = false;
    let mut spawned_below = false;

    if !field.selection_set.is_empty() {
        let field_type = field_type_name(schema, parent_type, field.name.as_str())?;

        for child in selected_fields(&field.selection_set) {
            // any service that resolves the parent object can echo these
            let stay_local = child.name.as_str() == "__typename"
                || (child.name.as_str() == "id" && child.selection_set.is_empty());

            let locations = if stay_local {
                None
            } else {
                Some(index.lookup(&field_type, child.name.as_str())?)
            };

            match locations {
                Some(locations) if !locations.contains(&draft.location) => {
                    // the current service cannot resolve this field; hand it
                    // to a dependent step at the first candidate location
                    let location = locations
                        .first()
                        .ok_or_else(|| GatewayError::UnknownField {
                            parent_type: field_type.clone(),
                            field: child.name.to_string(),
                        })?
                        .clone();

                    let position = draft.then.iter().position(|dependent| {
                        dependent.location == location && dependent.insertion_point == path
                    });
                    let position = match position {
                        Some(position) => position,
                        None => {
                            draft
                                .then
                                .push(StepDraft::new(&field_type, location, path.clone()));
                            draft.then.len() - 1
                        }
                    };

                    let dependent = &mut draft.then[position];
                    let child_path = path.join(PathSegment::field(response_key(child)));
                    let (processed, _) =
                        process_field(schema, index, dependent, &field_type, child, child_path)?;
                    dependent.selection_set.push(processed);
                    spawned_child = true;
                }
                _ => {
                    let child_path = path.join(PathSegment::field(response_key(child)));
                    let (processed, needs_parent_id) = process_field(
                        schema, index, draft, &field_type, child, child_path,
                    )?;
                    if needs_parent_id {
                        spawned_below = true;
                    }
                    children.push(processed);
                }
            }
        }

        // dependent steps look their parent objects up by id: the field a
        // dependent hangs off must echo it, and so must the field one level
        // above (the second-to-last segment of the dependent's path)
        if spawned_child || spawned_below {
            let asks_for_id = selected_fields(&children)
                .iter()
                .any(|child| child.name.as_str() == "id");
            if !asks_for_id {
                children.push(ast::Selection::Field(Node::new(ast::Field {
                    alias: None,
                    name: Name::new("id").expect("'id' is a valid name"),
                    arguments: Vec::new(),
                    directives: Default::default(),
                    selection_set: Vec::new(),
                })));
            }
        }
    }

    Ok((
        ast::Selection::Field(Node::new(ast::Field {
            alias: field.alias.clone(),
            name: field.name.clone(),
            arguments: field.arguments.clone(),
            directives: field.directives.clone(),
            selection_set: children,
        })),
        spawned_child,
    ))
}

fn collect_subtree_variables(selection_set: &[ast::Selection], draft: &mut StepDraft) {
    for field in selected_fields(selection_set) {
        draft.variables.extend(extract_variables(&field.arguments));
        for directive in field.directives.iter() {
            draft.variables.extend(extract_variables(&directive.arguments));
        }
        collect_subtree_variables(&field.selection_set, draft);
    }
}

fn finalize_step(
    draft: StepDraft,
    kind: OperationKind,
    document_variables: &[Node<ast::VariableDefinition>],
    registry: &dyn ServiceRegistry,
) -> Result<Arc<QueryPlanStep>, GatewayError> {
    let queryer = registry
        .get(&draft.location)
        .ok_or_else(|| GatewayError::UnknownService {
            service: draft.location.clone(),
        })?;

    let mut variable_definitions: Vec<Node<ast::VariableDefinition>> = document_variables
        .iter()
        .filter(|definition| draft.variables.contains(definition.name.as_str()))
        .cloned()
        .collect();

    // the node pattern binds `$id`, declare it when the document does not
    if !is_root_type(&draft.parent_type)
        && !variable_definitions
            .iter()
            .any(|definition| definition.name.as_str() == "id")
    {
        variable_definitions.push(Node::new(ast::VariableDefinition {
            name: Name::new("id").expect("'id' is a valid name"),
            ty: Node::new(ast::Type::NonNullNamed(
                Name::new("ID").expect("'ID' is a valid name"),
            )),
            default_value: None,
            directives: Default::default(),
        }));
    }

    let query_document = build_query_document(
        kind,
        &draft.parent_type,
        None,
        &variable_definitions,
        &draft.selection_set,
    )?;

    let then = draft
        .then
        .into_iter()
        .map(|dependent| finalize_step(dependent, kind, document_variables, registry))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Arc::new(QueryPlanStep {
        parent_type: draft.parent_type,
        selection_set: draft.selection_set,
        insertion_point: draft.insertion_point,
        variables: draft.variables,
        variable_definitions,
        query_document: Some(query_document),
        queryer,
        then,
    }))
}

/// Build the operation document a step sends upstream.
///
/// Top-level steps keep their selection set as the operation's own. Steps
/// resolving fields of any other type are wrapped in the node pattern,
///
/// ```graphql
/// { node(id: $id) { ... on ParentType { <selection> } } }
/// ```
///
/// with the id bound to `$id` in the cached plan document, or inlined as a
/// string literal when the executor re-binds the query per parent instance.
pub(crate) fn build_query_document(
    kind: OperationKind,
    parent_type: &str,
    node_id: Option<&str>,
    variable_definitions: &[Node<ast::VariableDefinition>],
    selection_set: &[ast::Selection],
) -> Result<ast::Document, GatewayError> {
    let (operation_type, selection_set) = if is_root_type(parent_type) {
        let operation_type = match kind {
            OperationKind::Query => ast::OperationType::Query,
            OperationKind::Mutation => ast::OperationType::Mutation,
        };
        (operation_type, selection_set.to_vec())
    } else {
        let type_condition =
            Name::new(parent_type).map_err(|err| GatewayError::InvalidQuery {
                reason: format!("invalid type name '{parent_type}': {err}"),
            })?;

        let id_value = match node_id {
            Some(id) => ast::Value::String(id.to_string()),
            None => ast::Value::Variable(Name::new("id").expect("'id' is a valid name")),
        };

        let node_field = ast::Field {
            alias: None,
            name: Name::new("node").expect("'node' is a valid name"),
            arguments: vec![Node::new(ast::Argument {
                name: Name::new("id").expect("'id' is a valid name"),
                value: Node::new(id_value),
            })],
            directives: Default::default(),
            selection_set: vec![ast::Selection::InlineFragment(Node::new(
                ast::InlineFragment {
                    type_condition: Some(type_condition),
                    directives: Default::default(),
                    selection_set: selection_set.to_vec(),
                },
            ))],
        };

        (
            ast::OperationType::Query,
            vec![ast::Selection::Field(Node::new(node_field))],
        )
    };

    let mut document = ast::Document::new();
    document
        .definitions
        .push(ast::Definition::OperationDefinition(Node::new(
            ast::OperationDefinition {
                operation_type,
                name: None,
                variables: variable_definitions.to_vec(),
                directives: Default::default(),
                selection_set,
            },
        )));
    Ok(document)
}

/// The key a field's value appears under in a response.
pub(crate) fn response_key(field: &ast::Field) -> &str {
    field
        .alias
        .as_ref()
        .map(|alias| alias.as_str())
        .unwrap_or_else(|| field.name.as_str())
}

/// The fields of a selection set, in order. Fragments are expected to have
/// been applied already.
pub(crate) fn selected_fields(selection_set: &[ast::Selection]) -> Vec<&Node<ast::Field>> {
    selection_set
        .iter()
        .filter_map(|selection| match selection {
            ast::Selection::Field(field) => Some(field),
            _ => None,
        })
        .collect()
}

/// Inline every fragment spread and inline fragment, merging fields that
/// appear more than once at the same level into a single selection whose
/// children are the union of the originals. Applying this twice gives the
/// same result as applying it once.
pub(crate) fn apply_fragments(
    selection_set: &[ast::Selection],
    fragments: &[Node<ast::FragmentDefinition>],
) -> Vec<ast::Selection> {
    let mut order: Vec<String> = Vec::new();
    let mut merged: std::collections::HashMap<String, ast::Field> = Default::default();
    collect_fields(selection_set, fragments, &mut order, &mut merged);

    order
        .into_iter()
        .map(|key| {
            let mut field = merged.remove(&key).expect("collected fields stay in sync");
            field.selection_set = apply_fragments(&field.selection_set, fragments);
            ast::Selection::Field(Node::new(field))
        })
        .collect()
}

fn collect_fields(
    selection_set: &[ast::Selection],
    fragments: &[Node<ast::FragmentDefinition>],
    order: &mut Vec<String>,
    merged: &mut std::collections::HashMap<String, ast::Field>,
) {
    for selection in selection_set {
        match selection {
            ast::Selection::Field(field) => {
                let key = response_key(field).to_string();
                if let Some(existing) = merged.get_mut(&key) {
                    existing
                        .selection_set
                        .extend(field.selection_set.iter().cloned());
                } else {
                    order.push(key.clone());
                    merged.insert(key, (**field).clone());
                }
            }
            ast::Selection::InlineFragment(fragment) => {
                collect_fields(&fragment.selection_set, fragments, order, merged);
            }
            ast::Selection::FragmentSpread(spread) => {
                if let Some(definition) = fragments
                    .iter()
                    .find(|fragment| fragment.name == spread.fragment_name)
                {
                    collect_fields(&definition.selection_set, fragments, order, merged);
                }
            }
        }
    }
}

/// Collect the names of every variable referenced by an argument list,
/// including variables nested inside list and object values.
pub(crate) fn extract_variables(arguments: &[Node<ast::Argument>]) -> Vec<String> {
    let mut variables = Vec::new();
    for argument in arguments {
        extract_value_variables(&argument.value, &mut variables);
    }
    variables
}

fn extract_value_variables(value: &ast::Value, variables: &mut Vec<String>) {
    match value {
        ast::Value::Variable(name) => variables.push(name.to_string()),
        ast::Value::List(values) => {
            for value in values {
                extract_value_variables(value, variables);
            }
        }
        ast::Value::Object(fields) => {
            for (_, value) in fields {
                extract_value_variables(value, variables);
            }
        }
        _ => {}
    }
}

fn field_type_name(
    schema: &Schema,
    parent_type: &str,
    field: &str,
) -> Result<String, GatewayError> {
    use apollo_compiler::schema::ExtendedType;

    let unknown = || GatewayError::UnknownField {
        parent_type: parent_type.to_string(),
        field: field.to_string(),
    };

    let definition = match schema.types.get(parent_type).ok_or_else(unknown)? {
        ExtendedType::Object(object) => object.fields.get(field).ok_or_else(unknown)?,
        ExtendedType::Interface(interface) => interface.fields.get(field).ok_or_else(unknown)?,
        _ => return Err(unknown()),
    };

    Ok(definition.ty.inner_named_type().to_string())
}
