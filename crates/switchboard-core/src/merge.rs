//! Merging source schemas into the one schema the gateway serves.

use crate::error::SchemaError;
use apollo_compiler::name;
use apollo_compiler::schema::{ComponentName, ExtendedType, FieldDefinition};
use apollo_compiler::Schema;

/// The capability of combining source schemas into one.
pub trait Merger: Send + Sync {
    fn merge(&self, sources: &[&Schema]) -> Result<Schema, SchemaError>;
}

impl<F> Merger for F
where
    F: Fn(&[&Schema]) -> Result<Schema, SchemaError> + Send + Sync,
{
    fn merge(&self, sources: &[&Schema]) -> Result<Schema, SchemaError> {
        self(sources)
    }
}

/// The default merger: [`merge_schemas`] behind the [`Merger`] capability.
#[derive(Debug, Default, Clone, Copy)]
pub struct SchemaMerger;

impl Merger for SchemaMerger {
    fn merge(&self, sources: &[&Schema]) -> Result<Schema, SchemaError> {
        merge_schemas(sources)
    }
}

/// Union a list of schemas.
///
/// Types defined by a single schema are copied over. Types defined by several
/// schemas are unioned field-wise: a field may appear in more than one schema
/// as long as every definition has the same signature, in which case each
/// defining service simply becomes a candidate location for it. Scalars and
/// enums must be structurally identical everywhere they appear.
pub fn merge_schemas(sources: &[&Schema]) -> Result<Schema, SchemaError> {
    let mut iter = sources.iter();
    let first = iter.next().ok_or(SchemaError::NoSources)?;
    let mut merged: Schema = (*first).clone();

    for source in iter {
        for (type_name, incoming) in &source.types {
            if let Some(existing) = merged.types.get_mut(type_name) {
                merge_type(type_name.as_str(), existing, incoming)?;
            } else {
                merged.types.insert(type_name.clone(), incoming.clone());
            }
        }

        for (directive_name, incoming) in &source.directive_definitions {
            if !merged.directive_definitions.contains_key(directive_name) {
                merged
                    .directive_definitions
                    .insert(directive_name.clone(), incoming.clone());
            }
        }
    }

    // root operation types follow the conventional names once the types exist
    let definition = merged.schema_definition.make_mut();
    if merged.types.contains_key("Query") && definition.query.is_none() {
        definition.query = Some(ComponentName::from(name!("Query")));
    }
    if merged.types.contains_key("Mutation") && definition.mutation.is_none() {
        definition.mutation = Some(ComponentName::from(name!("Mutation")));
    }
    if merged.types.contains_key("Subscription") && definition.subscription.is_none() {
        definition.subscription = Some(ComponentName::from(name!("Subscription")));
    }

    Ok(merged)
}

fn merge_type(
    name: &str,
    existing: &mut ExtendedType,
    incoming: &ExtendedType,
) -> Result<(), SchemaError> {
    if existing == incoming {
        return Ok(());
    }

    match (existing, incoming) {
        (ExtendedType::Object(existing), ExtendedType::Object(incoming)) => {
            let existing = existing.make_mut();
            for (field_name, incoming_field) in &incoming.fields {
                match existing.fields.get(field_name) {
                    None => {
                        existing
                            .fields
                            .insert(field_name.clone(), incoming_field.clone());
                    }
                    Some(existing_field) => {
                        check_field_signature(name, existing_field, incoming_field)?
                    }
                }
            }
            for interface in &incoming.implements_interfaces {
                if !existing.implements_interfaces.contains(interface) {
                    existing.implements_interfaces.insert(interface.clone());
                }
            }
            Ok(())
        }
        (ExtendedType::Interface(existing), ExtendedType::Interface(incoming)) => {
            let existing = existing.make_mut();
            for (field_name, incoming_field) in &incoming.fields {
                match existing.fields.get(field_name) {
                    None => {
                        existing
                            .fields
                            .insert(field_name.clone(), incoming_field.clone());
                    }
                    Some(existing_field) => {
                        check_field_signature(name, existing_field, incoming_field)?
                    }
                }
            }
            Ok(())
        }
        (ExtendedType::Union(existing), ExtendedType::Union(incoming)) => {
            let existing = existing.make_mut();
            for member in &incoming.members {
                if !existing.members.contains(member) {
                    existing.members.insert(member.clone());
                }
            }
            Ok(())
        }
        (ExtendedType::Scalar(_), ExtendedType::Scalar(_)) => {
            // equality was already ruled out above
            Err(SchemaError::Conflict {
                reason: format!("scalar '{name}' is defined differently by two services"),
            })
        }
        (ExtendedType::Enum(existing), ExtendedType::Enum(incoming)) => {
            let same_values = existing.values.len() == incoming.values.len()
                && incoming
                    .values
                    .keys()
                    .all(|value| existing.values.contains_key(value));
            if same_values {
                Ok(())
            } else {
                Err(SchemaError::Conflict {
                    reason: format!("enum '{name}' has mismatched values across services"),
                })
            }
        }
        (ExtendedType::InputObject(existing), ExtendedType::InputObject(incoming)) => {
            let existing = existing.make_mut();
            for (field_name, incoming_field) in &incoming.fields {
                match existing.fields.get(field_name) {
                    None => {
                        existing
                            .fields
                            .insert(field_name.clone(), incoming_field.clone());
                    }
                    Some(existing_field) => {
                        if existing_field.ty != incoming_field.ty
                            || existing_field.default_value != incoming_field.default_value
                        {
                            return Err(SchemaError::Conflict {
                                reason: format!(
                                    "input field '{name}.{field_name}' is defined with different types"
                                ),
                            });
                        }
                    }
                }
            }
            Ok(())
        }
        _ => Err(SchemaError::Conflict {
            reason: format!("type '{name}' has a different kind in two services"),
        }),
    }
}

fn check_field_signature(
    type_name: &str,
    existing: &FieldDefinition,
    incoming: &FieldDefinition,
) -> Result<(), SchemaError> {
    let same_arguments = existing.arguments.len() == incoming.arguments.len()
        && existing.arguments.iter().all(|existing_arg| {
            incoming.arguments.iter().any(|incoming_arg| {
                incoming_arg.name == existing_arg.name
                    && incoming_arg.ty == existing_arg.ty
                    && incoming_arg.default_value == existing_arg.default_value
            })
        });

    if existing.ty == incoming.ty && same_arguments {
        Ok(())
    } else {
        Err(SchemaError::Conflict {
            reason: format!(
                "field '{type_name}.{}' is defined with incompatible signatures",
                existing.name
            ),
        })
    }
}
