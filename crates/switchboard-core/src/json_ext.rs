//! Insertion points: paths into the accumulated response tree.

use crate::error::GatewayError;
use serde_json::map::Map;
use serde_json::Value;
use std::fmt;

/// A JSON object.
pub type Object = Map<String, Value>;

/// One segment of an insertion point.
///
/// Segments come in the form `field[:index][#id]`: `field` descends into an
/// object key, `:index` selects an element of the list stored under that key
/// and `#id` names the `id` of the object the segment refers to, so that a
/// dependent step can bind its `node(id: …)` lookup.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PathSegment {
    pub field: String,
    pub index: Option<usize>,
    pub id: Option<String>,
}

impl PathSegment {
    /// A segment that descends into a plain object key.
    pub fn field(name: impl Into<String>) -> Self {
        PathSegment {
            field: name.into(),
            index: None,
            id: None,
        }
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Parse the `field[:index][#id]` form.
    pub fn parse(raw: &str) -> Result<Self, GatewayError> {
        let (rest, id) = match raw.split_once('#') {
            Some((rest, id)) => (rest, Some(id.to_string())),
            None => (raw, None),
        };
        let (field, index) = match rest.split_once(':') {
            Some((field, index)) => {
                let index = index.parse::<usize>().map_err(|_| {
                    GatewayError::stitch(format!("invalid list index in path segment '{raw}'"))
                })?;
                (field, Some(index))
            }
            None => (rest, None),
        };
        Ok(PathSegment {
            field: field.to_string(),
            index,
            id,
        })
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.field)?;
        if let Some(index) = self.index {
            write!(f, ":{index}")?;
        }
        if let Some(id) = &self.id {
            write!(f, "#{id}")?;
        }
        Ok(())
    }
}

/// A path into the result document.
///
/// The planner produces paths of plain `field` segments; the executor
/// realises them against intermediate results, expanding lists into `:index`
/// segments and recording parent ids as `#id` suffixes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InsertionPoint(Vec<PathSegment>);

impl InsertionPoint {
    pub fn empty() -> Self {
        InsertionPoint(Vec::new())
    }

    /// Build a path of plain field segments.
    pub fn from_fields<T: AsRef<str>>(fields: &[T]) -> Self {
        InsertionPoint(
            fields
                .iter()
                .map(|f| PathSegment::field(f.as_ref()))
                .collect(),
        )
    }

    /// Parse each segment of a `field[:index][#id]` slice.
    pub fn from_slice<T: AsRef<str>>(segments: &[T]) -> Result<Self, GatewayError> {
        Ok(InsertionPoint(
            segments
                .iter()
                .map(|s| PathSegment::parse(s.as_ref()))
                .collect::<Result<_, _>>()?,
        ))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathSegment> {
        self.0.iter()
    }

    pub fn last(&self) -> Option<&PathSegment> {
        self.0.last()
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn push(&mut self, segment: PathSegment) {
        self.0.push(segment);
    }

    pub fn pop(&mut self) -> Option<PathSegment> {
        self.0.pop()
    }

    pub fn join(&self, segment: PathSegment) -> Self {
        let mut new = self.clone();
        new.push(segment);
        new
    }

    /// The id the step at this insertion point should bind its node lookup
    /// to: the id recorded on the last segment, or on the one before it when
    /// the path ends in a plain field.
    pub fn node_id(&self) -> Option<&str> {
        let last = self.0.last()?;
        if let Some(id) = &last.id {
            return Some(id);
        }
        self.0
            .get(self.0.len().checked_sub(2)?)
            .and_then(|segment| segment.id.as_deref())
    }
}

impl fmt::Display for InsertionPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

impl From<Vec<PathSegment>> for InsertionPoint {
    fn from(segments: Vec<PathSegment>) -> Self {
        InsertionPoint(segments)
    }
}

/// Walk `path` down from `target`, materialising missing objects and growing
/// lists (padded with empty objects) along the way, and return the value the
/// path points at.
pub fn extract_value<'a>(
    target: &'a mut Value,
    path: &[PathSegment],
) -> Result<&'a mut Value, GatewayError> {
    let mut current = target;
    for segment in path {
        let object = current.as_object_mut().ok_or_else(|| {
            GatewayError::stitch(format!(
                "expected an object while descending into '{}'",
                segment.field
            ))
        })?;
        let slot = object.entry(segment.field.clone()).or_insert_with(|| {
            if segment.index.is_some() {
                Value::Array(Vec::new())
            } else {
                Value::Object(Object::new())
            }
        });
        current = match segment.index {
            Some(index) => {
                let list = slot.as_array_mut().ok_or_else(|| {
                    GatewayError::stitch(format!(
                        "expected a list under '{}' but found something else",
                        segment.field
                    ))
                })?;
                while list.len() <= index {
                    list.push(Value::Object(Object::new()));
                }
                &mut list[index]
            }
            None => slot,
        };
    }
    Ok(current)
}

/// Place `value` at `path` inside the accumulator.
///
/// An empty path shallow-merges `value` into the root. A terminal list
/// segment grows the target list as needed and merges object values into the
/// selected element (located by `#id` when a matching element already
/// exists, by index otherwise). A terminal plain segment assigns the key,
/// overwriting whatever is there; the overwrite is what lets an upstream
/// result replace a gateway stub.
pub fn insert_value(
    target: &mut Object,
    path: &InsertionPoint,
    value: Value,
) -> Result<(), GatewayError> {
    let segments = path.segments();
    let Some((last, head)) = segments.split_last() else {
        let incoming = match value {
            Value::Object(object) => object,
            other => {
                return Err(GatewayError::stitch(format!(
                    "cannot merge a non-object value into the response root: {other}"
                )))
            }
        };
        merge_object(target, incoming);
        return Ok(());
    };

    let mut root = Value::Object(std::mem::take(target));
    let result = insert_at(&mut root, head, last, value);
    match root {
        Value::Object(object) => *target = object,
        _ => unreachable!("the accumulator root is always an object"),
    }
    result
}

fn insert_at(
    root: &mut Value,
    head: &[PathSegment],
    last: &PathSegment,
    value: Value,
) -> Result<(), GatewayError> {
    let parent = extract_value(root, head)?;
    let parent = parent.as_object_mut().ok_or_else(|| {
        GatewayError::stitch(format!(
            "insertion parent of '{}' was not an object",
            last.field
        ))
    })?;

    match last.index {
        Some(index) => {
            let slot = parent
                .entry(last.field.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            let list = slot.as_array_mut().ok_or_else(|| {
                GatewayError::stitch(format!("found a non-list at insertion point '{last}'"))
            })?;
            while list.len() <= index {
                list.push(Value::Object(Object::new()));
            }
            // an element carrying the right id wins over the positional slot
            let position = match &last.id {
                Some(id) => list
                    .iter()
                    .position(|entry| {
                        entry.get("id").map(value_as_id_string).as_deref() == Some(id.as_str())
                    })
                    .unwrap_or(index),
                None => index,
            };
            match value {
                Value::Object(incoming) => {
                    let element = list[position].as_object_mut().ok_or_else(|| {
                        GatewayError::stitch(format!(
                            "list element at insertion point '{last}' was not an object"
                        ))
                    })?;
                    merge_object(element, incoming);
                }
                other => list[position] = other,
            }
        }
        None if last.id.is_some() => {
            let slot = parent
                .entry(last.field.clone())
                .or_insert_with(|| Value::Object(Object::new()));
            match value {
                Value::Object(incoming) => {
                    let element = slot.as_object_mut().ok_or_else(|| {
                        GatewayError::stitch(format!(
                            "found a non-object at insertion point '{last}'"
                        ))
                    })?;
                    merge_object(element, incoming);
                }
                other => *slot = other,
            }
        }
        None => {
            parent.insert(last.field.clone(), value);
        }
    }
    Ok(())
}

/// Shallow merge: existing keys are overwritten.
pub(crate) fn merge_object(target: &mut Object, incoming: Object) {
    for (key, value) in incoming {
        target.insert(key, value);
    }
}

/// Ids come back from services as strings or numbers; compare them by their
/// string form.
pub(crate) fn value_as_id_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
