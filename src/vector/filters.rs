//! Filter helpers for vector store queries and payload conversion.

use serde_json::{Map, Value, json};

use super::types::{Chunk, RetrievalFilterArgs};

/// Compose the standard attribute filter payload from optional arguments.
pub fn build_retrieval_filter(args: &RetrievalFilterArgs) -> Option<Value> {
    let mut must: Vec<Value> = Vec::new();

    if let Some(indicator) = args.indicator.as_ref().and_then(|value| non_empty(value)) {
        must.push(json!({
            "key": "indicator_acronym",
            "match": { "value": indicator }
        }));
    }

    if let Some(year) = args.year.as_ref().and_then(|value| non_empty(value)) {
        must.push(json!({
            "key": "year",
            "match": { "value": year }
        }));
    }

    if let Some(tables) = args.source_tables.as_ref() {
        let cleaned: Vec<String> = tables
            .iter()
            .filter_map(|table| non_empty(table).map(|value| value.to_string()))
            .collect();
        if !cleaned.is_empty() {
            must.push(json!({
                "key": "source_table",
                "match": { "any": cleaned }
            }));
        }
    }

    if let Some(document_name) = args
        .document_name
        .as_ref()
        .and_then(|value| non_empty(value))
    {
        must.push(json!({
            "key": "document_name",
            "match": { "value": document_name }
        }));
    }

    if must.is_empty() {
        None
    } else {
        Some(json!({ "must": must }))
    }
}

/// Extend a filter with a presence requirement on one payload field.
///
/// Used by the structural retrieval query that guarantees inclusion of
/// bibliographic evidence (`doi` present).
pub fn with_required_field(filter: Option<Value>, field: &str) -> Value {
    let mut body = filter.unwrap_or_else(|| json!({ "must": [] }));
    let must_not = json!([{ "is_empty": { "key": field } }]);
    body.as_object_mut()
        .expect("filter body is an object")
        .insert("must_not".into(), must_not);
    body
}

/// Filter matching a single ephemeral namespace.
pub fn document_name_filter(document_name: &str) -> Value {
    json!({
        "must": [
            {
                "key": "document_name",
                "match": { "value": document_name }
            }
        ]
    })
}

/// Convert a stored payload back into a [`Chunk`].
///
/// The chunk text lives under the `text` key; every other payload entry is an
/// attribute.
pub fn payload_to_chunk(mut payload: Map<String, Value>) -> Chunk {
    let text = match payload.remove("text") {
        Some(Value::String(text)) => text,
        _ => String::new(),
    };
    Chunk {
        text,
        attributes: payload,
    }
}

/// Flatten a chunk into the payload stored alongside its vector.
pub fn chunk_to_payload(chunk: &Chunk) -> Value {
    let mut payload = chunk.attributes.clone();
    payload.insert("text".into(), Value::String(chunk.text.clone()));
    Value::Object(payload)
}

fn non_empty(input: &str) -> Option<&str> {
    let trimmed = input.trim();
    if trimmed.is_empty() { None } else { Some(trimmed) }
}
