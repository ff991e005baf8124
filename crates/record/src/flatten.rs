use std::collections::BTreeMap;

use serde_json::{Map, Value as JsonValue};

use crate::types::FieldValue;
use crate::{GOLDEN_RECORD_TAG, IDENTIFIER_PATH};

/// Top-level keys that never become match fields.
const SKIPPED_ROOT_KEYS: [&str; 3] = ["resourceType", "id", "meta"];

/// Flatten a JSON resource into dotted paths.
///
/// Arrays do not contribute a path segment, so `name[0].given[1]` lands under
/// `name.given`. Objects found under an `identifier` key are kept whole as
/// [`FieldValue::Identifier`]. `null` is dropped.
pub fn flatten_resource(resource: &JsonValue) -> BTreeMap<String, Vec<FieldValue>> {
    let mut fields = BTreeMap::new();
    if let Some(object) = resource.as_object() {
        for (key, value) in object {
            if SKIPPED_ROOT_KEYS.contains(&key.as_str()) {
                continue;
            }
            walk(key, key, value, &mut fields);
        }
    }
    fields
}

fn walk(
    path: &str,
    key: &str,
    value: &JsonValue,
    fields: &mut BTreeMap<String, Vec<FieldValue>>,
) {
    match value {
        JsonValue::Null => {}
        JsonValue::Array(items) => {
            for item in items {
                walk(path, key, item, fields);
            }
        }
        JsonValue::Object(object) if key == IDENTIFIER_PATH => {
            if let Some(identifier) = identifier_value(object) {
                fields.entry(path.to_string()).or_default().push(identifier);
            }
        }
        JsonValue::Object(object) => {
            for (child_key, child) in object {
                let child_path = format!("{path}.{child_key}");
                walk(&child_path, child_key, child, fields);
            }
        }
        JsonValue::String(text) => push_text(path, text.clone(), fields),
        JsonValue::Number(number) => push_text(path, number.to_string(), fields),
        JsonValue::Bool(flag) => push_text(path, flag.to_string(), fields),
    }
}

fn push_text(path: &str, text: String, fields: &mut BTreeMap<String, Vec<FieldValue>>) {
    fields
        .entry(path.to_string())
        .or_default()
        .push(FieldValue::Text(text));
}

fn identifier_value(object: &Map<String, JsonValue>) -> Option<FieldValue> {
    let value = object.get("value").and_then(JsonValue::as_str)?;
    let system = object.get("system").and_then(JsonValue::as_str);
    Some(FieldValue::identifier(system, value))
}

/// A resource is golden when any `meta.tag` carries the golden record code.
pub(crate) fn is_golden_resource(resource: &JsonValue) -> bool {
    resource
        .pointer("/meta/tag")
        .and_then(JsonValue::as_array)
        .map(|tags| {
            tags.iter()
                .any(|tag| tag.get("code").and_then(JsonValue::as_str) == Some(GOLDEN_RECORD_TAG))
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Record;
    use serde_json::json;

    #[test]
    fn arrays_are_transparent() {
        let fields = flatten_resource(&json!({
            "resourceType": "Patient",
            "id": "p1",
            "name": [
                { "given": ["Jose", "Martin"], "family": "Fernandez" },
                { "given": ["Pepe"] }
            ]
        }));

        let given: Vec<_> = fields["name.given"].iter().map(FieldValue::as_text).collect();
        assert_eq!(given, vec!["Jose", "Martin", "Pepe"]);
        assert_eq!(fields["name.family"], vec![FieldValue::text("Fernandez")]);
        assert!(!fields.contains_key("resourceType"));
        assert!(!fields.contains_key("id"));
    }

    #[test]
    fn identifiers_keep_their_system() {
        let fields = flatten_resource(&json!({
            "identifier": [
                { "system": "http://eid", "value": "eid-1" },
                { "value": "loose" },
                { "system": "http://eid" }
            ]
        }));

        assert_eq!(
            fields["identifier"],
            vec![
                FieldValue::identifier(Some("http://eid"), "eid-1"),
                FieldValue::identifier(None, "loose"),
            ]
        );
    }

    #[test]
    fn scalars_and_nulls() {
        let fields = flatten_resource(&json!({
            "active": true,
            "multipleBirthInteger": 2,
            "deceasedDateTime": null
        }));

        assert_eq!(fields["active"], vec![FieldValue::text("true")]);
        assert_eq!(fields["multipleBirthInteger"], vec![FieldValue::text("2")]);
        assert!(!fields.contains_key("deceasedDateTime"));
    }

    #[test]
    fn golden_tag_marks_record() {
        let record = Record::from_json(&json!({
            "resourceType": "Patient",
            "id": "g1",
            "meta": { "tag": [{ "system": crate::RECORD_STATUS_SYSTEM, "code": "GOLDEN_RECORD" }] }
        }))
        .unwrap();

        assert!(record.is_golden());
        assert_eq!(record.paths().count(), 0);
    }
}
