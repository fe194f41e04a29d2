//! Filter, update, sort and projection evaluation over plain documents.
//!
//! Supports the subset of the document query language the in-memory driver
//! needs: equality, `$eq $ne $gt $gte $lt $lte $in $nin $exists`, `$and`,
//! `$or`, and the `$set $unset $inc $setOnInsert` update operators. Paths may
//! be dotted.

use super::{DriverError, DriverErrorKind, DriverResult};
use crate::core::Document;
use serde_json::Value;
use std::cmp::Ordering;

const BAD_VALUE_CODE: i32 = 2;
const FAILED_TO_PARSE_CODE: i32 = 9;
const IMMUTABLE_FIELD_CODE: i32 = 66;

fn bad_query(message: String) -> DriverError {
    DriverError::new(DriverErrorKind::Server, message).with_code(BAD_VALUE_CODE)
}

pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = doc.get(first)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn set_path(doc: &mut Document, path: &str, value: Value) -> DriverResult<()> {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
            Ok(())
        }
        Some((head, rest)) => {
            let child = doc
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Document::new()));
            match child {
                Value::Object(map) => set_path(map, rest, value),
                other => Err(DriverError::new(
                    DriverErrorKind::Write,
                    format!("Cannot create field '{}' in element {{{}: {}}}", rest, head, other),
                )
                .with_code(28)),
            }
        }
    }
}

fn remove_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Object(map)) = doc.get_mut(head) {
                remove_path(map, rest);
            }
        }
    }
}

pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                return Some(a.cmp(&b));
            }
            a.as_f64()?.partial_cmp(&b.as_f64()?)
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match compare_values(left, right) {
        Some(ordering) => ordering == Ordering::Equal,
        None => left == right,
    }
}

/// Equality that also matches array membership, like the server does.
fn field_equals(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        None => expected.is_null(),
        Some(Value::Array(items)) if !expected.is_array() => {
            items.iter().any(|item| values_equal(item, expected))
        }
        Some(actual) => values_equal(actual, expected),
    }
}

fn is_operator_document(value: &Value) -> bool {
    match value {
        Value::Object(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

pub fn matches(doc: &Document, filter: &Document) -> DriverResult<bool> {
    for (key, condition) in filter {
        let matched = match key.as_str() {
            "$and" => clauses(condition, key)?
                .iter()
                .map(|clause| matches(doc, clause))
                .collect::<DriverResult<Vec<_>>>()?
                .into_iter()
                .all(|m| m),
            "$or" => clauses(condition, key)?
                .iter()
                .map(|clause| matches(doc, clause))
                .collect::<DriverResult<Vec<_>>>()?
                .into_iter()
                .any(|m| m),
            other if other.starts_with('$') => {
                return Err(bad_query(format!("unknown top level operator: {}", other)));
            }
            path => {
                let actual = get_path(doc, path);
                if is_operator_document(condition) {
                    field_matches_operators(actual, condition)?
                } else {
                    field_equals(actual, condition)
                }
            }
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn clauses<'a>(condition: &'a Value, op: &str) -> DriverResult<Vec<&'a Document>> {
    let Value::Array(items) = condition else {
        return Err(bad_query(format!("{} must be an array", op)));
    };
    items
        .iter()
        .map(|item| match item {
            Value::Object(map) => Ok(map),
            _ => Err(bad_query(format!("{} entries must be documents", op))),
        })
        .collect()
}

fn field_matches_operators(actual: Option<&Value>, operators: &Value) -> DriverResult<bool> {
    let Value::Object(operators) = operators else {
        return Ok(false);
    };
    for (op, operand) in operators {
        let ok = match op.as_str() {
            "$eq" => field_equals(actual, operand),
            "$ne" => !field_equals(actual, operand),
            "$gt" | "$gte" | "$lt" | "$lte" => match actual.and_then(|a| compare_values(a, operand)) {
                Some(ordering) => match op.as_str() {
                    "$gt" => ordering == Ordering::Greater,
                    "$gte" => ordering != Ordering::Less,
                    "$lt" => ordering == Ordering::Less,
                    _ => ordering != Ordering::Greater,
                },
                None => false,
            },
            "$in" | "$nin" => {
                let Value::Array(candidates) = operand else {
                    return Err(bad_query(format!("{} needs an array", op)));
                };
                let found = candidates.iter().any(|c| field_equals(actual, c));
                if op == "$in" { found } else { !found }
            }
            "$exists" => actual.is_some() == operand.as_bool().unwrap_or(true),
            other => return Err(bad_query(format!("unknown operator: {}", other))),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Equality predicates of a filter, used to seed an upserted document.
pub fn seed_from_filter(filter: &Document) -> DriverResult<Document> {
    let mut seed = Document::new();
    for (key, condition) in filter {
        if key == "$and" {
            for clause in clauses(condition, key)? {
                for (k, v) in seed_from_filter(clause)? {
                    set_path(&mut seed, &k, v)?;
                }
            }
            continue;
        }
        if key.starts_with('$') {
            continue;
        }
        if is_operator_document(condition) {
            if let Some(eq) = condition.get("$eq") {
                set_path(&mut seed, key, eq.clone())?;
            }
            continue;
        }
        set_path(&mut seed, key, condition.clone())?;
    }
    Ok(seed)
}

pub fn is_update_document(update: &Document) -> bool {
    !update.is_empty() && update.keys().all(|k| k.starts_with('$'))
}

pub fn apply_update(doc: &mut Document, update: &Document, inserting: bool) -> DriverResult<()> {
    for (op, fields) in update {
        let Value::Object(fields) = fields else {
            return Err(DriverError::new(
                DriverErrorKind::Server,
                format!("Modifiers operate on fields but we found type {} instead", fields),
            )
            .with_code(FAILED_TO_PARSE_CODE));
        };
        for (path, value) in fields {
            if path == "_id" && !inserting && op != "$setOnInsert" {
                let unchanged = doc.get("_id").map(|id| values_equal(id, value)).unwrap_or(false);
                if !unchanged {
                    return Err(immutable_id());
                }
            }
            match op.as_str() {
                "$set" => set_path(doc, path, value.clone())?,
                "$setOnInsert" => {
                    if inserting {
                        set_path(doc, path, value.clone())?;
                    }
                }
                "$unset" => remove_path(doc, path),
                "$inc" => {
                    let current = get_path(doc, path).cloned().unwrap_or(Value::from(0));
                    let next = increment(&current, value).ok_or_else(|| {
                        DriverError::new(
                            DriverErrorKind::Write,
                            format!("Cannot apply $inc to a value of non-numeric type at '{}'", path),
                        )
                        .with_code(14)
                    })?;
                    set_path(doc, path, next)?;
                }
                other => {
                    return Err(DriverError::new(
                        DriverErrorKind::Server,
                        format!("Unknown modifier: {}", other),
                    )
                    .with_code(FAILED_TO_PARSE_CODE));
                }
            }
        }
    }
    Ok(())
}

fn increment(current: &Value, by: &Value) -> Option<Value> {
    match (current.as_i64(), by.as_i64()) {
        (Some(a), Some(b)) => Some(Value::from(a.checked_add(b)?)),
        _ => Some(Value::from(current.as_f64()? + by.as_f64()?)),
    }
}

fn immutable_id() -> DriverError {
    DriverError::new(
        DriverErrorKind::Write,
        "Performing an update on the path '_id' would modify the immutable field '_id'",
    )
    .with_code(IMMUTABLE_FIELD_CODE)
}

/// Replaces the content of `doc`, keeping its `_id`.
pub fn replace(doc: &mut Document, replacement: Document) -> DriverResult<()> {
    if is_update_document(&replacement) {
        return Err(DriverError::new(
            DriverErrorKind::Server,
            "Replacement document must not contain update operators",
        )
        .with_code(FAILED_TO_PARSE_CODE));
    }
    let id = doc.get("_id").cloned();
    if let (Some(existing), Some(incoming)) = (&id, replacement.get("_id")) {
        if !values_equal(existing, incoming) {
            return Err(immutable_id());
        }
    }
    *doc = replacement;
    if let Some(id) = id {
        doc.insert("_id".to_string(), id);
    }
    Ok(())
}

pub fn sort_documents(docs: &mut [Document], sort: &Document) {
    docs.sort_by(|a, b| {
        for (path, direction) in sort {
            let descending = direction.as_i64().map(|d| d < 0).unwrap_or(false);
            let ordering = match (get_path(a, path), get_path(b, path)) {
                (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            let ordering = if descending { ordering.reverse() } else { ordering };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

pub fn project(doc: Document, projection: &Document) -> Document {
    if projection.is_empty() {
        return doc;
    }
    let inclusive = projection
        .iter()
        .any(|(k, v)| k != "_id" && v.as_i64().map(|n| n != 0).unwrap_or(true));
    let keep_id = projection
        .get("_id")
        .map(|v| v.as_i64().map(|n| n != 0).unwrap_or(true))
        .unwrap_or(true);

    let mut projected = Document::new();
    if inclusive {
        if keep_id {
            if let Some(id) = doc.get("_id") {
                projected.insert("_id".to_string(), id.clone());
            }
        }
        for path in projection.keys().filter(|k| k.as_str() != "_id") {
            if let Some(value) = get_path(&doc, path) {
                // Sub-document nesting is preserved for dotted paths.
                let _ = set_path(&mut projected, path, value.clone());
            }
        }
        projected
    } else {
        let mut doc = doc;
        for (path, flag) in projection {
            if flag.as_i64() == Some(0) {
                remove_path(&mut doc, path);
            }
        }
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not a document"),
        }
    }

    #[test]
    fn matches_equality_and_operators() {
        let person = doc(json!({"_id": 1, "name": "a", "age": 30, "tags": ["x", "y"], "address": {"city": "Oslo"}}));
        assert!(matches(&person, &doc(json!({"name": "a"}))).unwrap());
        assert!(matches(&person, &doc(json!({"age": {"$gte": 30, "$lt": 31}}))).unwrap());
        assert!(matches(&person, &doc(json!({"tags": "y"}))).unwrap());
        assert!(matches(&person, &doc(json!({"address.city": "Oslo"}))).unwrap());
        assert!(matches(&person, &doc(json!({"$or": [{"name": "b"}, {"age": {"$in": [29, 30]}}]}))).unwrap());
        assert!(!matches(&person, &doc(json!({"missing": {"$exists": true}}))).unwrap());
        assert!(matches(&person, &doc(json!({"missing": null}))).unwrap());
        assert!(matches(&person, &doc(json!({"$foo": 1}))).is_err());
    }

    #[test]
    fn applies_update_operators() {
        let mut target = doc(json!({"_id": 1, "count": 1, "drop": true}));
        apply_update(
            &mut target,
            &doc(json!({"$set": {"a.b": 2}, "$inc": {"count": 2}, "$unset": {"drop": 1}, "$setOnInsert": {"created": true}})),
            false,
        )
        .unwrap();
        assert_eq!(Value::Object(target), json!({"_id": 1, "count": 3, "a": {"b": 2}}));
    }

    #[test]
    fn refuses_to_change_id() {
        let mut target = doc(json!({"_id": 1, "v": 1}));
        let err = apply_update(&mut target, &doc(json!({"$set": {"_id": 2}})), false).unwrap_err();
        assert_eq!(err.code, Some(IMMUTABLE_FIELD_CODE));
        assert!(replace(&mut target, doc(json!({"_id": 3}))).is_err());
        replace(&mut target, doc(json!({"v": 2}))).unwrap();
        assert_eq!(Value::Object(target), json!({"v": 2, "_id": 1}));
    }

    #[test]
    fn seeds_upsert_from_equalities() {
        let seed = seed_from_filter(&doc(json!({"_id": 7, "version": {"$eq": 2}, "age": {"$gt": 3}}))).unwrap();
        assert_eq!(Value::Object(seed), json!({"_id": 7, "version": 2}));
    }

    #[test]
    fn sorts_and_projects() {
        let mut docs = vec![
            doc(json!({"_id": 1, "n": 2, "s": "b"})),
            doc(json!({"_id": 2, "n": 1, "s": "a"})),
            doc(json!({"_id": 3, "n": 2, "s": "a"})),
        ];
        sort_documents(&mut docs, &doc(json!({"n": -1, "s": 1})));
        let ids: Vec<_> = docs.iter().map(|d| d["_id"].clone()).collect();
        assert_eq!(ids, vec![json!(3), json!(1), json!(2)]);

        let projected = project(docs.remove(0), &doc(json!({"s": 1})));
        assert_eq!(Value::Object(projected), json!({"_id": 3, "s": "a"}));
    }
}
