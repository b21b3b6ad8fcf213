//! Free-form collected data records and helpers shared by host and guest

use serde_json::{Map, Value};

/// A collected data record: string keys mapping to arbitrary JSON values
pub type Record = Map<String, Value>;

/// Recursively merge `input` into `target`.
///
/// Nested objects are merged key by key; any other value in `input`
/// replaces the value in `target`.
pub fn merge_records(target: &mut Record, input: Record) {
    for (key, value) in input {
        match (target.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_records(existing, incoming);
            }
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

/// Wall-clock time in fractional seconds since the Unix epoch
pub fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

/// Value at a dotted path such as `"memory.available"`
pub fn lookup<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = record.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Numeric value at a dotted path
pub fn lookup_f64(record: &Record, path: &str) -> Option<f64> {
    lookup(record, path)?.as_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_merge_nested_objects() {
        let mut merged = Record::new();
        merge_records(&mut merged, record(json!({"a": {"x": 1}})));
        merge_records(&mut merged, record(json!({"a": {"y": 2}})));

        assert_eq!(Value::Object(merged), json!({"a": {"x": 1, "y": 2}}));
    }

    #[test]
    fn test_merge_later_wins() {
        let mut merged = record(json!({"a": {"x": 1}, "b": 1}));
        merge_records(&mut merged, record(json!({"a": {"x": 5}, "b": {"c": 2}})));

        assert_eq!(Value::Object(merged), json!({"a": {"x": 5}, "b": {"c": 2}}));
    }

    #[test]
    fn test_merge_object_replaces_scalar_and_back() {
        let mut merged = record(json!({"a": {"x": 1}}));
        merge_records(&mut merged, record(json!({"a": 3})));
        assert_eq!(Value::Object(merged.clone()), json!({"a": 3}));

        merge_records(&mut merged, record(json!({"a": {"y": 1}})));
        assert_eq!(Value::Object(merged), json!({"a": {"y": 1}}));
    }

    #[test]
    fn test_lookup_f64() {
        let data = record(json!({"memory": {"available": 1024.5}, "flag": true}));
        assert_eq!(lookup_f64(&data, "memory.available"), Some(1024.5));
        assert_eq!(lookup_f64(&data, "memory.missing"), None);
        assert_eq!(lookup_f64(&data, "flag"), None);
    }
}
