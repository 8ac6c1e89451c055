//! Dotted / indexed field paths over JSON values (`order.lines[0].sku`).

use core::fmt;
use core::str::FromStr;

use serde_json::{Map, Value as JsonValue};

use crate::error::MappingError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// A parsed field path.
///
/// A missing key or out-of-range index reads as *undefined* (`None`); an explicit
/// JSON `null` is a present value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    raw: String,
    segments: Vec<Segment>,
}

impl FieldPath {
    pub fn parse(raw: &str) -> Result<Self, MappingError> {
        let err = |reason: &str| MappingError::InvalidPath {
            path: raw.to_string(),
            reason: reason.to_string(),
        };

        if raw.is_empty() {
            return Err(err("empty path"));
        }

        let mut segments = Vec::new();
        let mut key = String::new();
        let mut after_index = false;
        let mut chars = raw.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '.' => {
                    if key.is_empty() && !after_index {
                        return Err(err("empty segment"));
                    }
                    if chars.peek().is_none() {
                        return Err(err("trailing `.`"));
                    }
                    if !key.is_empty() {
                        segments.push(Segment::Key(std::mem::take(&mut key)));
                    }
                    after_index = false;
                }
                '[' => {
                    if !key.is_empty() {
                        segments.push(Segment::Key(std::mem::take(&mut key)));
                    }
                    let mut digits = String::new();
                    loop {
                        match chars.next() {
                            Some(']') => break,
                            Some(d) if d.is_ascii_digit() => digits.push(d),
                            Some(_) => return Err(err("array index must be a non-negative integer")),
                            None => return Err(err("unclosed `[`")),
                        }
                    }
                    let index = digits
                        .parse::<usize>()
                        .map_err(|_| err("array index must be a non-negative integer"))?;
                    segments.push(Segment::Index(index));
                    after_index = true;
                }
                ']' => return Err(err("unexpected `]`")),
                other => {
                    if after_index {
                        return Err(err("expected `.` or `[` after an index"));
                    }
                    key.push(other);
                }
            }
        }
        if !key.is_empty() {
            segments.push(Segment::Key(key));
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Value at this path, or `None` when any segment is absent.
    pub fn get<'a>(&self, value: &'a JsonValue) -> Option<&'a JsonValue> {
        self.segments.iter().try_fold(value, |cur, seg| match seg {
            Segment::Key(k) => cur.get(k.as_str()),
            Segment::Index(i) => cur.get(*i),
        })
    }

    /// Write `value` at this path, creating intermediate objects/arrays.
    ///
    /// `null` slots are replaced by the container the next segment needs; arrays are
    /// padded with `null` up to the index. Walking through a scalar is an error.
    pub fn set(&self, target: &mut JsonValue, value: JsonValue) -> Result<(), MappingError> {
        let mut cur = target;
        for seg in &self.segments {
            cur = match seg {
                Segment::Key(k) => {
                    if cur.is_null() {
                        *cur = JsonValue::Object(Map::new());
                    }
                    let found = kind_of(cur);
                    cur.as_object_mut()
                        .ok_or_else(|| self.conflict(format!("expected an object at `{k}`, found {found}")))?
                        .entry(k.clone())
                        .or_insert(JsonValue::Null)
                }
                Segment::Index(i) => {
                    if cur.is_null() {
                        *cur = JsonValue::Array(Vec::new());
                    }
                    let found = kind_of(cur);
                    let items = cur
                        .as_array_mut()
                        .ok_or_else(|| self.conflict(format!("expected an array at [{i}], found {found}")))?;
                    if items.len() <= *i {
                        items.resize(*i + 1, JsonValue::Null);
                    }
                    &mut items[*i]
                }
            };
        }
        *cur = value;
        Ok(())
    }

    fn conflict(&self, reason: String) -> MappingError {
        MappingError::PathConflict {
            path: self.raw.clone(),
            reason,
        }
    }
}

pub(crate) fn kind_of(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

impl FromStr for FieldPath {
    type Err = MappingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_nested_and_indexed_segments() {
        let path = FieldPath::parse("a.items[0].sku").unwrap();
        assert_eq!(
            path.segments(),
            &[
                Segment::Key("a".into()),
                Segment::Key("items".into()),
                Segment::Index(0),
                Segment::Key("sku".into()),
            ]
        );
        assert_eq!(FieldPath::parse("grid[1][2]").unwrap().segments().len(), 3);
    }

    #[test]
    fn rejects_malformed_paths() {
        for bad in ["", ".a", "a..b", "a.", "a[x]", "a[1", "a]", "a[0]b", "a[]"] {
            assert!(FieldPath::parse(bad).is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn missing_is_none_but_null_is_present() {
        let doc = json!({"a": {"b": null, "list": [1]}});
        assert_eq!(FieldPath::parse("a.b").unwrap().get(&doc), Some(&JsonValue::Null));
        assert_eq!(FieldPath::parse("a.c").unwrap().get(&doc), None);
        assert_eq!(FieldPath::parse("a.list[3]").unwrap().get(&doc), None);
    }

    #[test]
    fn set_creates_intermediate_containers() {
        let mut doc = JsonValue::Null;
        FieldPath::parse("order.lines[1].sku").unwrap().set(&mut doc, json!("ABC")).unwrap();
        assert_eq!(doc, json!({"order": {"lines": [null, {"sku": "ABC"}]}}));
    }

    #[test]
    fn set_through_scalar_fails() {
        let mut doc = json!({"name": "widget"});
        let err = FieldPath::parse("name.first").unwrap().set(&mut doc, json!("x")).unwrap_err();
        assert!(matches!(err, MappingError::PathConflict { .. }));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn segment() -> impl Strategy<Value = Segment> {
            prop_oneof![
                "[a-z][a-z0-9_]{0,5}".prop_map(Segment::Key),
                (0usize..4).prop_map(Segment::Index),
            ]
        }

        fn render(segments: &[Segment]) -> String {
            let mut out = String::new();
            for seg in segments {
                match seg {
                    Segment::Key(k) => {
                        if !out.is_empty() {
                            out.push('.');
                        }
                        out.push_str(k);
                    }
                    Segment::Index(i) => out.push_str(&format!("[{i}]")),
                }
            }
            out
        }

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 128,
                ..ProptestConfig::default()
            })]

            /// Property: a value written at a path reads back unchanged.
            #[test]
            fn set_then_get_returns_value(
                segments in prop::collection::vec(segment(), 1..5),
                n in any::<i64>(),
            ) {
                let path = FieldPath::parse(&render(&segments)).unwrap();
                prop_assert_eq!(path.segments(), segments.as_slice());

                let mut doc = JsonValue::Null;
                path.set(&mut doc, json!(n)).unwrap();
                prop_assert_eq!(path.get(&doc), Some(&json!(n)));
            }
        }
    }
}
