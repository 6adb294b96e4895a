//! Shared filter grammar used by both the vector and lexical store adapters
//! (§4.4): a conjunction of per-field clauses, each a scalar, a list
//! (any-of), or a range. Grounded on `_build_filter` from the vector-store
//! side and the `filter` clause construction on the lexical-store side of
//! the system this spec was distilled from.

use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Scalar(ScalarValue),
    AnyOf(Vec<ScalarValue>),
    Range(RangeValue),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Str(String),
    Int(i64),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeValue {
    pub gte: Option<i64>,
    pub lte: Option<i64>,
    pub gt: Option<i64>,
    pub lt: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub clauses: BTreeMap<String, FilterValue>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_eq(mut self, field: impl Into<String>, value: impl Into<ScalarValue>) -> Self {
        self.clauses.insert(field.into(), FilterValue::Scalar(value.into()));
        self
    }

    pub fn with_any_of(mut self, field: impl Into<String>, values: Vec<ScalarValue>) -> Self {
        self.clauses.insert(field.into(), FilterValue::AnyOf(values));
        self
    }

    pub fn with_range(mut self, field: impl Into<String>, range: RangeValue) -> Self {
        self.clauses.insert(field.into(), FilterValue::Range(range));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Render as a LanceDB SQL-ish predicate string (`only_if`).
    pub fn to_lance_predicate(&self) -> Option<String> {
        if self.clauses.is_empty() {
            return None;
        }
        let mut parts = Vec::new();
        for (field, value) in &self.clauses {
            match value {
                FilterValue::Scalar(s) => parts.push(format!("{field} = {}", s.to_sql())),
                FilterValue::AnyOf(values) => {
                    let list = values.iter().map(ScalarValue::to_sql).collect::<Vec<_>>().join(", ");
                    parts.push(format!("{field} IN ({list})"));
                }
                FilterValue::Range(r) => {
                    if let Some(v) = r.gte {
                        parts.push(format!("{field} >= {v}"));
                    }
                    if let Some(v) = r.lte {
                        parts.push(format!("{field} <= {v}"));
                    }
                    if let Some(v) = r.gt {
                        parts.push(format!("{field} > {v}"));
                    }
                    if let Some(v) = r.lt {
                        parts.push(format!("{field} < {v}"));
                    }
                }
            }
        }
        Some(parts.join(" AND "))
    }
}

impl ScalarValue {
    fn to_sql(&self) -> String {
        match self {
            ScalarValue::Str(s) => format!("'{}'", s.replace('\'', "''")),
            ScalarValue::Int(i) => i.to_string(),
        }
    }
}

impl From<&str> for ScalarValue {
    fn from(value: &str) -> Self {
        ScalarValue::Str(value.to_string())
    }
}
impl From<String> for ScalarValue {
    fn from(value: String) -> Self {
        ScalarValue::Str(value)
    }
}
impl From<i64> for ScalarValue {
    fn from(value: i64) -> Self {
        ScalarValue::Int(value)
    }
}
impl From<u32> for ScalarValue {
    fn from(value: u32) -> Self {
        ScalarValue::Int(value as i64)
    }
}
