//! Conversion of raw AFLUX entries into typed records.
//!
//! Materialization never fails. A missing field is [`Field::Absent`]; a
//! field that does not parse as its property's kind is
//! [`Field::Unparseable`] and leaves a warning on the record.

use serde::Serialize;
use serde_json::Value as Json;
use tracing::debug;

use crate::registry::{PropertyDescriptor, ValueKind};
use crate::transport::RawRecord;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    String(String),
    Boolean(bool),
    List(Vec<Value>),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum Field {
    Present(Value),
    Absent,
    /// The remote value, as JSON text.
    Unparseable(String),
}

impl Field {
    pub fn value(&self) -> Option<&Value> {
        match self {
            Field::Present(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Field::Absent)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaterializeWarning {
    pub property: &'static str,
    pub expected: ValueKind,
    pub raw: String,
}

/// A typed AFLOW entry, fields in selection order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    fields: Vec<(&'static str, Field)>,
    warnings: Vec<MaterializeWarning>,
}

impl Record {
    /// `None` when the property was not selected.
    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|(n, _)| *n == name).map(|(_, f)| f)
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.get(name).and_then(Field::value)
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.value(name).and_then(Value::as_f64)
    }

    pub fn string(&self, name: &str) -> Option<&str> {
        self.value(name).and_then(Value::as_str)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&'static str, &Field)> {
        self.fields.iter().map(|(n, f)| (*n, f))
    }

    pub fn warnings(&self) -> &[MaterializeWarning] {
        &self.warnings
    }
}

pub fn materialize(raw: &RawRecord, selected: &[&'static PropertyDescriptor]) -> Record {
    let mut fields = Vec::with_capacity(selected.len());
    let mut warnings = Vec::new();

    for property in selected {
        let field = coerce(property, raw.get(property.remote_key));
        if let Field::Unparseable(text) = &field {
            debug!(
                property = property.name,
                expected = %property.value_kind,
                raw = %text,
                "unparseable field"
            );
            warnings.push(MaterializeWarning {
                property: property.name,
                expected: property.value_kind,
                raw: text.clone(),
            });
        }
        fields.push((property.name, field));
    }

    Record { fields, warnings }
}

/// Typed view of one raw value. `null` counts as absent.
pub(crate) fn coerce(property: &PropertyDescriptor, raw: Option<&Json>) -> Field {
    let raw = match raw {
        None | Some(Json::Null) => return Field::Absent,
        Some(v) => v,
    };
    let parsed = match property.value_kind {
        ValueKind::List => parse_list(raw, property.item_kind.unwrap_or(ValueKind::Unknown)),
        kind => parse_scalar(raw, kind),
    };
    match parsed {
        Some(v) => Field::Present(v),
        None => Field::Unparseable(raw.to_string()),
    }
}

fn parse_scalar(raw: &Json, kind: ValueKind) -> Option<Value> {
    match (kind, raw) {
        (ValueKind::Number, Json::Number(n)) => n.as_f64().map(Value::Number),
        // legacy entries carry numbers as strings
        (ValueKind::Number, Json::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|n| n.is_finite())
            .map(Value::Number),
        (ValueKind::String, Json::String(s)) => Some(Value::String(s.clone())),
        (ValueKind::Boolean, Json::Bool(b)) => Some(Value::Boolean(*b)),
        (ValueKind::Boolean, Json::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" => Some(Value::Boolean(true)),
            "false" | "f" => Some(Value::Boolean(false)),
            _ => None,
        },
        (ValueKind::List, _) => parse_list(raw, ValueKind::Unknown),
        (ValueKind::Unknown, _) => infer(raw),
        _ => None,
    }
}

fn parse_list(raw: &Json, item: ValueKind) -> Option<Value> {
    match raw {
        Json::Array(items) => items
            .iter()
            .map(|v| parse_scalar(v, item))
            .collect::<Option<Vec<_>>>()
            .map(Value::List),
        // "Fe,Ni" style encoding
        Json::String(s) if s.trim().is_empty() => Some(Value::List(Vec::new())),
        Json::String(s) => s
            .split(',')
            .map(|part| parse_scalar(&Json::String(part.trim().to_string()), item))
            .collect::<Option<Vec<_>>>()
            .map(Value::List),
        _ => None,
    }
}

fn infer(raw: &Json) -> Option<Value> {
    match raw {
        Json::Number(n) => n.as_f64().map(Value::Number),
        Json::String(s) => Some(Value::String(s.clone())),
        Json::Bool(b) => Some(Value::Boolean(*b)),
        Json::Array(items) => items
            .iter()
            .map(infer)
            .collect::<Option<Vec<_>>>()
            .map(Value::List),
        Json::Null | Json::Object(_) => None,
    }
}
