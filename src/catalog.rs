//! In-process catalog that answers compiled queries without a network.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::compiler::{Direction, PageRequest};
use crate::error::TransportError;
use crate::filter::{FilterNode, Literal, Operator};
use crate::materialize::{Field, Value, coerce};
use crate::registry::PropertyDescriptor;
use crate::transport::{Connection, RawPage, RawRecord, Transport};

/// Records held in memory, served page by page in compiled order.
///
/// Cursor tokens are record offsets. Every page reports `total_matches`.
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    records: Arc<Vec<RawRecord>>,
}

impl MemoryCatalog {
    pub fn new(records: Vec<RawRecord>) -> Self {
        Self {
            records: Arc::new(records),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Answers one page request.
    ///
    /// Raw matchbooks are rejected: only typed filters are evaluated here.
    pub fn page(&self, request: &PageRequest<'_>) -> Result<RawPage, TransportError> {
        let compiled = request.compiled;
        if compiled.is_raw() {
            return Err(TransportError::Status {
                code: 400,
                message: "raw matchbooks cannot be evaluated in memory".to_string(),
            });
        }
        let offset = match request.token() {
            None => 0,
            Some(t) => t
                .parse::<usize>()
                .map_err(|_| TransportError::Status {
                    code: 400,
                    message: format!("invalid cursor `{}`", t),
                })?,
        };

        let mut matched = self
            .records
            .iter()
            .filter(|r| compiled.filter().is_none_or(|f| matches(f, r, false)))
            .collect::<Vec<_>>();

        matched.sort_by(|a, b| {
            compiled
                .order()
                .iter()
                .map(|o| {
                    let ord = compare_fields(o.property, a, b);
                    match o.direction {
                        Direction::Descending if ord_is_between_present(o.property, a, b) => {
                            ord.reverse()
                        }
                        _ => ord,
                    }
                })
                .find(|o| *o != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });

        let total = matched.len();
        let end = offset.saturating_add(compiled.page_size()).min(total);
        let records = matched
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|r| (*r).clone())
            .collect();

        Ok(RawPage {
            records,
            next_cursor: (end < total).then(|| end.to_string()),
            total_matches: Some(total as u64),
        })
    }
}

impl Transport for MemoryCatalog {
    type Connection = MemoryCatalog;

    fn connect(&self) -> Result<Self::Connection, TransportError> {
        Ok(self.clone())
    }
}

impl Connection for MemoryCatalog {
    fn send(&mut self, request: &PageRequest<'_>) -> Result<RawPage, TransportError> {
        self.page(request)
    }
}

/// Evaluates `node` against a raw record. Missing or unparseable fields
/// never match, negated or not.
///
/// `!v` reads the same whether it came from `Ne` or a negated `Eq`: on a
/// list it means no element equals `v`.
pub fn matches(node: &FilterNode, record: &RawRecord, negated: bool) -> bool {
    match node {
        FilterNode::Comparison {
            property,
            op: Operator::Ne,
            value,
        } => test(property, record, !negated, |v| compare(v, Operator::Eq, value)),
        FilterNode::Comparison {
            property,
            op,
            value,
        } => test(property, record, negated, |v| compare(v, *op, value)),
        FilterNode::Range {
            property,
            low,
            high,
        } => test(property, record, negated, |v| {
            compare(v, Operator::Ge, low) && compare(v, Operator::Le, high)
        }),
        FilterNode::InSet { property, values } => test(property, record, negated, |v| {
            values.iter().any(|l| compare(v, Operator::Eq, l))
        }),
        FilterNode::And(children) if negated => children.iter().any(|c| matches(c, record, true)),
        FilterNode::And(children) => children.iter().all(|c| matches(c, record, false)),
        FilterNode::Or(children) if negated => children.iter().all(|c| matches(c, record, true)),
        FilterNode::Or(children) => children.iter().any(|c| matches(c, record, false)),
        FilterNode::Not(child) => matches(child, record, !negated),
    }
}

/// Applies `pred` to a scalar, or to any element of a list.
fn test(
    property: &PropertyDescriptor,
    record: &RawRecord,
    negated: bool,
    pred: impl Fn(&Value) -> bool,
) -> bool {
    match coerce(property, record.get(property.remote_key)) {
        Field::Present(Value::List(items)) => items.iter().any(&pred) != negated,
        Field::Present(v) => pred(&v) != negated,
        Field::Absent | Field::Unparseable(_) => false,
    }
}

fn compare(value: &Value, op: Operator, literal: &Literal) -> bool {
    let ord = match (value, literal) {
        (Value::Number(a), Literal::Number(b)) => a.partial_cmp(b),
        (Value::String(a), Literal::String(b)) => {
            if op == Operator::Contains {
                return a.contains(b.as_str());
            }
            Some(a.as_str().cmp(b.as_str()))
        }
        (Value::Boolean(a), Literal::Boolean(b)) => Some(a.cmp(b)),
        _ => None,
    };
    let Some(ord) = ord else {
        return false;
    };
    match op {
        Operator::Eq => ord == Ordering::Equal,
        Operator::Ne => ord != Ordering::Equal,
        Operator::Lt => ord == Ordering::Less,
        Operator::Le => ord != Ordering::Greater,
        Operator::Gt => ord == Ordering::Greater,
        Operator::Ge => ord != Ordering::Less,
        Operator::Contains => false,
    }
}

fn sort_key(property: &PropertyDescriptor, record: &RawRecord) -> Option<Value> {
    match coerce(property, record.get(property.remote_key)) {
        Field::Present(v) => Some(v),
        _ => None,
    }
}

/// Present values first, in ascending order; missing values last.
fn compare_fields(property: &PropertyDescriptor, a: &RawRecord, b: &RawRecord) -> Ordering {
    match (sort_key(property, a), sort_key(property, b)) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x.total_cmp(&y),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

fn ord_is_between_present(property: &PropertyDescriptor, a: &RawRecord, b: &RawRecord) -> bool {
    sort_key(property, a).is_some() && sort_key(property, b).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{QueryRequest, compile};
    use crate::filter::{comparison, eq, gt, in_set, not, range};
    use serde_json::json;

    fn catalog() -> MemoryCatalog {
        MemoryCatalog::new(
            [
                json!({"auid": "aflow:03", "density": 7.8, "species": ["Fe"]}),
                json!({"auid": "aflow:01", "density": 2.7, "species": ["Al"]}),
                json!({"auid": "aflow:02", "density": "n/a", "species": ["Fe", "Ni"]}),
                json!({"density": 8.9, "species": ["Ni"]}),
            ]
            .into_iter()
            .filter_map(|v| v.as_object().cloned())
            .collect(),
        )
    }

    fn auids(page: &RawPage) -> Vec<Option<&str>> {
        page.records
            .iter()
            .map(|r| r.get("auid").and_then(|v| v.as_str()))
            .collect()
    }

    #[test]
    fn evaluates_and_orders_by_fallback() {
        let cat = catalog();
        let compiled = compile(&QueryRequest::new().filter(in_set("species", ["Fe", "Ni"]).unwrap())).unwrap();
        let page = cat.page(&compiled.page(None).unwrap()).unwrap();
        assert_eq!(auids(&page), [Some("aflow:02"), Some("aflow:03"), None]);
        assert_eq!(page.total_matches, Some(3));
        assert_eq!(page.next_cursor, None);
    }

    #[test]
    fn missing_values_never_match() {
        let cat = catalog();
        let compiled = compile(&QueryRequest::new().filter(not(gt("density", 5).unwrap()))).unwrap();
        let page = cat.page(&compiled.page(None).unwrap()).unwrap();
        // "n/a" density is unparseable and excluded even under negation
        assert_eq!(auids(&page), [Some("aflow:01")]);
    }

    #[test]
    fn pages_by_offset() {
        let cat = catalog();
        let compiled = compile(&QueryRequest::new().page_size(3)).unwrap();
        let first = cat.page(&compiled.page(None).unwrap()).unwrap();
        assert_eq!(first.records.len(), 3);
        assert_eq!(first.next_cursor.as_deref(), Some("3"));

        let cursor = compiled.cursor("3");
        let second = cat.page(&compiled.page(Some(&cursor)).unwrap()).unwrap();
        assert_eq!(auids(&second), [None]);
        assert_eq!(second.next_cursor, None);
    }

    #[test]
    fn descending_order_keeps_missing_last() {
        let cat = catalog();
        let compiled = compile(
            &QueryRequest::new()
                .order_by("density", Direction::Descending)
                .unwrap(),
        )
        .unwrap();
        let page = cat.page(&compiled.page(None).unwrap()).unwrap();
        assert_eq!(
            auids(&page),
            [None, Some("aflow:03"), Some("aflow:01"), Some("aflow:02")]
        );
    }

    #[test]
    fn list_equality_means_membership() {
        let record = catalog().records[2].clone();
        assert!(matches(&eq("species", "Ni").unwrap(), &record, false));
        assert!(!matches(&eq("species", "Al").unwrap(), &record, false));
        assert!(matches(&eq("species", "Al").unwrap(), &record, true));
        assert!(!matches(&range("density", 0, 10).unwrap(), &record, false));
    }

    #[test]
    fn same_matchbook_selects_same_records() {
        let cat = MemoryCatalog::new(
            [
                json!({"auid": "aflow:01", "species": ["Fe", "Ni"]}),
                json!({"auid": "aflow:02", "species": ["Al"]}),
            ]
            .into_iter()
            .filter_map(|v| v.as_object().cloned())
            .collect(),
        );
        let ne = compile(
            &QueryRequest::new().filter(comparison("species", Operator::Ne, "Fe").unwrap()),
        )
        .unwrap();
        let not_eq = compile(&QueryRequest::new().filter(not(eq("species", "Fe").unwrap()))).unwrap();
        assert_eq!(ne.matchbook(), not_eq.matchbook());

        let a = cat.page(&ne.page(None).unwrap()).unwrap();
        let b = cat.page(&not_eq.page(None).unwrap()).unwrap();
        assert_eq!(auids(&a), [Some("aflow:02")]);
        assert_eq!(auids(&a), auids(&b));

        // negating `Ne` gives back membership
        let not_ne = compile(
            &QueryRequest::new().filter(not(comparison("species", Operator::Ne, "Fe").unwrap())),
        )
        .unwrap();
        let c = cat.page(&not_ne.page(None).unwrap()).unwrap();
        assert_eq!(auids(&c), [Some("aflow:01")]);
    }

    #[test]
    fn raw_matchbooks_are_rejected() {
        let compiled = crate::compiler::compile_raw("species(Fe)", 10).unwrap();
        let err = catalog().page(&compiled.page(None).unwrap()).unwrap_err();
        assert!(matches!(err, TransportError::Status { code: 400, .. }));
    }
}
