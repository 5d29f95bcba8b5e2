//! Composable filter expressions.
//!
//! Every constructor checks its property against the registry and the
//! literal against the property's kind, so a tree that exists is well typed.
//! Nodes are immutable; combinators build new nodes around shared children
//! and never flatten (that happens in the compiler).

use std::fmt;
use std::ops;
use std::sync::Arc;

use crate::error::{AflowError, Result};
use crate::registry::{PropertyDescriptor, ValueKind, resolve};

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Number(f64),
    String(String),
    Boolean(bool),
}

impl Literal {
    pub fn kind(&self) -> ValueKind {
        match self {
            Literal::Number(_) => ValueKind::Number,
            Literal::String(_) => ValueKind::String,
            Literal::Boolean(_) => ValueKind::Boolean,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Number(n) => write!(f, "{}", n),
            Literal::String(s) => f.write_str(s),
            Literal::Boolean(b) => write!(f, "{}", b),
        }
    }
}

impl From<f64> for Literal {
    fn from(v: f64) -> Self {
        Literal::Number(v)
    }
}

impl From<i64> for Literal {
    fn from(v: i64) -> Self {
        Literal::Number(v as f64)
    }
}

impl From<i32> for Literal {
    fn from(v: i32) -> Self {
        Literal::Number(f64::from(v))
    }
}

impl From<&str> for Literal {
    fn from(v: &str) -> Self {
        Literal::String(v.to_string())
    }
}

impl From<String> for Literal {
    fn from(v: String) -> Self {
        Literal::String(v)
    }
}

impl From<bool> for Literal {
    fn from(v: bool) -> Self {
        Literal::Boolean(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Substring match on string values.
    Contains,
}

impl Operator {
    /// Operator selecting exactly the present values this one rejects.
    pub(crate) fn negate(self) -> Option<Operator> {
        match self {
            Operator::Eq => Some(Operator::Ne),
            Operator::Ne => Some(Operator::Eq),
            Operator::Lt => Some(Operator::Ge),
            Operator::Le => Some(Operator::Gt),
            Operator::Gt => Some(Operator::Le),
            Operator::Ge => Some(Operator::Lt),
            Operator::Contains => None,
        }
    }

    pub(crate) fn is_ordering(self) -> bool {
        matches!(
            self,
            Operator::Lt | Operator::Le | Operator::Gt | Operator::Ge
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterNode {
    Comparison {
        property: &'static PropertyDescriptor,
        op: Operator,
        value: Literal,
    },
    /// Inclusive on both ends.
    Range {
        property: &'static PropertyDescriptor,
        low: Literal,
        high: Literal,
    },
    InSet {
        property: &'static PropertyDescriptor,
        values: Arc<[Literal]>,
    },
    And(Arc<[FilterNode]>),
    Or(Arc<[FilterNode]>),
    Not(Arc<FilterNode>),
}

fn check_literal(property: &PropertyDescriptor, literal: &Literal) -> Result<()> {
    let expected = property.literal_kind();
    if expected == ValueKind::Unknown || expected == literal.kind() {
        return Ok(());
    }
    Err(AflowError::TypeMismatch {
        property: property.name.to_string(),
        expected,
        found: literal.kind(),
    })
}

pub fn comparison(property: &str, op: Operator, value: impl Into<Literal>) -> Result<FilterNode> {
    let property = resolve(property)?;
    let value = value.into();
    check_literal(property, &value)?;
    Ok(FilterNode::Comparison {
        property,
        op,
        value,
    })
}

pub fn range(property: &str, low: impl Into<Literal>, high: impl Into<Literal>) -> Result<FilterNode> {
    let property = resolve(property)?;
    let (low, high) = (low.into(), high.into());
    check_literal(property, &low)?;
    check_literal(property, &high)?;
    Ok(FilterNode::Range {
        property,
        low,
        high,
    })
}

pub fn in_set<I, L>(property: &str, values: I) -> Result<FilterNode>
where
    I: IntoIterator<Item = L>,
    L: Into<Literal>,
{
    let property = resolve(property)?;
    let values = values
        .into_iter()
        .map(|v| {
            let v = v.into();
            check_literal(property, &v).map(|_| v)
        })
        .collect::<Result<Arc<[Literal]>>>()?;
    Ok(FilterNode::InSet { property, values })
}

pub fn and<I: IntoIterator<Item = FilterNode>>(nodes: I) -> FilterNode {
    FilterNode::And(nodes.into_iter().collect())
}

pub fn or<I: IntoIterator<Item = FilterNode>>(nodes: I) -> FilterNode {
    FilterNode::Or(nodes.into_iter().collect())
}

pub fn not(node: FilterNode) -> FilterNode {
    FilterNode::Not(Arc::new(node))
}

pub fn eq(property: &str, value: impl Into<Literal>) -> Result<FilterNode> {
    comparison(property, Operator::Eq, value)
}

pub fn lt(property: &str, value: impl Into<Literal>) -> Result<FilterNode> {
    comparison(property, Operator::Lt, value)
}

pub fn gt(property: &str, value: impl Into<Literal>) -> Result<FilterNode> {
    comparison(property, Operator::Gt, value)
}

pub fn contains(property: &str, value: impl Into<Literal>) -> Result<FilterNode> {
    comparison(property, Operator::Contains, value)
}

impl ops::BitAnd for FilterNode {
    type Output = FilterNode;

    fn bitand(self, rhs: FilterNode) -> FilterNode {
        and([self, rhs])
    }
}

impl ops::BitOr for FilterNode {
    type Output = FilterNode;

    fn bitor(self, rhs: FilterNode) -> FilterNode {
        or([self, rhs])
    }
}

impl ops::Not for FilterNode {
    type Output = FilterNode;

    fn not(self) -> FilterNode {
        not(self)
    }
}
