//! Turns a [`QueryRequest`] into an AFLUX matchbook.
//!
//! Compilation is pure: the same request always yields the same
//! [`CompiledRequest`], including its fingerprint.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use crate::error::{AflowError, Result};
use crate::filter::{FilterNode, Literal, Operator};
use crate::registry::{FALLBACK_KEY, PropertyDescriptor, ValueKind, fallback, keyword, resolve};

/// Default number of records requested per page.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Characters a string literal may carry. Everything else either has a
/// meaning in AFLUX syntax or changes the request URL.
fn is_literal_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OrderBy {
    pub property: &'static PropertyDescriptor,
    pub direction: Direction,
}

/// A logical query before compilation.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    select: Vec<&'static PropertyDescriptor>,
    filter: Option<FilterNode>,
    order_by: Option<OrderBy>,
    page_size: usize,
}

impl Default for QueryRequest {
    fn default() -> Self {
        Self {
            select: Vec::new(),
            filter: None,
            order_by: None,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl QueryRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds properties to the selection. Duplicates are ignored and the
    /// first occurrence fixes the position.
    pub fn select<I, S>(mut self, names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            let property = resolve(name.as_ref())?;
            if !self.select.contains(&property) {
                self.select.push(property);
            }
        }
        Ok(self)
    }

    pub fn filter(mut self, filter: FilterNode) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn order_by(mut self, name: &str, direction: Direction) -> Result<Self> {
        let property = resolve(name)?;
        self.order_by = Some(OrderBy {
            property,
            direction,
        });
        Ok(self)
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn selected(&self) -> &[&'static PropertyDescriptor] {
        &self.select
    }
}

/// Opaque position inside a compiled query's result set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cursor {
    query: u64,
    token: String,
}

impl Cursor {
    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Wire-level form of a query, sent verbatim by transports.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRequest {
    matchbook: String,
    filter: Option<FilterNode>,
    select: Arc<[&'static PropertyDescriptor]>,
    order: Vec<OrderBy>,
    page_size: usize,
    fingerprint: u64,
    raw: bool,
}

impl CompiledRequest {
    /// AFLUX matchbook without paging or format directives.
    pub fn matchbook(&self) -> &str {
        &self.matchbook
    }

    pub fn filter(&self) -> Option<&FilterNode> {
        self.filter.as_ref()
    }

    pub fn selected(&self) -> &Arc<[&'static PropertyDescriptor]> {
        &self.select
    }

    /// Sort keys, always ending with the fallback key.
    pub fn order(&self) -> &[OrderBy] {
        &self.order
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// Built by [`compile_raw`]: the matchbook was given verbatim and there
    /// is no typed filter behind it.
    pub fn is_raw(&self) -> bool {
        self.raw
    }

    /// Binds a transport-issued token to this query.
    pub fn cursor(&self, token: impl Into<String>) -> Cursor {
        Cursor {
            query: self.fingerprint,
            token: token.into(),
        }
    }

    /// Request for the page at `cursor`, or the first page.
    pub fn page<'a>(&'a self, cursor: Option<&'a Cursor>) -> Result<PageRequest<'a>> {
        if let Some(c) = cursor {
            if c.query != self.fingerprint {
                return Err(AflowError::CursorMismatch);
            }
        }
        Ok(PageRequest {
            compiled: self,
            cursor,
        })
    }
}

/// One page of a compiled query, as handed to a transport connection.
#[derive(Debug, Clone, Copy)]
pub struct PageRequest<'a> {
    pub compiled: &'a CompiledRequest,
    pub cursor: Option<&'a Cursor>,
}

impl PageRequest<'_> {
    pub fn token(&self) -> Option<&str> {
        self.cursor.map(Cursor::token)
    }
}

/// Negation-free intermediate form.
#[derive(Debug)]
enum Term {
    Leaf {
        key: &'static str,
        expr: String,
    },
    All(Vec<Term>),
    Any(Vec<Term>),
}

pub fn compile(request: &QueryRequest) -> Result<CompiledRequest> {
    if request.page_size == 0 {
        return Err(AflowError::InvalidPageSize);
    }

    let mut parts = Vec::new();
    let mut mentioned = Vec::new();

    if let Some(filter) = &request.filter {
        let term = normalize(filter, false)?;
        collect_keys(&term, &mut mentioned);
        match term {
            Term::All(children) => parts.extend(children.iter().map(render)),
            other => parts.push(render(&other)),
        }
    }

    let select: Arc<[&'static PropertyDescriptor]> = if request.select.is_empty() {
        Arc::from(vec![fallback()])
    } else {
        Arc::from(request.select.clone())
    };

    for property in select.iter() {
        if !mentioned.contains(&property.remote_key) {
            parts.push(property.remote_key.to_string());
            mentioned.push(property.remote_key);
        }
    }

    let mut order = Vec::new();
    if let Some(order_by) = request.order_by {
        match order_by.property.value_kind {
            ValueKind::Number | ValueKind::String => order.push(order_by),
            kind => {
                return Err(AflowError::UnsupportedFilter(format!(
                    "cannot order by `{}` ({} values)",
                    order_by.property.name, kind
                )));
            }
        }
    }
    if order.iter().all(|o| o.property.name != FALLBACK_KEY) {
        order.push(OrderBy {
            property: fallback(),
            direction: Direction::Ascending,
        });
    }
    let keys = order
        .iter()
        .map(|o| match o.direction {
            Direction::Ascending => o.property.remote_key.to_string(),
            Direction::Descending => format!("-{}", o.property.remote_key),
        })
        .collect::<Vec<_>>();
    parts.push(format!("$order({})", keys.join(",")));

    let matchbook = parts.join(",");

    Ok(CompiledRequest {
        fingerprint: fingerprint(&matchbook, request.page_size),
        matchbook,
        filter: request.filter.clone(),
        select,
        order,
        page_size: request.page_size,
        raw: false,
    })
}

fn fingerprint(matchbook: &str, page_size: usize) -> u64 {
    let mut hasher = DefaultHasher::new();
    matchbook.hash(&mut hasher);
    page_size.hash(&mut hasher);
    hasher.finish()
}

/// Checks a hand-written matchbook and wraps it for execution.
///
/// The grammar accepted is the one [`compile`] emits: terms separated by
/// `,` (and) or `:` (or), each either a parenthesized group or an AFLUX
/// keyword with an optional `(...)` condition. Every keyword must be known
/// to [`keyword`]; directives (`$...`) are added by the executor and are
/// rejected here. Records are materialized under their AFLUX keywords, in
/// the order the keywords first appear.
pub fn compile_raw(matchbook: &str, page_size: usize) -> Result<CompiledRequest> {
    if page_size == 0 {
        return Err(AflowError::InvalidPageSize);
    }

    let mut parser = RawParser {
        text: matchbook,
        pos: 0,
        keywords: Vec::new(),
    };
    parser.terms()?;
    if parser.pos != matchbook.len() {
        return Err(parser.error("unexpected character"));
    }

    let matchbook = format!("{},$order({})", matchbook, FALLBACK_KEY);
    Ok(CompiledRequest {
        fingerprint: fingerprint(&matchbook, page_size),
        matchbook,
        filter: None,
        select: Arc::from(parser.keywords),
        order: vec![OrderBy {
            property: fallback(),
            direction: Direction::Ascending,
        }],
        page_size,
        raw: true,
    })
}

struct RawParser<'a> {
    text: &'a str,
    pos: usize,
    keywords: Vec<&'static PropertyDescriptor>,
}

impl RawParser<'_> {
    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn error(&self, what: &str) -> AflowError {
        AflowError::UnsupportedFilter(format!(
            "{} at offset {} in matchbook {:?}",
            what, self.pos, self.text
        ))
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn terms(&mut self) -> Result<()> {
        loop {
            self.term()?;
            if !(self.eat(',') || self.eat(':')) {
                return Ok(());
            }
        }
    }

    fn term(&mut self) -> Result<()> {
        if self.eat('(') {
            self.terms()?;
            if !self.eat(')') {
                return Err(self.error("unclosed group"));
            }
            return Ok(());
        }

        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("expected a keyword"));
        }
        let property = keyword(&self.text[start..self.pos])?;
        if !self.keywords.contains(&property) {
            self.keywords.push(property);
        }

        if self.eat('(') {
            let start = self.pos;
            while self
                .peek()
                .is_some_and(|c| is_literal_char(c) || matches!(c, '*' | '!' | ',' | ':'))
            {
                self.pos += 1;
            }
            if start == self.pos {
                return Err(self.error("empty condition"));
            }
            if !self.eat(')') {
                return Err(self.error("unclosed condition"));
            }
        }
        Ok(())
    }
}

fn unsupported(property: &PropertyDescriptor, what: &str) -> AflowError {
    AflowError::UnsupportedFilter(format!(
        "{} on `{}` ({} values)",
        what, property.name, property.value_kind
    ))
}

fn normalize(node: &FilterNode, negated: bool) -> Result<Term> {
    match node {
        FilterNode::Comparison {
            property,
            op,
            value,
        } => comparison_term(property, *op, value, negated),
        FilterNode::Range {
            property,
            low,
            high,
        } => {
            if property.literal_kind() != ValueKind::Number
                || property.value_kind == ValueKind::List
            {
                return Err(unsupported(property, "range"));
            }
            let (lo, hi) = (number(low), number(high));
            if lo > hi {
                return Err(AflowError::UnsupportedFilter(format!(
                    "empty range {}..={} on `{}`",
                    low, high, property.name
                )));
            }
            if negated {
                return Ok(Term::Any(vec![
                    comparison_term(property, Operator::Lt, low, false)?,
                    comparison_term(property, Operator::Gt, high, false)?,
                ]));
            }
            Ok(leaf(
                property,
                format!("{}*,*{}", literal(property, low)?, literal(property, high)?),
            ))
        }
        FilterNode::InSet { property, values } => {
            if values.is_empty() {
                return Err(unsupported(property, "empty set"));
            }
            if negated {
                let terms = values
                    .iter()
                    .map(|v| comparison_term(property, Operator::Ne, v, false))
                    .collect::<Result<Vec<_>>>()?;
                return Ok(Term::All(terms));
            }
            let rendered = values
                .iter()
                .map(|v| literal(property, v))
                .collect::<Result<Vec<_>>>()?;
            Ok(leaf(property, rendered.join(":")))
        }
        FilterNode::And(children) => group(children, negated, !negated),
        FilterNode::Or(children) => group(children, negated, negated),
        FilterNode::Not(child) => normalize(child, !negated),
    }
}

/// Builds an All (`all == true`) or Any group, flattening nested groups of
/// the same kind.
fn group(children: &[FilterNode], negated: bool, all: bool) -> Result<Term> {
    if children.is_empty() {
        return Err(AflowError::UnsupportedFilter(
            "empty and/or combinator".to_string(),
        ));
    }
    let mut out = Vec::with_capacity(children.len());
    for child in children {
        match (normalize(child, negated)?, all) {
            (Term::All(inner), true) | (Term::Any(inner), false) => out.extend(inner),
            (term, _) => out.push(term),
        }
    }
    if out.len() == 1 {
        return Ok(out.remove(0));
    }
    Ok(if all { Term::All(out) } else { Term::Any(out) })
}

fn comparison_term(
    property: &'static PropertyDescriptor,
    op: Operator,
    value: &Literal,
    negated: bool,
) -> Result<Term> {
    let kind = property.literal_kind();
    let is_list = property.value_kind == ValueKind::List;

    if op.is_ordering() && (kind != ValueKind::Number || is_list) {
        return Err(unsupported(property, "ordering comparison"));
    }
    if op == Operator::Contains && (kind != ValueKind::String || is_list) {
        return Err(unsupported(property, "substring match"));
    }

    let v = literal(property, value)?;
    let op = if negated {
        match op.negate() {
            Some(op) => op,
            None => return Ok(leaf(property, format!("!*{}*", v))),
        }
    } else {
        op
    };

    let expr = match op {
        Operator::Eq => v,
        Operator::Ne => format!("!{}", v),
        Operator::Le => format!("*{}", v),
        Operator::Ge => format!("{}*", v),
        Operator::Lt => format!("*{v},!{v}"),
        Operator::Gt => format!("{v}*,!{v}"),
        Operator::Contains => format!("*{}*", v),
    };
    Ok(leaf(property, expr))
}

fn leaf(property: &'static PropertyDescriptor, expr: String) -> Term {
    Term::Leaf {
        key: property.remote_key,
        expr,
    }
}

fn number(l: &Literal) -> f64 {
    match l {
        Literal::Number(n) => *n,
        _ => f64::NAN,
    }
}

fn literal(property: &PropertyDescriptor, value: &Literal) -> Result<String> {
    match value {
        Literal::Number(n) if !n.is_finite() => Err(AflowError::UnsupportedFilter(format!(
            "non-finite number {} on `{}`",
            n, property.name
        ))),
        Literal::String(s) if s.is_empty() || !s.chars().all(is_literal_char) => {
            Err(AflowError::UnsupportedFilter(format!(
                "string {:?} on `{}` is empty or has characters outside [A-Za-z0-9._-]",
                s, property.name
            )))
        }
        other => Ok(other.to_string()),
    }
}

fn collect_keys(term: &Term, out: &mut Vec<&'static str>) {
    match term {
        Term::Leaf { key, .. } => {
            if !out.contains(key) {
                out.push(*key);
            }
        }
        Term::All(children) | Term::Any(children) => {
            for child in children {
                collect_keys(child, out);
            }
        }
    }
}

fn render(term: &Term) -> String {
    match term {
        Term::Leaf { key, expr } => format!("{}({})", key, expr),
        Term::All(children) => format!(
            "({})",
            children.iter().map(render).collect::<Vec<_>>().join(",")
        ),
        Term::Any(children) => format!(
            "({})",
            children.iter().map(render).collect::<Vec<_>>().join(":")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{and, comparison, contains, eq, gt, in_set, lt, not, or, range};

    fn matchbook(filter: FilterNode) -> String {
        compile(&QueryRequest::new().filter(filter))
            .unwrap()
            .matchbook()
            .to_string()
    }

    #[test]
    fn renders_leaves() {
        assert_eq!(
            matchbook(range("density", 2.0, 5.5).unwrap()),
            "density(2*,*5.5),auid,$order(auid)"
        );
        assert_eq!(
            matchbook(in_set("species", ["Fe", "Ni"]).unwrap()),
            "species(Fe:Ni),auid,$order(auid)"
        );
        assert_eq!(
            matchbook(lt("band_gap", 1).unwrap()),
            "Egap(*1,!1),auid,$order(auid)"
        );
        assert_eq!(
            matchbook(contains("compound", "O2").unwrap()),
            "compound(*O2*),auid,$order(auid)"
        );
    }

    #[test]
    fn flattens_nested_and() {
        let a = gt("band_gap", 1).unwrap();
        let b = eq("is_metal", false).unwrap();
        let c = in_set("species", ["Fe"]).unwrap();

        let flat = matchbook(and([a.clone(), b.clone(), c.clone()]));
        let left = matchbook(and([and([a.clone(), b.clone()]), c.clone()]));
        let right = matchbook(and([a, and([b, c])]));
        assert_eq!(flat, left);
        assert_eq!(flat, right);
        assert_eq!(flat, "Egap(1*,!1),is_metal(false),species(Fe),auid,$order(auid)");
    }

    #[test]
    fn groups_or_inside_and() {
        let q = and([
            or([eq("species", "Fe").unwrap(), eq("species", "Co").unwrap()]),
            gt("natoms", 4).unwrap(),
        ]);
        assert_eq!(
            matchbook(q),
            "(species(Fe):species(Co)),natoms(4*,!4),auid,$order(auid)"
        );
    }

    #[test]
    fn pushes_negation_to_leaves() {
        let q = not(and([
            range("density", 2, 3).unwrap(),
            in_set("species", ["Fe", "Ni"]).unwrap(),
        ]));
        assert_eq!(
            matchbook(q),
            "(density(*2,!2):density(3*,!3):(species(!Fe),species(!Ni))),auid,$order(auid)"
        );
        assert_eq!(
            matchbook(not(not(eq("density", 1).unwrap()))),
            "density(1),auid,$order(auid)"
        );
    }

    #[test]
    fn selection_and_order() {
        let request = QueryRequest::new()
            .select(["compound", "band_gap", "compound"])
            .unwrap()
            .filter(gt("band_gap", 0).unwrap())
            .order_by("band_gap", Direction::Descending)
            .unwrap()
            .page_size(50);
        let compiled = compile(&request).unwrap();
        assert_eq!(
            compiled.matchbook(),
            "Egap(0*,!0),compound,$order(-Egap,auid)"
        );
        assert_eq!(compiled.page_size(), 50);
        assert_eq!(compiled.selected().len(), 2);
        assert_eq!(compiled.order().last().unwrap().property.name, "auid");
    }

    #[test]
    fn rejects_unsupported_combinations() {
        let cases = [
            lt("compound", "B").unwrap(),
            contains("density", 2).unwrap(),
            lt("species", "Fe").unwrap(),
            range("density", 5, 2).unwrap(),
            in_set("species", Vec::<&str>::new()).unwrap(),
            and([]),
            eq("compound", "Fe O").unwrap(),
            comparison("prototype", Operator::Eq, "A(B)").unwrap(),
        ];
        for filter in cases {
            let err = compile(&QueryRequest::new().filter(filter.clone())).unwrap_err();
            assert!(
                matches!(err, AflowError::UnsupportedFilter(_)),
                "{:?} gave {:?}",
                filter,
                err
            );
        }

        let err = compile(
            &QueryRequest::new()
                .order_by("species", Direction::Ascending)
                .unwrap(),
        )
        .unwrap_err();
        assert!(matches!(err, AflowError::UnsupportedFilter(_)));
    }

    #[test]
    fn zero_page_size_is_rejected() {
        let err = compile(&QueryRequest::new().page_size(0)).unwrap_err();
        assert!(matches!(err, AflowError::InvalidPageSize));
    }

    #[test]
    fn cursors_are_bound_to_their_query() {
        let a = compile(&QueryRequest::new().filter(gt("density", 1).unwrap())).unwrap();
        let b = compile(&QueryRequest::new().filter(gt("density", 2).unwrap())).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());

        let cursor = a.cursor("2");
        assert_eq!(a.page(Some(&cursor)).unwrap().token(), Some("2"));
        assert!(matches!(
            b.page(Some(&cursor)),
            Err(AflowError::CursorMismatch)
        ));
    }

    #[test]
    fn literals_outside_the_url_safe_set_are_rejected() {
        for bad in ["A#B", "50%", "A+B", "Fe/O", "A&B", "é"] {
            let err = compile(&QueryRequest::new().filter(eq("prototype", bad).unwrap())).unwrap_err();
            assert!(matches!(err, AflowError::UnsupportedFilter(_)), "{:?}", bad);
        }
        assert_eq!(
            matchbook(eq("prototype", "A_cF4_225_a").unwrap()),
            "prototype(A_cF4_225_a),auid,$order(auid)"
        );
        assert_eq!(
            matchbook(eq("dft_type", "PAW_PBE-1.0").unwrap()),
            "dft_type(PAW_PBE-1.0),auid,$order(auid)"
        );
    }

    #[test]
    fn raw_matchbooks_keep_keywords_in_order() {
        let compiled = compile_raw("species(Fe:Ni),Egap(1*,*3),(nspecies(2):nspecies(3)),ael_bulk_modulus_vrh", 50).unwrap();
        assert!(compiled.is_raw());
        assert_eq!(
            compiled.matchbook(),
            "species(Fe:Ni),Egap(1*,*3),(nspecies(2):nspecies(3)),ael_bulk_modulus_vrh,$order(auid)"
        );
        let names = compiled.selected().iter().map(|p| p.name).collect::<Vec<_>>();
        assert_eq!(names, ["species", "Egap", "nspecies", "ael_bulk_modulus_vrh"]);
        assert_eq!(compiled.selected()[1].value_kind, ValueKind::Number);
        assert_eq!(compiled.selected()[3].value_kind, ValueKind::Unknown);
        assert_eq!(compiled.page_size(), 50);
    }

    #[test]
    fn raw_matchbooks_are_validated() {
        for bad in [
            "",
            "species(Fe),",
            "species(Fe",
            "species()",
            "(species(Fe)",
            "species(Fe) ",
            "species(A#B)",
            "Egap(1*),$paging(2)",
            "notakeyword(1)",
            "band_gap(1*)",
        ] {
            let err = compile_raw(bad, 10).unwrap_err();
            assert!(
                matches!(err, AflowError::UnsupportedFilter(_) | AflowError::UnknownProperty(_)),
                "{:?} gave {:?}",
                bad,
                err
            );
        }
        assert!(matches!(compile_raw("auid", 0), Err(AflowError::InvalidPageSize)));
    }

    #[test]
    fn identical_wire_queries_share_cursors() {
        let typed = compile(&QueryRequest::new().filter(eq("species", "Fe").unwrap())).unwrap();
        let raw = compile_raw("species(Fe),auid", typed.page_size()).unwrap();
        assert_eq!(raw.matchbook(), typed.matchbook());
        assert_eq!(raw.fingerprint(), typed.fingerprint());
        // same wire query, so a cursor from one is valid for the other
        assert!(raw.page(Some(&typed.cursor("2"))).is_ok());
    }
}

