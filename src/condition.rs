//! Condition Evaluator for edge guards.
//!
//! Grammar: `{{var}} <op> [value]` atoms, `op` one of `exists`, `not exists`,
//! `equals`, `not_equals`, `contains`, `not_contains`, chained with `AND` / `OR`.
//! Chains fold strictly left to right: `a OR b AND c` is `(a OR b) AND c`.

use std::{fmt, str::FromStr};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::{
    flow::model::Edge,
    template::{is_present, resolve_expr, unquote, value_to_string},
};

static CONNECTIVE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+(AND|OR)\s+").unwrap());
static ATOM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?is)^\{\{\s*(.+?)\s*\}\}\s*(not\s+exists|exists|not_equals|equals|not_contains|contains|==|!=)(?:\s+(.*))?$",
    )
    .unwrap()
});

#[derive(Debug, Error, Clone, PartialEq)]
#[error("{reason} in `{expr}`")]
pub struct ConditionParseError {
    pub expr: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Exists,
    NotExists,
    Equals,
    NotEquals,
    Contains,
    NotContains,
}

impl Operator {
    fn needs_value(self) -> bool {
        !matches!(self, Operator::Exists | Operator::NotExists)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connective {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub var: String,
    pub op: Operator,
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    first: Predicate,
    rest: Vec<(Connective, Predicate)>,
}

impl FromStr for Condition {
    type Err = ConditionParseError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let err = |reason: &str| ConditionParseError {
            expr: expr.to_string(),
            reason: reason.to_string(),
        };
        if expr.trim().is_empty() {
            return Err(err("empty condition"));
        }

        let mut atoms = Vec::new();
        let mut connectives = Vec::new();
        let mut last = 0;
        let shielded = shielded_spans(expr);
        for caps in CONNECTIVE.captures_iter(expr) {
            let whole = caps.get(0).ok_or_else(|| err("bad connective"))?;
            if shielded.iter().any(|&(from, to)| whole.start() >= from && whole.start() < to) {
                continue;
            }
            atoms.push(&expr[last..whole.start()]);
            connectives.push(if &caps[1] == "AND" {
                Connective::And
            } else {
                Connective::Or
            });
            last = whole.end();
        }
        atoms.push(&expr[last..]);

        let mut predicates = atoms
            .into_iter()
            .map(|atom| parse_predicate(atom).map_err(|reason| err(&reason)))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter();
        let first = predicates.next().ok_or_else(|| err("empty condition"))?;
        Ok(Condition {
            first,
            rest: connectives.into_iter().zip(predicates).collect(),
        })
    }
}

/// Byte ranges of `{{...}}` expressions and quoted values, where `AND`/`OR`
/// are literal text. A quote only opens at the start of a word and must close.
fn shielded_spans(expr: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut i = 0;
    while i < expr.len() {
        let rest = &expr[i..];
        if rest.starts_with("{{") {
            let end = rest.find("}}").map(|e| i + e + 2).unwrap_or(expr.len());
            spans.push((i, end));
            i = end;
            continue;
        }
        let Some(c) = rest.chars().next() else { break };
        let word_start = expr[..i].chars().next_back().is_none_or(char::is_whitespace);
        if (c == '"' || c == '\'') && word_start {
            if let Some(close) = rest[1..].find(c) {
                let end = i + 1 + close + 1;
                spans.push((i, end));
                i = end;
                continue;
            }
        }
        i += c.len_utf8();
    }
    spans
}

fn parse_predicate(atom: &str) -> Result<Predicate, String> {
    let caps = ATOM
        .captures(atom.trim())
        .ok_or_else(|| format!("cannot parse `{}`", atom.trim()))?;
    let var = caps[1].to_string();
    let op = match caps[2].to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ").as_str() {
        "exists" => Operator::Exists,
        "not exists" => Operator::NotExists,
        "equals" | "==" => Operator::Equals,
        "not_equals" | "!=" => Operator::NotEquals,
        "contains" => Operator::Contains,
        "not_contains" => Operator::NotContains,
        other => return Err(format!("unknown operator `{}`", other)),
    };
    let value = caps
        .get(3)
        .map(|m| m.as_str().trim().to_string())
        .filter(|v| !v.is_empty());
    if op.needs_value() && value.is_none() {
        return Err(format!("operator `{}` needs a value", &caps[2]));
    }
    if !op.needs_value() && value.is_some() {
        return Err(format!("unexpected value after `{}`", &caps[2]));
    }
    Ok(Predicate { var, op, value })
}

impl Condition {
    pub fn evaluate(&self, scope: &Value) -> bool {
        self.rest
            .iter()
            .fold(self.first.evaluate(scope), |acc, (conn, pred)| match conn {
                Connective::And => acc && pred.evaluate(scope),
                Connective::Or => acc || pred.evaluate(scope),
            })
    }

    /// True when the chain mixes `AND` and `OR`.
    pub fn is_mixed(&self) -> bool {
        let has_and = self.rest.iter().any(|(c, _)| *c == Connective::And);
        let has_or = self.rest.iter().any(|(c, _)| *c == Connective::Or);
        has_and && has_or
    }

    pub fn predicates(&self) -> impl Iterator<Item = &Predicate> {
        std::iter::once(&self.first).chain(self.rest.iter().map(|(_, p)| p))
    }
}

impl Predicate {
    pub fn evaluate(&self, scope: &Value) -> bool {
        let resolved = resolve_expr(&self.var, scope).unwrap_or(Value::Null);
        let expected = self
            .value
            .as_deref()
            .map(|v| unquote(v).unwrap_or(v).trim().to_string())
            .unwrap_or_default();
        match self.op {
            Operator::Exists => is_present(&resolved),
            Operator::NotExists => !is_present(&resolved),
            Operator::Equals => same(&resolved, &expected),
            Operator::NotEquals => !same(&resolved, &expected),
            Operator::Contains => contains(&resolved, &expected),
            Operator::NotContains => !contains(&resolved, &expected),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operator::Exists => "exists",
            Operator::NotExists => "not exists",
            Operator::Equals => "equals",
            Operator::NotEquals => "not_equals",
            Operator::Contains => "contains",
            Operator::NotContains => "not_contains",
        };
        f.write_str(s)
    }
}

fn same(actual: &Value, expected: &str) -> bool {
    let actual = value_to_string(actual);
    let actual = actual.trim();
    if actual.to_lowercase() == expected.to_lowercase() {
        return true;
    }
    match (actual.parse::<f64>(), expected.parse::<f64>()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn contains(actual: &Value, expected: &str) -> bool {
    match actual {
        Value::Null => false,
        Value::Array(items) => items.iter().any(|item| same(item, expected)),
        other => value_to_string(other)
            .to_lowercase()
            .contains(&expected.to_lowercase()),
    }
}

/// Evaluate a guard string. Unparseable guards are false.
pub fn evaluate(expr: &str, scope: &Value) -> bool {
    match expr.parse::<Condition>() {
        Ok(cond) => cond.evaluate(scope),
        Err(e) => {
            warn!("🛑 unparseable guard treated as false: {}", e);
            false
        }
    }
}

/// First edge, in declaration order, whose guard holds. Unguarded edges always hold.
pub fn select_edge<'a>(edges: &'a [Edge], scope: &Value) -> Option<&'a Edge> {
    edges.iter().find(|edge| match edge.condition.as_deref() {
        None => true,
        Some(expr) if expr.trim().is_empty() => true,
        Some(expr) => evaluate(expr, scope),
    })
}
