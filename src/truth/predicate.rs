//! `must_show` predicates evaluated against evidence payloads.
//!
//! Grammar: `term (&& term)*` where `term := field op literal`. Fields are
//! dotted paths into the JSON payload, `op` is one of `== != < <= > >=`, and a
//! literal is a number, `true`, `false`, or a quoted string. An empty
//! predicate matches any payload.

use regex::Regex;
use serde_json::Value;
use std::str::FromStr;
use std::sync::LazyLock;

use crate::errors::GateError;

static TERM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\s*(==|!=|<=|>=|<|>)\s*(.+?)\s*$").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Number(f64),
    Bool(bool),
    Str(String),
}

#[derive(Debug, Clone, PartialEq)]
struct Term {
    path: Vec<String>,
    op: Op,
    literal: Literal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    source: String,
    terms: Vec<Term>,
}

impl Predicate {
    pub fn source(&self) -> &str {
        &self.source
    }

    /// True when every term holds. A missing field fails its term.
    pub fn matches(&self, payload: &Value) -> bool {
        self.terms.iter().all(|t| t.matches(payload))
    }
}

impl std::fmt::Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for Predicate {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |message: String| GateError::InvalidPredicate {
            expr: s.to_string(),
            message,
        };
        if s.trim().is_empty() {
            return Ok(Self {
                source: String::new(),
                terms: Vec::new(),
            });
        }

        let mut terms = Vec::new();
        for raw in s.split("&&") {
            let cap = TERM
                .captures(raw)
                .ok_or_else(|| invalid(format!("cannot parse term '{}'", raw.trim())))?;
            let op = match &cap[2] {
                "==" => Op::Eq,
                "!=" => Op::Ne,
                "<" => Op::Lt,
                "<=" => Op::Le,
                ">" => Op::Gt,
                _ => Op::Ge,
            };
            let literal = parse_literal(&cap[3]).ok_or_else(|| invalid(format!("bad literal '{}'", &cap[3])))?;
            if !matches!(literal, Literal::Number(_)) && !matches!(op, Op::Eq | Op::Ne) {
                return Err(invalid(format!("'{}' only compares numbers", &cap[2])));
            }
            terms.push(Term {
                path: cap[1].split('.').map(str::to_string).collect(),
                op,
                literal,
            });
        }
        Ok(Self {
            source: s.trim().to_string(),
            terms,
        })
    }
}

fn parse_literal(raw: &str) -> Option<Literal> {
    match raw {
        "true" => return Some(Literal::Bool(true)),
        "false" => return Some(Literal::Bool(false)),
        _ => {}
    }
    for quote in ['"', '\''] {
        if raw.len() >= 2 && raw.starts_with(quote) && raw.ends_with(quote) {
            return Some(Literal::Str(raw[1..raw.len() - 1].to_string()));
        }
    }
    raw.parse::<f64>().ok().map(Literal::Number)
}

impl Term {
    fn matches(&self, payload: &Value) -> bool {
        let mut value = payload;
        for key in &self.path {
            match value.get(key) {
                Some(v) => value = v,
                None => return false,
            }
        }

        match &self.literal {
            Literal::Number(expected) => {
                let Some(actual) = value.as_f64() else {
                    return false;
                };
                match self.op {
                    Op::Eq => actual == *expected,
                    Op::Ne => actual != *expected,
                    Op::Lt => actual < *expected,
                    Op::Le => actual <= *expected,
                    Op::Gt => actual > *expected,
                    Op::Ge => actual >= *expected,
                }
            }
            Literal::Bool(expected) => match value.as_bool() {
                Some(actual) => (actual == *expected) == (self.op == Op::Eq),
                None => false,
            },
            Literal::Str(expected) => match value.as_str() {
                Some(actual) => (actual == expected) == (self.op == Op::Eq),
                None => false,
            },
        }
    }
}
