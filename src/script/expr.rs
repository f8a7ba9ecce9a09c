//! Embedded expression language
//!
//! The `${ ... }$` blocks of a script hold a small, closed language:
//! assignments, integer arithmetic, string concatenation, comparisons,
//! indexing into JSON results and a fixed set of built-in functions. It is
//! evaluated against an [`Env`] passed in by the caller, so variables set in
//! one block stay visible to later blocks and to `$name` references.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value as Json;

use crate::common::{Error, Result};

/// A value produced by an expression or stored in the environment
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    Json(Json),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Str(_) => "string",
            Value::Json(_) => "json",
        }
    }

    fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Str(s) => !s.is_empty(),
            Value::Json(j) => !j.is_null(),
        }
    }

    /// Lift a JSON value into the most specific scalar variant
    pub fn from_json(json: Json) -> Self {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::String(s) => Value::Str(s),
            Json::Number(ref n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Json(json),
            },
            other => Value::Json(other),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Json(j) => write!(f, "{j}"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

/// Variables visible to scripts
#[derive(Debug, Default, Clone)]
pub struct Env {
    vars: HashMap<String, Value>,
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.vars.insert(name.into(), value.into());
    }
}

/// Which output-matching primitive an expectation uses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expectation {
    Literal(String),
    Regex(String),
    Json,
    RelativeTime,
    IsoTime,
}

/// Receiver of expectations raised by built-in functions
pub trait ExpectHost {
    /// Check an expectation against pending output.
    ///
    /// Returns the named captures of a regex expectation (empty otherwise).
    fn expect(&mut self, expectation: Expectation) -> Result<HashMap<String, String>>;
}

// === Lexing ===

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Int(i64),
    Str(String),
    Ident(String),
    Op(&'static str),
    Sep,
}

const OPERATORS: [&str; 15] = [
    "==", "!=", "=", "+", "-", "*", "/", "%", "!", "(", ")", "[", "]", ",", ";",
];

fn lex(src: &str) -> Result<Vec<Tok>> {
    let mut toks = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '\n' {
            toks.push(Tok::Sep);
            i += 1;
        } else if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let digits: String = chars[start..i].iter().collect();
            let n = digits
                .parse()
                .map_err(|_| Error::Expression(format!("integer literal out of range: {digits}")))?;
            toks.push(Tok::Int(n));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            toks.push(Tok::Ident(chars[start..i].iter().collect()));
        } else if c == '"' || c == '\'' {
            let (s, next) = lex_string(&chars, i)?;
            toks.push(Tok::Str(s));
            i = next;
        } else {
            let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
            let op = OPERATORS
                .iter()
                .find(|op| rest.starts_with(**op))
                .ok_or_else(|| Error::Expression(format!("unexpected character '{c}'")))?;
            if *op == ";" {
                toks.push(Tok::Sep);
            } else {
                toks.push(Tok::Op(*op));
            }
            i += op.len();
        }
    }

    Ok(toks)
}

fn lex_string(chars: &[char], start: usize) -> Result<(String, usize)> {
    let quote = chars[start];
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => {
                let escaped = chars
                    .get(i + 1)
                    .ok_or_else(|| Error::Expression("unterminated string literal".to_string()))?;
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    other => *other,
                });
                i += 2;
            }
            c if c == quote => return Ok((out, i + 1)),
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Err(Error::Expression("unterminated string literal".to_string()))
}

// === Parsing ===

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Var(String),
    Unary(&'static str, Box<Expr>),
    Binary(&'static str, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    Index(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone)]
enum Stmt {
    Assign(String, Expr),
    Expr(Expr),
}

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn peek_op(&self, op: &str) -> bool {
        matches!(self.peek(), Some(Tok::Op(o)) if *o == op)
    }

    fn next(&mut self) -> Option<Tok> {
        let tok = self.toks.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expect_op(&mut self, op: &str) -> Result<()> {
        match self.next() {
            Some(Tok::Op(o)) if o == op => Ok(()),
            other => Err(Error::Expression(format!("expected '{op}', found {other:?}"))),
        }
    }

    fn program(&mut self) -> Result<Vec<Stmt>> {
        let mut stmts = Vec::new();
        loop {
            while matches!(self.peek(), Some(Tok::Sep)) {
                self.pos += 1;
            }
            if self.peek().is_none() {
                return Ok(stmts);
            }
            stmts.push(self.statement()?);
            match self.peek() {
                None | Some(Tok::Sep) => {}
                Some(other) => {
                    return Err(Error::Expression(format!("unexpected {other:?} after statement")))
                }
            }
        }
    }

    fn statement(&mut self) -> Result<Stmt> {
        if let (Some(Tok::Ident(name)), Some(Tok::Op("="))) =
            (self.toks.get(self.pos), self.toks.get(self.pos + 1))
        {
            let name = name.clone();
            self.pos += 2;
            return Ok(Stmt::Assign(name, self.expr()?));
        }
        Ok(Stmt::Expr(self.expr()?))
    }

    fn expr(&mut self) -> Result<Expr> {
        let mut lhs = self.additive()?;
        while let Some(op) = ["==", "!="].into_iter().find(|op| self.peek_op(op)) {
            self.pos += 1;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(self.additive()?));
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Expr> {
        let mut lhs = self.term()?;
        while let Some(op) = ["+", "-"].into_iter().find(|op| self.peek_op(op)) {
            self.pos += 1;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(self.term()?));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr> {
        let mut lhs = self.unary()?;
        while let Some(op) = ["*", "/", "%"].into_iter().find(|op| self.peek_op(op)) {
            self.pos += 1;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(self.unary()?));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr> {
        if let Some(op) = ["-", "!"].into_iter().find(|op| self.peek_op(op)) {
            self.pos += 1;
            return Ok(Expr::Unary(op, Box::new(self.unary()?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.peek_op("(") {
                let Expr::Var(name) = expr else {
                    return Err(Error::Expression("only named functions can be called".to_string()));
                };
                self.pos += 1;
                let mut args = Vec::new();
                if !self.peek_op(")") {
                    loop {
                        args.push(self.expr()?);
                        if self.peek_op(",") {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                self.expect_op(")")?;
                expr = Expr::Call(name, args);
            } else if self.peek_op("[") {
                self.pos += 1;
                let index = self.expr()?;
                self.expect_op("]")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Tok::Int(i)) => Ok(Expr::Literal(Value::Int(i))),
            Some(Tok::Str(s)) => Ok(Expr::Literal(Value::Str(s))),
            Some(Tok::Ident(name)) => Ok(match name.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" => Expr::Literal(Value::Null),
                _ => Expr::Var(name),
            }),
            Some(Tok::Op("(")) => {
                let inner = self.expr()?;
                self.expect_op(")")?;
                Ok(inner)
            }
            Some(other) => Err(Error::Expression(format!("unexpected {other:?}"))),
            None => Err(Error::Expression("unexpected end of expression".to_string())),
        }
    }
}

// === Evaluation ===

/// Evaluate a program, returning the value of its last bare expression
pub fn eval(src: &str, env: &mut Env, host: &mut dyn ExpectHost) -> Result<Value> {
    let toks = lex(src)?;
    let program = Parser { toks, pos: 0 }.program()?;

    let mut result = Value::Null;
    for stmt in &program {
        match stmt {
            Stmt::Assign(name, expr) => {
                let value = eval_expr(expr, env, host)?;
                env.set(name.clone(), value);
                result = Value::Null;
            }
            Stmt::Expr(expr) => result = eval_expr(expr, env, host)?,
        }
    }
    Ok(result)
}

fn eval_expr(expr: &Expr, env: &mut Env, host: &mut dyn ExpectHost) -> Result<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Var(name) => env
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Expression(format!("undefined variable '{name}'"))),
        Expr::Unary(op, inner) => {
            let v = eval_expr(inner, env, host)?;
            match (*op, v) {
                ("-", Value::Int(i)) => i
                    .checked_neg()
                    .map(Value::Int)
                    .ok_or_else(|| Error::Expression("integer overflow".to_string())),
                ("!", v) => Ok(Value::Bool(!v.truthy())),
                (op, v) => Err(Error::Expression(format!(
                    "cannot apply '{op}' to {}",
                    v.type_name()
                ))),
            }
        }
        Expr::Binary(op, lhs, rhs) => {
            let l = eval_expr(lhs, env, host)?;
            let r = eval_expr(rhs, env, host)?;
            binary(op, l, r)
        }
        Expr::Index(target, index) => {
            let t = eval_expr(target, env, host)?;
            let i = eval_expr(index, env, host)?;
            index_value(t, i)
        }
        Expr::Call(name, args) => {
            let args = args
                .iter()
                .map(|a| eval_expr(a, env, host))
                .collect::<Result<Vec<_>>>()?;
            call(name, args, host)
        }
    }
}

fn binary(op: &str, l: Value, r: Value) -> Result<Value> {
    let overflow = || Error::Expression("integer overflow".to_string());
    match (op, l, r) {
        ("==", l, r) => Ok(Value::Bool(l == r)),
        ("!=", l, r) => Ok(Value::Bool(l != r)),
        ("+", Value::Int(a), Value::Int(b)) => a.checked_add(b).map(Value::Int).ok_or_else(overflow),
        ("+", l @ Value::Str(_), r) | ("+", l, r @ Value::Str(_)) => {
            Ok(Value::Str(format!("{l}{r}")))
        }
        ("-", Value::Int(a), Value::Int(b)) => a.checked_sub(b).map(Value::Int).ok_or_else(overflow),
        ("*", Value::Int(a), Value::Int(b)) => a.checked_mul(b).map(Value::Int).ok_or_else(overflow),
        ("/" | "%", Value::Int(_), Value::Int(0)) => {
            Err(Error::Expression("division by zero".to_string()))
        }
        ("/", Value::Int(a), Value::Int(b)) => a.checked_div(b).map(Value::Int).ok_or_else(overflow),
        ("%", Value::Int(a), Value::Int(b)) => a.checked_rem(b).map(Value::Int).ok_or_else(overflow),
        (op, l, r) => Err(Error::Expression(format!(
            "unsupported operands for '{op}': {} and {}",
            l.type_name(),
            r.type_name()
        ))),
    }
}

fn index_value(target: Value, index: Value) -> Result<Value> {
    let missing = |what: String| Error::Expression(format!("no element {what}"));
    match (target, index) {
        (Value::Json(Json::Object(map)), Value::Str(key)) => map
            .get(&key)
            .cloned()
            .map(Value::from_json)
            .ok_or_else(|| missing(format!("'{key}'"))),
        (Value::Json(Json::Array(items)), Value::Int(i)) => usize::try_from(i)
            .ok()
            .and_then(|i| items.get(i).cloned())
            .map(Value::from_json)
            .ok_or_else(|| missing(format!("at index {i}"))),
        (Value::Str(s), Value::Int(i)) => usize::try_from(i)
            .ok()
            .and_then(|i| s.chars().nth(i))
            .map(|c| Value::Str(c.to_string()))
            .ok_or_else(|| missing(format!("at index {i}"))),
        (t, i) => Err(Error::Expression(format!(
            "cannot index {} with {}",
            t.type_name(),
            i.type_name()
        ))),
    }
}

fn call(name: &str, args: Vec<Value>, host: &mut dyn ExpectHost) -> Result<Value> {
    let arity = |n: usize| -> Result<()> {
        if args.len() == n {
            Ok(())
        } else {
            Err(Error::Expression(format!(
                "{name}() takes {n} argument(s), got {}",
                args.len()
            )))
        }
    };

    match name {
        "str" => {
            arity(1)?;
            Ok(Value::Str(args[0].to_string()))
        }
        "int" => {
            arity(1)?;
            match &args[0] {
                Value::Int(i) => Ok(Value::Int(*i)),
                Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                Value::Str(s) => s
                    .trim()
                    .parse()
                    .map(Value::Int)
                    .map_err(|_| Error::Expression(format!("cannot convert '{s}' to int"))),
                other => Err(Error::Expression(format!(
                    "cannot convert {} to int",
                    other.type_name()
                ))),
            }
        }
        "len" => {
            arity(1)?;
            let n = match &args[0] {
                Value::Str(s) => s.chars().count(),
                Value::Json(Json::Array(a)) => a.len(),
                Value::Json(Json::Object(o)) => o.len(),
                other => {
                    return Err(Error::Expression(format!(
                        "{} has no length",
                        other.type_name()
                    )))
                }
            };
            i64::try_from(n)
                .map(Value::Int)
                .map_err(|_| Error::Expression("length out of range".to_string()))
        }
        "expect_str" => {
            arity(1)?;
            host.expect(Expectation::Literal(args[0].to_string()))?;
            Ok(Value::Null)
        }
        "expect_regex" | "regex" => {
            arity(1)?;
            let Value::Str(pattern) = &args[0] else {
                return Err(Error::Expression(format!("{name}() expects a string pattern")));
            };
            let groups = host.expect(Expectation::Regex(pattern.clone()))?;
            let object = groups
                .into_iter()
                .map(|(k, v)| (k, Json::String(v)))
                .collect();
            Ok(Value::Json(Json::Object(object)))
        }
        "expect_json" => {
            arity(0)?;
            host.expect(Expectation::Json)?;
            Ok(Value::Null)
        }
        "expect_reltime" => {
            arity(0)?;
            host.expect(Expectation::RelativeTime)?;
            Ok(Value::Null)
        }
        "expect_isotime" => {
            arity(0)?;
            host.expect(Expectation::IsoTime)?;
            Ok(Value::Null)
        }
        _ => Err(Error::Expression(format!("unknown function '{name}'"))),
    }
}
