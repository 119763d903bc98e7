//! Restricted condition expressions for step `when` and include `condition` fields.
//!
//! Conditions are evaluated by a small interpreter over a variable map; there
//! is no access to anything but the values handed in. The grammar:
//!
//! ```text
//! expr       := or
//! or         := and (("||" | "or") and)*
//! and        := unary (("&&" | "and") unary)*
//! unary      := ("!" | "not") unary | comparison
//! comparison := primary (("==" | "!=" | "<" | "<=" | ">" | ">=" | "in" | "not in") primary)?
//! primary    := number | string | "true" | "false" | "null"
//!             | identifier ("." identifier)*
//!             | "(" expr ")" | "[" (expr ("," expr)*)? "]"
//! ```
//!
//! Truthiness follows the usual scripting rules: `null`, `false`, `0`, `""`,
//! `[]` and `{}` are false. Unknown variables evaluate to `null`.
//!
//! # Examples
//!
//! ```
//! use serde_json::{Map, json};
//! use tplkit::descriptor::expression::evaluate_condition;
//!
//! let mut vars = Map::new();
//! vars.insert("framework".to_string(), json!("react"));
//! vars.insert("port".to_string(), json!(8080));
//!
//! assert!(evaluate_condition("framework == 'react' && port > 3000", &vars).unwrap());
//! assert!(!evaluate_condition("useAuth", &vars).unwrap());
//! ```

use regex::Regex;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::sync::LazyLock;
use thiserror::Error;

/// A condition failed to tokenize or parse.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} at position {position}")]
pub struct ExpressionError {
    /// Byte offset into the expression text
    pub position: usize,
    /// What went wrong
    pub message: String,
}

impl ExpressionError {
    fn new(position: usize, message: impl Into<String>) -> Self {
        Self {
            position,
            message: message.into(),
        }
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

/// Parsed condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Literal(Value),
    Variable(Vec<String>),
    List(Vec<Expression>),
    Not(Box<Expression>),
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),
    Compare(CompareOp, Box<Expression>, Box<Expression>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    In,
    Op(CompareOp),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ExpressionError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);
        let next2 = chars.get(i + 2).map(|(_, c)| *c);

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let (token, width) = match (c, next) {
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('[', _) => (Token::LBracket, 1),
            (']', _) => (Token::RBracket, 1),
            (',', _) => (Token::Comma, 1),
            ('&', Some('&')) => (Token::And, 2),
            ('|', Some('|')) => (Token::Or, 2),
            ('=', Some('=')) if next2 == Some('=') => (Token::Op(CompareOp::Eq), 3),
            ('=', Some('=')) => (Token::Op(CompareOp::Eq), 2),
            ('!', Some('=')) if next2 == Some('=') => (Token::Op(CompareOp::Ne), 3),
            ('!', Some('=')) => (Token::Op(CompareOp::Ne), 2),
            ('!', _) => (Token::Not, 1),
            ('<', Some('=')) => (Token::Op(CompareOp::Le), 2),
            ('<', _) => (Token::Op(CompareOp::Lt), 1),
            ('>', Some('=')) => (Token::Op(CompareOp::Ge), 2),
            ('>', _) => (Token::Op(CompareOp::Gt), 1),
            ('\'' | '"', _) => {
                let quote = c;
                let mut value = String::new();
                let mut j = i + 1;
                let mut closed = false;
                while j < chars.len() {
                    let (_, ch) = chars[j];
                    if ch == '\\' {
                        if let Some((_, escaped)) = chars.get(j + 1) {
                            value.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => *other,
                            });
                            j += 2;
                            continue;
                        }
                    }
                    if ch == quote {
                        closed = true;
                        break;
                    }
                    value.push(ch);
                    j += 1;
                }
                if !closed {
                    return Err(ExpressionError::new(pos, "unterminated string literal"));
                }
                tokens.push((pos, Token::Str(value)));
                i = j + 1;
                continue;
            }
            (d, _) if d.is_ascii_digit() || (d == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let mut j = i + 1;
                while j < chars.len() && (chars[j].1.is_ascii_digit() || chars[j].1 == '.') {
                    j += 1;
                }
                let end = chars.get(j).map_or(input.len(), |(p, _)| *p);
                let text = &input[pos..end];
                let number = text
                    .parse::<f64>()
                    .map_err(|_| ExpressionError::new(pos, format!("invalid number '{text}'")))?;
                tokens.push((pos, Token::Number(number)));
                i = j;
                continue;
            }
            (a, _) if a.is_ascii_alphabetic() || a == '_' || a == '$' => {
                let mut j = i + 1;
                while j < chars.len() {
                    let ch = chars[j].1;
                    if ch.is_ascii_alphanumeric() || ch == '_' || ch == '$' || ch == '.' {
                        j += 1;
                    } else {
                        break;
                    }
                }
                let end = chars.get(j).map_or(input.len(), |(p, _)| *p);
                let word = &input[pos..end];
                let token = match word {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    _ => {
                        if word.ends_with('.') || word.contains("..") {
                            return Err(ExpressionError::new(pos, format!("invalid identifier '{word}'")));
                        }
                        Token::Ident(word.to_string())
                    }
                };
                tokens.push((pos, token));
                i = j;
                continue;
            }
            _ => return Err(ExpressionError::new(pos, format!("unexpected character '{c}'"))),
        };

        tokens.push((pos, token));
        i += width;
    }

    Ok(tokens)
}

/// Deepest allowed nesting of parentheses, brackets and negations.
const MAX_NESTING: usize = 64;

/// Longest accepted token stream; bounds the depth of `&&`/`||` chains.
const MAX_TOKENS: usize = 1024;

struct Parser {
    tokens: Vec<(usize, Token)>,
    index: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn descend(&mut self, position: usize) -> Result<(), ExpressionError> {
        if self.depth >= MAX_NESTING {
            return Err(ExpressionError::new(position, "expression nested too deeply"));
        }
        self.depth += 1;
        Ok(())
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.index).map(|(_, t)| t)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.index).map_or(self.end, |(p, _)| *p)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.index).map(|(_, t)| t.clone());
        self.index += 1;
        token
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), ExpressionError> {
        if self.peek() == Some(expected) {
            self.index += 1;
            Ok(())
        } else {
            Err(ExpressionError::new(self.position(), format!("expected {what}")))
        }
    }

    fn parse_or(&mut self) -> Result<Expression, ExpressionError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.index += 1;
            let right = self.parse_and()?;
            left = Expression::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expression, ExpressionError> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.index += 1;
            let right = self.parse_unary()?;
            left = Expression::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expression, ExpressionError> {
        if self.peek() == Some(&Token::Not) {
            self.descend(self.position())?;
            self.index += 1;
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Expression::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expression, ExpressionError> {
        let left = self.parse_primary()?;

        let op = match self.peek() {
            Some(Token::Op(op)) => Some(*op),
            Some(Token::In) => Some(CompareOp::In),
            Some(Token::Not)
                if matches!(self.tokens.get(self.index + 1), Some((_, Token::In))) =>
            {
                self.index += 1;
                Some(CompareOp::NotIn)
            }
            _ => None,
        };

        match op {
            Some(op) => {
                self.index += 1;
                let right = self.parse_primary()?;
                Ok(Expression::Compare(op, Box::new(left), Box::new(right)))
            }
            None => Ok(left),
        }
    }

    fn parse_primary(&mut self) -> Result<Expression, ExpressionError> {
        let position = self.position();
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expression::Literal(number_value(n))),
            Some(Token::Str(s)) => Ok(Expression::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expression::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expression::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expression::Literal(Value::Null)),
            Some(Token::Ident(name)) => {
                Ok(Expression::Variable(name.split('.').map(str::to_string).collect()))
            }
            Some(Token::LParen) => {
                self.descend(position)?;
                let inner = self.parse_or()?;
                self.expect(&Token::RParen, "')'")?;
                self.depth -= 1;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                self.descend(position)?;
                let mut items = Vec::new();
                if self.peek() != Some(&Token::RBracket) {
                    loop {
                        items.push(self.parse_or()?);
                        if self.peek() == Some(&Token::Comma) {
                            self.index += 1;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(&Token::RBracket, "']'")?;
                self.depth -= 1;
                Ok(Expression::List(items))
            }
            Some(other) => {
                Err(ExpressionError::new(position, format!("unexpected token {other:?}")))
            }
            None => Err(ExpressionError::new(position, "unexpected end of expression")),
        }
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        #[allow(clippy::cast_possible_truncation)]
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

/// Parse a condition into an [`Expression`].
///
/// # Errors
///
/// Returns an [`ExpressionError`] for unknown characters, unbalanced
/// brackets, trailing input, or expressions nested or chained past the
/// parser's limits.
pub fn parse(input: &str) -> Result<Expression, ExpressionError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ExpressionError::new(0, "empty expression"));
    }
    if let Some((position, _)) = tokens.get(MAX_TOKENS) {
        return Err(ExpressionError::new(*position, "expression too long"));
    }
    let mut parser = Parser {
        tokens,
        index: 0,
        end: input.len(),
        depth: 0,
    };
    let expression = parser.parse_or()?;
    if parser.index < parser.tokens.len() {
        return Err(ExpressionError::new(parser.position(), "unexpected trailing input"));
    }
    Ok(expression)
}

/// Scripting-style truthiness of a JSON value.
#[must_use]
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn ordering(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|item| loose_eq(item, needle)),
        Value::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
        Value::Object(map) => needle.as_str().is_some_and(|n| map.contains_key(n)),
        _ => false,
    }
}

fn lookup(path: &[String], variables: &Map<String, Value>) -> Value {
    let Some((first, rest)) = path.split_first() else {
        return Value::Null;
    };
    let mut current = match variables.get(first) {
        Some(value) => value,
        None => return Value::Null,
    };
    for segment in rest {
        current = match current {
            Value::Object(map) => match map.get(segment) {
                Some(value) => value,
                None => return Value::Null,
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(value) => value,
                None => return Value::Null,
            },
            _ => return Value::Null,
        };
    }
    current.clone()
}

impl Expression {
    /// Evaluate against a variable map.
    #[must_use]
    pub fn evaluate(&self, variables: &Map<String, Value>) -> Value {
        match self {
            Self::Literal(value) => value.clone(),
            Self::Variable(path) => lookup(path, variables),
            Self::List(items) => Value::Array(items.iter().map(|e| e.evaluate(variables)).collect()),
            Self::Not(inner) => Value::Bool(!is_truthy(&inner.evaluate(variables))),
            Self::And(left, right) => Value::Bool(
                is_truthy(&left.evaluate(variables)) && is_truthy(&right.evaluate(variables)),
            ),
            Self::Or(left, right) => Value::Bool(
                is_truthy(&left.evaluate(variables)) || is_truthy(&right.evaluate(variables)),
            ),
            Self::Compare(op, left, right) => {
                let l = left.evaluate(variables);
                let r = right.evaluate(variables);
                let result = match op {
                    CompareOp::Eq => loose_eq(&l, &r),
                    CompareOp::Ne => !loose_eq(&l, &r),
                    CompareOp::Lt => ordering(&l, &r) == Some(Ordering::Less),
                    CompareOp::Le => {
                        matches!(ordering(&l, &r), Some(Ordering::Less | Ordering::Equal))
                    }
                    CompareOp::Gt => ordering(&l, &r) == Some(Ordering::Greater),
                    CompareOp::Ge => {
                        matches!(ordering(&l, &r), Some(Ordering::Greater | Ordering::Equal))
                    }
                    CompareOp::In => contains(&r, &l),
                    CompareOp::NotIn => !contains(&r, &l),
                };
                Value::Bool(result)
            }
        }
    }
}

/// Parse and evaluate a condition to a boolean.
///
/// # Errors
///
/// Returns an [`ExpressionError`] if the condition does not parse.
pub fn evaluate_condition(
    input: &str,
    variables: &Map<String, Value>,
) -> Result<bool, ExpressionError> {
    Ok(is_truthy(&parse(input)?.evaluate(variables)))
}

static BARE_IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*$").expect("static regex"));

/// Heuristic check for conditions that are almost certainly mistakes.
///
/// Flags empty text, pure punctuation, a bare number and a bare identifier.
/// Advisory only: callers turn this into a warning.
#[must_use]
pub fn is_degenerate(input: &str) -> bool {
    let trimmed = input.trim();
    trimmed.is_empty()
        || trimmed.chars().all(|c| c.is_ascii_punctuation() || c.is_whitespace())
        || trimmed.parse::<f64>().is_ok()
        || BARE_IDENTIFIER.is_match(trimmed)
}
