//! Rule predicate DSL — compile once, evaluate per event
//!
//! A subscription's filter expression compiles to a [`RuleExpr`] tree
//! at registration time. Evaluation is a pure recursive walk over the
//! tree: deterministic, side-effect free, short-circuiting `and`/`or`
//! left-to-right, and permissive on type mismatches (a comparison that
//! cannot be made evaluates to false, never to an error).
//!
//! Grammar:
//!
//! ```text
//! expr       := and_expr ( "or" and_expr )*
//! and_expr   := unary ( "and" unary )*
//! unary      := "not" unary | "(" expr ")" | comparison
//! comparison := path op literal
//! op         := "==" | "!=" | "<" | ">" | "<=" | ">=" | "contains"
//! path       := ident ( "." segment )*
//! literal    := string | number | "true" | "false" | "null"
//! ```
//!
//! Paths address the top-level event fields `source`, `type`, `id`,
//! `correlation_id`, `ts`, `sequence`, or dig into the payload with a
//! `payload.`-prefixed dotted path (numeric segments index arrays).

use crate::error::{EventError, Result};
use crate::types::StoredEvent;

// ─── Compiled form ───────────────────────────────────────────────

/// Comparison operator of a leaf predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Contains,
}

/// Literal operand of a comparison
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
}

/// Dotted field path into an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath(pub Vec<String>);

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// Compiled predicate tree
///
/// Built once by [`compile`]; read-only thereafter.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleExpr {
    /// `path op literal`
    Compare {
        path: FieldPath,
        op: CompareOp,
        value: Literal,
    },
    /// `and`-composition; true when every child is true
    All(Vec<RuleExpr>),
    /// `or`-composition; true when any child is true
    Any(Vec<RuleExpr>),
    /// Negation
    Not(Box<RuleExpr>),
}

impl RuleExpr {
    /// Evaluate the predicate against a stored event
    pub fn matches(&self, event: &StoredEvent) -> bool {
        match self {
            RuleExpr::Compare { path, op, value } => match resolve(event, path) {
                Some(field) => compare(&field, *op, value),
                None => false,
            },
            RuleExpr::All(children) => children.iter().all(|c| c.matches(event)),
            RuleExpr::Any(children) => children.iter().any(|c| c.matches(event)),
            RuleExpr::Not(child) => !child.matches(event),
        }
    }
}

/// Compile rule source into a predicate tree
pub fn compile(source: &str) -> Result<RuleExpr> {
    let tokens = lex(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: source.len(),
    };
    let expr = parser.expr()?;
    if let Some((at, tok)) = parser.peek() {
        return Err(EventError::RuleCompile {
            reason: format!("unexpected trailing '{}'", tok.describe()),
            position: at,
        });
    }
    Ok(expr)
}

// ─── Field resolution ────────────────────────────────────────────

/// A resolved field value, borrowed from the event where possible
enum FieldRef<'a> {
    Str(&'a str),
    Num(f64),
    Json(&'a serde_json::Value),
}

fn resolve<'a>(event: &'a StoredEvent, path: &FieldPath) -> Option<FieldRef<'a>> {
    let (head, rest) = path.0.split_first()?;
    if head == "payload" {
        let mut value = &event.payload;
        for seg in rest {
            value = match value {
                serde_json::Value::Object(map) => map.get(seg)?,
                serde_json::Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        return Some(FieldRef::Json(value));
    }
    // Top-level fields have no sub-paths
    if !rest.is_empty() {
        return None;
    }
    match head.as_str() {
        "source" => Some(FieldRef::Str(&event.source)),
        "type" => Some(FieldRef::Str(&event.event_type)),
        "id" => Some(FieldRef::Str(&event.id)),
        "correlation_id" => Some(FieldRef::Str(&event.correlation_id)),
        "ts" => Some(FieldRef::Num(event.ts as f64)),
        "sequence" => Some(FieldRef::Num(event.sequence as f64)),
        _ => None,
    }
}

// ─── Comparison semantics ────────────────────────────────────────

fn field_number(field: &FieldRef<'_>) -> Option<f64> {
    match field {
        FieldRef::Num(n) => Some(*n),
        FieldRef::Str(s) => s.parse().ok(),
        FieldRef::Json(serde_json::Value::Number(n)) => n.as_f64(),
        FieldRef::Json(serde_json::Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

fn literal_number(lit: &Literal) -> Option<f64> {
    match lit {
        Literal::Num(n) => Some(*n),
        Literal::Str(s) => s.parse().ok(),
        _ => None,
    }
}

/// Type-aware equality with numeric cross-coercion
fn equals(field: &FieldRef<'_>, lit: &Literal) -> bool {
    if let (Some(a), Some(b)) = (field_number(field), literal_number(lit)) {
        return a == b;
    }
    match (field, lit) {
        (FieldRef::Str(s), Literal::Str(t)) => s == t,
        (FieldRef::Json(serde_json::Value::String(s)), Literal::Str(t)) => s == t,
        (FieldRef::Json(serde_json::Value::Bool(b)), Literal::Bool(c)) => b == c,
        (FieldRef::Json(serde_json::Value::Null), Literal::Null) => true,
        _ => false,
    }
}

fn compare(field: &FieldRef<'_>, op: CompareOp, lit: &Literal) -> bool {
    match op {
        CompareOp::Eq => equals(field, lit),
        CompareOp::Ne => !equals(field, lit),
        CompareOp::Lt | CompareOp::Gt | CompareOp::Le | CompareOp::Ge => {
            // Ordering is numeric-only; incomparable operands are false
            match (field_number(field), literal_number(lit)) {
                (Some(a), Some(b)) => match op {
                    CompareOp::Lt => a < b,
                    CompareOp::Gt => a > b,
                    CompareOp::Le => a <= b,
                    CompareOp::Ge => a >= b,
                    _ => unreachable!(),
                },
                _ => false,
            }
        }
        CompareOp::Contains => match (field, lit) {
            (FieldRef::Str(s), Literal::Str(t)) => s.contains(t.as_str()),
            (FieldRef::Json(serde_json::Value::String(s)), Literal::Str(t)) => {
                s.contains(t.as_str())
            }
            (FieldRef::Json(serde_json::Value::Array(items)), _) => items
                .iter()
                .any(|item| equals(&FieldRef::Json(item), lit)),
            _ => false,
        },
    }
}

// ─── Lexer ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    And,
    Or,
    Not,
    Contains,
    True,
    False,
    Null,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Dot,
    LParen,
    RParen,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(s) => s.clone(),
            Token::Number(n) => n.to_string(),
            Token::Str(s) => format!("\"{}\"", s),
            Token::And => "and".into(),
            Token::Or => "or".into(),
            Token::Not => "not".into(),
            Token::Contains => "contains".into(),
            Token::True => "true".into(),
            Token::False => "false".into(),
            Token::Null => "null".into(),
            Token::Eq => "==".into(),
            Token::Ne => "!=".into(),
            Token::Lt => "<".into(),
            Token::Gt => ">".into(),
            Token::Le => "<=".into(),
            Token::Ge => ">=".into(),
            Token::Dot => ".".into(),
            Token::LParen => "(".into(),
            Token::RParen => ")".into(),
        }
    }

    /// Keyword tokens double as path segments after a dot
    fn as_segment(&self) -> Option<String> {
        match self {
            Token::Ident(s) => Some(s.clone()),
            Token::And | Token::Or | Token::Not | Token::Contains | Token::True
            | Token::False | Token::Null => Some(self.describe()),
            Token::Number(n) if n.fract() == 0.0 && *n >= 0.0 => {
                Some(format!("{}", *n as u64))
            }
            _ => None,
        }
    }
}

fn lex(source: &str) -> Result<Vec<(usize, Token)>> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '(' => {
                tokens.push((i, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((i, Token::RParen));
                i += 1;
            }
            '.' => {
                tokens.push((i, Token::Dot));
                i += 1;
            }
            '=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push((i, Token::Eq));
                    i += 2;
                } else {
                    return Err(EventError::RuleCompile {
                        reason: "expected '==' (single '=' is not an operator)".to_string(),
                        position: i,
                    });
                }
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push((i, Token::Ne));
                    i += 2;
                } else {
                    return Err(EventError::RuleCompile {
                        reason: "expected '!='".to_string(),
                        position: i,
                    });
                }
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push((i, Token::Le));
                    i += 2;
                } else {
                    tokens.push((i, Token::Lt));
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push((i, Token::Ge));
                    i += 2;
                } else {
                    tokens.push((i, Token::Gt));
                    i += 1;
                }
            }
            '"' => {
                let start = i;
                i += 1;
                let mut value = String::new();
                loop {
                    match bytes.get(i) {
                        None => {
                            return Err(EventError::RuleCompile {
                                reason: "unterminated string literal".to_string(),
                                position: start,
                            })
                        }
                        Some(b'"') => {
                            i += 1;
                            break;
                        }
                        Some(b'\\') => {
                            let escaped = bytes.get(i + 1).ok_or_else(|| {
                                EventError::RuleCompile {
                                    reason: "dangling escape".to_string(),
                                    position: i,
                                }
                            })?;
                            value.push(match escaped {
                                b'"' => '"',
                                b'\\' => '\\',
                                b'n' => '\n',
                                b't' => '\t',
                                other => {
                                    return Err(EventError::RuleCompile {
                                        reason: format!(
                                            "unsupported escape '\\{}'",
                                            *other as char
                                        ),
                                        position: i,
                                    })
                                }
                            });
                            i += 2;
                        }
                        Some(_) => {
                            // Strings are UTF-8; advance one whole char
                            let rest = &source[i..];
                            let ch = rest.chars().next().unwrap_or('\u{fffd}');
                            value.push(ch);
                            i += ch.len_utf8();
                        }
                    }
                }
                tokens.push((start, Token::Str(value)));
            }
            '0'..='9' | '-' => {
                let start = i;
                i += 1;
                while i < bytes.len()
                    && (bytes[i].is_ascii_digit() || bytes[i] == b'.' || bytes[i] == b'e'
                        || bytes[i] == b'E' || bytes[i] == b'+' || bytes[i] == b'-')
                {
                    // A dot followed by a non-digit terminates the number
                    // so `payload.0.x` lexes as segments, not a float
                    if bytes[i] == b'.'
                        && !bytes.get(i + 1).map(u8::is_ascii_digit).unwrap_or(false)
                    {
                        break;
                    }
                    i += 1;
                }
                let text = &source[start..i];
                let n: f64 = text.parse().map_err(|_| EventError::RuleCompile {
                    reason: format!("invalid number '{}'", text),
                    position: start,
                })?;
                tokens.push((start, Token::Number(n)));
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                let word = &source[start..i];
                let token = match word {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "contains" => Token::Contains,
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(word.to_string()),
                };
                tokens.push((start, token));
            }
            _ => {
                return Err(EventError::RuleCompile {
                    reason: format!("unexpected character '{}'", c),
                    position: i,
                })
            }
        }
    }

    Ok(tokens)
}

// ─── Parser ──────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<(usize, &Token)> {
        self.tokens.get(self.pos).map(|(at, tok)| (*at, tok))
    }

    fn advance(&mut self) -> Option<(usize, Token)> {
        let item = self.tokens.get(self.pos).cloned();
        if item.is_some() {
            self.pos += 1;
        }
        item
    }

    fn error(&self, reason: impl Into<String>) -> EventError {
        let position = self.peek().map(|(at, _)| at).unwrap_or(self.end);
        EventError::RuleCompile {
            reason: reason.into(),
            position,
        }
    }

    fn expr(&mut self) -> Result<RuleExpr> {
        let mut children = vec![self.and_expr()?];
        while matches!(self.peek(), Some((_, Token::Or))) {
            self.advance();
            children.push(self.and_expr()?);
        }
        Ok(if children.len() == 1 {
            children.pop().unwrap_or(RuleExpr::Any(Vec::new()))
        } else {
            RuleExpr::Any(children)
        })
    }

    fn and_expr(&mut self) -> Result<RuleExpr> {
        let mut children = vec![self.unary()?];
        while matches!(self.peek(), Some((_, Token::And))) {
            self.advance();
            children.push(self.unary()?);
        }
        Ok(if children.len() == 1 {
            children.pop().unwrap_or(RuleExpr::All(Vec::new()))
        } else {
            RuleExpr::All(children)
        })
    }

    fn unary(&mut self) -> Result<RuleExpr> {
        match self.peek() {
            Some((_, Token::Not)) => {
                self.advance();
                Ok(RuleExpr::Not(Box::new(self.unary()?)))
            }
            Some((_, Token::LParen)) => {
                self.advance();
                let inner = self.expr()?;
                match self.advance() {
                    Some((_, Token::RParen)) => Ok(inner),
                    _ => Err(self.error("expected ')'")),
                }
            }
            _ => self.comparison(),
        }
    }

    fn comparison(&mut self) -> Result<RuleExpr> {
        let path = self.path()?;
        let op = match self.advance() {
            Some((_, Token::Eq)) => CompareOp::Eq,
            Some((_, Token::Ne)) => CompareOp::Ne,
            Some((_, Token::Lt)) => CompareOp::Lt,
            Some((_, Token::Gt)) => CompareOp::Gt,
            Some((_, Token::Le)) => CompareOp::Le,
            Some((_, Token::Ge)) => CompareOp::Ge,
            Some((_, Token::Contains)) => CompareOp::Contains,
            Some((at, tok)) => {
                return Err(EventError::RuleCompile {
                    reason: format!("expected comparison operator, found '{}'", tok.describe()),
                    position: at,
                })
            }
            None => return Err(self.error("expected comparison operator")),
        };
        let value = self.literal()?;
        Ok(RuleExpr::Compare { path, op, value })
    }

    fn path(&mut self) -> Result<FieldPath> {
        let first = match self.advance() {
            Some((_, Token::Ident(name))) => name,
            Some((at, tok)) => {
                return Err(EventError::RuleCompile {
                    reason: format!("expected field path, found '{}'", tok.describe()),
                    position: at,
                })
            }
            None => return Err(self.error("expected field path")),
        };
        let mut segments = vec![first];
        while matches!(self.peek(), Some((_, Token::Dot))) {
            self.advance();
            match self.advance() {
                Some((at, tok)) => match tok.as_segment() {
                    Some(seg) => segments.push(seg),
                    None => {
                        return Err(EventError::RuleCompile {
                            reason: format!("invalid path segment '{}'", tok.describe()),
                            position: at,
                        })
                    }
                },
                None => return Err(self.error("expected path segment after '.'")),
            }
        }
        Ok(FieldPath(segments))
    }

    fn literal(&mut self) -> Result<Literal> {
        match self.advance() {
            Some((_, Token::Str(s))) => Ok(Literal::Str(s)),
            Some((_, Token::Number(n))) => Ok(Literal::Num(n)),
            Some((_, Token::True)) => Ok(Literal::Bool(true)),
            Some((_, Token::False)) => Ok(Literal::Bool(false)),
            Some((_, Token::Null)) => Ok(Literal::Null),
            Some((at, tok)) => Err(EventError::RuleCompile {
                reason: format!("expected literal, found '{}'", tok.describe()),
                position: at,
            }),
            None => Err(self.error("expected literal")),
        }
    }
}
