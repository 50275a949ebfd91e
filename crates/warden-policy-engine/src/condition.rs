//! Per-call boolean conditions over the call's parameters and result.
//!
//! Grammar, loosest binding first:
//!
//! ```text
//! or      := and (("||" | "or") and)*
//! and     := unary (("&&" | "and") unary)*
//! unary   := ("!" | "not") unary | compare
//! compare := primary (("==" | "!=" | ">" | ">=" | "<" | "<=") primary)?
//! primary := "#" ident ("." segment)* | literal | "(" or ")"
//! ```

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;
use warden_audit::CallContext;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ConditionError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("evaluation error: {0}")]
    Evaluation(String),
}

/// Named values visible to a condition.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VariableScope {
    vars: BTreeMap<String, Value>,
}

impl VariableScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parameters by name, plus `result` when the call returned a non-null value.
    pub fn from_context(ctx: &CallContext) -> Self {
        let mut scope = Self::new();
        for param in &ctx.params {
            scope.set(param.name.clone(), param.value.clone());
        }
        if let Some(result) = ctx.return_value.as_ref().filter(|v| !v.is_null()) {
            scope.set("result", result.clone());
        }
        scope
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    fn resolve(&self, path: &[String]) -> Value {
        let Some((head, rest)) = path.split_first() else {
            return Value::Null;
        };
        let mut current = match self.vars.get(head) {
            Some(value) => value,
            None => return Value::Null,
        };
        for segment in rest {
            let next = match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            match next {
                Some(value) => current = value,
                None => return Value::Null,
            }
        }
        current.clone()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Clone, Debug, PartialEq)]
enum Expr {
    Literal(Value),
    Var(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Var(Vec<String>),
    Literal(Value),
    Cmp(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

/// Longer sources are rejected; also bounds the depth of `&&`/`||` chains.
const MAX_TOKENS: usize = 512;
/// Deepest allowed nesting of `!` and parentheses.
const MAX_NESTING: usize = 64;

/// A parsed condition, reusable across calls.
#[derive(Clone, Debug, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(ConditionError::Parse("empty condition".to_string()));
        }
        if tokens.len() > MAX_TOKENS {
            return Err(ConditionError::Parse(format!(
                "condition has {} tokens, limit is {MAX_TOKENS}",
                tokens.len()
            )));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.or()?;
        if parser.pos != parser.tokens.len() {
            return Err(ConditionError::Parse(format!(
                "unexpected token at position {}",
                parser.pos
            )));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// `null` reads as false; any other non-boolean result is an error.
    pub fn evaluate(&self, scope: &VariableScope) -> Result<bool, ConditionError> {
        match eval(&self.expr, scope)? {
            Value::Bool(flag) => Ok(flag),
            Value::Null => Ok(false),
            other => Err(ConditionError::Evaluation(format!(
                "condition produced a non-boolean value: {other}"
            ))),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, ConditionError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '#' => {
                i += 1;
                let mut path = Vec::new();
                loop {
                    let start = i;
                    while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                        i += 1;
                    }
                    if start == i {
                        return Err(ConditionError::Parse(format!(
                            "expected identifier at position {start}"
                        )));
                    }
                    path.push(chars[start..i].iter().collect());
                    if i < chars.len() && chars[i] == '.' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Var(path));
            }
            '\'' | '"' => {
                let quote = c;
                i += 1;
                let start = i;
                while i < chars.len() && chars[i] != quote {
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(ConditionError::Parse("unterminated string".to_string()));
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(Token::Literal(Value::String(text)));
                i += 1;
            }
            '=' | '!' | '>' | '<' | '&' | '|' => {
                let next = chars.get(i + 1).copied();
                let (token, width) = match (c, next) {
                    ('=', Some('=')) => (Token::Cmp(CmpOp::Eq), 2),
                    ('!', Some('=')) => (Token::Cmp(CmpOp::Ne), 2),
                    ('>', Some('=')) => (Token::Cmp(CmpOp::Ge), 2),
                    ('<', Some('=')) => (Token::Cmp(CmpOp::Le), 2),
                    ('&', Some('&')) => (Token::And, 2),
                    ('|', Some('|')) => (Token::Or, 2),
                    ('!', _) => (Token::Not, 1),
                    ('>', _) => (Token::Cmp(CmpOp::Gt), 1),
                    ('<', _) => (Token::Cmp(CmpOp::Lt), 1),
                    _ => {
                        return Err(ConditionError::Parse(format!(
                            "unexpected operator '{c}' at position {i}"
                        )))
                    }
                };
                tokens.push(token);
                i += width;
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = if let Ok(int) = text.parse::<i64>() {
                    Value::from(int)
                } else {
                    let float = text
                        .parse::<f64>()
                        .map_err(|_| ConditionError::Parse(format!("bad number '{text}'")))?;
                    Value::from(float)
                };
                tokens.push(Token::Literal(number));
            }
            c if c.is_alphabetic() => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let token = match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" => Token::Literal(Value::Bool(true)),
                    "false" => Token::Literal(Value::Bool(false)),
                    "null" => Token::Literal(Value::Null),
                    _ => {
                        return Err(ConditionError::Parse(format!(
                            "unknown word '{word}'; variables start with '#'"
                        )))
                    }
                };
                tokens.push(token);
            }
            _ => {
                return Err(ConditionError::Parse(format!(
                    "unexpected character '{c}' at position {i}"
                )))
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn nested<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, ConditionError>,
    ) -> Result<T, ConditionError> {
        if self.depth >= MAX_NESTING {
            return Err(ConditionError::Parse(format!(
                "condition nested deeper than {MAX_NESTING}"
            )));
        }
        self.depth += 1;
        let parsed = parse(self);
        self.depth -= 1;
        parsed
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn or(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ConditionError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            let inner = self.nested(Self::unary)?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Expr, ConditionError> {
        let left = self.primary()?;
        if let Some(Token::Cmp(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.primary()?;
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn primary(&mut self) -> Result<Expr, ConditionError> {
        match self.next() {
            Some(Token::Var(path)) => Ok(Expr::Var(path)),
            Some(Token::Literal(value)) => Ok(Expr::Literal(value)),
            Some(Token::LParen) => {
                let inner = self.nested(Self::or)?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ConditionError::Parse("missing ')'".to_string())),
                }
            }
            Some(other) => Err(ConditionError::Parse(format!(
                "unexpected token {other:?}"
            ))),
            None => Err(ConditionError::Parse(
                "unexpected end of condition".to_string(),
            )),
        }
    }
}

fn eval(expr: &Expr, scope: &VariableScope) -> Result<Value, ConditionError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Var(path) => Ok(scope.resolve(path)),
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, scope)?)?)),
        Expr::And(left, right) => {
            if !truthy(&eval(left, scope)?)? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truthy(&eval(right, scope)?)?))
        }
        Expr::Or(left, right) => {
            if truthy(&eval(left, scope)?)? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truthy(&eval(right, scope)?)?))
        }
        Expr::Compare(op, left, right) => {
            let left = eval(left, scope)?;
            let right = eval(right, scope)?;
            compare(*op, &left, &right).map(Value::Bool)
        }
    }
}

fn truthy(value: &Value) -> Result<bool, ConditionError> {
    match value {
        Value::Bool(flag) => Ok(*flag),
        Value::Null => Ok(false),
        other => Err(ConditionError::Evaluation(format!(
            "expected a boolean, got {other}"
        ))),
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, ConditionError> {
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            a.partial_cmp(&b)
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };

    match op {
        CmpOp::Eq => Ok(ordering.map_or_else(|| left == right, |o| o == Ordering::Equal)),
        CmpOp::Ne => Ok(ordering.map_or_else(|| left != right, |o| o != Ordering::Equal)),
        CmpOp::Gt => ordered(ordering, left, right).map(|o| o == Ordering::Greater),
        CmpOp::Ge => ordered(ordering, left, right).map(|o| o != Ordering::Less),
        CmpOp::Lt => ordered(ordering, left, right).map(|o| o == Ordering::Less),
        CmpOp::Le => ordered(ordering, left, right).map(|o| o != Ordering::Greater),
    }
}

fn ordered(
    ordering: Option<Ordering>,
    left: &Value,
    right: &Value,
) -> Result<Ordering, ConditionError> {
    ordering
        .ok_or_else(|| ConditionError::Evaluation(format!("cannot order {left} and {right}")))
}
