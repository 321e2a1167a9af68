//! Sandboxed expression evaluator.
//!
//! Business rules, suppression rules, derivation transforms, and filter
//! `regex` predicates all need a tiny expression language over record/anomaly
//! fields. The reference system generates and evaluates host code at
//! runtime; per the design notes that is explicitly disallowed here. This
//! module supports only: field lookup (dotted path), comparison operators,
//! logical AND/OR/NOT, numeric and string literals, and regex match. There
//! is no host-language `eval` anywhere in this crate.

use regex::Regex;
use serde_json::Value;

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Number(f64),
    Str(String),
    Bool(bool),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Literal),
    Field(String),
    Compare(Box<Expr>, CompareOp, Box<Expr>),
    Arith(Box<Expr>, ArithOp, Box<Expr>),
    Matches(Box<Expr>, String),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

/// Parses and evaluates an expression string in one call; rules are short
/// and re-parsed rarely enough that caching isn't worth the complexity.
pub fn evaluate(source: &str, record: &Value) -> Result<bool> {
    let expr = parse(source)?;
    match eval_expr(&expr, record)? {
        Value::Bool(b) => Ok(b),
        Value::Null => Ok(false),
        other => Err(CoreError::ExpressionEvaluation(
            source.to_string(),
            format!("expression did not evaluate to a boolean, got {other}"),
        )),
    }
}

/// Like [`evaluate`] but returns the raw value, used by `derive`
/// transformations which compute a scalar rather than a predicate.
pub fn evaluate_value(source: &str, record: &Value) -> Result<Value> {
    let expr = parse(source)?;
    eval_expr(&expr, record)
}

fn eval_expr(expr: &Expr, record: &Value) -> Result<Value> {
    Ok(match expr {
        Expr::Literal(Literal::Number(n)) => Value::from(*n),
        Expr::Literal(Literal::Str(s)) => Value::String(s.clone()),
        Expr::Literal(Literal::Bool(b)) => Value::Bool(*b),
        Expr::Field(path) => get_nested(record, path).cloned().unwrap_or(Value::Null),
        Expr::Compare(lhs, op, rhs) => {
            let l = eval_expr(lhs, record)?;
            let r = eval_expr(rhs, record)?;
            Value::Bool(compare(&l, *op, &r))
        }
        Expr::Arith(lhs, op, rhs) => {
            let l = eval_expr(lhs, record)?;
            let r = eval_expr(rhs, record)?;
            let a = l.as_f64().unwrap_or(0.0);
            let b = r.as_f64().unwrap_or(0.0);
            let result = match op {
                ArithOp::Add => a + b,
                ArithOp::Sub => a - b,
                ArithOp::Mul => a * b,
                ArithOp::Div => {
                    if b == 0.0 {
                        return Err(CoreError::ExpressionEvaluation(
                            "expression".into(),
                            "division by zero".into(),
                        ));
                    }
                    a / b
                }
            };
            Value::from(result)
        }
        Expr::Matches(lhs, pattern) => {
            let l = eval_expr(lhs, record)?;
            let s = value_as_str(&l);
            let re = Regex::new(pattern).map_err(|e| {
                CoreError::ExpressionEvaluation(pattern.clone(), e.to_string())
            })?;
            Value::Bool(re.is_match(&s))
        }
        Expr::And(a, b) => {
            let av = matches!(eval_expr(a, record)?, Value::Bool(true));
            Value::Bool(av && matches!(eval_expr(b, record)?, Value::Bool(true)))
        }
        Expr::Or(a, b) => {
            let av = matches!(eval_expr(a, record)?, Value::Bool(true));
            Value::Bool(av || matches!(eval_expr(b, record)?, Value::Bool(true)))
        }
        Expr::Not(a) => Value::Bool(!matches!(eval_expr(a, record)?, Value::Bool(true))),
    })
}

fn value_as_str(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn compare(l: &Value, op: CompareOp, r: &Value) -> bool {
    if let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) {
        return match op {
            CompareOp::Eq => a == b,
            CompareOp::Ne => a != b,
            CompareOp::Gt => a > b,
            CompareOp::Gte => a >= b,
            CompareOp::Lt => a < b,
            CompareOp::Lte => a <= b,
        };
    }
    let a = value_as_str(l);
    let b = value_as_str(r);
    match op {
        CompareOp::Eq => a == b,
        CompareOp::Ne => a != b,
        CompareOp::Gt => a > b,
        CompareOp::Gte => a >= b,
        CompareOp::Lt => a < b,
        CompareOp::Lte => a <= b,
    }
}

/// Dotted-path lookup (`context.metric`, `sample.labels.region`) used both
/// by the expression evaluator's `Field` nodes and by the data collector's
/// filter predicates.
pub fn get_nested<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

// --- tokenizer + recursive-descent parser ------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    And,
    Or,
    Not,
    Matches,
    Op(CompareOp),
    Arith(ArithOp),
    LParen,
    RParen,
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(CoreError::ExpressionEvaluation(
                        src.to_string(),
                        "unterminated string literal".into(),
                    ));
                }
                i += 1;
                tokens.push(Token::Str(s));
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CompareOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CompareOp::Eq));
                i += 2;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CompareOp::Gte));
                i += 2;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CompareOp::Lte));
                i += 2;
            }
            '>' => {
                tokens.push(Token::Op(CompareOp::Gt));
                i += 1;
            }
            '<' => {
                tokens.push(Token::Op(CompareOp::Lt));
                i += 1;
            }
            '+' => {
                tokens.push(Token::Arith(ArithOp::Add));
                i += 1;
            }
            '*' => {
                tokens.push(Token::Arith(ArithOp::Mul));
                i += 1;
            }
            '/' => {
                tokens.push(Token::Arith(ArithOp::Div));
                i += 1;
            }
            '-' if !matches!(
                tokens.last(),
                Some(Token::Number(_)) | Some(Token::Ident(_)) | Some(Token::RParen)
            ) && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit()) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let num: String = chars[start..i].iter().collect();
                let n = num.parse::<f64>().map_err(|e| {
                    CoreError::ExpressionEvaluation(src.to_string(), e.to_string())
                })?;
                tokens.push(Token::Number(n));
            }
            '-' => {
                tokens.push(Token::Arith(ArithOp::Sub));
                i += 1;
            }
            _ if c.is_ascii_digit() => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let num: String = chars[start..i].iter().collect();
                let n = num.parse::<f64>().map_err(|e| {
                    CoreError::ExpressionEvaluation(src.to_string(), e.to_string())
                })?;
                tokens.push(Token::Number(n));
            }
            _ if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    "not" => tokens.push(Token::Not),
                    "matches" => tokens.push(Token::Matches),
                    "true" => tokens.push(Token::Ident("__true__".into())),
                    "false" => tokens.push(Token::Ident("__false__".into())),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            other => {
                return Err(CoreError::ExpressionEvaluation(
                    src.to_string(),
                    format!("unexpected character '{other}'"),
                ));
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.next();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.next();
            let rhs = self.parse_unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.next();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let lhs = self.parse_additive()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.next();
            let rhs = self.parse_additive()?;
            return Ok(Expr::Compare(Box::new(lhs), op, Box::new(rhs)));
        }
        if matches!(self.peek(), Some(Token::Matches)) {
            self.next();
            let pattern = match self.next() {
                Some(Token::Str(s)) => s,
                other => {
                    return Err(CoreError::ExpressionEvaluation(
                        "expression".into(),
                        format!("expected string pattern after 'matches', got {other:?}"),
                    ))
                }
            };
            return Ok(Expr::Matches(Box::new(lhs), pattern));
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        while let Some(Token::Arith(op @ (ArithOp::Add | ArithOp::Sub))) = self.peek().cloned() {
            self.next();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Arith(Box::new(lhs), op, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_primary()?;
        while let Some(Token::Arith(op @ (ArithOp::Mul | ArithOp::Div))) = self.peek().cloned() {
            self.next();
            let rhs = self.parse_primary()?;
            lhs = Expr::Arith(Box::new(lhs), op, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(CoreError::ExpressionEvaluation(
                        "expression".into(),
                        "expected closing parenthesis".into(),
                    )),
                }
            }
            Some(Token::Number(n)) => Ok(Expr::Literal(Literal::Number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Literal::Str(s))),
            Some(Token::Ident(id)) if id == "__true__" => Ok(Expr::Literal(Literal::Bool(true))),
            Some(Token::Ident(id)) if id == "__false__" => Ok(Expr::Literal(Literal::Bool(false))),
            Some(Token::Ident(id)) => Ok(Expr::Field(id)),
            other => Err(CoreError::ExpressionEvaluation(
                "expression".into(),
                format!("unexpected token {other:?}"),
            )),
        }
    }
}

pub fn parse(source: &str) -> Result<Expr> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(CoreError::ExpressionEvaluation(
            source.to_string(),
            "empty expression".into(),
        ));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(CoreError::ExpressionEvaluation(
            source.to_string(),
            "trailing tokens after expression".into(),
        ));
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn comparison_and_logic() {
        let record = json!({"severity": "high", "score": 0.8, "metric": "cpu.load"});
        assert!(evaluate("score > 0.5 and severity == \"high\"", &record).unwrap());
        assert!(!evaluate("score > 0.9", &record).unwrap());
        assert!(evaluate("not (score > 0.9)", &record).unwrap());
    }

    #[test]
    fn nested_field_lookup() {
        let record = json!({"sample": {"labels": {"region": "us-east"}}});
        assert!(evaluate("sample.labels.region == \"us-east\"", &record).unwrap());
    }

    #[test]
    fn regex_match() {
        let record = json!({"metric": "svc.requests.rate"});
        assert!(evaluate("metric matches \"^svc\\\\.\"", &record).unwrap());
        assert!(!evaluate("metric matches \"^xyz\"", &record).unwrap());
    }

    #[test]
    fn invalid_expression_is_an_error_not_a_panic() {
        let record = json!({});
        assert!(evaluate("score >", &record).is_err());
        assert!(evaluate("", &record).is_err());
    }
}
