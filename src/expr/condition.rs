//! Condition expression parser and evaluator
//!
//! Boolean algebra over typed comparisons: literals, dotted variable
//! paths, `== != < <= > >=`, and `&& || !` with `!` binding tightest and
//! `||` loosest. Comparisons on mismatched types fail the evaluation
//! rather than coercing.

use crate::error::{Error, Result};
use crate::expr::lexer::{tokenize, Token};
use crate::expr::VariableResolver;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Value),
    /// Dotted path; the head is a variable name, or `@` for the current
    /// element inside a JSONPath filter.
    Path(Vec<String>),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

/// Evaluate a condition expression to a boolean.
pub fn evaluate(expr: &str, vars: &dyn VariableResolver) -> Result<bool> {
    let tokens = tokenize(expr)?;
    let parsed = parse_tokens(&tokens)?;
    match eval_expr(&parsed, vars)? {
        Value::Bool(b) => Ok(b),
        other => Err(Error::Expression(format!(
            "condition evaluated to {} instead of a boolean",
            type_name(&other)
        ))),
    }
}

/// Parse a full token stream into an expression tree.
pub(crate) fn parse_tokens(tokens: &[Token]) -> Result<Expr> {
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != tokens.len() {
        return Err(Error::Expression(format!(
            "unexpected trailing {}",
            tokens[parser.pos].describe()
        )));
    }
    Ok(expr)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: &Token) -> Result<()> {
        match self.advance() {
            Some(t) if t == expected => Ok(()),
            Some(t) => Err(Error::Expression(format!(
                "expected {:?}, found {}",
                expected,
                t.describe()
            ))),
            None => Err(Error::Expression(format!(
                "expected {:?}, found end of expression",
                expected
            ))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(operand)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let left = self.parse_primary()?;
        let op = match self.peek() {
            Some(Token::Eq) => CmpOp::Eq,
            Some(Token::Ne) => CmpOp::Ne,
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::Le) => CmpOp::Le,
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::Ge) => CmpOp::Ge,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_primary()?;
        Ok(Expr::Compare(Box::new(left), op, Box::new(right)))
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.advance().cloned() {
            Some(Token::Number(n)) => Ok(Expr::Literal(number_value(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Ident(name)) => {
                let mut path = vec![name];
                self.parse_path_tail(&mut path)?;
                Ok(Expr::Path(path))
            },
            Some(Token::At) => {
                let mut path = vec!["@".to_string()];
                self.parse_path_tail(&mut path)?;
                Ok(Expr::Path(path))
            },
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            },
            Some(other) => Err(Error::Expression(format!(
                "unexpected {} in expression",
                other.describe()
            ))),
            None => Err(Error::Expression("unexpected end of expression".to_string())),
        }
    }

    fn parse_path_tail(&mut self, path: &mut Vec<String>) -> Result<()> {
        while self.peek() == Some(&Token::Dot) {
            self.advance();
            match self.advance().cloned() {
                Some(Token::Ident(seg)) => path.push(seg),
                Some(Token::Number(n)) if n.fract() == 0.0 && n >= 0.0 => {
                    path.push((n as u64).to_string());
                },
                Some(other) => {
                    return Err(Error::Expression(format!(
                        "expected field name after `.`, found {}",
                        other.describe()
                    )));
                },
                None => {
                    return Err(Error::Expression(
                        "expected field name after `.`".to_string(),
                    ));
                },
            }
        }
        Ok(())
    }
}

/// Evaluate a parsed expression against a resolver.
pub(crate) fn eval_expr(expr: &Expr, vars: &dyn VariableResolver) -> Result<Value> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(path) => resolve_path(path, vars),
        Expr::Compare(left, op, right) => {
            let lhs = eval_expr(left, vars)?;
            let rhs = eval_expr(right, vars)?;
            compare(&lhs, *op, &rhs).map(Value::Bool)
        },
        Expr::And(left, right) => {
            if !eval_bool(left, vars)? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(eval_bool(right, vars)?))
        },
        Expr::Or(left, right) => {
            if eval_bool(left, vars)? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(eval_bool(right, vars)?))
        },
        Expr::Not(inner) => Ok(Value::Bool(!eval_bool(inner, vars)?)),
    }
}

fn eval_bool(expr: &Expr, vars: &dyn VariableResolver) -> Result<bool> {
    match eval_expr(expr, vars)? {
        Value::Bool(b) => Ok(b),
        other => Err(Error::Expression(format!(
            "expected boolean operand, got {}",
            type_name(&other)
        ))),
    }
}

/// Walk a dotted path from the resolver through nested objects; numeric
/// segments index into arrays.
pub(crate) fn resolve_path(path: &[String], vars: &dyn VariableResolver) -> Result<Value> {
    let head = &path[0];
    let mut current = vars
        .resolve(head)
        .ok_or_else(|| Error::UndefinedVariable(head.clone()))?;

    for segment in &path[1..] {
        current = match &current {
            Value::Object(map) => map
                .get(segment)
                .cloned()
                .ok_or_else(|| Error::UndefinedVariable(path.join(".")))?,
            Value::Array(items) => {
                let index: usize = segment
                    .parse()
                    .map_err(|_| Error::UndefinedVariable(path.join(".")))?;
                items
                    .get(index)
                    .cloned()
                    .ok_or_else(|| Error::UndefinedVariable(path.join(".")))?
            },
            _ => return Err(Error::UndefinedVariable(path.join("."))),
        };
    }
    Ok(current)
}

fn compare(lhs: &Value, op: CmpOp, rhs: &Value) -> Result<bool> {
    match op {
        CmpOp::Eq | CmpOp::Ne => {
            let equal = values_equal(lhs, rhs)?;
            Ok(if op == CmpOp::Eq { equal } else { !equal })
        },
        _ => {
            let (a, b) = match (lhs.as_f64(), rhs.as_f64()) {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    return Err(Error::Expression(format!(
                        "ordering comparison requires numbers, got {} and {}",
                        type_name(lhs),
                        type_name(rhs)
                    )));
                },
            };
            Ok(match op {
                CmpOp::Lt => a < b,
                CmpOp::Le => a <= b,
                CmpOp::Gt => a > b,
                CmpOp::Ge => a >= b,
                CmpOp::Eq | CmpOp::Ne => unreachable!(),
            })
        },
    }
}

/// Equality requires matching types; numbers compare numerically so that
/// `1` and `1.0` are equal.
fn values_equal(lhs: &Value, rhs: &Value) -> Result<bool> {
    match (lhs, rhs) {
        (Value::Number(_), Value::Number(_)) => {
            Ok(lhs.as_f64().expect("checked number") == rhs.as_f64().expect("checked number"))
        },
        (Value::String(a), Value::String(b)) => Ok(a == b),
        (Value::Bool(a), Value::Bool(b)) => Ok(a == b),
        (Value::Null, Value::Null) => Ok(true),
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            Ok(lhs == rhs)
        },
        _ => Err(Error::Expression(format!(
            "cannot compare {} with {}",
            type_name(lhs),
            type_name(rhs)
        ))),
    }
}

pub(crate) fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < (i64::MAX as f64) {
        Value::Number((n as i64).into())
    } else {
        serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn comparisons_and_logic() {
        let ctx = vars(&[("userRole", json!("admin")), ("count", json!(5))]);
        assert!(evaluate("userRole == \"admin\"", &ctx).unwrap());
        assert!(!evaluate("userRole != \"admin\"", &ctx).unwrap());
        assert!(evaluate("count > 3 && count <= 5", &ctx).unwrap());
        assert!(evaluate("count < 3 || userRole == \"admin\"", &ctx).unwrap());
    }

    #[test]
    fn not_binds_tighter_than_and() {
        let ctx = vars(&[("a", json!(false)), ("b", json!(true))]);
        // !a && b  ==  (!a) && b
        assert!(evaluate("!a && b", &ctx).unwrap());
        assert!(!evaluate("!(a || b)", &ctx).unwrap());
    }

    #[test]
    fn dotted_paths_walk_objects() {
        let ctx = vars(&[("user", json!({"profile": {"age": 30}, "tags": ["x", "y"]}))]);
        assert!(evaluate("user.profile.age >= 18", &ctx).unwrap());
        assert!(evaluate("user.tags.1 == \"y\"", &ctx).unwrap());
    }

    #[test]
    fn type_mismatch_fails() {
        let ctx = vars(&[("n", json!(1)), ("s", json!("1"))]);
        assert!(evaluate("n == s", &ctx).is_err());
        assert!(evaluate("s > 0", &ctx).is_err());
    }

    #[test]
    fn undefined_variable_fails() {
        let ctx = vars(&[]);
        match evaluate("missing == 1", &ctx) {
            Err(Error::UndefinedVariable(name)) => assert_eq!(name, "missing"),
            other => panic!("expected UndefinedVariable, got {other:?}"),
        }
    }

    #[test]
    fn integer_and_float_equality() {
        let ctx = vars(&[("x", json!(2))]);
        assert!(evaluate("x == 2.0", &ctx).unwrap());
    }

    #[test]
    fn non_boolean_result_rejected() {
        let ctx = vars(&[("x", json!(2))]);
        assert!(evaluate("x", &ctx).is_err());
    }

    #[test]
    fn short_circuit_skips_undefined_rhs() {
        let ctx = vars(&[("ok", json!(true))]);
        assert!(evaluate("ok || missing == 1", &ctx).unwrap());
    }
}
