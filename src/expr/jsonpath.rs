//! JSONPath evaluator for transform expressions
//!
//! Supports field access, wildcards, slices, negative indices, recursive
//! descent, and `[?(@.field op value)]` filters over the condition
//! grammar. A definite path (fields and indices only) yields the single
//! matched value; wildcard, slice, descent, and filter paths yield an
//! array of all matches.

use crate::error::{Error, Result};
use crate::expr::condition::{self, Expr};
use crate::expr::lexer::{tokenize, Token};
use crate::expr::VariableResolver;
use serde_json::Value;

#[derive(Debug, Clone)]
enum Segment {
    Field(String),
    Index(i64),
    Slice(Option<i64>, Option<i64>),
    Wildcard,
    Descent,
    Filter(Expr),
}

impl Segment {
    /// Plural segments turn the result into an array of matches.
    fn is_plural(&self) -> bool {
        matches!(
            self,
            Segment::Wildcard | Segment::Slice(..) | Segment::Descent | Segment::Filter(_)
        )
    }
}

/// Apply a JSONPath expression (starting with `$`) to an input value.
pub fn query(path: &str, input: &Value) -> Result<Value> {
    let segments = parse(path)?;
    let plural = segments.iter().any(Segment::is_plural);

    let mut nodes = vec![input.clone()];
    for segment in &segments {
        nodes = apply(segment, nodes);
    }

    if plural {
        Ok(Value::Array(nodes))
    } else {
        nodes
            .into_iter()
            .next()
            .ok_or_else(|| Error::Expression(format!("JSONPath {} matched nothing", path)))
    }
}

fn parse(path: &str) -> Result<Vec<Segment>> {
    let tokens = tokenize(path)?;
    let mut parser = PathParser { tokens: &tokens, pos: 0 };
    parser.expect_dollar()?;
    parser.parse_segments()
}

struct PathParser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> PathParser<'a> {
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

    fn expect_dollar(&mut self) -> Result<()> {
        match self.advance() {
            Some(Token::Dollar) => Ok(()),
            _ => Err(Error::Expression("JSONPath must start with `$`".to_string())),
        }
    }

    fn parse_segments(&mut self) -> Result<Vec<Segment>> {
        let mut segments = Vec::new();
        while let Some(token) = self.peek() {
            match token {
                Token::Dot => {
                    self.advance();
                    segments.push(self.parse_dot_segment()?);
                },
                Token::DotDot => {
                    self.advance();
                    segments.push(Segment::Descent);
                    // `..foo` and `..[...]` both apply a selector to every
                    // descendant; bare `..` at the end is invalid.
                    match self.peek() {
                        Some(Token::LBracket) => {
                            self.advance();
                            segments.push(self.parse_bracket_segment()?);
                        },
                        Some(_) => segments.push(self.parse_dot_segment()?),
                        None => {
                            return Err(Error::Expression(
                                "JSONPath ends with dangling `..`".to_string(),
                            ));
                        },
                    }
                },
                Token::LBracket => {
                    self.advance();
                    segments.push(self.parse_bracket_segment()?);
                },
                other => {
                    return Err(Error::Expression(format!(
                        "unexpected {} in JSONPath",
                        other.describe()
                    )));
                },
            }
        }
        Ok(segments)
    }

    fn parse_dot_segment(&mut self) -> Result<Segment> {
        match self.advance().cloned() {
            Some(Token::Ident(name)) => Ok(Segment::Field(name)),
            Some(Token::Star) => Ok(Segment::Wildcard),
            Some(other) => Err(Error::Expression(format!(
                "expected field name after `.`, found {}",
                other.describe()
            ))),
            None => Err(Error::Expression("JSONPath ends with dangling `.`".to_string())),
        }
    }

    fn parse_bracket_segment(&mut self) -> Result<Segment> {
        let segment = match self.peek().cloned() {
            Some(Token::Star) => {
                self.advance();
                Segment::Wildcard
            },
            Some(Token::Str(name)) => {
                self.advance();
                Segment::Field(name)
            },
            Some(Token::Question) => {
                self.advance();
                return self.parse_filter();
            },
            Some(Token::Colon) => {
                self.advance();
                let end = self.parse_optional_int()?;
                Segment::Slice(None, end)
            },
            Some(Token::Number(n)) => {
                self.advance();
                let first = int_from(n)?;
                if self.peek() == Some(&Token::Colon) {
                    self.advance();
                    let end = self.parse_optional_int()?;
                    Segment::Slice(Some(first), end)
                } else {
                    Segment::Index(first)
                }
            },
            Some(other) => {
                return Err(Error::Expression(format!(
                    "unexpected {} in JSONPath brackets",
                    other.describe()
                )));
            },
            None => return Err(Error::Expression("unterminated `[` in JSONPath".to_string())),
        };

        match self.advance() {
            Some(Token::RBracket) => Ok(segment),
            _ => Err(Error::Expression("expected `]` in JSONPath".to_string())),
        }
    }

    fn parse_optional_int(&mut self) -> Result<Option<i64>> {
        if let Some(Token::Number(n)) = self.peek().cloned() {
            self.advance();
            return Ok(Some(int_from(n)?));
        }
        Ok(None)
    }

    /// `[?(expr)]` — the filter body reuses the condition grammar with
    /// `@` bound to the element under test.
    fn parse_filter(&mut self) -> Result<Segment> {
        match self.advance() {
            Some(Token::LParen) => {},
            _ => return Err(Error::Expression("expected `(` after `?` in filter".to_string())),
        }

        let start = self.pos;
        let mut depth = 1usize;
        while let Some(token) = self.advance() {
            match token {
                Token::LParen => depth += 1,
                Token::RParen => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                },
                _ => {},
            }
        }
        if depth != 0 {
            return Err(Error::Expression("unterminated filter in JSONPath".to_string()));
        }

        let inner = &self.tokens[start..self.pos - 1];
        let expr = condition::parse_tokens(inner)?;

        match self.advance() {
            Some(Token::RBracket) => Ok(Segment::Filter(expr)),
            _ => Err(Error::Expression("expected `]` after filter".to_string())),
        }
    }
}

fn int_from(n: f64) -> Result<i64> {
    if n.fract() != 0.0 {
        return Err(Error::Expression(format!(
            "JSONPath index must be an integer, got {}",
            n
        )));
    }
    Ok(n as i64)
}

fn apply(segment: &Segment, nodes: Vec<Value>) -> Vec<Value> {
    let mut out = Vec::new();
    for node in nodes {
        match segment {
            Segment::Field(name) => {
                if let Value::Object(map) = &node {
                    if let Some(value) = map.get(name) {
                        out.push(value.clone());
                    }
                }
            },
            Segment::Index(index) => {
                if let Value::Array(items) = &node {
                    if let Some(resolved) = resolve_index(*index, items.len()) {
                        out.push(items[resolved].clone());
                    }
                }
            },
            Segment::Slice(start, end) => {
                if let Value::Array(items) = &node {
                    let len = items.len() as i64;
                    let lo = clamp_bound(start.unwrap_or(0), len);
                    let hi = clamp_bound(end.unwrap_or(len), len);
                    if lo < hi {
                        out.extend(items[lo as usize..hi as usize].iter().cloned());
                    }
                }
            },
            Segment::Wildcard => match &node {
                Value::Array(items) => out.extend(items.iter().cloned()),
                Value::Object(map) => out.extend(map.values().cloned()),
                _ => {},
            },
            Segment::Descent => collect_descendants(&node, &mut out),
            Segment::Filter(expr) => {
                if let Value::Array(items) = &node {
                    for item in items {
                        if filter_matches(expr, item) {
                            out.push(item.clone());
                        }
                    }
                }
            },
        }
    }
    out
}

fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let resolved = if index < 0 { len + index } else { index };
    if (0..len).contains(&resolved) {
        Some(resolved as usize)
    } else {
        None
    }
}

fn clamp_bound(bound: i64, len: i64) -> i64 {
    let resolved = if bound < 0 { len + bound } else { bound };
    resolved.clamp(0, len)
}

/// Pre-order traversal: the node itself, then its children.
fn collect_descendants(node: &Value, out: &mut Vec<Value>) {
    out.push(node.clone());
    match node {
        Value::Array(items) => {
            for item in items {
                collect_descendants(item, out);
            }
        },
        Value::Object(map) => {
            for value in map.values() {
                collect_descendants(value, out);
            }
        },
        _ => {},
    }
}

/// A filter that errors (missing field, type mismatch) excludes the
/// element instead of failing the whole query.
fn filter_matches(expr: &Expr, item: &Value) -> bool {
    struct ElementScope<'a>(&'a Value);
    impl VariableResolver for ElementScope<'_> {
        fn resolve(&self, name: &str) -> Option<Value> {
            (name == "@").then(|| self.0.clone())
        }
    }

    matches!(
        condition::eval_expr(expr, &ElementScope(item)),
        Ok(Value::Bool(true))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> Value {
        json!({
            "store": {
                "book": [
                    {"title": "Sayings", "price": 8.95, "category": "quote"},
                    {"title": "Moby Dick", "price": 12.99, "category": "fiction"},
                    {"title": "Odyssey", "price": 22.99, "category": "fiction"}
                ],
                "bicycle": {"color": "red", "price": 19.95}
            }
        })
    }

    #[test]
    fn definite_path_returns_scalar() {
        let result = query("$.store.bicycle.color", &store()).unwrap();
        assert_eq!(result, json!("red"));
    }

    #[test]
    fn definite_path_missing_is_error() {
        assert!(query("$.store.tricycle", &store()).is_err());
    }

    #[test]
    fn wildcard_returns_array() {
        let result = query("$.store.book[*].title", &store()).unwrap();
        assert_eq!(result, json!(["Sayings", "Moby Dick", "Odyssey"]));
    }

    #[test]
    fn negative_index() {
        let result = query("$.store.book[-1].title", &store()).unwrap();
        assert_eq!(result, json!("Odyssey"));
    }

    #[test]
    fn slices() {
        let result = query("$.store.book[0:2].title", &store()).unwrap();
        assert_eq!(result, json!(["Sayings", "Moby Dick"]));

        let result = query("$.store.book[1:].price", &store()).unwrap();
        assert_eq!(result, json!([12.99, 22.99]));
    }

    #[test]
    fn recursive_descent_collects_all_prices() {
        // serde_json object iteration is key-sorted, so the bicycle's
        // price is visited before the books'.
        let result = query("$..price", &store()).unwrap();
        assert_eq!(result, json!([19.95, 8.95, 12.99, 22.99]));
    }

    #[test]
    fn filters_with_comparison() {
        let result = query("$.store.book[?(@.price < 10)].title", &store()).unwrap();
        assert_eq!(result, json!(["Sayings"]));

        let result = query("$.store.book[?(@.category == \"fiction\")].title", &store()).unwrap();
        assert_eq!(result, json!(["Moby Dick", "Odyssey"]));
    }

    #[test]
    fn filter_errors_exclude_element() {
        let data = json!({"items": [{"n": 1}, {"s": "x"}, {"n": 5}]});
        let result = query("$.items[?(@.n > 2)]", &data).unwrap();
        assert_eq!(result, json!([{"n": 5}]));
    }

    #[test]
    fn bracket_field_access() {
        let result = query("$.store[\"bicycle\"].price", &store()).unwrap();
        assert_eq!(result, json!(19.95));
    }

    #[test]
    fn rejects_malformed_paths() {
        assert!(query("store.book", &store()).is_err());
        assert!(query("$.store.book[", &store()).is_err());
        assert!(query("$..", &store()).is_err());
    }
}
