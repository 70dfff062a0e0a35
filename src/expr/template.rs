//! String template evaluator
//!
//! Templates are literal text with `${expr}` substitutions. An expression
//! is a dotted variable path, any condition-grammar expression, or a
//! helper call (`upper`, `lower`, `capitalize`, `trim`, `length`, `join`,
//! `formatNumber`, `formatDate`, `if`, `default`). Helper calls nest.

use crate::error::{Error, Result};
use crate::expr::condition::{self, type_name, Expr};
use crate::expr::lexer::{tokenize, Token};
use crate::expr::{EvalOptions, VariableResolver};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

/// Render a template to a string.
pub fn render(text: &str, vars: &dyn VariableResolver, options: &EvalOptions) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    for piece in split(text)? {
        match piece {
            Piece::Literal(s) => out.push_str(s),
            Piece::Substitution(expr) => {
                let value = eval_substitution(expr, vars, options)?;
                out.push_str(&display(&value));
            },
        }
    }
    Ok(out)
}

/// Evaluate a template, preserving the value type when the whole text is
/// a single `${...}` substitution. Used for tool parameters so structured
/// values survive instead of being flattened to strings.
pub fn evaluate_value(
    text: &str,
    vars: &dyn VariableResolver,
    options: &EvalOptions,
) -> Result<Value> {
    let pieces = split(text)?;
    if let [Piece::Substitution(expr)] = pieces.as_slice() {
        return eval_substitution(expr, vars, options);
    }
    render(text, vars, options).map(Value::String)
}

/// Variable names referenced by a template's substitutions. Used by
/// workflow validation; unparseable substitutions contribute nothing
/// (they fail later, at evaluation time).
pub fn referenced_variables(text: &str) -> Vec<String> {
    let mut names = Vec::new();
    let Ok(pieces) = split(text) else {
        return names;
    };
    for piece in pieces {
        if let Piece::Substitution(expr) = piece {
            if let Ok(tokens) = tokenize(expr) {
                if let Ok(parsed) = parse_template_expr(&tokens) {
                    collect_refs(&parsed, &mut names);
                }
            }
        }
    }
    names.sort();
    names.dedup();
    names
}

/// Variable names referenced by a bare condition expression (no `${...}`
/// wrapper), e.g. a loop's break condition. Same best-effort contract as
/// [`referenced_variables`].
pub fn condition_references(expr: &str) -> Vec<String> {
    let mut names = Vec::new();
    if let Ok(tokens) = tokenize(expr) {
        if let Ok(parsed) = condition::parse_tokens(&tokens) {
            collect_expr_refs(&parsed, &mut names);
        }
    }
    names.sort();
    names.dedup();
    names
}

enum Piece<'a> {
    Literal(&'a str),
    Substitution(&'a str),
}

/// Split template text into literal runs and `${...}` bodies. A `}`
/// inside a quoted string does not terminate the substitution.
fn split(text: &str) -> Result<Vec<Piece<'_>>> {
    let mut pieces = Vec::new();
    let bytes = text.as_bytes();
    let mut cursor = 0;

    while let Some(open) = text[cursor..].find("${").map(|i| cursor + i) {
        if open > cursor {
            pieces.push(Piece::Literal(&text[cursor..open]));
        }

        let body_start = open + 2;
        let mut quote: Option<u8> = None;
        let mut close = None;
        let mut i = body_start;
        while i < bytes.len() {
            let b = bytes[i];
            match quote {
                Some(q) => {
                    if b == b'\\' {
                        i += 1;
                    } else if b == q {
                        quote = None;
                    }
                },
                None => match b {
                    b'\'' | b'"' => quote = Some(b),
                    b'}' => {
                        close = Some(i);
                        break;
                    },
                    _ => {},
                },
            }
            i += 1;
        }

        let close = close
            .ok_or_else(|| Error::Expression(format!("unterminated ${{...}} in template: {}", text)))?;
        pieces.push(Piece::Substitution(&text[body_start..close]));
        cursor = close + 1;
    }

    if cursor < text.len() {
        pieces.push(Piece::Literal(&text[cursor..]));
    }
    Ok(pieces)
}

/// An expression inside `${...}`: either plain condition grammar or a
/// helper call with nested arguments.
enum TemplateExpr {
    Plain(Expr),
    Call(String, Vec<TemplateExpr>),
}

fn parse_template_expr(tokens: &[Token]) -> Result<TemplateExpr> {
    if let [Token::Ident(name), Token::LParen, ..] = tokens {
        if tokens.last() == Some(&Token::RParen) && call_spans_all(tokens) {
            let args = split_args(&tokens[2..tokens.len() - 1])?
                .into_iter()
                .map(parse_template_expr)
                .collect::<Result<Vec<_>>>()?;
            return Ok(TemplateExpr::Call(name.clone(), args));
        }
    }
    condition::parse_tokens(tokens).map(TemplateExpr::Plain)
}

/// True when the `(` at index 1 closes at the final token, i.e. the whole
/// expression is one call rather than a call inside a larger expression.
fn call_spans_all(tokens: &[Token]) -> bool {
    let mut depth = 0usize;
    for (i, token) in tokens.iter().enumerate().skip(1) {
        match token {
            Token::LParen => depth += 1,
            Token::RParen => {
                depth -= 1;
                if depth == 0 {
                    return i == tokens.len() - 1;
                }
            },
            _ => {},
        }
    }
    false
}

/// Split argument tokens on top-level commas.
fn split_args(tokens: &[Token]) -> Result<Vec<&[Token]>> {
    if tokens.is_empty() {
        return Ok(Vec::new());
    }
    let mut args = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, token) in tokens.iter().enumerate() {
        match token {
            Token::LParen | Token::LBracket => depth += 1,
            Token::RParen | Token::RBracket => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| Error::Expression("unbalanced parentheses".to_string()))?;
            },
            Token::Comma if depth == 0 => {
                args.push(&tokens[start..i]);
                start = i + 1;
            },
            _ => {},
        }
    }
    args.push(&tokens[start..]);
    if args.iter().any(|a| a.is_empty()) {
        return Err(Error::Expression("empty helper argument".to_string()));
    }
    Ok(args)
}

fn eval_substitution(
    expr_text: &str,
    vars: &dyn VariableResolver,
    options: &EvalOptions,
) -> Result<Value> {
    let tokens = tokenize(expr_text)?;
    let expr = parse_template_expr(&tokens)?;
    match eval_template_expr(&expr, vars, options) {
        Ok(value) => Ok(value),
        Err(Error::UndefinedVariable(_)) if !options.strict => {
            Ok(Value::String(options.missing_placeholder.clone()))
        },
        Err(e) => Err(e),
    }
}

fn eval_template_expr(
    expr: &TemplateExpr,
    vars: &dyn VariableResolver,
    options: &EvalOptions,
) -> Result<Value> {
    match expr {
        TemplateExpr::Plain(inner) => condition::eval_expr(inner, vars),
        TemplateExpr::Call(name, args) => eval_call(name, args, vars, options),
    }
}

fn eval_call(
    name: &str,
    args: &[TemplateExpr],
    vars: &dyn VariableResolver,
    options: &EvalOptions,
) -> Result<Value> {
    // `default` gets special treatment: an undefined first argument is
    // the case it exists for, not an error.
    if name == "default" {
        expect_arity(name, args, 2, 2)?;
        let value = match eval_template_expr(&args[0], vars, options) {
            Ok(Value::Null) | Err(Error::UndefinedVariable(_)) => None,
            Ok(value) => Some(value),
            Err(e) => return Err(e),
        };
        return match value {
            Some(v) => Ok(v),
            None => eval_template_expr(&args[1], vars, options),
        };
    }

    match name {
        "upper" => {
            expect_arity(name, args, 1, 1)?;
            let s = eval_string(&args[0], vars, options)?;
            Ok(Value::String(s.to_uppercase()))
        },
        "lower" => {
            expect_arity(name, args, 1, 1)?;
            let s = eval_string(&args[0], vars, options)?;
            Ok(Value::String(s.to_lowercase()))
        },
        "capitalize" => {
            expect_arity(name, args, 1, 1)?;
            let s = eval_string(&args[0], vars, options)?;
            let mut chars = s.chars();
            let capitalized = match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            };
            Ok(Value::String(capitalized))
        },
        "trim" => {
            expect_arity(name, args, 1, 1)?;
            let s = eval_string(&args[0], vars, options)?;
            Ok(Value::String(s.trim().to_string()))
        },
        "length" => {
            expect_arity(name, args, 1, 1)?;
            let value = eval_template_expr(&args[0], vars, options)?;
            let len = match &value {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                other => {
                    return Err(Error::Expression(format!(
                        "length() expects a string, array, or object, got {}",
                        type_name(other)
                    )));
                },
            };
            Ok(Value::Number(len.into()))
        },
        "join" => {
            expect_arity(name, args, 2, 2)?;
            let value = eval_template_expr(&args[0], vars, options)?;
            let sep = eval_string(&args[1], vars, options)?;
            let Value::Array(items) = value else {
                return Err(Error::Expression(format!(
                    "join() expects an array, got {}",
                    type_name(&value)
                )));
            };
            let joined =
                items.iter().map(display).collect::<Vec<_>>().join(&sep);
            Ok(Value::String(joined))
        },
        "formatNumber" => {
            expect_arity(name, args, 1, 2)?;
            let value = eval_template_expr(&args[0], vars, options)?;
            let n = value.as_f64().ok_or_else(|| {
                Error::Expression(format!(
                    "formatNumber() expects a number, got {}",
                    type_name(&value)
                ))
            })?;
            let decimals = match args.get(1) {
                Some(arg) => {
                    let d = eval_template_expr(arg, vars, options)?;
                    d.as_u64().ok_or_else(|| {
                        Error::Expression("formatNumber() decimals must be a non-negative integer".to_string())
                    })? as usize
                },
                None => 2,
            };
            Ok(Value::String(format!("{:.*}", decimals, n)))
        },
        "formatDate" => {
            expect_arity(name, args, 1, 2)?;
            let value = eval_template_expr(&args[0], vars, options)?;
            let datetime = parse_datetime(&value)?;
            let fmt = match args.get(1) {
                Some(arg) => eval_string(arg, vars, options)?,
                None => "%Y-%m-%d".to_string(),
            };
            Ok(Value::String(datetime.format(&fmt).to_string()))
        },
        "if" => {
            expect_arity(name, args, 2, 3)?;
            let cond = match eval_template_expr(&args[0], vars, options)? {
                Value::Bool(b) => b,
                other => {
                    return Err(Error::Expression(format!(
                        "if() condition must be a boolean, got {}",
                        type_name(&other)
                    )));
                },
            };
            if cond {
                eval_template_expr(&args[1], vars, options)
            } else {
                match args.get(2) {
                    Some(arg) => eval_template_expr(arg, vars, options),
                    None => Ok(Value::String(String::new())),
                }
            }
        },
        other => Err(Error::Expression(format!("unknown template helper: {}", other))),
    }
}

fn expect_arity(name: &str, args: &[TemplateExpr], min: usize, max: usize) -> Result<()> {
    if args.len() < min || args.len() > max {
        return Err(Error::Expression(format!(
            "{}() takes {} argument(s), got {}",
            name,
            if min == max {
                min.to_string()
            } else {
                format!("{}..{}", min, max)
            },
            args.len()
        )));
    }
    Ok(())
}

fn eval_string(
    expr: &TemplateExpr,
    vars: &dyn VariableResolver,
    options: &EvalOptions,
) -> Result<String> {
    Ok(display(&eval_template_expr(expr, vars, options)?))
}

/// RFC 3339 strings or epoch seconds.
fn parse_datetime(value: &Value) -> Result<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| Error::Expression(format!("formatDate() cannot parse {:?}: {}", s, e))),
        Value::Number(n) => {
            let secs = n.as_i64().ok_or_else(|| {
                Error::Expression("formatDate() epoch value must be an integer".to_string())
            })?;
            Utc.timestamp_opt(secs, 0).single().ok_or_else(|| {
                Error::Expression(format!("formatDate() epoch out of range: {}", secs))
            })
        },
        other => Err(Error::Expression(format!(
            "formatDate() expects a string or number, got {}",
            type_name(other)
        ))),
    }
}

/// Render a value into template output.
pub(crate) fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                display_number(f)
            } else {
                n.to_string()
            }
        },
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn display_number(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        format!("{}", f)
    }
}

fn collect_refs(expr: &TemplateExpr, names: &mut Vec<String>) {
    match expr {
        TemplateExpr::Plain(inner) => collect_expr_refs(inner, names),
        TemplateExpr::Call(_, args) => {
            for arg in args {
                collect_refs(arg, names);
            }
        },
    }
}

fn collect_expr_refs(expr: &Expr, names: &mut Vec<String>) {
    match expr {
        Expr::Path(path) => {
            if let Some(head) = path.first() {
                if head != "@" {
                    names.push(head.clone());
                }
            }
        },
        Expr::Compare(l, _, r) | Expr::And(l, r) | Expr::Or(l, r) => {
            collect_expr_refs(l, names);
            collect_expr_refs(r, names);
        },
        Expr::Not(inner) => collect_expr_refs(inner, names),
        Expr::Literal(_) => {},
    }
}
