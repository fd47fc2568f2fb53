use serde_json::Value;
use winnow::ascii::{digit1, multispace0};
use winnow::combinator::{opt, preceded};
use winnow::error::{ContextError, ErrMode, StrContext, StrContextValue};
use winnow::token::{any, take_while};
use winnow::{ModalResult, Parser};

use medallion_types::MedallionError;

use crate::ast::*;

const RESERVED: &[&str] = &[
    "and", "or", "not", "is", "in", "like", "between", "case", "when", "then", "else", "end",
    "as", "from", "where", "select", "null", "true", "false",
];

fn is_reserved(word: &str) -> bool {
    RESERVED.iter().any(|r| r.eq_ignore_ascii_case(word))
}

fn make_cut_error(desc: &'static str) -> ErrMode<ContextError<StrContext>> {
    let mut e = ContextError::new();
    e.push(StrContext::Expected(StrContextValue::Description(desc)));
    ErrMode::Cut(e)
}

fn backtrack<T>() -> ModalResult<T> {
    Err(ErrMode::Backtrack(ContextError::new()))
}

/// Whitespace consumer (including newlines).
fn ws<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    multispace0.parse_next(input)
}

/// Parse an identifier: [A-Za-z_][A-Za-z0-9_]*
fn identifier<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    (
        take_while(1, |c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(0.., |c: char| c.is_ascii_alphanumeric() || c == '_'),
    )
        .take()
        .parse_next(input)
}

/// Match a case-insensitive keyword, backtracking on any other word.
fn keyword<'i>(kw: &'static str) -> impl FnMut(&mut &'i str) -> ModalResult<&'i str> {
    move |input: &mut &'i str| {
        let before = *input;
        let word = identifier.parse_next(input)?;
        if word.eq_ignore_ascii_case(kw) {
            Ok(word)
        } else {
            *input = before;
            backtrack()
        }
    }
}

fn expect_keyword(input: &mut &str, kw: &'static str, desc: &'static str) -> ModalResult<()> {
    let _ = ws.parse_next(input)?;
    keyword(kw)
        .parse_next(input)
        .map_err(|_| make_cut_error(desc))?;
    Ok(())
}

fn expect_char(input: &mut &str, c: char, desc: &'static str) -> ModalResult<()> {
    let _ = ws.parse_next(input)?;
    if input.starts_with(c) {
        *input = &input[c.len_utf8()..];
        Ok(())
    } else {
        Err(make_cut_error(desc))
    }
}

/// Parse an unsigned integer or decimal literal.
fn number(input: &mut &str) -> ModalResult<Value> {
    let s: &str = (digit1, opt(('.', digit1))).take().parse_next(input)?;
    if s.contains('.') {
        let f: f64 = s
            .parse()
            .map_err(|_| ErrMode::Backtrack(ContextError::new()))?;
        Ok(serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null))
    } else {
        let i: i64 = s
            .parse()
            .map_err(|_| ErrMode::Backtrack(ContextError::new()))?;
        Ok(Value::from(i))
    }
}

/// Parse a single-quoted string; `''` is an escaped quote.
fn string_literal(input: &mut &str) -> ModalResult<String> {
    let _ = '\''.parse_next(input)?;
    let mut s = String::new();
    loop {
        let c = any
            .parse_next(input)
            .map_err(|_: ErrMode<ContextError>| make_cut_error("closing quote"))?;
        if c == '\'' {
            if input.starts_with('\'') {
                *input = &input[1..];
                s.push('\'');
            } else {
                break;
            }
        } else {
            s.push(c);
        }
    }
    Ok(s)
}

/// Parse a backtick-quoted identifier.
fn quoted_identifier(input: &mut &str) -> ModalResult<String> {
    let _ = '`'.parse_next(input)?;
    let name: &str = take_while(0.., |c: char| c != '`').parse_next(input)?;
    let _ = '`'
        .parse_next(input)
        .map_err(|_: ErrMode<ContextError>| make_cut_error("closing backtick"))?;
    Ok(name.to_string())
}

/// Parse `( '.' identifier )*` after the first path segment.
fn path_rest(input: &mut &str, path: &mut String) -> ModalResult<()> {
    while let Some(seg) = opt(preceded('.', identifier)).parse_next(input)? {
        path.push('.');
        path.push_str(seg);
    }
    Ok(())
}

fn function_args(input: &mut &str, name: &str) -> ModalResult<Vec<Expr>> {
    let _ = ws.parse_next(input)?;
    let mut args = Vec::new();
    if input.starts_with(')') {
        *input = &input[1..];
        return Ok(args);
    }
    if input.starts_with('*') {
        *input = &input[1..];
        args.push(Expr::Literal(Value::String("*".into())));
        expect_char(input, ')', "closing parenthesis")?;
        return Ok(args);
    }
    loop {
        args.push(expr.parse_next(input)?);
        let _ = ws.parse_next(input)?;
        // CAST(x AS type)
        if name.eq_ignore_ascii_case("cast") && args.len() == 1 {
            if opt(keyword("as")).parse_next(input)?.is_some() {
                let _ = ws.parse_next(input)?;
                let ty = identifier
                    .parse_next(input)
                    .map_err(|_| make_cut_error("type name after AS"))?;
                args.push(Expr::Literal(Value::String(ty.to_ascii_lowercase())));
                let _ = ws.parse_next(input)?;
            }
        }
        if input.starts_with(',') {
            *input = &input[1..];
            continue;
        }
        expect_char(input, ')', "',' or ')' in argument list")?;
        return Ok(args);
    }
}

fn case_expr(input: &mut &str) -> ModalResult<Expr> {
    let mut branches = Vec::new();
    loop {
        let _ = ws.parse_next(input)?;
        if opt(keyword("when")).parse_next(input)?.is_none() {
            break;
        }
        let cond = expr.parse_next(input)?;
        expect_keyword(input, "then", "THEN after WHEN condition")?;
        let value = expr.parse_next(input)?;
        branches.push((cond, value));
    }
    if branches.is_empty() {
        return Err(make_cut_error("WHEN branch in CASE"));
    }
    let _ = ws.parse_next(input)?;
    let otherwise = if opt(keyword("else")).parse_next(input)?.is_some() {
        Some(Box::new(expr.parse_next(input)?))
    } else {
        None
    };
    expect_keyword(input, "end", "END closing CASE")?;
    Ok(Expr::Case {
        branches,
        otherwise,
    })
}

fn primary(input: &mut &str) -> ModalResult<Expr> {
    let _ = ws.parse_next(input)?;

    if input.starts_with('(') {
        *input = &input[1..];
        let inner = expr.parse_next(input)?;
        expect_char(input, ')', "closing parenthesis")?;
        return Ok(inner);
    }
    if input.starts_with('\'') {
        return string_literal.map(|s| Expr::Literal(Value::String(s))).parse_next(input);
    }
    if input.starts_with(|c: char| c.is_ascii_digit()) {
        return number.map(Expr::Literal).parse_next(input);
    }
    if input.starts_with('`') {
        let mut path = quoted_identifier.parse_next(input)?;
        path_rest(input, &mut path)?;
        return Ok(Expr::Column(path));
    }

    let before = *input;
    let word = identifier.parse_next(input)?;
    match word.to_ascii_lowercase().as_str() {
        "null" => return Ok(Expr::Literal(Value::Null)),
        "true" => return Ok(Expr::Literal(Value::Bool(true))),
        "false" => return Ok(Expr::Literal(Value::Bool(false))),
        "case" => return case_expr(input),
        _ => {}
    }
    if is_reserved(word) {
        *input = before;
        return backtrack();
    }

    let after_ident = *input;
    let _ = ws.parse_next(input)?;
    if input.starts_with('(') {
        *input = &input[1..];
        let args = function_args(input, word)?;
        return Ok(Expr::Function {
            name: word.to_ascii_lowercase(),
            args,
        });
    }
    *input = after_ident;

    let mut path = word.to_string();
    path_rest(input, &mut path)?;
    Ok(Expr::Column(path))
}

fn unary(input: &mut &str) -> ModalResult<Expr> {
    let _ = ws.parse_next(input)?;
    if input.starts_with('-') {
        *input = &input[1..];
        let inner = unary.parse_next(input)?;
        return Ok(match inner {
            Expr::Literal(Value::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    Expr::Literal(Value::from(-i))
                } else {
                    let f = n.as_f64().unwrap_or(0.0);
                    Expr::Literal(
                        serde_json::Number::from_f64(-f)
                            .map(Value::Number)
                            .unwrap_or(Value::Null),
                    )
                }
            }
            other => Expr::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(other),
            },
        });
    }
    if input.starts_with('+') {
        *input = &input[1..];
        return unary.parse_next(input);
    }
    primary.parse_next(input)
}

fn multiplicative(input: &mut &str) -> ModalResult<Expr> {
    let mut left = unary.parse_next(input)?;
    loop {
        let _ = ws.parse_next(input)?;
        let op = if input.starts_with('*') {
            BinaryOp::Mul
        } else if input.starts_with('/') {
            BinaryOp::Div
        } else if input.starts_with('%') {
            BinaryOp::Mod
        } else {
            break;
        };
        *input = &input[1..];
        let right = unary
            .parse_next(input)
            .map_err(|_| make_cut_error("operand after arithmetic operator"))?;
        left = Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        };
    }
    Ok(left)
}

fn additive(input: &mut &str) -> ModalResult<Expr> {
    let mut left = multiplicative.parse_next(input)?;
    loop {
        let _ = ws.parse_next(input)?;
        let (op, len) = if input.starts_with("||") {
            (BinaryOp::Concat, 2)
        } else if input.starts_with('+') {
            (BinaryOp::Add, 1)
        } else if input.starts_with('-') {
            (BinaryOp::Sub, 1)
        } else {
            break;
        };
        *input = &input[len..];
        let right = multiplicative
            .parse_next(input)
            .map_err(|_| make_cut_error("operand after arithmetic operator"))?;
        left = Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        };
    }
    Ok(left)
}

fn comparison_op(input: &mut &str) -> Option<BinaryOp> {
    const OPS: &[(&str, BinaryOp)] = &[
        ("<=", BinaryOp::LtEq),
        (">=", BinaryOp::GtEq),
        ("<>", BinaryOp::NotEq),
        ("!=", BinaryOp::NotEq),
        ("==", BinaryOp::Eq),
        ("=", BinaryOp::Eq),
        ("<", BinaryOp::Lt),
        (">", BinaryOp::Gt),
    ];
    for (token, op) in OPS {
        if input.starts_with(token) {
            *input = &input[token.len()..];
            return Some(*op);
        }
    }
    None
}

fn predicate(input: &mut &str) -> ModalResult<Expr> {
    let left = additive.parse_next(input)?;
    let _ = ws.parse_next(input)?;

    if let Some(op) = comparison_op(input) {
        let right = additive
            .parse_next(input)
            .map_err(|_| make_cut_error("operand after comparison operator"))?;
        return Ok(Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        });
    }

    if opt(keyword("is")).parse_next(input)?.is_some() {
        let _ = ws.parse_next(input)?;
        let negated = opt(keyword("not")).parse_next(input)?.is_some();
        expect_keyword(input, "null", "NULL after IS")?;
        return Ok(Expr::IsNull {
            expr: Box::new(left),
            negated,
        });
    }

    let before = *input;
    let negated = opt(keyword("not")).parse_next(input)?.is_some();
    let _ = ws.parse_next(input)?;

    if opt(keyword("in")).parse_next(input)?.is_some() {
        expect_char(input, '(', "'(' after IN")?;
        let mut list = Vec::new();
        loop {
            list.push(expr.parse_next(input)?);
            let _ = ws.parse_next(input)?;
            if input.starts_with(',') {
                *input = &input[1..];
                continue;
            }
            expect_char(input, ')', "',' or ')' in IN list")?;
            break;
        }
        return Ok(Expr::InList {
            expr: Box::new(left),
            list,
            negated,
        });
    }

    if opt(keyword("like")).parse_next(input)?.is_some() {
        let _ = ws.parse_next(input)?;
        let pattern = string_literal
            .parse_next(input)
            .map_err(|_| make_cut_error("string pattern after LIKE"))?;
        return Ok(Expr::Like {
            expr: Box::new(left),
            pattern,
            negated,
        });
    }

    if opt(keyword("between")).parse_next(input)?.is_some() {
        let low = additive.parse_next(input)?;
        expect_keyword(input, "and", "AND in BETWEEN")?;
        let high = additive.parse_next(input)?;
        return Ok(Expr::Between {
            expr: Box::new(left),
            low: Box::new(low),
            high: Box::new(high),
            negated,
        });
    }

    if negated {
        *input = before;
    }
    Ok(left)
}

fn not_expr(input: &mut &str) -> ModalResult<Expr> {
    let _ = ws.parse_next(input)?;
    if opt(keyword("not")).parse_next(input)?.is_some() {
        let inner = not_expr.parse_next(input)?;
        return Ok(Expr::Unary {
            op: UnaryOp::Not,
            expr: Box::new(inner),
        });
    }
    predicate.parse_next(input)
}

fn and_expr(input: &mut &str) -> ModalResult<Expr> {
    let mut left = not_expr.parse_next(input)?;
    loop {
        let _ = ws.parse_next(input)?;
        if opt(keyword("and")).parse_next(input)?.is_none() {
            break;
        }
        let right = not_expr
            .parse_next(input)
            .map_err(|_| make_cut_error("operand after AND"))?;
        left = Expr::Binary {
            op: BinaryOp::And,
            left: Box::new(left),
            right: Box::new(right),
        };
    }
    Ok(left)
}

/// Full expression: `or_expr`.
fn expr(input: &mut &str) -> ModalResult<Expr> {
    let mut left = and_expr.parse_next(input)?;
    loop {
        let _ = ws.parse_next(input)?;
        if opt(keyword("or")).parse_next(input)?.is_none() {
            break;
        }
        let right = and_expr
            .parse_next(input)
            .map_err(|_| make_cut_error("operand after OR"))?;
        left = Expr::Binary {
            op: BinaryOp::Or,
            left: Box::new(left),
            right: Box::new(right),
        };
    }
    Ok(left)
}

fn projection(input: &mut &str) -> ModalResult<Projection> {
    let _ = ws.parse_next(input)?;
    if input.starts_with('*') {
        *input = &input[1..];
        return Ok(Projection::Wildcard);
    }
    let e = expr.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let alias = if opt(keyword("as")).parse_next(input)?.is_some() {
        let _ = ws.parse_next(input)?;
        Some(
            identifier
                .parse_next(input)
                .map_err(|_| make_cut_error("alias after AS"))?
                .to_string(),
        )
    } else {
        let before = *input;
        match opt(identifier).parse_next(input)? {
            Some(word) if !is_reserved(word) => Some(word.to_string()),
            _ => {
                *input = before;
                None
            }
        }
    };
    Ok(Projection::Expr { expr: e, alias })
}

fn select_query(input: &mut &str) -> ModalResult<SelectQuery> {
    let _ = ws.parse_next(input)?;
    keyword("select")
        .context(StrContext::Expected(StrContextValue::StringLiteral("SELECT")))
        .parse_next(input)?;

    let mut projections = vec![projection.parse_next(input)?];
    loop {
        let _ = ws.parse_next(input)?;
        if input.starts_with(',') {
            *input = &input[1..];
            projections.push(projection.parse_next(input)?);
        } else {
            break;
        }
    }

    expect_keyword(input, "from", "FROM clause")?;
    let _ = ws.parse_next(input)?;
    if input.starts_with('{') {
        *input = &input[1..];
        let _ = identifier
            .parse_next(input)
            .map_err(|_| make_cut_error("dataframe placeholder name"))?;
        expect_char(input, '}', "closing '}' of dataframe placeholder")?;
    } else {
        let _ = identifier
            .parse_next(input)
            .map_err(|_| make_cut_error("dataframe name after FROM"))?;
    }

    let _ = ws.parse_next(input)?;
    let filter = if opt(keyword("where")).parse_next(input)?.is_some() {
        Some(expr.parse_next(input)?)
    } else {
        None
    };
    Ok(SelectQuery {
        projections,
        filter,
    })
}

fn to_error(source: &str, remaining: &str, message: String) -> MedallionError {
    MedallionError::ParseError {
        offset: source.len() - remaining.len(),
        message,
        expr: source.to_string(),
    }
}

fn finish<T>(source: &str, remaining: &str, parsed: ModalResult<T>) -> Result<T, MedallionError> {
    match parsed {
        Ok(value) => {
            let rest = remaining.trim();
            if rest.is_empty() {
                Ok(value)
            } else {
                let snippet: String = rest.chars().take(20).collect();
                Err(to_error(
                    source,
                    remaining,
                    format!("unexpected input '{snippet}'"),
                ))
            }
        }
        Err(e) => Err(to_error(source, remaining, format!("{e}"))),
    }
}

/// Parse a scalar or boolean expression such as `open > 0 AND symbol IS NOT NULL`.
pub fn parse_expr(input: &str) -> Result<Expr, MedallionError> {
    if input.trim().is_empty() {
        return Err(to_error(input, input, "empty expression".into()));
    }
    let mut remaining = input;
    let parsed = expr.parse_next(&mut remaining);
    finish(input, remaining, parsed)
}

/// Parse a `SELECT ... FROM {df} [WHERE ...]` statement.
pub fn parse_query(input: &str) -> Result<SelectQuery, MedallionError> {
    let mut remaining = input;
    let parsed = select_query.parse_next(&mut remaining);
    finish(input, remaining, parsed)
}
