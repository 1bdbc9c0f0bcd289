use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while},
    character::complete::{alpha1, alphanumeric1, char, digit1, multispace0, satisfy},
    combinator::{map, map_res, not, opt, recognize, value, verify},
    error::{ErrorKind, ParseError as NomParseError},
    multi::{many0, many0_count, separated_list0},
    sequence::{delimited, pair, preceded, terminated},
    IResult,
};
use regex::Regex;
use thiserror::Error;

use crate::ast::{ArithOp, ArrayOp, AstNode, ComparisonOp, LogicOp, Pattern, Value};

const KEYWORDS: [&str; 6] = ["and", "or", "not", "in", "true", "false"];

/// Deepest nesting an expression may have, counting both the operators of
/// the parsed tree and the parentheses around them.
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("expression is empty")]
    Empty,
    #[error("syntax error near `{0}`")]
    Syntax(String),
    #[error("unexpected content near `{0}`")]
    Trailing(String),
    #[error("invalid regex `{pattern}`: {reason}")]
    InvalidRegex { pattern: String, reason: String },
    #[error("expression nests deeper than {limit} levels")]
    TooDeep { limit: usize },
}

/// A combinator that takes a parser `inner` and produces a parser that also consumes both leading and
/// trailing whitespace, returning the output of `inner`.
fn ws<'a, F, O, E: NomParseError<&'a str>>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O, E>
where
    F: FnMut(&'a str) -> IResult<&'a str, O, E>,
{
    delimited(multispace0, inner, multispace0)
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '.'
}

/// Case-insensitive keyword that must not run into an identifier.
fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    terminated(tag_no_case(kw), not(satisfy(is_ident_char)))
}

fn parse_number(i: &str) -> IResult<&str, AstNode> {
    let parser = recognize(pair(digit1, opt(pair(char('.'), digit1))));
    map(map_res(parser, |num: &str| num.parse::<f64>()), |n| {
        AstNode::Constant(Value::Number(n))
    })(i)
}

fn parse_boolean(i: &str) -> IResult<&str, AstNode> {
    let parser = alt((value(true, keyword("true")), value(false, keyword("false"))));
    map(parser, |b| AstNode::Constant(Value::Bool(b)))(i)
}

fn parse_string(i: &str) -> IResult<&str, AstNode> {
    let parser = alt((
        delimited(char('"'), take_while(|c: char| c != '"'), char('"')),
        delimited(char('\''), take_while(|c: char| c != '\''), char('\'')),
    ));
    map(parser, |s: &str| AstNode::Constant(Value::String(s.to_string())))(i)
}

fn parse_variable(i: &str) -> IResult<&str, AstNode> {
    let parser = verify(
        recognize(pair(
            alt((alpha1, tag("_"))),
            many0_count(alt((alphanumeric1, tag("_"), tag(".")))),
        )),
        |s: &str| !KEYWORDS.iter().any(|kw| kw.eq_ignore_ascii_case(s)),
    );
    map(parser, |s: &str| AstNode::Variable(s.to_string()))(i)
}

fn too_deep(i: &str) -> nom::Err<nom::error::Error<&str>> {
    nom::Err::Failure(nom::error::Error::new(i, ErrorKind::TooLarge))
}

/// Rejects `node` once it nests deeper than [`MAX_DEPTH`].
fn bounded(i: &str, node: AstNode) -> IResult<&str, AstNode> {
    if node.depth() > MAX_DEPTH {
        return Err(too_deep(i));
    }
    Ok((i, node))
}

fn parse_primary(i: &str, depth: usize) -> IResult<&str, AstNode> {
    ws(alt((
        parse_number,
        parse_string,
        parse_boolean,
        parse_variable,
        delimited(char('('), |i| parse_or(i, depth + 1), char(')')),
    )))(i)
}

fn parse_unary(i: &str, depth: usize) -> IResult<&str, AstNode> {
    if depth > MAX_DEPTH {
        return Err(too_deep(i));
    }
    match preceded(ws(char('-')), |i| parse_unary(i, depth + 1))(i) {
        Ok((rest, n)) => bounded(rest, AstNode::Negate(Box::new(n))),
        Err(nom::Err::Error(_)) => parse_primary(i, depth),
        Err(e) => Err(e),
    }
}

/// Chains longer than [`MAX_DEPTH`] are refused before they are folded.
fn fold_arith<'a>(
    i: &'a str,
    first: AstNode,
    rest: Vec<(ArithOp, AstNode)>,
) -> IResult<&'a str, AstNode> {
    if rest.len() >= MAX_DEPTH {
        return Err(too_deep(i));
    }
    let node = rest.into_iter().fold(first, |lhs, (op, rhs)| {
        AstNode::Arith(Box::new(lhs), op, Box::new(rhs))
    });
    bounded(i, node)
}

fn parse_product(i: &str, depth: usize) -> IResult<&str, AstNode> {
    let (i, first) = parse_unary(i, depth)?;
    let op = alt((
        value(ArithOp::Mul, char('*')),
        value(ArithOp::Div, char('/')),
        value(ArithOp::Rem, char('%')),
    ));
    let (i, rest) = many0(pair(ws(op), |i| parse_unary(i, depth)))(i)?;
    fold_arith(i, first, rest)
}

fn parse_sum(i: &str, depth: usize) -> IResult<&str, AstNode> {
    let (i, first) = parse_product(i, depth)?;
    let op = alt((value(ArithOp::Add, char('+')), value(ArithOp::Sub, char('-'))));
    let (i, rest) = many0(pair(ws(op), |i| parse_product(i, depth)))(i)?;
    fold_arith(i, first, rest)
}

fn parse_list(i: &str, depth: usize) -> IResult<&str, Vec<AstNode>> {
    delimited(
        ws(char('(')),
        separated_list0(ws(char(',')), |i| parse_sum(i, depth + 1)),
        ws(char(')')),
    )(i)
}

fn parse_comparison_op(i: &str) -> IResult<&str, ComparisonOp> {
    map(
        alt((
            tag("=="),
            tag("!="),
            tag("<>"),
            tag(">="),
            tag("<="),
            tag(">"),
            tag("<"),
            tag("="),
        )),
        ComparisonOp::from_str,
    )(i)
}

fn parse_array_op(i: &str) -> IResult<&str, ArrayOp> {
    alt((
        value(ArrayOp::NotIn, pair(keyword("not"), ws(keyword("in")))),
        value(ArrayOp::In, keyword("in")),
    ))(i)
}

/// `=~` matches, `!~` is the negated form.
fn parse_match_op(i: &str) -> IResult<&str, bool> {
    alt((value(false, tag("=~")), value(true, tag("!~"))))(i)
}

fn parse_compare(i: &str, depth: usize) -> IResult<&str, AstNode> {
    let (i, lhs) = parse_sum(i, depth)?;

    // x in (1, 2, 3), x not in ('a', 'b')
    if let Ok((rest, op)) = ws(parse_array_op)(i) {
        let (rest, list) = parse_list(rest, depth)?;
        return bounded(rest, AstNode::Array(Box::new(lhs), op, list));
    }

    // name =~ '^a.*'
    if let Ok((rest, negate)) = ws(parse_match_op)(i) {
        let (rest, pattern) = parse_sum(rest, depth)?;
        let node = AstNode::Match {
            expr: Box::new(lhs),
            pattern: Box::new(pattern),
            negate,
        };
        return bounded(rest, node);
    }

    if let Ok((rest, op)) = ws(parse_comparison_op)(i) {
        let (rest, rhs) = parse_sum(rest, depth)?;
        return bounded(rest, AstNode::Compare(Box::new(lhs), op, Box::new(rhs)));
    }

    Ok((i, lhs))
}

fn parse_not(i: &str, depth: usize) -> IResult<&str, AstNode> {
    if depth > MAX_DEPTH {
        return Err(too_deep(i));
    }
    match preceded(ws(alt((tag("!"), keyword("not")))), |i| parse_not(i, depth + 1))(i) {
        Ok((rest, n)) => bounded(rest, AstNode::Not(Box::new(n))),
        Err(nom::Err::Error(_)) => parse_compare(i, depth),
        Err(e) => Err(e),
    }
}

fn fold_logic(i: &str, first: AstNode, rest: Vec<AstNode>, op: LogicOp) -> IResult<&str, AstNode> {
    if rest.len() >= MAX_DEPTH {
        return Err(too_deep(i));
    }
    let node = rest.into_iter().fold(first, |lhs, rhs| {
        AstNode::Logic(Box::new(lhs), op, Box::new(rhs))
    });
    bounded(i, node)
}

fn parse_and(i: &str, depth: usize) -> IResult<&str, AstNode> {
    let (i, first) = parse_not(i, depth)?;
    let (i, rest) = many0(preceded(ws(alt((tag("&&"), keyword("and")))), |i| {
        parse_not(i, depth)
    }))(i)?;
    fold_logic(i, first, rest, LogicOp::And)
}

fn parse_or(i: &str, depth: usize) -> IResult<&str, AstNode> {
    let (i, first) = parse_and(i, depth)?;
    let (i, rest) = many0(preceded(ws(alt((tag("||"), keyword("or")))), |i| {
        parse_and(i, depth)
    }))(i)?;
    fold_logic(i, first, rest, LogicOp::Or)
}

/// Parses an expression, returning the unparsed remainder.
pub fn parse(i: &str) -> IResult<&str, AstNode> {
    ws(|i| parse_or(i, 0))(i)
}

fn near(rest: &str) -> String {
    rest.trim().lines().next().unwrap_or("").to_string()
}

/// Replaces string-literal regex patterns with compiled ones.
fn compile_patterns(node: AstNode) -> Result<AstNode, ParseError> {
    let boxed = |n: Box<AstNode>| compile_patterns(*n).map(Box::new);
    Ok(match node {
        AstNode::Match {
            expr,
            pattern,
            negate,
        } => {
            let pattern = match *pattern {
                AstNode::Constant(Value::String(p)) => match Regex::new(&p) {
                    Ok(re) => Box::new(AstNode::Regex(Pattern(re))),
                    Err(e) => {
                        return Err(ParseError::InvalidRegex {
                            pattern: p,
                            reason: e.to_string(),
                        })
                    }
                },
                other => boxed(Box::new(other))?,
            };
            AstNode::Match {
                expr: boxed(expr)?,
                pattern,
                negate,
            }
        }
        AstNode::Not(n) => AstNode::Not(boxed(n)?),
        AstNode::Negate(n) => AstNode::Negate(boxed(n)?),
        AstNode::Compare(l, op, r) => AstNode::Compare(boxed(l)?, op, boxed(r)?),
        AstNode::Arith(l, op, r) => AstNode::Arith(boxed(l)?, op, boxed(r)?),
        AstNode::Logic(l, op, r) => AstNode::Logic(boxed(l)?, op, boxed(r)?),
        AstNode::Array(l, op, items) => AstNode::Array(
            boxed(l)?,
            op,
            items
                .into_iter()
                .map(compile_patterns)
                .collect::<Result<_, _>>()?,
        ),
        leaf => leaf,
    })
}

/// Parses the whole input into an evaluable tree. Unlike [`parse`], any
/// leftover input is an error.
pub fn compile(input: &str) -> Result<AstNode, ParseError> {
    if input.trim().is_empty() {
        return Err(ParseError::Empty);
    }
    match parse(input) {
        Ok((rest, node)) if rest.trim().is_empty() => compile_patterns(node),
        Ok((rest, _)) => Err(ParseError::Trailing(near(rest))),
        Err(nom::Err::Failure(e)) if e.code == ErrorKind::TooLarge => {
            Err(ParseError::TooDeep { limit: MAX_DEPTH })
        }
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(ParseError::Syntax(near(e.input))),
        Err(nom::Err::Incomplete(_)) => Err(ParseError::Syntax(near(input))),
    }
}
