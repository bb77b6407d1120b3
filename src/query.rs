//! Targeting query language.
//!
//! Rule queries are small boolean expressions over the evaluation context, e.g.:
//!
//! ```text
//! country in ["fr", "de"] and (plan eq "pro" or beta eq true)
//! app_version ge "1.4.0" && not email ew "@example.com"
//! ```
use std::cmp::Ordering;

use nom::{
    branch::alt,
    bytes::complete::{escaped_transform, is_not, tag, tag_no_case},
    character::complete::{alpha1, alphanumeric1, char, multispace0, satisfy},
    combinator::{all_consuming, map, not, opt, recognize, value},
    multi::{many0, many0_count, separated_list0},
    number::complete::double,
    sequence::{delimited, pair, preceded, terminated},
    IResult,
};
use regex::Regex;
use semver::Version;

use crate::attributes::{AttributeValue, EvaluationContext};

/// Decides whether a rule query applies to an evaluation context.
pub trait QueryEvaluator {
    /// `Ok(false)` means the rule does not apply. `Err` is an evaluator failure, which flag
    /// evaluation logs and treats as a non-match.
    fn evaluate(&self, query: &str, context: &EvaluationContext) -> Result<bool, QueryError>;
}

impl<T: Fn(&str, &EvaluationContext) -> Result<bool, QueryError>> QueryEvaluator for T {
    fn evaluate(&self, query: &str, context: &EvaluationContext) -> Result<bool, QueryError> {
        self(query, context)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum QueryError {
    #[error("invalid query '{query}': {message}")]
    Parse { query: String, message: String },
}

/// Default [`QueryEvaluator`] parsing and evaluating the query language.
#[derive(Debug, Default, Clone, Copy)]
pub struct RulesEvaluator;

impl QueryEvaluator for RulesEvaluator {
    fn evaluate(&self, query: &str, context: &EvaluationContext) -> Result<bool, QueryError> {
        Ok(Query::parse(query)?.eval(context))
    }
}

/// Parsed query.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    And(Box<Query>, Box<Query>),
    Or(Box<Query>, Box<Query>),
    Not(Box<Query>),
    /// Attribute exists and is not null.
    Present(String),
    Compare {
        attribute: String,
        op: CompareOp,
        value: Literal,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
    StartsWith,
    EndsWith,
    In,
    Matches,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Number(f64),
    Bool(bool),
    Null,
    List(Vec<Literal>),
}

impl Query {
    pub fn parse(query: &str) -> Result<Query, QueryError> {
        all_consuming(ws(or_expr))(query)
            .map(|(_, query)| query)
            .map_err(|err| QueryError::Parse {
                query: query.to_owned(),
                message: err.to_string(),
            })
    }

    pub fn eval(&self, context: &EvaluationContext) -> bool {
        match self {
            Query::And(lhs, rhs) => lhs.eval(context) && rhs.eval(context),
            Query::Or(lhs, rhs) => lhs.eval(context) || rhs.eval(context),
            Query::Not(inner) => !inner.eval(context),
            Query::Present(attribute) => context
                .get(attribute)
                .is_some_and(|value| *value != AttributeValue::Null),
            Query::Compare {
                attribute,
                op,
                value,
            } => op.eval(context.get(attribute), value),
        }
    }
}

impl CompareOp {
    /// Missing attributes and type mismatches never match.
    fn eval(self, attribute: Option<&AttributeValue>, literal: &Literal) -> bool {
        self.try_eval(attribute, literal).unwrap_or(false)
    }

    fn try_eval(self, attribute: Option<&AttributeValue>, literal: &Literal) -> Option<bool> {
        let attribute = attribute?;
        match self {
            CompareOp::Eq => Some(literal.matches(attribute)),
            CompareOp::Ne => Some(!literal.matches(attribute)),
            CompareOp::In => match literal {
                Literal::List(items) => Some(items.iter().any(|item| item.matches(attribute))),
                _ => None,
            },
            CompareOp::Contains | CompareOp::StartsWith | CompareOp::EndsWith => {
                let (AttributeValue::String(s), Literal::Str(needle)) = (attribute, literal) else {
                    return None;
                };
                Some(match self {
                    CompareOp::Contains => s.contains(needle.as_str()),
                    CompareOp::StartsWith => s.starts_with(needle.as_str()),
                    _ => s.ends_with(needle.as_str()),
                })
            }
            CompareOp::Matches => {
                let (AttributeValue::String(s), Literal::Str(pattern)) = (attribute, literal) else {
                    return None;
                };
                let regex = Regex::new(pattern).ok()?;
                Some(regex.is_match(s))
            }
            CompareOp::Gt | CompareOp::Ge | CompareOp::Lt | CompareOp::Le => {
                let ordering = compare(attribute, literal)?;
                Some(match self {
                    CompareOp::Gt => ordering.is_gt(),
                    CompareOp::Ge => ordering.is_ge(),
                    CompareOp::Lt => ordering.is_lt(),
                    _ => ordering.is_le(),
                })
            }
        }
    }
}

impl Literal {
    fn matches(&self, attribute: &AttributeValue) -> bool {
        match (self, attribute) {
            (Literal::Str(lhs), AttributeValue::String(rhs)) => lhs == rhs,
            (Literal::Number(lhs), AttributeValue::Number(rhs)) => lhs == rhs,
            (Literal::Bool(lhs), AttributeValue::Boolean(rhs)) => lhs == rhs,
            (Literal::Null, AttributeValue::Null) => true,
            _ => false,
        }
    }
}

/// Semantic version ordering when both sides are versions, numeric ordering otherwise.
fn compare(attribute: &AttributeValue, literal: &Literal) -> Option<Ordering> {
    match (attribute, literal) {
        (AttributeValue::String(lhs), Literal::Str(rhs)) => {
            if let (Ok(lhs), Ok(rhs)) = (Version::parse(lhs), Version::parse(rhs)) {
                return Some(lhs.cmp(&rhs));
            }
            let lhs: f64 = lhs.parse().ok()?;
            let rhs: f64 = rhs.parse().ok()?;
            lhs.partial_cmp(&rhs)
        }
        (AttributeValue::Number(lhs), Literal::Number(rhs)) => lhs.partial_cmp(rhs),
        (AttributeValue::String(lhs), Literal::Number(rhs)) => {
            lhs.parse::<f64>().ok()?.partial_cmp(rhs)
        }
        _ => None,
    }
}

// Parser

fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Case-insensitive word that must not be followed by an identifier character.
fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    terminated(tag_no_case(word), not(satisfy(is_ident_char)))
}

fn identifier(i: &str) -> IResult<&str, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0_count(alt((alphanumeric1, tag("_"), tag("."), tag("-")))),
    ))(i)
}

fn string_literal(i: &str) -> IResult<&str, String> {
    delimited(
        char('"'),
        map(
            opt(escaped_transform(
                is_not("\\\""),
                '\\',
                alt((
                    value("\\", tag("\\")),
                    value("\"", tag("\"")),
                    value("\n", tag("n")),
                    value("\t", tag("t")),
                )),
            )),
            |s: Option<String>| s.unwrap_or_default(),
        ),
        char('"'),
    )(i)
}

fn scalar(i: &str) -> IResult<&str, Literal> {
    alt((
        map(string_literal, Literal::Str),
        value(Literal::Bool(true), keyword("true")),
        value(Literal::Bool(false), keyword("false")),
        value(Literal::Null, keyword("null")),
        map(double, Literal::Number),
    ))(i)
}

fn literal(i: &str) -> IResult<&str, Literal> {
    alt((
        map(
            delimited(
                ws(char('[')),
                separated_list0(ws(char(',')), ws(scalar)),
                ws(char(']')),
            ),
            Literal::List,
        ),
        scalar,
    ))(i)
}

fn compare_op(i: &str) -> IResult<&str, CompareOp> {
    alt((
        value(CompareOp::Ge, alt((tag(">="), keyword("ge")))),
        value(CompareOp::Le, alt((tag("<="), keyword("le")))),
        value(CompareOp::Eq, alt((tag("=="), keyword("eq")))),
        value(CompareOp::Ne, alt((tag("!="), keyword("ne")))),
        value(CompareOp::Gt, alt((tag(">"), keyword("gt")))),
        value(CompareOp::Lt, alt((tag("<"), keyword("lt")))),
        value(CompareOp::Contains, keyword("co")),
        value(CompareOp::StartsWith, keyword("sw")),
        value(CompareOp::EndsWith, keyword("ew")),
        value(CompareOp::In, keyword("in")),
        value(CompareOp::Matches, keyword("mt")),
    ))(i)
}

fn comparison(i: &str) -> IResult<&str, Query> {
    let (i, attribute) = ws(identifier)(i)?;
    alt((
        map(ws(keyword("pr")), |_| Query::Present(attribute.to_owned())),
        map(pair(ws(compare_op), ws(literal)), |(op, value)| {
            Query::Compare {
                attribute: attribute.to_owned(),
                op,
                value,
            }
        }),
    ))(i)
}

fn unary(i: &str) -> IResult<&str, Query> {
    alt((
        map(preceded(ws(alt((keyword("not"), tag("!")))), unary), |q| {
            Query::Not(Box::new(q))
        }),
        delimited(ws(char('(')), or_expr, ws(char(')'))),
        comparison,
    ))(i)
}

fn and_expr(i: &str) -> IResult<&str, Query> {
    let (i, first) = unary(i)?;
    let (i, rest) = many0(preceded(ws(alt((tag("&&"), keyword("and")))), unary))(i)?;
    let query = rest
        .into_iter()
        .fold(first, |lhs, rhs| Query::And(Box::new(lhs), Box::new(rhs)));
    Ok((i, query))
}

fn or_expr(i: &str) -> IResult<&str, Query> {
    let (i, first) = and_expr(i)?;
    let (i, rest) = many0(preceded(ws(alt((tag("||"), keyword("or")))), and_expr))(i)?;
    let query = rest
        .into_iter()
        .fold(first, |lhs, rhs| Query::Or(Box::new(lhs), Box::new(rhs)));
    Ok((i, query))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> EvaluationContext {
        [
            ("targetingKey", AttributeValue::from("user-1")),
            ("email", AttributeValue::from("alice@example.com")),
            ("country", AttributeValue::from("fr")),
            ("age", AttributeValue::from(42)),
            ("beta", AttributeValue::from(true)),
            ("app_version", AttributeValue::from("1.10.2")),
            ("region", AttributeValue::Null),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v))
        .collect()
    }

    fn eval(query: &str) -> bool {
        RulesEvaluator.evaluate(query, &ctx()).unwrap()
    }

    #[test]
    fn equality() {
        assert!(eval(r#"targetingKey eq "user-1""#));
        assert!(eval(r#"targetingKey == "user-1""#));
        assert!(!eval(r#"targetingKey eq "user-2""#));
        assert!(eval(r#"targetingKey ne "user-2""#));
        assert!(eval("beta eq true"));
        assert!(eval("age == 42"));
        assert!(eval("region eq null"));
    }

    #[test]
    fn string_operators() {
        assert!(eval(r#"email ew "@example.com""#));
        assert!(eval(r#"email sw "alice""#));
        assert!(eval(r#"email co "ce@ex""#));
        assert!(eval(r#"email mt "^[a-z]+@example\\.com$""#));
        assert!(!eval(r#"email mt "^bob""#));
    }

    #[test]
    fn ordering() {
        assert!(eval("age gt 18"));
        assert!(eval("age >= 42"));
        assert!(!eval("age < 42"));
        // semver ordering, not lexicographic
        assert!(eval(r#"app_version gt "1.9.0""#));
        assert!(eval(r#"app_version le "1.10.2""#));
    }

    #[test]
    fn lists() {
        assert!(eval(r#"country in ["de", "fr"]"#));
        assert!(!eval(r#"country in ["de", "it"]"#));
        assert!(!eval("country in []"));
    }

    #[test]
    fn logical_operators_and_precedence() {
        assert!(eval(r#"country eq "fr" and beta eq true"#));
        assert!(eval(r#"country eq "de" or beta eq true"#));
        // and binds tighter than or
        assert!(eval(r#"beta eq true or country eq "de" and age lt 0"#));
        assert!(!eval(r#"(beta eq true or country eq "de") and age lt 0"#));
        assert!(eval(r#"not country eq "de""#));
        assert!(eval(r#"!(country eq "de") && age > 1"#));
    }

    #[test]
    fn presence() {
        assert!(eval("email pr"));
        assert!(!eval("region pr"));
        assert!(!eval("missing pr"));
    }

    #[test]
    fn missing_attributes_and_mismatches_never_match() {
        assert!(!eval(r#"missing eq "x""#));
        assert!(!eval(r#"missing ne "x""#));
        assert!(!eval(r#"age co "4""#));
        assert!(!eval(r#"beta gt 1"#));
        assert!(!eval(r#"email mt "(""#));
    }

    #[test]
    fn keywords_need_word_boundaries() {
        let mut ctx = ctx();
        ctx.insert("notify".to_owned(), AttributeValue::from("yes"));
        ctx.insert("order".to_owned(), AttributeValue::from(3));
        assert!(RulesEvaluator
            .evaluate(r#"notify eq "yes" and order gt 2"#, &ctx)
            .unwrap());
    }

    #[test]
    fn escaped_strings() {
        let mut ctx = EvaluationContext::new();
        ctx.insert("quote".to_owned(), AttributeValue::from("say \"hi\""));
        ctx.insert("empty".to_owned(), AttributeValue::from(""));
        assert!(RulesEvaluator
            .evaluate(r#"quote eq "say \"hi\"""#, &ctx)
            .unwrap());
        assert!(RulesEvaluator.evaluate(r#"empty eq """#, &ctx).unwrap());
    }

    #[test]
    fn malformed_queries_are_errors() {
        for query in ["", "country", r#"country eq"#, r#"country eq "fr" and"#, "(a eq 1"] {
            let err = RulesEvaluator.evaluate(query, &ctx()).unwrap_err();
            assert!(matches!(err, QueryError::Parse { .. }), "{query}");
        }
    }
}
