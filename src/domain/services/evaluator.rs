use std::cmp::Ordering;

use pest::Parser;
use pest::error::InputLocation;
use pest::iterators::Pair;
use pest_derive::Parser;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExpressionError {
    #[error("Placeholder ${0} has no matching input")]
    MissingPlaceholder(usize),

    #[error("Unexpected token '{0}'")]
    UnexpectedToken(String),

    #[error("Unexpected end of expression")]
    UnexpectedEnd,

    #[error("Unterminated string literal")]
    UnterminatedString,

    #[error("Expression does not evaluate to a boolean")]
    NotBoolean,

    #[error("Cannot compare {0} with {1}")]
    Incomparable(String, String),
}

/// Boolean predicate over a template expression with positional placeholders
/// `$0, $1, …`. Used by both If and DoWhile.
pub trait PredicateEvaluator: Send + Sync + std::fmt::Debug {
    fn evaluate(&self, expression: &str, inputs: &[Value]) -> Result<bool, ExpressionError>;
}

/// Replaces every `$N` with the literal rendering of `inputs[N]`.
///
/// The full digit run is read before substituting, so `$10` never matches `$1`.
/// Placeholders without a matching input are left untouched.
pub fn substitute_placeholders(expression: &str, inputs: &[Value]) -> String {
    let chars: Vec<char> = expression.chars().collect();
    let mut result = String::with_capacity(expression.len());
    let mut i = 0;

    while i < chars.len() {
        if chars[i] == '$' {
            let start = i + 1;
            let mut end = start;
            while end < chars.len() && chars[end].is_ascii_digit() {
                end += 1;
            }
            let index = chars[start..end].iter().collect::<String>().parse::<usize>().ok();
            if let Some(value) = index.and_then(|index| inputs.get(index)) {
                result.push_str(&render_literal(value));
                i = end;
                continue;
            }
        }
        result.push(chars[i]);
        i += 1;
    }

    result
}

fn render_literal(value: &Value) -> String {
    match value {
        Value::String(text) => quote(text),
        Value::Null => "null".to_string(),
        Value::Bool(_) | Value::Number(_) => value.to_string(),
        other => quote(&other.to_string()),
    }
}

fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[derive(Parser)]
#[grammar = "domain/services/expression.pest"]
struct ExpressionParser;

/// Evaluator for a small expression language: number, string, boolean and
/// null literals, `== != < <= > >=`, `&&`/`and`, `||`/`or`, `!`/`not` and parentheses.
#[derive(Debug, Clone, Default)]
pub struct SimpleExpressionEvaluator;

impl PredicateEvaluator for SimpleExpressionEvaluator {
    fn evaluate(&self, expression: &str, inputs: &[Value]) -> Result<bool, ExpressionError> {
        let substituted = substitute_placeholders(expression, inputs);
        let mut pairs = ExpressionParser::parse(Rule::predicate, &substituted).map_err(|err| syntax_error(&substituted, &err))?;

        let predicate = pairs.next().ok_or(ExpressionError::UnexpectedEnd)?;
        let disjunction = predicate.into_inner().next().ok_or(ExpressionError::UnexpectedEnd)?;

        match eval_disjunction(disjunction)? {
            Operand::Bool(value) => Ok(value),
            _ => Err(ExpressionError::NotBoolean),
        }
    }
}

/// Maps the furthest position pest reached onto the token found there.
fn syntax_error(source: &str, err: &pest::error::Error<Rule>) -> ExpressionError {
    let position = match err.location {
        InputLocation::Pos(position) => position,
        InputLocation::Span((start, _)) => start,
    };
    match source.get(position..).and_then(|rest| rest.split_whitespace().next()) {
        Some(token) => ExpressionError::UnexpectedToken(token.to_string()),
        None => ExpressionError::UnexpectedEnd,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Op {
    fn parse(symbol: &str) -> Result<Self, ExpressionError> {
        match symbol {
            "==" | "=" => Ok(Op::Eq),
            "!=" => Ok(Op::Ne),
            "<" => Ok(Op::Lt),
            "<=" => Ok(Op::Le),
            ">" => Ok(Op::Gt),
            ">=" => Ok(Op::Ge),
            other => Err(ExpressionError::UnexpectedToken(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Number(f64),
    Text(String),
    Bool(bool),
    Null,
}

impl Operand {
    fn as_bool(&self) -> Result<bool, ExpressionError> {
        match self {
            Operand::Bool(value) => Ok(*value),
            _ => Err(ExpressionError::NotBoolean),
        }
    }

    /// Numeric strings compare as numbers, services often report numbers as text.
    fn as_number(&self) -> Option<f64> {
        match self {
            Operand::Number(value) => Some(*value),
            Operand::Text(text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            Operand::Number(value) => value.to_string(),
            Operand::Text(text) => format!("'{}'", text),
            Operand::Bool(value) => value.to_string(),
            Operand::Null => "null".to_string(),
        }
    }
}

fn eval_disjunction(pair: Pair<Rule>) -> Result<Operand, ExpressionError> {
    let mut terms = pair.into_inner().filter(|term| term.as_rule() != Rule::or_op);
    let mut left = eval_conjunction(terms.next().ok_or(ExpressionError::UnexpectedEnd)?)?;
    for term in terms {
        let right = eval_conjunction(term)?;
        left = Operand::Bool(left.as_bool()? || right.as_bool()?);
    }
    Ok(left)
}

fn eval_conjunction(pair: Pair<Rule>) -> Result<Operand, ExpressionError> {
    let mut terms = pair.into_inner().filter(|term| term.as_rule() != Rule::and_op);
    let mut left = eval_unary(terms.next().ok_or(ExpressionError::UnexpectedEnd)?)?;
    for term in terms {
        let right = eval_unary(term)?;
        left = Operand::Bool(left.as_bool()? && right.as_bool()?);
    }
    Ok(left)
}

fn eval_unary(pair: Pair<Rule>) -> Result<Operand, ExpressionError> {
    let mut negations = 0;
    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::not_op => negations += 1,
            _ => {
                let operand = eval_comparison(inner)?;
                if negations == 0 {
                    return Ok(operand);
                }
                return Ok(Operand::Bool(operand.as_bool()? ^ (negations % 2 == 1)));
            }
        }
    }
    Err(ExpressionError::UnexpectedEnd)
}

fn eval_comparison(pair: Pair<Rule>) -> Result<Operand, ExpressionError> {
    let mut inner = pair.into_inner();
    let left = eval_operand(inner.next().ok_or(ExpressionError::UnexpectedEnd)?)?;
    let Some(op) = inner.next() else {
        return Ok(left);
    };
    let op = Op::parse(op.as_str())?;
    let right = eval_operand(inner.next().ok_or(ExpressionError::UnexpectedEnd)?)?;
    compare(op, &left, &right).map(Operand::Bool)
}

fn eval_operand(pair: Pair<Rule>) -> Result<Operand, ExpressionError> {
    match pair.as_rule() {
        Rule::number => pair.as_str().parse().map(Operand::Number).map_err(|_| ExpressionError::UnexpectedToken(pair.as_str().to_string())),
        Rule::string => {
            let body = pair.into_inner().next().map(|body| body.as_str()).unwrap_or_default();
            Ok(Operand::Text(unescape(body)))
        }
        Rule::boolean => Ok(Operand::Bool(pair.as_str().eq_ignore_ascii_case("true"))),
        Rule::null => Ok(Operand::Null),
        Rule::placeholder => {
            let index = pair.as_str()[1..].parse().map_err(|_| ExpressionError::UnexpectedToken(pair.as_str().to_string()))?;
            Err(ExpressionError::MissingPlaceholder(index))
        }
        Rule::unterminated_string => Err(ExpressionError::UnterminatedString),
        Rule::disjunction => eval_disjunction(pair),
        _ => Err(ExpressionError::UnexpectedToken(pair.as_str().to_string())),
    }
}

fn unescape(body: &str) -> String {
    let mut text = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => text.extend(chars.next()),
            c => text.push(c),
        }
    }
    text
}

fn compare(op: Op, left: &Operand, right: &Operand) -> Result<bool, ExpressionError> {
    if matches!(op, Op::Eq | Op::Ne) {
        let equal = match (left, right) {
            (Operand::Bool(a), Operand::Bool(b)) => a == b,
            (Operand::Null, Operand::Null) => true,
            (Operand::Null, _) | (_, Operand::Null) => false,
            (Operand::Text(a), Operand::Text(b)) if a == b => true,
            (a, b) => match (a.as_number(), b.as_number()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        };
        return Ok(if op == Op::Eq { equal } else { !equal });
    }

    let ordering = match (left.as_number(), right.as_number()) {
        (Some(x), Some(y)) => x.partial_cmp(&y),
        _ => match (left, right) {
            (Operand::Text(a), Operand::Text(b)) => Some(a.cmp(b)),
            _ => None,
        },
    };
    let ordering = ordering.ok_or_else(|| ExpressionError::Incomparable(left.describe(), right.describe()))?;

    Ok(match op {
        Op::Lt => ordering == Ordering::Less,
        Op::Le => ordering != Ordering::Greater,
        Op::Gt => ordering == Ordering::Greater,
        Op::Ge => ordering != Ordering::Less,
        Op::Eq | Op::Ne => false,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn eval(expression: &str, inputs: &[Value]) -> Result<bool, ExpressionError> {
        SimpleExpressionEvaluator.evaluate(expression, inputs)
    }

    #[test]
    fn test_substitution_reads_full_index() {
        let inputs: Vec<Value> = (0..11).map(|i| json!(i * 100)).collect();
        assert_eq!(substitute_placeholders("$10 > $1", &inputs), "1000 > 100");
        assert_eq!(substitute_placeholders("$0 == $7", &[json!("a'b")]), "'a\\'b' == $7");
    }

    #[test]
    fn test_comparisons_and_logic() {
        assert_eq!(eval("$0 > 3", &[json!(5)]), Ok(true));
        assert_eq!(eval("$0 == 'done' && $1 < 10", &[json!("done"), json!(12)]), Ok(false));
        assert_eq!(eval("$0 == 'done' || $1 < 10", &[json!("done"), json!(12)]), Ok(true));
        assert_eq!(eval("!($0 >= 2)", &[json!(1.5)]), Ok(true));
        assert_eq!(eval("not $0", &[json!(false)]), Ok(true));
        assert_eq!(eval("$0 > -1", &[json!(0)]), Ok(true));
        assert_eq!(eval("$0 == null", &[Value::Null]), Ok(true));
        assert_eq!(eval("$0 = \"x\" AND not (true or false)", &[json!("x")]), Ok(false));
        assert_eq!(eval("!!$0", &[json!(true)]), Ok(true));
    }

    #[test]
    fn test_numeric_strings_compare_as_numbers() {
        assert_eq!(eval("$0 < $1", &[json!("9"), json!("10")]), Ok(true));
        assert_eq!(eval("$0 == 3", &[json!("3")]), Ok(true));
    }

    #[test]
    fn test_escaped_quotes_survive_substitution() {
        assert_eq!(eval("$0 == 'it\\'s'", &[json!("it's")]), Ok(true));
    }

    #[test]
    fn test_malformed_expressions() {
        assert_eq!(eval("$2 > 1", &[json!(1)]), Err(ExpressionError::MissingPlaceholder(2)));
        assert_eq!(eval("$0 >", &[json!(1)]), Err(ExpressionError::UnexpectedEnd));
        assert_eq!(eval("$0", &[json!(3)]), Err(ExpressionError::NotBoolean));
        assert_eq!(eval("'open", &[]), Err(ExpressionError::UnterminatedString));
        assert!(matches!(eval("$0 > 1 1", &[json!(3)]), Err(ExpressionError::UnexpectedToken(_))));
        assert!(matches!(eval("true < 'x'", &[]), Err(ExpressionError::Incomparable(_, _))));
        assert_eq!(eval("$0 > 1 && banana", &[json!(3)]), Err(ExpressionError::UnexpectedToken("banana".to_string())));
        assert_eq!(eval("", &[]), Err(ExpressionError::UnexpectedEnd));
    }
}
