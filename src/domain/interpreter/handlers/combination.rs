use serde_json::Value;

use crate::domain::interpreter::config::ForEachPolicy;
use crate::error::InterpreterError;

/// Input values of one fan-out run, one per ForEach input list.
#[derive(Debug, Clone, PartialEq)]
pub struct InputCombination {
    pub values: Vec<Value>,
}

impl InputCombination {
    /// The fields joined with `delimiter`, strings without quotes.
    pub fn joined(&self, delimiter: &str) -> String {
        self.values
            .iter()
            .map(|value| match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(delimiter)
    }
}

/// Turns one ForEach input into its list of elements: arrays are taken as is,
/// strings are split on `delimiter`, anything else is a single element.
pub fn expand_list(value: &Value, delimiter: &str) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        Value::String(text) if text.is_empty() => Vec::new(),
        Value::String(text) => text.split(delimiter).map(|part| Value::String(part.trim().to_string())).collect(),
        other => vec![other.clone()],
    }
}

pub fn combine(node: &str, lists: &[Vec<Value>], policy: ForEachPolicy) -> Result<Vec<InputCombination>, InterpreterError> {
    match policy {
        ForEachPolicy::Zipped => zipped(node, lists),
        ForEachPolicy::CrossProduct => cross_product(node, lists),
    }
}

/// Lists of length 1 are repeated to the longest length, all others must match it.
fn zipped(node: &str, lists: &[Vec<Value>]) -> Result<Vec<InputCombination>, InterpreterError> {
    let lengths: Vec<usize> = lists.iter().map(Vec::len).collect();
    let longest = lengths.iter().copied().max().unwrap_or(0);

    if lengths.iter().any(|len| *len != longest && *len != 1) {
        return Err(InterpreterError::ForEachLengthMismatch { node: node.to_string(), lengths });
    }

    let combinations = (0..longest)
        .map(|position| InputCombination {
            values: lists.iter().map(|list| if list.len() == 1 { list[0].clone() } else { list[position].clone() }).collect(),
        })
        .collect();
    Ok(combinations)
}

fn cross_product(node: &str, lists: &[Vec<Value>]) -> Result<Vec<InputCombination>, InterpreterError> {
    match lists {
        [] => Ok(Vec::new()),
        [single] => Ok(single.iter().map(|value| InputCombination { values: vec![value.clone()] }).collect()),
        [first, second] => Ok(first
            .iter()
            .flat_map(|a| second.iter().map(move |b| InputCombination { values: vec![a.clone(), b.clone()] }))
            .collect()),
        _ => Err(InterpreterError::CrossProductArity { node: node.to_string(), lists: lists.len() }),
    }
}
