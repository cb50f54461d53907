//! Boolean expression plumbing for package conditions.
//!
//! Condition rows compile to an infix token stream (`and`/`or`/`not`,
//! parentheses, atom placeholders) which is converted to Reverse Polish
//! Notation via shunting-yard and evaluated against a truth context.

use std::collections::HashMap;

/// Splits an infix boolean expression into tokens. Operator words are
/// lower-cased; everything else is kept verbatim as an atom identifier.
pub fn tokenize(expression: &str) -> Vec<String> {
    let spaced = expression.replace('(', " ( ").replace(')', " ) ");
    spaced
        .split_whitespace()
        .map(|t| {
            let lower = t.to_ascii_lowercase();
            if matches!(lower.as_str(), "and" | "or" | "not") {
                lower
            } else {
                t.to_string()
            }
        })
        .collect()
}

fn precedence(token: &str) -> Option<u8> {
    match token {
        "not" => Some(3),
        "and" => Some(2),
        "or" => Some(1),
        _ => None,
    }
}

/// Converts infix tokens to RPN with precedence `not > and > or`.
pub fn shunting_yard(tokens: &[String]) -> Vec<String> {
    let mut output: Vec<String> = Vec::new();
    let mut stack: Vec<String> = Vec::new();

    for token in tokens {
        match token.as_str() {
            "(" => stack.push(token.clone()),
            ")" => {
                while let Some(top) = stack.last() {
                    if top == "(" {
                        break;
                    }
                    output.push(stack.pop().unwrap());
                }
                if stack.last().map(String::as_str) == Some("(") {
                    stack.pop();
                }
            }
            _ => match precedence(token) {
                Some(prec) => {
                    while let Some(top) = stack.last() {
                        match precedence(top) {
                            Some(top_prec) if top != "(" && top_prec >= prec => {
                                output.push(stack.pop().unwrap());
                            }
                            _ => break,
                        }
                    }
                    stack.push(token.clone());
                }
                None => output.push(token.clone()),
            },
        }
    }

    while let Some(op) = stack.pop() {
        output.push(op);
    }
    output
}

/// Evaluates an RPN queue. `true`/`false` literals evaluate directly; other
/// atoms are looked up in the context (missing atoms default to false). An
/// empty or malformed queue evaluates to false.
pub fn evaluate_rpn(rpn: &[String], context: &HashMap<String, bool>) -> bool {
    let mut stack: Vec<bool> = Vec::new();

    for token in rpn {
        match token.as_str() {
            "and" => {
                let (Some(b), Some(a)) = (stack.pop(), stack.pop()) else {
                    return false;
                };
                stack.push(a && b);
            }
            "or" => {
                let (Some(b), Some(a)) = (stack.pop(), stack.pop()) else {
                    return false;
                };
                stack.push(a || b);
            }
            "not" => {
                let Some(a) = stack.pop() else {
                    return false;
                };
                stack.push(!a);
            }
            other => {
                let value = match other.to_ascii_lowercase().as_str() {
                    "true" => true,
                    "false" => false,
                    _ => context.get(other).copied().unwrap_or(false),
                };
                stack.push(value);
            }
        }
    }

    stack.first().copied().unwrap_or(false)
}

/// Compiles and evaluates an infix boolean expression in one step.
pub fn evaluate_expression(expression: &str, context: &HashMap<String, bool>) -> bool {
    let rpn = shunting_yard(&tokenize(expression));
    evaluate_rpn(&rpn, context)
}
