//! `{{name}}` substitution and `when` expressions over the string variable map.

use std::collections::HashMap;

/// Replaces every `{{ name }}` whose name is identifier-shaped with its
/// value, or the empty string when unset. Anything else between braces
/// (`{{.State.Running}}`, `{{ a b }}`) is kept verbatim.
pub fn render(input: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let name = after[..end].trim();
        if is_identifier(name) {
            out.push_str(vars.get(name).map(String::as_str).unwrap_or(""));
        } else {
            out.push_str(&rest[start..start + 2 + end + 2]);
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "yes" | "on" | "1"
    )
}

/// Evaluates a `when` expression: variable names or literals joined by
/// `&&` and `||` (`&&` binds tighter), each optionally negated with `!`.
/// A term names a variable when one is set, otherwise it is read as a
/// literal.
pub fn evaluate_when(expr: &str, vars: &HashMap<String, String>) -> bool {
    let rendered = render(expr, vars);
    rendered
        .split("||")
        .any(|clause| clause.split("&&").all(|term| evaluate_term(term, vars)))
}

fn evaluate_term(term: &str, vars: &HashMap<String, String>) -> bool {
    let mut term = term.trim();
    let mut negate = false;
    while let Some(stripped) = term.strip_prefix('!') {
        negate = !negate;
        term = stripped.trim_start();
    }
    let value = vars.get(term).map(String::as_str).unwrap_or(term);
    is_truthy(value) != negate
}
