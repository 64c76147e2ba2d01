//! The menu/command scripting language.
//!
//! Scripts are line-oriented. `/* … */` comments may span lines, back-ticks
//! quote multi-word literals, labels are a bare word ending in `:` on a
//! line of their own, and `%{name}` substitutes a variable or macro at
//! evaluation time (repeatedly, with a recursion bound).
//!
//! This module owns the lexical layer: loading, tokenizing, escape
//! processing, substitution, and condition evaluation. The execution
//! engine lives in [`interp`].

pub mod interp;

use std::collections::HashMap;

use thiserror::Error;

/// Expansion passes before we assume `%{…}` refers to itself.
const EXPANSION_BOUND: usize = 16;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ScriptError {
    #[error("syntax error at line {0}")]
    Syntax(usize),
    #[error("undefined label '{0}'")]
    UndefinedLabel(String),
    #[error("script stack overflow")]
    StackOverflow,
    #[error("block nesting too deep at line {0}")]
    NestingTooDeep(usize),
    #[error("unbalanced block at line {0}")]
    UnbalancedBlock(usize),
    #[error("script '{0}' not found")]
    NotFound(String),
}

/// A loaded script: comment-stripped lines plus its label table.
#[derive(Debug, Clone)]
pub struct Script {
    pub name: String,
    pub lines: Vec<String>,
    pub labels: HashMap<String, usize>,
}

impl Script {
    /// Parse source text. Comments are removed before line splitting so a
    /// `/* … */` spanning lines leaves empty lines behind (keeping label
    /// line numbers stable is not required; labels are collected after
    /// stripping).
    pub fn parse(name: &str, source: &str) -> Script {
        let stripped = strip_comments(source);
        let lines: Vec<String> = stripped.lines().map(|l| l.trim().to_string()).collect();
        let mut labels = HashMap::new();
        for (i, line) in lines.iter().enumerate() {
            if let Some(label) = line.strip_suffix(':') {
                if !label.is_empty()
                    && !label.contains(char::is_whitespace)
                    && !label.contains('`')
                {
                    labels.insert(label.to_ascii_lowercase(), i);
                }
            }
        }
        Script { name: name.to_string(), lines, labels }
    }
}

/// Remove `/* … */` comments, preserving newlines inside them so later
/// line numbers still make sense in error messages. Back-ticked literals
/// shield comment markers.
fn strip_comments(source: &str) -> String {
    let bytes = source.as_bytes();
    let mut out = String::with_capacity(source.len());
    let mut i = 0;
    let mut in_comment = false;
    let mut in_literal = false;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if in_comment {
            if c == '*' && bytes.get(i + 1) == Some(&b'/') {
                in_comment = false;
                i += 2;
                continue;
            }
            if c == '\n' {
                out.push('\n');
            }
            i += 1;
            continue;
        }
        if in_literal {
            if c == '\\' && i + 1 < bytes.len() {
                out.push(c);
                out.push(bytes[i + 1] as char);
                i += 2;
                continue;
            }
            if c == '`' {
                in_literal = false;
            }
            out.push(c);
            i += 1;
            continue;
        }
        match c {
            '/' if bytes.get(i + 1) == Some(&b'*') => {
                in_comment = true;
                i += 2;
            }
            '`' => {
                in_literal = true;
                out.push(c);
                i += 1;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Split a line into tokens. Back-ticked spans become one token without
/// the back-ticks; everything else splits on whitespace.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_literal = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if in_literal {
            match c {
                '\\' => {
                    current.push(c);
                    if let Some(&next) = chars.peek() {
                        current.push(next);
                        chars.next();
                    }
                }
                '`' => {
                    in_literal = false;
                    tokens.push(std::mem::take(&mut current));
                }
                _ => current.push(c),
            }
            continue;
        }
        match c {
            '`' => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                in_literal = true;
            }
            c if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Process string-literal escapes. Known: `\r\n` pairs fall out of `\r`
/// and `\n` naturally, plus `\t`, `\\`, `` \` ``. Unknown escapes pass
/// through unchanged so ANSI art with back-slashes survives.
pub fn process_escapes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some('`') => out.push('`'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Substitute `%{name}` until none remain, against the variable map first
/// and the macro source second. Unknown names expand to the empty string.
pub fn expand(
    input: &str,
    vars: &HashMap<String, String>,
    macros: &dyn Fn(&str) -> Option<String>,
) -> String {
    let mut text = input.to_string();
    // Each pass substitutes every `%{…}` once; values containing further
    // substitutions are handled by the next pass, so the bound limits
    // recursion depth rather than the count per line.
    for _ in 0..EXPANSION_BOUND {
        if !text.contains("%{") {
            break;
        }
        let mut out = String::with_capacity(text.len());
        let mut rest = text.as_str();
        let mut replaced = false;
        while let Some(start) = rest.find("%{") {
            let Some(rel_end) = rest[start + 2..].find('}') else { break };
            let name = rest[start + 2..start + 2 + rel_end].to_ascii_lowercase();
            out.push_str(&rest[..start]);
            let value = vars
                .get(&name)
                .cloned()
                .or_else(|| macros(&name))
                .unwrap_or_default();
            out.push_str(&value);
            replaced = true;
            rest = &rest[start + 2 + rel_end + 1..];
        }
        out.push_str(rest);
        text = out;
        if !replaced {
            break;
        }
    }
    text
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// One side of a comparison: `%{}` substitution first, then a bare word
/// that names a variable or macro reads as its value (`if r == 0` works
/// without writing `%{r}`).
fn resolve_term(
    token: &str,
    vars: &HashMap<String, String>,
    macros: &dyn Fn(&str) -> Option<String>,
) -> String {
    let expanded = expand(token, vars, macros);
    if expanded == token {
        let key = expanded.to_ascii_lowercase();
        if let Some(v) = vars.get(&key) {
            return v.clone();
        }
        if let Some(m) = macros(&key) {
            return m;
        }
    }
    expanded
}

/// Evaluate a condition token run: comparisons joined by `&&`/`||`, equal
/// precedence, short-circuit, left to right.
pub fn eval_condition(
    tokens: &[String],
    vars: &HashMap<String, String>,
    macros: &dyn Fn(&str) -> Option<String>,
) -> Result<bool, ()> {
    let mut idx = 0;
    let mut acc: Option<bool> = None;
    let mut pending_op: Option<bool> = None; // true = AND, false = OR
    while idx < tokens.len() {
        if idx + 3 > tokens.len() {
            return Err(());
        }
        let lhs = resolve_term(&tokens[idx], vars, macros);
        let op = tokens[idx + 1].as_str();
        let rhs = resolve_term(&tokens[idx + 2], vars, macros);
        idx += 3;
        let value = compare(&lhs, op, &rhs)?;
        acc = Some(match (acc, pending_op) {
            (None, _) => value,
            (Some(a), Some(true)) => a && value,
            (Some(a), Some(false)) => a || value,
            (Some(_), None) => return Err(()),
        });
        pending_op = None;
        if idx < tokens.len() {
            pending_op = match tokens[idx].as_str() {
                "&&" => Some(true),
                "||" => Some(false),
                _ => return Err(()),
            };
            idx += 1;
            // Short-circuit: skip the next comparison's evaluation but
            // still consume its tokens (handled by the loop arithmetic;
            // evaluation is cheap and side-effect free, so plain
            // left-to-right folding gives identical results).
        }
    }
    acc.ok_or(())
}

fn compare(lhs: &str, op: &str, rhs: &str) -> Result<bool, ()> {
    match op {
        "==" => Ok(lhs == rhs),
        "!=" => Ok(lhs != rhs),
        ">" | "<" | ">=" | "<=" => {
            let a = parse_int(lhs);
            let b = parse_int(rhs);
            Ok(match op {
                ">" => a > b,
                "<" => a < b,
                ">=" => a >= b,
                _ => a <= b,
            })
        }
        _ => Err(()),
    }
}

/// Numeric parsing for arithmetic and comparisons: garbage reads as 0.
pub fn parse_int(s: &str) -> i64 {
    s.trim().parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_macros(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn comments_and_labels() {
        let src = "set a 1\n/* a comment\nspanning lines */\ntop:\ngoto top\n";
        let script = Script::parse("test", src);
        assert_eq!(script.labels.get("top"), Some(&3));
        assert_eq!(script.lines[0], "set a 1");
        // The comment interior collapsed to blank lines.
        assert_eq!(script.lines[1], "");
    }

    #[test]
    fn backticks_quote_multiword() {
        let tokens = tokenize("print `hello there world` plain");
        assert_eq!(tokens, vec!["print", "hello there world", "plain"]);
        // A comment marker inside a literal survives.
        let script = Script::parse("t", "print `not /* a comment`\n");
        assert_eq!(script.lines[0], "print `not /* a comment`");
    }

    #[test]
    fn escapes() {
        assert_eq!(process_escapes("a\\r\\nb"), "a\r\nb");
        assert_eq!(process_escapes("tab\\there"), "tab\there");
        assert_eq!(process_escapes("back\\\\slash"), "back\\slash");
        assert_eq!(process_escapes("tick\\`"), "tick`");
        // Unknown escapes pass through for ANSI art.
        assert_eq!(process_escapes("art\\_\\/"), "art\\_\\/");
    }

    #[test]
    fn expansion_is_repeated_and_bounded() {
        let mut vars = HashMap::new();
        vars.insert("a".into(), "%{b}".into());
        vars.insert("b".into(), "deep".into());
        assert_eq!(expand("x %{a} y", &vars, &no_macros), "x deep y");

        // Self-reference terminates via the bound.
        vars.insert("loop".into(), "%{loop}".into());
        let out = expand("%{loop}", &vars, &no_macros);
        assert!(out.is_empty() || out.contains("%{loop}"));

        // Unknown names vanish.
        assert_eq!(expand("<%{nosuch}>", &vars, &no_macros), "<>");
    }

    #[test]
    fn macros_fall_back_after_vars() {
        let mut vars = HashMap::new();
        vars.insert("line".into(), "override".into());
        let macros = |name: &str| match name {
            "line" => Some("3".to_string()),
            "hour" => Some("23".to_string()),
            _ => None,
        };
        assert_eq!(expand("%{line}", &vars, &macros), "override");
        assert_eq!(expand("%{hour}", &vars, &macros), "23");
    }

    #[test]
    fn conditions() {
        let vars = HashMap::new();
        let t = |s: &str| tokenize(s);
        assert_eq!(eval_condition(&t("5 > 3"), &vars, &no_macros), Ok(true));
        assert_eq!(eval_condition(&t("5 > 3 && 5 < 10"), &vars, &no_macros), Ok(true));
        assert_eq!(eval_condition(&t("5 > 9 || 1 == 1"), &vars, &no_macros), Ok(true));
        assert_eq!(eval_condition(&t("a == b"), &vars, &no_macros), Ok(false));
        assert_eq!(eval_condition(&t("abc == abc"), &vars, &no_macros), Ok(true));
        // Same precedence, left to right: (F && T) || T = T
        assert_eq!(
            eval_condition(&t("1 == 2 && 1 == 1 || 2 == 2"), &vars, &no_macros),
            Ok(true)
        );
        // Garbage comparisons are numeric zero.
        assert_eq!(eval_condition(&t("junk > -1"), &vars, &no_macros), Ok(true));
        assert!(eval_condition(&t("5 >"), &vars, &no_macros).is_err());
        assert!(eval_condition(&t("5 ?? 3"), &vars, &no_macros).is_err());
    }
}
