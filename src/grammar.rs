//! GBNF grammars that restrict a reply to one of a fixed set of literals.

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// Start/end marker pairs of the reasoning block a model may emit before
/// its answer: harmony channel markers and `<think>` tags.
pub const THINKING_MARKERS: [(&str, &str); 2] = [
    (
        "<|channel|>analysis<|message|>",
        "<|end|><|start|>assistant<|channel|>final<|message|>",
    ),
    ("<think>", "</think>"),
];

const RESERVED_RULES: [&str; 5] = [
    "root",
    "thinkingBlock",
    "thinkingStart",
    "thinkingEnd",
    "anychar",
];

/// Reads a `.gbnf` file.
pub fn load_grammar(path: impl AsRef<Path>) -> Result<String> {
    Ok(fs::read_to_string(path)?)
}

pub fn grammar_file_name(name: &str, thinking: bool) -> String {
    if thinking {
        format!("thinking_{name}.gbnf")
    } else {
        format!("{name}.gbnf")
    }
}

/// Builds a grammar whose final output is exactly one of `choices`, writes
/// it to `save_dir` and returns the text.
///
/// With `thinking`, a reasoning block delimited by one of
/// [`THINKING_MARKERS`] must come first.
pub fn multiple_choice_grammar<S: AsRef<str>>(
    choices: &[S],
    save_dir: impl AsRef<Path>,
    name: &str,
    thinking: bool,
) -> Result<String> {
    if choices.is_empty() {
        return Err(Error::Grammar("choices must be non-empty".to_string()));
    }
    if !is_rule_name(name) {
        return Err(Error::Grammar(format!(
            "name must be a valid rule identifier (got {name:?})"
        )));
    }
    if RESERVED_RULES.contains(&name) {
        return Err(Error::Grammar(format!(
            "name {name:?} collides with a built-in rule"
        )));
    }

    let alts = choices
        .iter()
        .map(|c| format!("\"{}\"", escape_literal(c.as_ref())))
        .collect::<Vec<_>>()
        .join(" | ");

    let content = if thinking {
        let starts = THINKING_MARKERS
            .iter()
            .map(|(start, _)| format!("\"{}\"", escape_literal(start)))
            .collect::<Vec<_>>()
            .join(" | ");
        let ends = THINKING_MARKERS
            .iter()
            .map(|(_, end)| format!("\"{}\"", escape_literal(&format!("{end}\n"))))
            .collect::<Vec<_>>()
            .join(" | ");
        format!(
            "root ::=  thinkingBlock {name}\n\
             thinkingBlock ::= thinkingStart anychar* thinkingEnd\n\
             thinkingStart ::= {starts}\n\
             thinkingEnd ::= {ends}\n\
             {name} ::= {alts}\n\
             anychar ::= [^<]\n"
        )
    } else {
        format!("root ::=  {name}\n{name} ::= {alts}\n")
    };

    let dir = save_dir.as_ref();
    fs::create_dir_all(dir)?;
    let path = dir.join(grammar_file_name(name, thinking));
    fs::write(&path, &content)?;
    tracing::debug!(path = %path.display(), choices = choices.len(), "Wrote grammar");

    Ok(content)
}

/// Escapes `s` for use inside a double-quoted GBNF literal.
pub fn escape_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

/// Inverse of [`escape_literal`]. Unknown escapes are kept verbatim.
pub fn unescape_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Removes a leading reasoning block, returning the trimmed answer.
/// Text without a complete block is only trimmed.
pub fn strip_thinking(response: &str) -> &str {
    let text = response.trim_start();
    for (start, end) in THINKING_MARKERS {
        if let Some(rest) = text.strip_prefix(start) {
            if let Some(pos) = rest.find(end) {
                return rest[pos + end.len()..].trim();
            }
        }
    }
    response.trim()
}

fn is_rule_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
