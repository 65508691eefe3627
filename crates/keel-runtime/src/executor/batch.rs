//! Script text analysis: `GO` batches and explicit transaction control.
//!
//! Both analyses run on a masked copy of the script in which comments, string
//! literals, quoted identifiers and dollar-quoted bodies are blanked out, so a
//! `BEGIN` inside a PL/pgSQL function or a `GO` inside a string is not
//! mistaken for a statement.

use once_cell::sync::Lazy;
use regex::Regex;

static GO_SEPARATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*GO(?:\s+(\d+))?\s*$").expect("separator pattern is valid"));

static TRANSACTION_CONTROL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(BEGIN|START\s+TRANSACTION|COMMIT|END|ROLLBACK|ABORT|SAVEPOINT|RELEASE|PREPARE\s+TRANSACTION)\b",
    )
    .expect("transaction pattern is valid")
});

static BEGIN_ATOMIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bBEGIN\s+ATOMIC\b").expect("atomic pattern is valid"));

/// A run of statements between separators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub sql: String,
    /// How many times the batch runs (`GO 3`).
    pub repeat: u32,
    /// 1-based line where the batch starts.
    pub line: usize,
}

/// Split script text into batches on lines holding only `GO [count]`.
///
/// Batches with nothing but whitespace and comments are dropped. A separator
/// with a count of zero drops its batch.
pub fn split_batches(text: &str) -> Vec<Batch> {
    let masked = mask_sql(text);
    let mut batches = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut start_line = 1;

    for (idx, (line, masked_line)) in text.lines().zip(masked.lines()).enumerate() {
        if let Some(caps) = GO_SEPARATOR.captures(masked_line) {
            let repeat = caps
                .get(1)
                .and_then(|m| m.as_str().parse::<u32>().ok())
                .unwrap_or(1);
            push_batch(&mut batches, &current, repeat, start_line);
            current.clear();
            start_line = idx + 2;
        } else {
            current.push(line);
        }
    }
    push_batch(&mut batches, &current, 1, start_line);

    batches
}

fn push_batch(batches: &mut Vec<Batch>, lines: &[&str], repeat: u32, line: usize) {
    if repeat == 0 {
        return;
    }
    let sql = lines.join("\n");
    if mask_sql(&sql).trim().is_empty() {
        return;
    }
    batches.push(Batch {
        sql: sql.trim().to_string(),
        repeat,
        line,
    });
}

/// Whether the script manages its own transactions.
///
/// Looks for statements starting with `BEGIN`, `START TRANSACTION`, `COMMIT`,
/// `END`, `ROLLBACK`, `ABORT`, `SAVEPOINT`, `RELEASE` or
/// `PREPARE TRANSACTION`. The body of a `BEGIN ATOMIC ... END` function is
/// not transaction control.
pub fn contains_transaction_control(text: &str) -> bool {
    let masked = mask_sql(text);
    let mut in_atomic_body = false;

    for statement in masked.split(';') {
        // Separator lines are not part of any statement.
        let statement: String = statement
            .lines()
            .filter(|line| !GO_SEPARATOR.is_match(line))
            .collect::<Vec<_>>()
            .join("\n");

        if in_atomic_body {
            if starts_with_keyword(&statement, "END") {
                in_atomic_body = false;
            }
            continue;
        }
        if BEGIN_ATOMIC.is_match(&statement) {
            in_atomic_body = true;
            continue;
        }
        if TRANSACTION_CONTROL.is_match(&statement) {
            return true;
        }
    }
    false
}

fn starts_with_keyword(statement: &str, keyword: &str) -> bool {
    statement
        .split_whitespace()
        .next()
        .map(|word| word.eq_ignore_ascii_case(keyword))
        .unwrap_or(false)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Lexeme {
    Code,
    LineComment,
    BlockComment(usize),
    SingleQuote,
    DoubleQuote,
    Dollar(String),
}

/// Blank out comments, literals and dollar-quoted bodies.
///
/// Newlines are kept so masked lines line up with the original text.
pub fn mask_sql(sql: &str) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut state = Lexeme::Code;
    let mut i = 0;

    let blank = |out: &mut String, c: char| out.push(if c == '\n' { '\n' } else { ' ' });

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        match &state {
            Lexeme::Code => match c {
                '-' if next == Some('-') => {
                    state = Lexeme::LineComment;
                    out.push_str("  ");
                    i += 2;
                    continue;
                }
                '/' if next == Some('*') => {
                    state = Lexeme::BlockComment(1);
                    out.push_str("  ");
                    i += 2;
                    continue;
                }
                '\'' => {
                    state = Lexeme::SingleQuote;
                    out.push(' ');
                }
                '"' => {
                    state = Lexeme::DoubleQuote;
                    out.push(' ');
                }
                '$' => {
                    if let Some(tag) = dollar_tag(&chars, i) {
                        for _ in 0..tag.chars().count() {
                            out.push(' ');
                        }
                        i += tag.chars().count();
                        state = Lexeme::Dollar(tag);
                        continue;
                    }
                    out.push(c);
                }
                _ => out.push(c),
            },
            Lexeme::LineComment => {
                if c == '\n' {
                    state = Lexeme::Code;
                }
                blank(&mut out, c);
            }
            Lexeme::BlockComment(depth) => {
                let depth = *depth;
                if c == '*' && next == Some('/') {
                    out.push_str("  ");
                    i += 2;
                    state = if depth == 1 {
                        Lexeme::Code
                    } else {
                        Lexeme::BlockComment(depth - 1)
                    };
                    continue;
                }
                if c == '/' && next == Some('*') {
                    out.push_str("  ");
                    i += 2;
                    state = Lexeme::BlockComment(depth + 1);
                    continue;
                }
                blank(&mut out, c);
            }
            Lexeme::SingleQuote => {
                if c == '\'' {
                    if next == Some('\'') {
                        out.push_str("  ");
                        i += 2;
                        continue;
                    }
                    state = Lexeme::Code;
                }
                blank(&mut out, c);
            }
            Lexeme::DoubleQuote => {
                if c == '"' {
                    if next == Some('"') {
                        out.push_str("  ");
                        i += 2;
                        continue;
                    }
                    state = Lexeme::Code;
                }
                blank(&mut out, c);
            }
            Lexeme::Dollar(tag) => {
                if c == '$' && starts_with_at(&chars, i, tag) {
                    let len = tag.chars().count();
                    for _ in 0..len {
                        out.push(' ');
                    }
                    i += len;
                    state = Lexeme::Code;
                    continue;
                }
                blank(&mut out, c);
            }
        }
        i += 1;
    }

    out
}

/// Read a dollar-quote delimiter (`$$` or `$tag$`) starting at `start`.
///
/// Tags cannot start with a digit, so positional parameters like `$1` are not
/// delimiters.
fn dollar_tag(chars: &[char], start: usize) -> Option<String> {
    let mut tag = String::from("$");
    let mut i = start + 1;

    while let Some(&c) = chars.get(i) {
        if c == '$' {
            tag.push('$');
            return Some(tag);
        }
        let valid = if tag.len() == 1 {
            c.is_alphabetic() || c == '_'
        } else {
            c.is_alphanumeric() || c == '_'
        };
        if !valid {
            return None;
        }
        tag.push(c);
        i += 1;
    }
    None
}

fn starts_with_at(chars: &[char], start: usize, pattern: &str) -> bool {
    let mut i = start;
    for p in pattern.chars() {
        if chars.get(i) != Some(&p) {
            return false;
        }
        i += 1;
    }
    true
}
