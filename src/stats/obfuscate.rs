//! Resource obfuscation for stats aggregation
//!
//! Stats group by resource, so literal query values must be masked
//! before they become aggregation keys: raw SQL with bound values would
//! explode the key space and leak data into stats payloads.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // "key": <anything up to , } ]> masks values while keeping keys.
    static ref MONGO_VALUES: Regex =
        Regex::new(r#""(?P<key>(?:[^"\\]|\\.)*)"\s*:\s*(?:"(?:[^"\\]|\\.)*"|[^,}\]]+)"#).unwrap();
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

/// Obfuscate a resource according to the span type it came from.
pub fn obfuscate_resource(span_type: &str, resource: &str) -> String {
    match span_type {
        "sql" | "cassandra" => obfuscate_sql(resource),
        "redis" => obfuscate_redis(resource),
        "mongodb" => obfuscate_mongo(resource),
        _ => resource.to_string(),
    }
}

/// Replace SQL literals with `?`, strip comments, collapse whitespace.
pub fn obfuscate_sql(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut chars = query.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                // String literal, with backslash and '' escaping.
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            chars.next();
                        }
                        '\'' => {
                            if chars.peek() == Some(&'\'') {
                                chars.next();
                            } else {
                                break;
                            }
                        }
                        _ => {}
                    }
                }
                out.push('?');
            }
            '-' if chars.peek() == Some(&'-') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
                out.push(' ');
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
                out.push(' ');
            }
            c if c.is_ascii_digit() => {
                // A digit inside an identifier ("t1") is not a literal.
                let in_word = out
                    .chars()
                    .last()
                    .map_or(false, |p| p.is_ascii_alphanumeric() || p == '_');
                if in_word {
                    out.push(c);
                    continue;
                }
                while let Some(&n) = chars.peek() {
                    if n.is_ascii_digit() || n == '.' || n == 'e' || n == 'E' || n == 'x' {
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push('?');
            }
            c => out.push(c),
        }
    }
    let collapsed = WHITESPACE.replace_all(out.trim(), " ").into_owned();
    collapse_value_lists(&collapsed)
}

// ( ?, ?, ? ) → ( ? ) so IN lists of any arity share a key.
fn collapse_value_lists(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut rest = query;
    while let Some(open) = rest.find('(') {
        out.push_str(&rest[..=open]);
        rest = &rest[open + 1..];
        if let Some(close) = rest.find(')') {
            let inner = &rest[..close];
            if !inner.is_empty()
                && inner
                    .chars()
                    .all(|c| c == '?' || c == ',' || c.is_whitespace())
            {
                out.push_str("?)");
                rest = &rest[close + 1..];
                continue;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Keep only the command words of each redis invocation.
pub fn obfuscate_redis(commands: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for line in commands.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(cmd) = line.split_whitespace().next() {
            out.push(cmd);
        }
    }
    out.join(" ")
}

/// Mask all values in a MongoDB query document, keeping the keys.
pub fn obfuscate_mongo(query: &str) -> String {
    MONGO_VALUES
        .replace_all(query, "\"$key\": \"?\"")
        .into_owned()
}
