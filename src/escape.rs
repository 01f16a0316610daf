//! Escape decoding for user supplied text and path helpers for device replies.

use once_cell::sync::Lazy;
use regex::Regex;

static RE_PARENTHESIZED: Lazy<Regex> = Lazy::new(|| Regex::new(r"\(([^)]+)\)").unwrap());

static RE_QUOTED_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"['"](/[^'"\r\n]*)['"]"#).unwrap());

/// Turn typed escape sequences into the characters they stand for.
///
/// Runs three passes in a fixed order: `\xHH` byte escapes, `\uHHHH` escapes,
/// then the single character escapes (`\n`, `\r`, `\t`, `\b`, `\f`, `\v`, `\0`).
/// Whatever `\X` remains collapses to `X`; a trailing lone backslash is dropped.
/// An escape directly preceded by another backslash is not decoded by the first
/// two passes.
pub fn unescape(original: &str) -> String {
    let hex = decode_numeric(original, 'x', 2);
    let unicode = decode_numeric(&hex, 'u', 4);
    decode_simple(&unicode)
}

fn decode_numeric(input: &str, marker: char, digits: usize) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        let escaped_backslash = i > 0 && chars[i - 1] == '\\';
        if ch == '\\'
            && !escaped_backslash
            && chars.get(i + 1) == Some(&marker)
            && i + 2 + digits <= chars.len()
        {
            let hex: String = chars[i + 2..i + 2 + digits].iter().collect();
            let decoded = u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32);
            if hex.chars().all(|c| c.is_ascii_hexdigit())
                && let Some(decoded) = decoded
            {
                out.push(decoded);
                i += 2 + digits;
                continue;
            }
        }
        out.push(ch);
        i += 1;
    }

    out
}

fn decode_simple(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();

    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('v') => out.push('\u{b}'),
            Some('0') => out.push('\0'),
            Some(other) => out.push(other),
            None => {}
        }
    }

    out
}

/// Path held in the first parenthesized group of a reply, re-rooted at `/`.
///
/// `ql_fs.mkdirs('/usr/lib/net')` yields `/usr/lib/net`.
pub fn extract_file_path(data: &str) -> Option<String> {
    let inner = RE_PARENTHESIZED.captures(data)?.get(1)?.as_str().trim();
    let unquoted = inner.trim_matches(|c| c == '\'' || c == '"');
    let segments: Vec<&str> = unquoted.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return None;
    }
    Some(format!("/{}", segments.join("/")))
}

/// First quoted absolute path in a reply, e.g. the argument echoed back by
/// `uos.remove('/usr/a.py')`.
pub fn extract_quoted_path(data: &str) -> Option<String> {
    RE_QUOTED_PATH
        .captures(data)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_table() {
        assert_eq!(unescape("\\r\\n"), "\r\n");
        assert_eq!(unescape("\\x41"), "A");
        assert_eq!(unescape("\\u0041"), "A");
        assert_eq!(unescape("\\t\\b\\f\\v\\0"), "\t\u{8}\u{c}\u{b}\0");
    }

    #[test]
    fn test_unknown_escapes_collapse() {
        assert_eq!(unescape("a\\qb"), "aqb");
        assert_eq!(unescape("end\\"), "end");
        assert_eq!(unescape("\\\\"), "\\");
    }

    #[test]
    fn test_escaped_backslash_blocks_hex() {
        // `\\x41` is an escaped backslash followed by plain `x41`
        assert_eq!(unescape("\\\\x41"), "\\x41");
    }

    #[test]
    fn test_malformed_numeric_escapes_do_not_panic() {
        assert_eq!(unescape("\\xZZ"), "xZZ");
        assert_eq!(unescape("\\x4"), "x4");
        assert_eq!(unescape("\\uD800"), "uD800");
        assert_eq!(unescape("ü\\x41ü"), "üAü");
    }

    #[test]
    fn test_unescape_idempotent_without_residual_backslashes() {
        let inputs = [
            "plain text",
            "\\r\\n",
            "\\x41\\x42",
            "tab\\there",
            "\\u00e9t\\u00e9",
            "mixed \\q \\x7a",
        ];
        for input in inputs {
            let once = unescape(input);
            if !once.contains('\\') {
                assert_eq!(unescape(&once), once, "input: {input:?}");
            }
        }
    }

    #[test]
    fn test_extract_file_path() {
        assert_eq!(
            extract_file_path(">>> ql_fs.mkdirs('/usr/lib/net')\r\n"),
            Some("/usr/lib/net".to_string())
        );
        assert_eq!(extract_file_path("no parens here"), None);
        assert_eq!(extract_file_path("()"), None);
    }

    #[test]
    fn test_extract_quoted_path() {
        assert_eq!(
            extract_quoted_path("uos.remove('/usr/sub/file.py')\r\n>>> "),
            Some("/usr/sub/file.py".to_string())
        );
        assert_eq!(
            extract_quoted_path("uos.rmdir(\"/usr/sub\")"),
            Some("/usr/sub".to_string())
        );
        assert_eq!(extract_quoted_path("print('hello')"), None);
    }
}
