//! Escaping helpers for the textual index format and for emitted XML
//! attribute values.

/// Escape record text for the tab-separated index serialization.
/// Backslash, tab and newline are the only bytes that would break the
/// one-record-per-line format.
pub fn index_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            _ => out.push(ch),
        }
    }
    out
}

/// Inverse of [`index_escape`]. Unknown escapes pass the escaped
/// character through unchanged.
pub fn index_unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Escape a string for use inside a double-quoted XML attribute value.
pub fn xml_escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_escape_specials() {
        assert_eq!(index_escape("a\tb\nc\\d"), "a\\tb\\nc\\\\d");
    }

    #[test]
    fn test_index_escape_round_trip() {
        for text in ["", "plain", "\n", "\t\t", "a\\n", "mixed\t\\\nend"] {
            assert_eq!(index_unescape(&index_escape(text)), text);
        }
    }

    #[test]
    fn test_index_unescape_trailing_backslash() {
        assert_eq!(index_unescape("x\\"), "x\\");
    }

    #[test]
    fn test_xml_escape_attr() {
        assert_eq!(xml_escape_attr(r#"a<b>&"c""#), "a&lt;b&gt;&amp;&quot;c&quot;");
    }
}
