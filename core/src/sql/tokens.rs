//! Generic `open ... close` token scanning shared by the `${}` substitution
//! pass and the `#{}` placeholder pass.

/// Replace every `open...close` token in `text` with whatever `handler`
/// returns for the token's content. A backslash escapes an opening marker.
pub fn parse_tokens(
    text: &str,
    open: &str,
    close: &str,
    handler: &mut dyn FnMut(&str) -> String,
) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        let Some(start) = rest.find(open) else {
            out.push_str(rest);
            return out;
        };
        if start > 0 && rest.as_bytes()[start - 1] == b'\\' {
            // escaped opening marker: emit it literally
            out.push_str(&rest[..start - 1]);
            out.push_str(open);
            rest = &rest[start + open.len()..];
            continue;
        }
        out.push_str(&rest[..start]);
        let after_open = &rest[start + open.len()..];
        match after_open.find(close) {
            Some(end) => {
                out.push_str(&handler(&after_open[..end]));
                rest = &after_open[end + close.len()..];
            }
            None => {
                // unterminated token: emit the rest verbatim
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
}

/// True when `text` contains at least one unescaped `open...close` token.
pub fn contains_token(text: &str, open: &str, close: &str) -> bool {
    let mut found = false;
    parse_tokens(text, open, close, &mut |_| {
        found = true;
        String::new()
    });
    found
}

#[cfg(test)]
mod unit {
    use super::*;

    fn upper(text: &str) -> String {
        parse_tokens(text, "#{", "}", &mut |content| content.to_uppercase())
    }

    #[test]
    fn replaces_tokens_in_order() {
        assert_eq!(upper("a #{x} b #{y}"), "a X b Y");
    }

    #[test]
    fn escaped_open_is_literal() {
        assert_eq!(upper(r"a \#{x}"), "a #{x}");
    }

    #[test]
    fn unterminated_token_passes_through() {
        assert_eq!(upper("a #{x"), "a #{x");
    }

    #[test]
    fn detects_tokens() {
        assert!(contains_token("x ${a} y", "${", "}"));
        assert!(!contains_token("plain", "${", "}"));
        assert!(!contains_token(r"\${a}", "${", "}"));
    }
}
