use std::iter::Peekable;
use std::str::Chars;

const MAX_LINE_CHARS: usize = 4096;

/// Strips terminal escape sequences and control characters from one line of
/// child output so it can be logged and written to error logs verbatim.
pub fn clean_line(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len().min(MAX_LINE_CHARS));
    let mut kept = 0usize;
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\x1b' => skip_escape(&mut chars),
            '\t' => {
                out.push(' ');
                kept += 1;
            }
            '\r' | '\n' => {}
            c if c.is_control() || is_bidi_control(c) => {}
            c => {
                out.push(c);
                kept += 1;
            }
        }
        if kept >= MAX_LINE_CHARS {
            if chars.peek().is_some() {
                out.push_str(" ...[truncated]");
            }
            break;
        }
    }
    out
}

fn skip_escape(chars: &mut Peekable<Chars<'_>>) {
    match chars.next() {
        // CSI: parameters end at the first final byte.
        Some('[') => {
            for c in chars.by_ref() {
                if ('@'..='~').contains(&c) {
                    return;
                }
            }
        }
        // OSC: BEL or ST terminated.
        Some(']') => skip_until_st(chars, true),
        Some('P' | 'X' | '^' | '_') => skip_until_st(chars, false),
        _ => {}
    }
}

fn skip_until_st(chars: &mut Peekable<Chars<'_>>, bel_ends: bool) {
    while let Some(c) = chars.next() {
        if bel_ends && c == '\x07' {
            return;
        }
        if c == '\x1b' && chars.peek() == Some(&'\\') {
            chars.next();
            return;
        }
    }
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}

#[cfg(test)]
mod tests {
    use super::clean_line;

    #[test]
    fn drops_color_codes_and_titles() {
        let got = clean_line("gcc \u{1b}[1;31merror\u{1b}[0m: \u{1b}]0;make\u{7}stop");
        assert_eq!(got, "gcc error: stop");
    }

    #[test]
    fn drops_string_terminated_payloads() {
        assert_eq!(clean_line("a\u{1b}Pdcs\u{1b}\\b"), "ab");
    }

    #[test]
    fn tabs_become_spaces_and_controls_vanish() {
        assert_eq!(clean_line("CC\tfoo.o\r\u{202e}"), "CC foo.o");
    }

    #[test]
    fn long_lines_are_truncated() {
        let raw = "x".repeat(5000);
        let got = clean_line(&raw);
        assert!(got.ends_with("...[truncated]"));
        assert!(got.len() < raw.len());
    }
}
