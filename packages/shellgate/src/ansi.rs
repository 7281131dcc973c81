/// ANSI escape sequence stripping.
///
/// Terminal output is full of color codes, cursor movement and mode
/// switches; sentinel matching and captured output both need the plain
/// text. Handles CSI sequences, OSC strings (BEL- or ST-terminated),
/// charset designations and bare two-byte escapes.
pub fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            // CSI: parameters and intermediates, then one final byte @..~
            Some('[') => {
                chars.next();
                for c in chars.by_ref() {
                    if ('@'..='~').contains(&c) {
                        break;
                    }
                }
            }
            // OSC: runs until BEL or ESC \
            Some(']') => {
                chars.next();
                while let Some(c) = chars.next() {
                    if c == '\u{07}' {
                        break;
                    }
                    if c == '\u{1b}' {
                        if chars.peek() == Some(&'\\') {
                            chars.next();
                        }
                        break;
                    }
                }
            }
            // Charset designation: ESC ( X / ESC ) X
            Some('(') | Some(')') => {
                chars.next();
                chars.next();
            }
            // Any other two-byte escape
            Some(_) => {
                chars.next();
            }
            None => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(strip_ansi("hello world\r\n"), "hello world\r\n");
    }

    #[test]
    fn sgr_colors_are_removed() {
        assert_eq!(strip_ansi("\x1b[31mred\x1b[0m plain"), "red plain");
        assert_eq!(strip_ansi("\x1b[1;32;40mbold\x1b[m"), "bold");
    }

    #[test]
    fn cursor_and_mode_sequences_are_removed() {
        assert_eq!(strip_ansi("\x1b[2J\x1b[H\x1b[?2004hprompt$ "), "prompt$ ");
        assert_eq!(strip_ansi("a\x1b[10;20Hb"), "ab");
    }

    #[test]
    fn osc_title_sequences_are_removed() {
        assert_eq!(strip_ansi("\x1b]0;my title\x07text"), "text");
        assert_eq!(strip_ansi("\x1b]2;title\x1b\\text"), "text");
    }

    #[test]
    fn two_byte_escapes_are_removed() {
        assert_eq!(strip_ansi("\x1b=x\x1b>y"), "xy");
        assert_eq!(strip_ansi("\x1b(Bascii"), "ascii");
    }

    #[test]
    fn truncated_sequence_at_end_is_dropped() {
        assert_eq!(strip_ansi("ok\x1b["), "ok");
        assert_eq!(strip_ansi("ok\x1b"), "ok");
    }
}
