//! Rendering of raw terminal byte streams into readable text.
//!
//! Command segmentation needs the line an operator actually submitted and the text the
//! backend printed, not the raw escape-laden stream. [`ScreenParser`] replays the bytes on a
//! fixed size [`vt100`] screen and reads the visible lines back. Repeat counts of CSI
//! sequences are clamped to the screen size first, whatever the stream carries.

use regex::Regex;
use vt100::Parser;

pub trait TtyParser: Send + Sync {
    /// Last non-empty rendered line, prompt removed.
    fn parse_input(&self, chunks: &[Vec<u8>]) -> String;
    /// All non-empty rendered lines except the last one (the next prompt).
    fn parse_output(&self, chunks: &[Vec<u8>]) -> String;
}

const PS1_PATTERN: &str = r"^\[?.*@.*\]?[\$#]\s|mysql>\s";
pub const SCREEN_ROWS: u16 = 100;
pub const SCREEN_COLS: u16 = 200;

/// CSI final bytes whose parameters are repeat counts or positions.
const COUNT_FINALS: &[u8] = b"@ABCDEFGHIJKLMPSTXZ`abdef";

enum Scan {
    Ground,
    Escape,
    Csi(Vec<u8>),
}

fn push_clamped(out: &mut Vec<u8>, params: &[u8], limit: u64) {
    for (i, param) in params.split(|&b| b == b';').enumerate() {
        if i > 0 {
            out.push(b';');
        }
        if !param.is_empty() && param.iter().all(u8::is_ascii_digit) {
            let value = param.iter().fold(0u64, |n, d| {
                n.saturating_mul(10).saturating_add(u64::from(d - b'0'))
            });
            out.extend_from_slice(value.min(limit).to_string().as_bytes());
        } else {
            out.extend_from_slice(param);
        }
    }
}

/// Rewrites count parameters larger than `limit` down to `limit`.
fn clamp_counts(bytes: &[u8], limit: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut state = Scan::Ground;
    for &b in bytes {
        state = match state {
            Scan::Ground if b == 0x1b => Scan::Escape,
            Scan::Ground => {
                out.push(b);
                Scan::Ground
            }
            Scan::Escape if b == b'[' => Scan::Csi(Vec::new()),
            Scan::Escape if b == 0x1b => {
                out.push(0x1b);
                Scan::Escape
            }
            Scan::Escape => {
                out.extend_from_slice(&[0x1b, b]);
                Scan::Ground
            }
            Scan::Csi(params) if (0x40..=0x7e).contains(&b) => {
                out.extend_from_slice(b"\x1b[");
                if COUNT_FINALS.contains(&b) {
                    push_clamped(&mut out, &params, limit);
                } else {
                    out.extend_from_slice(&params);
                }
                out.push(b);
                Scan::Ground
            }
            Scan::Csi(mut params) => {
                params.push(b);
                Scan::Csi(params)
            }
        };
    }
    match state {
        Scan::Ground => {}
        Scan::Escape => out.push(0x1b),
        Scan::Csi(params) => {
            out.extend_from_slice(b"\x1b[");
            out.extend_from_slice(&params);
        }
    }
    out
}

pub struct ScreenParser {
    ps1: Regex,
    rows: u16,
    cols: u16,
}

impl ScreenParser {
    pub fn new() -> Result<Self, regex::Error> {
        Self::with_prompt(PS1_PATTERN)
    }

    /// Uses a custom prompt pattern, removed from the start of submitted lines.
    pub fn with_prompt(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            ps1: Regex::new(pattern)?,
            rows: SCREEN_ROWS,
            cols: SCREEN_COLS,
        })
    }

    /// Renders on a `rows` x `cols` screen instead of the default one.
    pub fn with_size(mut self, rows: u16, cols: u16) -> Self {
        self.rows = rows.max(1);
        self.cols = cols.max(1);
        self
    }

    fn render(&self, chunks: &[Vec<u8>]) -> Vec<String> {
        let limit = u64::from(self.rows.max(self.cols));
        let mut screen = Parser::new(self.rows, self.cols, 0);
        screen.process(&clamp_counts(&chunks.concat(), limit));
        screen
            .screen()
            .contents()
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| line.trim_end().to_string())
            .collect()
    }
}

impl TtyParser for ScreenParser {
    fn parse_input(&self, chunks: &[Vec<u8>]) -> String {
        let lines = self.render(chunks);
        match lines.last() {
            Some(line) => self.ps1.replace(line, "").trim().to_string(),
            None => String::new(),
        }
    }

    fn parse_output(&self, chunks: &[Vec<u8>]) -> String {
        let lines = self.render(chunks);
        if lines.len() < 2 {
            return String::new();
        }
        lines[..lines.len() - 1].join("\n").trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: &[&str]) -> Vec<Vec<u8>> {
        parts.iter().map(|p| p.as_bytes().to_vec()).collect()
    }

    #[test]
    fn test_parse_input_strips_prompt() {
        let parser = ScreenParser::new().unwrap();
        assert_eq!(
            parser.parse_input(&chunks(&["[root@web01 ~]# ", "ls -la"])),
            "ls -la"
        );
        assert_eq!(parser.parse_input(&chunks(&["alice@host:~$ whoami"])), "whoami");
        assert_eq!(parser.parse_input(&chunks(&["mysql> show tables;"])), "show tables;");
        assert_eq!(parser.parse_input(&chunks(&["echo hi"])), "echo hi");
    }

    #[test]
    fn test_parse_input_applies_edits() {
        let parser = ScreenParser::new().unwrap();
        // backspace then erase to end of line
        assert_eq!(parser.parse_input(&chunks(&["lsx", "\x08\x1b[K"])), "ls");
        // carriage return redraw keeps the latest text
        assert_eq!(parser.parse_input(&chunks(&["cat a", "\rcat b"])), "cat b");
        // colors are dropped
        assert_eq!(parser.parse_input(&chunks(&["\x1b[01;32mtop\x1b[0m"])), "top");
        // title updates are dropped
        assert_eq!(parser.parse_input(&chunks(&["\x1b]0;title\x07uptime"])), "uptime");
    }

    #[test]
    fn test_parse_input_empty() {
        let parser = ScreenParser::new().unwrap();
        assert_eq!(parser.parse_input(&[]), "");
        assert_eq!(parser.parse_input(&chunks(&["\r\n", "   "])), "");
    }

    #[test]
    fn test_parse_output_drops_last_prompt() {
        let parser = ScreenParser::new().unwrap();
        assert_eq!(parser.parse_output(&chunks(&["\r\nhi\r\n$ "])), "hi");
        assert_eq!(
            parser.parse_output(&chunks(&["\r\na.txt\r\n", "b.txt\r\n", "[root@web01 ~]# "])),
            "a.txt\nb.txt"
        );
        assert_eq!(parser.parse_output(&chunks(&["$ "])), "");
    }

    #[test]
    fn test_oversized_counts_stay_on_screen() {
        let parser = ScreenParser::new().unwrap();
        let started = std::time::Instant::now();

        let output = parser.parse_output(&chunks(&["\x1b[18446744073709551615Cx\r\n$ "]));
        assert_eq!(output, "x");
        let output = parser.parse_output(&chunks(&["\x1b[200000000Cy\r\n$ "]));
        assert_eq!(output, "y");
        assert_eq!(
            parser.parse_input(&chunks(&["abc", "\x1b[3D\x1b[4294967295@", "z"])),
            "z"
        );
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
    }

    #[test]
    fn test_clamp_counts() {
        assert_eq!(clamp_counts(b"\x1b[99999@x", 200), b"\x1b[200@x");
        assert_eq!(clamp_counts(b"\x1b[5;123456H", 200), b"\x1b[5;200H");
        // modes and colors are not counts
        assert_eq!(
            clamp_counts(b"\x1b[?1049h\x1b[38;5;255m", 200),
            b"\x1b[?1049h\x1b[38;5;255m"
        );
        assert_eq!(clamp_counts(b"plain\x1b]0;t\x07", 200), b"plain\x1b]0;t\x07");
        // a sequence cut at the end is kept as is
        assert_eq!(clamp_counts(b"ab\x1b[12", 200), b"ab\x1b[12");
    }

    #[test]
    fn test_long_lines_wrap_into_one_command() {
        let parser = ScreenParser::new().unwrap().with_size(24, 10);
        assert_eq!(
            parser.parse_input(&chunks(&["echo 0123456789abc"])),
            "echo 0123456789abc"
        );
        // only what fits on the screen survives
        let many: String = (0..40).map(|i| format!("{}\r\n", i)).collect();
        let output = parser.parse_output(&[many.into_bytes(), b"$ ".to_vec()]);
        assert!(output.starts_with("17\n"));
        assert!(output.ends_with("39"));
    }

    #[test]
    fn test_custom_prompt() {
        let parser = ScreenParser::with_prompt(r"^sql> ").unwrap();
        assert_eq!(parser.parse_input(&chunks(&["sql> select 1"])), "select 1");
        assert!(ScreenParser::with_prompt("(").is_err());
    }
}
