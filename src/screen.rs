//! Minimal ANSI screen emulator.
//!
//! Processes just enough of the CSI repertoire to reconstruct the *final*
//! visible frame from a stream of PTY bytes: `EL (K)` 0/1/2, cursor moves
//! `CUU/CUD/CUF/CUB (A/B/C/D)`, `CHA (G)`, `CUP (H)`. `SGR (m)` is accepted
//! and ignored; any other CSI sequence is consumed and discarded. The
//! emulator exists to derive a stable frame for TTS selection, not to render
//! a terminal.

/// Maximum retained lines; the oldest are dropped beyond this.
const MAX_LINES: usize = 1000;

/// CSI parser state.
enum ParseState {
    Ground,
    /// Saw ESC, waiting for `[` (or anything else, which aborts).
    Escape,
    /// Inside a CSI sequence, accumulating parameter bytes.
    Csi,
}

/// Dynamic screen: a growing vector of lines plus a cursor.
pub struct ScreenEmulator {
    lines: Vec<String>,
    row: usize,
    col: usize,
    state: ParseState,
    params: String,
}

impl ScreenEmulator {
    pub fn new() -> Self {
        Self {
            lines: vec![String::new()],
            row: 0,
            col: 0,
            state: ParseState::Ground,
            params: String::new(),
        }
    }

    /// Feed a chunk of PTY output (lossy UTF-8 text).
    pub fn process(&mut self, data: &str) {
        for c in data.chars() {
            match self.state {
                ParseState::Ground => match c {
                    '\u{1b}' => self.state = ParseState::Escape,
                    '\n' => {
                        self.row += 1;
                        self.col = 0;
                        self.ensure_row();
                    }
                    '\r' => self.col = 0,
                    '\u{8}' => self.col = self.col.saturating_sub(1),
                    '\t' => {
                        // Advance to the next 8-column tab stop.
                        let next = (self.col / 8 + 1) * 8;
                        while self.col < next {
                            self.put_char(' ');
                        }
                    }
                    c if c.is_control() => {}
                    c => self.put_char(c),
                },
                ParseState::Escape => {
                    if c == '[' {
                        self.params.clear();
                        self.state = ParseState::Csi;
                    } else {
                        // Non-CSI escape — not in the supported subset.
                        self.state = ParseState::Ground;
                    }
                }
                ParseState::Csi => {
                    if c.is_ascii_digit() || c == ';' || c == '?' {
                        self.params.push(c);
                    } else {
                        let params = std::mem::take(&mut self.params);
                        self.apply_csi(c, &params);
                        self.state = ParseState::Ground;
                    }
                }
            }
        }
    }

    fn apply_csi(&mut self, cmd: char, params: &str) {
        let args: Vec<usize> = params
            .split(';')
            .map(|p| p.trim_start_matches('?').parse().unwrap_or(0))
            .collect();
        let first = args.first().copied().unwrap_or(0);
        let first_or_one = if first == 0 { 1 } else { first };

        match cmd {
            'A' => self.row = self.row.saturating_sub(first_or_one),
            'B' => {
                self.row += first_or_one;
                self.ensure_row();
            }
            'C' => self.col += first_or_one,
            'D' => self.col = self.col.saturating_sub(first_or_one),
            'G' => self.col = first_or_one.saturating_sub(1),
            'H' => {
                let row = args.first().copied().unwrap_or(1).max(1);
                let col = args.get(1).copied().unwrap_or(1).max(1);
                self.row = row - 1;
                self.col = col - 1;
                self.ensure_row();
            }
            'K' => self.erase_in_line(first),
            // SGR: colors/attributes carry no content — ignored.
            'm' => {}
            // Anything else in the CSI space is consumed and discarded.
            _ => {}
        }
    }

    fn erase_in_line(&mut self, mode: usize) {
        self.ensure_row();
        let line = &mut self.lines[self.row];
        match mode {
            // 0: cursor to end of line
            0 => {
                let keep: String = line.chars().take(self.col).collect();
                *line = keep;
            }
            // 1: start of line through cursor (inclusive), blanked
            1 => {
                let tail: String = line.chars().skip(self.col + 1).collect();
                let mut blanked = " ".repeat(self.col + 1);
                blanked.push_str(&tail);
                *line = blanked;
            }
            // 2: whole line
            2 => line.clear(),
            _ => {}
        }
    }

    fn ensure_row(&mut self) {
        while self.lines.len() <= self.row {
            self.lines.push(String::new());
        }
        if self.lines.len() > MAX_LINES {
            let drop = self.lines.len() - MAX_LINES;
            self.lines.drain(..drop);
            self.row = self.row.saturating_sub(drop);
        }
    }

    fn put_char(&mut self, c: char) {
        self.ensure_row();
        let line = &mut self.lines[self.row];
        let len = line.chars().count();
        if self.col < len {
            // Overwrite in place
            *line = line
                .chars()
                .enumerate()
                .map(|(i, existing)| if i == self.col { c } else { existing })
                .collect();
        } else {
            for _ in len..self.col {
                line.push(' ');
            }
            line.push(c);
        }
        self.col += 1;
    }

    /// The final rendered frame: lines joined with `\n`, trailing blank lines
    /// stripped.
    pub fn screen_content(&self) -> String {
        let mut end = self.lines.len();
        while end > 0 && self.lines[end - 1].trim().is_empty() {
            end -= 1;
        }
        self.lines[..end].join("\n")
    }

    /// Clear all state back to a fresh screen.
    pub fn reset(&mut self) {
        self.lines.clear();
        self.lines.push(String::new());
        self.row = 0;
        self.col = 0;
        self.state = ParseState::Ground;
        self.params.clear();
    }
}

impl Default for ScreenEmulator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(data: &str) -> String {
        let mut screen = ScreenEmulator::new();
        screen.process(data);
        screen.screen_content()
    }

    #[test]
    fn plain_text_and_newlines() {
        assert_eq!(render("hello"), "hello");
        assert_eq!(render("one\ntwo\nthree"), "one\ntwo\nthree");
    }

    #[test]
    fn carriage_return_overwrites() {
        assert_eq!(render("abcdef\rxyz"), "xyzdef");
    }

    #[test]
    fn trailing_blank_lines_are_stripped() {
        assert_eq!(render("text\n\n\n"), "text");
        assert_eq!(render(""), "");
        assert_eq!(render("\n\n"), "");
    }

    #[test]
    fn sgr_is_ignored() {
        assert_eq!(render("\u{1b}[31mred\u{1b}[0m"), "red");
        assert_eq!(render("\u{1b}[1;32;44mstyled\u{1b}[m"), "styled");
    }

    #[test]
    fn erase_line_modes() {
        // EL 0: cursor to end
        assert_eq!(render("abcdef\r\u{1b}[3C\u{1b}[K"), "abc");
        // EL 2: whole line
        assert_eq!(render("abcdef\u{1b}[2K"), "");
        // EL 2 then rewrite
        assert_eq!(render("abcdef\u{1b}[2K\rnew"), "new");
    }

    #[test]
    fn erase_to_start_blanks_inclusive() {
        // Cursor on column 2 (0-based); EL 1 blanks columns 0..=2
        let mut screen = ScreenEmulator::new();
        screen.process("abcdef\r\u{1b}[2C\u{1b}[1K");
        assert_eq!(screen.screen_content(), "   def");
    }

    #[test]
    fn cursor_moves() {
        // CUB then overwrite
        assert_eq!(render("abc\u{1b}[2Dxy"), "axy");
        // CUF pads with spaces
        assert_eq!(render("a\u{1b}[3Cb"), "a   b");
        // CUU rewrites an earlier row
        assert_eq!(render("first\nsecond\u{1b}[A\rFIRST"), "FIRST\nsecond");
    }

    #[test]
    fn cha_and_cup() {
        // CHA: absolute column (1-based)
        assert_eq!(render("abcdef\u{1b}[2GX"), "aXcdef");
        // CUP: absolute row/col
        assert_eq!(render("one\ntwo\u{1b}[1;1HX"), "Xne\ntwo");
        // CUP with defaults goes home
        assert_eq!(render("one\ntwo\u{1b}[HX"), "Xne\ntwo");
    }

    #[test]
    fn cursor_down_extends_rows() {
        assert_eq!(render("a\u{1b}[2Bb"), "a\n\n b");
    }

    #[test]
    fn unknown_csi_is_consumed() {
        assert_eq!(render("ab\u{1b}[?25lcd"), "abcd");
        assert_eq!(render("ab\u{1b}[3Jcd"), "abcd");
    }

    #[test]
    fn split_sequences_across_chunks() {
        let mut screen = ScreenEmulator::new();
        screen.process("red:\u{1b}[3");
        screen.process("1mred\u{1b}");
        screen.process("[0m");
        assert_eq!(screen.screen_content(), "red:red");
    }

    #[test]
    fn tab_advances_to_stop() {
        assert_eq!(render("a\tb"), "a       b");
    }

    #[test]
    fn reset_restores_initial_state() {
        let mut screen = ScreenEmulator::new();
        screen.process("content\nmore\u{1b}[31m");
        screen.reset();
        assert_eq!(screen.screen_content(), "");
        screen.process("fresh");
        assert_eq!(screen.screen_content(), "fresh");
    }

    #[test]
    fn line_cap_drops_oldest() {
        let mut screen = ScreenEmulator::new();
        for i in 0..1200 {
            screen.process(&format!("line{i}\n"));
        }
        let content = screen.screen_content();
        let first = content.lines().next().unwrap();
        assert!(!content.contains("line0\n"));
        assert!(first.starts_with("line"));
        assert!(content.lines().count() <= 1000);
        assert!(content.ends_with("line1199"));
    }
}
