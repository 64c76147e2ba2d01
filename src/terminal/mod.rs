//! ANSI terminal model.
//!
//! Each line owns an 80×25 cell grid mirroring what the caller's screen
//! shows. The session feeds every byte it emits through [`Terminal::feed`]
//! so the grid stays in sync for the sysop snoop view, and so the paging
//! logic can count emitted rows without re-parsing the output stream.
//!
//! A cell holds a codepoint plus a 16-bit attribute word: foreground colour
//! in bits 0-3, background colour in bits 4-6, and an independent flash bit
//! at bit 8. A 2 Hz blink phase toggles visibility of flashing cells;
//! redraw notifications are row-scoped so a handful of flashing cells does
//! not repaint the whole screen.

pub const COLS: usize = 80;
pub const ROWS: usize = 25;

/// Attribute word layout.
pub const ATTR_FG_MASK: u16 = 0x000F;
pub const ATTR_BG_MASK: u16 = 0x0070;
pub const ATTR_BG_SHIFT: u16 = 4;
pub const ATTR_FLASH: u16 = 0x0100;
/// Default rendition: light grey on black.
pub const ATTR_DEFAULT: u16 = 0x0007;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    pub ch: char,
    pub attr: u16,
}

impl Default for Cell {
    fn default() -> Self {
        Cell { ch: ' ', attr: ATTR_DEFAULT }
    }
}

#[derive(Debug, Clone, Copy)]
enum Parse {
    Ground,
    Escape,
    Csi,
}

/// The 80×25 terminal grid and its escape-sequence parser.
pub struct Terminal {
    cells: Vec<Cell>,
    row: usize,
    col: usize,
    attr: u16,
    parse: Parse,
    params: Vec<u16>,
    cur_param: Option<u16>,
    blink_phase: bool,
    dirty: [bool; ROWS],
    /// LF count since the last clear/reset, consumed by the pager.
    lines_emitted: usize,
}

impl Default for Terminal {
    fn default() -> Self {
        Self::new()
    }
}

impl Terminal {
    pub fn new() -> Self {
        Terminal {
            cells: vec![Cell::default(); COLS * ROWS],
            row: 0,
            col: 0,
            attr: ATTR_DEFAULT,
            parse: Parse::Ground,
            params: Vec::new(),
            cur_param: None,
            blink_phase: true,
            dirty: [false; ROWS],
            lines_emitted: 0,
        }
    }

    pub fn cell(&self, row: usize, col: usize) -> Cell {
        self.cells[row * COLS + col]
    }

    pub fn cursor(&self) -> (usize, usize) {
        (self.row, self.col)
    }

    pub fn attr(&self) -> u16 {
        self.attr
    }

    /// Rows touched since the last call. Cleared on read.
    pub fn take_dirty_rows(&mut self) -> Vec<usize> {
        let rows = (0..ROWS).filter(|&r| self.dirty[r]).collect();
        self.dirty = [false; ROWS];
        rows
    }

    /// LF count since the last take; the pager resets this each screenful.
    pub fn take_lines_emitted(&mut self) -> usize {
        std::mem::take(&mut self.lines_emitted)
    }

    pub fn reset_line_count(&mut self) {
        self.lines_emitted = 0;
    }

    /// Advance the 2 Hz blink phase. Returns the rows that contain flashing
    /// cells and therefore need repainting.
    pub fn tick_blink(&mut self) -> Vec<usize> {
        self.blink_phase = !self.blink_phase;
        (0..ROWS)
            .filter(|&r| {
                (0..COLS).any(|c| self.cell(r, c).attr & ATTR_FLASH != 0)
            })
            .collect()
    }

    /// Whether flashing cells are currently visible.
    pub fn blink_visible(&self) -> bool {
        self.blink_phase
    }

    pub fn feed_bytes(&mut self, data: &[u8]) {
        for &b in data {
            self.feed(b);
        }
    }

    /// Process one output byte through the parser.
    pub fn feed(&mut self, byte: u8) {
        match self.parse {
            Parse::Ground => self.feed_ground(byte),
            Parse::Escape => match byte {
                b'[' => {
                    self.parse = Parse::Csi;
                    self.params.clear();
                    self.cur_param = None;
                }
                _ => {
                    // Unhandled escape (charset selection etc.) - drop it.
                    self.parse = Parse::Ground;
                }
            },
            Parse::Csi => self.feed_csi(byte),
        }
    }

    fn feed_ground(&mut self, byte: u8) {
        match byte {
            0x1B => self.parse = Parse::Escape,
            0x08 => {
                // BS
                if self.col > 0 {
                    self.col -= 1;
                }
            }
            0x09 => {
                // TAB to next 8-column stop
                self.col = ((self.col / 8) + 1) * 8;
                if self.col >= COLS {
                    self.col = COLS - 1;
                }
            }
            0x0A | 0x0B => self.line_feed(),
            0x0C => self.clear_screen(),
            0x0D => self.col = 0,
            0x00..=0x1F => {} // other controls ignored
            b => self.put_char(b as char),
        }
    }

    fn feed_csi(&mut self, byte: u8) {
        match byte {
            b'0'..=b'9' => {
                let d = (byte - b'0') as u16;
                self.cur_param = Some(self.cur_param.unwrap_or(0).saturating_mul(10).saturating_add(d));
            }
            b';' => {
                self.params.push(self.cur_param.take().unwrap_or(0));
            }
            b'?' => {} // private-mode prefix, parameters still accumulate
            final_byte => {
                if let Some(p) = self.cur_param.take() {
                    self.params.push(p);
                }
                self.dispatch_csi(final_byte);
                self.parse = Parse::Ground;
            }
        }
    }

    fn param(&self, idx: usize, default: u16) -> u16 {
        match self.params.get(idx) {
            Some(0) | None => default,
            Some(&v) => v,
        }
    }

    fn dispatch_csi(&mut self, cmd: u8) {
        match cmd {
            b'A' => {
                let n = self.param(0, 1) as usize;
                self.row = self.row.saturating_sub(n);
            }
            b'B' => {
                let n = self.param(0, 1) as usize;
                self.row = (self.row + n).min(ROWS - 1);
            }
            b'C' => {
                let n = self.param(0, 1) as usize;
                self.col = (self.col + n).min(COLS - 1);
            }
            b'D' => {
                let n = self.param(0, 1) as usize;
                self.col = self.col.saturating_sub(n);
            }
            b'H' | b'f' => {
                let r = self.param(0, 1) as usize;
                let c = self.param(1, 1) as usize;
                self.row = r.clamp(1, ROWS) - 1;
                self.col = c.clamp(1, COLS) - 1;
            }
            b'J' => self.erase_display(),
            b'K' => self.erase_line(),
            b'L' => {
                let n = self.param(0, 1) as usize;
                for _ in 0..n {
                    self.insert_row(self.row);
                }
            }
            b'M' => {
                let n = self.param(0, 1) as usize;
                for _ in 0..n {
                    self.delete_row(self.row);
                }
            }
            b'm' => self.apply_sgr(),
            b'n' => {
                // DSR request heading outward needs no grid change; the
                // reply arrives on the input pipe and is handled by the
                // detectansi wait state.
            }
            _ => {}
        }
    }

    fn apply_sgr(&mut self) {
        if self.params.is_empty() {
            // ESC[m is a full reset, same as ESC[0m
            self.attr = ATTR_DEFAULT;
            return;
        }
        for i in 0..self.params.len() {
            match self.params[i] {
                0 => self.attr = ATTR_DEFAULT,
                1 => self.attr |= 0x0008, // bold == bright foreground
                5 => self.attr |= ATTR_FLASH,
                25 => self.attr &= !ATTR_FLASH,
                30..=37 => {
                    let bright = self.attr & 0x0008;
                    self.attr = (self.attr & !ATTR_FG_MASK) | (self.params[i] - 30) | bright;
                }
                40..=47 => {
                    self.attr = (self.attr & !ATTR_BG_MASK)
                        | (((self.params[i] - 40) & 0x7) << ATTR_BG_SHIFT);
                }
                _ => {}
            }
        }
    }

    fn put_char(&mut self, ch: char) {
        if self.col >= COLS {
            self.col = 0;
            self.line_feed();
        }
        self.cells[self.row * COLS + self.col] = Cell { ch, attr: self.attr };
        self.dirty[self.row] = true;
        self.col += 1;
    }

    fn line_feed(&mut self) {
        self.lines_emitted += 1;
        if self.row + 1 == ROWS {
            self.scroll_up();
        } else {
            self.row += 1;
        }
    }

    fn scroll_up(&mut self) {
        self.cells.copy_within(COLS.., 0);
        let last = (ROWS - 1) * COLS;
        for c in &mut self.cells[last..] {
            *c = Cell { ch: ' ', attr: self.attr & !ATTR_FLASH };
        }
        self.dirty = [true; ROWS];
    }

    fn insert_row(&mut self, at: usize) {
        let start = at * COLS;
        let end = (ROWS - 1) * COLS;
        self.cells.copy_within(start..end, start + COLS);
        for c in &mut self.cells[start..start + COLS] {
            *c = Cell::default();
        }
        for r in at..ROWS {
            self.dirty[r] = true;
        }
    }

    fn delete_row(&mut self, at: usize) {
        let start = at * COLS;
        self.cells.copy_within(start + COLS.., start);
        let last = (ROWS - 1) * COLS;
        for c in &mut self.cells[last..] {
            *c = Cell::default();
        }
        for r in at..ROWS {
            self.dirty[r] = true;
        }
    }

    fn erase_display(&mut self) {
        match self.param(0, 0) {
            2 => self.clear_screen(),
            1 => {
                let upto = self.row * COLS + self.col;
                for c in &mut self.cells[..=upto.min(COLS * ROWS - 1)] {
                    *c = Cell::default();
                }
                for r in 0..=self.row {
                    self.dirty[r] = true;
                }
            }
            _ => {
                let from = self.row * COLS + self.col;
                for c in &mut self.cells[from..] {
                    *c = Cell::default();
                }
                for r in self.row..ROWS {
                    self.dirty[r] = true;
                }
            }
        }
    }

    fn erase_line(&mut self) {
        let base = self.row * COLS;
        match self.param(0, 0) {
            2 => {
                for c in &mut self.cells[base..base + COLS] {
                    *c = Cell::default();
                }
            }
            1 => {
                for c in &mut self.cells[base..=base + self.col] {
                    *c = Cell::default();
                }
            }
            _ => {
                for c in &mut self.cells[base + self.col..base + COLS] {
                    *c = Cell::default();
                }
            }
        }
        self.dirty[self.row] = true;
    }

    fn clear_screen(&mut self) {
        for c in &mut self.cells {
            *c = Cell::default();
        }
        self.row = 0;
        self.col = 0;
        self.dirty = [true; ROWS];
        self.lines_emitted = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row_text(t: &Terminal, row: usize) -> String {
        (0..COLS).map(|c| t.cell(row, c).ch).collect::<String>().trim_end().to_string()
    }

    #[test]
    fn plain_text_and_crlf() {
        let mut t = Terminal::new();
        t.feed_bytes(b"hello\r\nworld");
        assert_eq!(row_text(&t, 0), "hello");
        assert_eq!(row_text(&t, 1), "world");
        assert_eq!(t.cursor(), (1, 5));
        assert_eq!(t.take_lines_emitted(), 1);
    }

    #[test]
    fn cursor_movement_and_home() {
        let mut t = Terminal::new();
        t.feed_bytes(b"\x1b[10;20Hx");
        assert_eq!(t.cell(9, 19).ch, 'x');
        t.feed_bytes(b"\x1b[2A\x1b[5Dy");
        assert_eq!(t.cell(7, 15).ch, 'y');
        // H with no params homes the cursor
        t.feed_bytes(b"\x1b[Hz");
        assert_eq!(t.cell(0, 0).ch, 'z');
    }

    #[test]
    fn sgr_colours_and_reset_variants() {
        let mut t = Terminal::new();
        t.feed_bytes(b"\x1b[1;34;42mA");
        let cell = t.cell(0, 0);
        assert_eq!(cell.attr & ATTR_FG_MASK, 4 | 8); // bright blue
        assert_eq!((cell.attr & ATTR_BG_MASK) >> ATTR_BG_SHIFT, 2);
        // Bare ESC[m resets, same as ESC[0m
        t.feed_bytes(b"\x1b[mB");
        assert_eq!(t.cell(0, 1).attr, ATTR_DEFAULT);
        t.feed_bytes(b"\x1b[5mC");
        assert!(t.cell(0, 2).attr & ATTR_FLASH != 0);
    }

    #[test]
    fn flash_rows_reported_by_blink_tick() {
        let mut t = Terminal::new();
        t.feed_bytes(b"\x1b[3;1H\x1b[5mALERT\x1b[0m");
        let rows = t.tick_blink();
        assert_eq!(rows, vec![2]);
    }

    #[test]
    fn scroll_at_bottom() {
        let mut t = Terminal::new();
        for i in 0..ROWS + 3 {
            t.feed_bytes(format!("line{}\r\n", i).as_bytes());
        }
        // First rows have scrolled off; last written line is near the bottom.
        assert_eq!(row_text(&t, 0), format!("line{}", 4));
        assert_eq!(row_text(&t, ROWS - 2), format!("line{}", ROWS + 2));
    }

    #[test]
    fn form_feed_clears_and_resets_pager_count() {
        let mut t = Terminal::new();
        t.feed_bytes(b"abc\r\n\r\n\x0c");
        assert_eq!(t.take_lines_emitted(), 0);
        assert_eq!(t.cursor(), (0, 0));
        assert_eq!(row_text(&t, 0), "");
    }

    #[test]
    fn erase_line_variants() {
        let mut t = Terminal::new();
        t.feed_bytes(b"0123456789");
        t.feed_bytes(b"\x1b[5G"); // unknown final byte, ignored
        t.feed_bytes(b"\x1b[1;5H\x1b[K");
        assert_eq!(row_text(&t, 0), "0123");
        t.feed_bytes(b"\x1b[2K");
        assert_eq!(row_text(&t, 0), "");
    }

    #[test]
    fn dsr_request_leaves_grid_untouched() {
        let mut t = Terminal::new();
        t.feed_bytes(b"ab\x1b[6ncd");
        assert_eq!(row_text(&t, 0), "abcd");
    }

    #[test]
    fn insert_and_delete_rows() {
        let mut t = Terminal::new();
        t.feed_bytes(b"one\r\ntwo\r\nthree");
        t.feed_bytes(b"\x1b[2;1H\x1b[L");
        assert_eq!(row_text(&t, 1), "");
        assert_eq!(row_text(&t, 2), "two");
        t.feed_bytes(b"\x1b[M");
        assert_eq!(row_text(&t, 1), "two");
        assert_eq!(row_text(&t, 2), "three");
    }
}
