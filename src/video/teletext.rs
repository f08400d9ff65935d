/*!
teletext.rs - MODE7: SAA5050-style shift/attribute machine.

Driven with one byte per 1 MHz character. Attributes accumulate
left-to-right across each scanline and reset at the line start; control
codes (low 5 bits of the 7-bit code space) occupy a character cell and
mostly take effect from the following cell ("set-after"), with the usual
set-at exceptions. Graphics codes expand to 2x3 sixel cells, contiguous
or separated; text codes index an embedded 5x7 glyph set.

Output is one 16-pixel row per call, matching the renderer's 1 MHz
character width.
*/

/// The eight teletext display colors, ARGB.
const COLORS: [u32; 8] = [
    0xFF00_0000, // black
    0xFFFF_0000, // red
    0xFF00_FF00, // green
    0xFFFF_FF00, // yellow
    0xFF00_00FF, // blue
    0xFFFF_00FF, // magenta
    0xFF00_FFFF, // cyan
    0xFFFF_FFFF, // white
];

/// Scanlines per teletext character row (CRTC R9 = 18).
const ROW_SCANLINES: u8 = 19;

pub struct Teletext {
    // Attribute state, reset per scanline.
    fg: usize,
    bg: usize,
    graphics: bool,
    separated: bool,
    hold: bool,
    flash: bool,
    double_height: bool,
    conceal: bool,
    held_char: u8,

    scanline: u8,
    flash_frame_count: u32,
    flash_visible: bool,
}

impl Teletext {
    pub fn new() -> Teletext {
        Teletext {
            fg: 7,
            bg: 0,
            graphics: false,
            separated: false,
            hold: false,
            flash: false,
            double_height: false,
            conceal: false,
            held_char: 0x20,
            scanline: 0,
            flash_frame_count: 0,
            flash_visible: true,
        }
    }

    /// Start a new scanline at row address `ra`; attribute state resets.
    pub fn new_line(&mut self, ra: u8) {
        self.fg = 7;
        self.bg = 0;
        self.graphics = false;
        self.separated = false;
        self.hold = false;
        self.flash = false;
        self.double_height = false;
        self.conceal = false;
        self.held_char = 0x20;
        self.scanline = ra % ROW_SCANLINES;
    }

    /// Frame tick: advances the flash phase (roughly 3:1 duty).
    pub fn vsync(&mut self) {
        self.flash_frame_count += 1;
        self.flash_visible = (self.flash_frame_count % 64) < 48;
    }

    /// Expand one character byte into 16 host pixels for the current
    /// scanline.
    pub fn render_char(&mut self, data: u8, out: &mut [u32; 16]) {
        let code = data & 0x7F;

        if code < 0x20 {
            self.render_control_cell(out);
            self.apply_control(code);
            return;
        }

        if self.graphics && (code & 0x20) != 0 {
            self.held_char = code;
            if self.visible() {
                self.render_sixels(code, out);
            } else {
                out.fill(COLORS[self.bg]);
            }
            return;
        }

        if self.visible() {
            self.render_glyph(code, out);
        } else {
            out.fill(COLORS[self.bg]);
        }
    }

    fn visible(&self) -> bool {
        if self.conceal {
            return false;
        }
        if self.flash && !self.flash_visible {
            return false;
        }
        true
    }

    /// Control codes display as background, or as the held graphics
    /// character while hold mode is on.
    fn render_control_cell(&mut self, out: &mut [u32; 16]) {
        if self.hold && self.graphics {
            let held = self.held_char;
            self.render_sixels(held, out);
        } else {
            out.fill(COLORS[self.bg]);
        }
    }

    fn apply_control(&mut self, code: u8) {
        match code {
            0x01..=0x07 => {
                self.fg = code as usize;
                self.graphics = false;
                self.conceal = false;
            }
            0x08 => self.flash = true,
            0x09 => self.flash = false,
            0x0C => self.double_height = false,
            0x0D => self.double_height = true,
            0x11..=0x17 => {
                self.fg = (code & 0x07) as usize;
                self.graphics = true;
                self.conceal = false;
            }
            0x18 => self.conceal = true,
            0x19 => self.separated = false,
            0x1A => self.separated = true,
            0x1C => self.bg = 0,
            0x1D => self.bg = self.fg,
            0x1E => self.hold = true,
            0x1F => {
                self.hold = false;
                self.held_char = 0x20;
            }
            _ => {}
        }
    }

    /// 2x3 sixel expansion. Cell bits: 0/1 top, 2/3 middle, 4/6 bottom.
    fn render_sixels(&self, code: u8, out: &mut [u32; 16]) {
        let fg = COLORS[self.fg];
        let bg = COLORS[self.bg];

        // Vertical thirds over the 19 scanlines: 6/7/6.
        let (left_bit, right_bit) = match self.scanline {
            0..=5 => (0x01, 0x02),
            6..=12 => (0x04, 0x08),
            _ => (0x10, 0x40),
        };
        // Separated graphics blank the trailing rows of each third.
        let row_gap = self.separated && matches!(self.scanline, 4..=5 | 11..=12 | 17..=18);

        let left_on = (code & left_bit) != 0 && !row_gap;
        let right_on = (code & right_bit) != 0 && !row_gap;
        let col_gap = if self.separated { 2 } else { 0 };

        for (i, pixel) in out.iter_mut().enumerate() {
            let (on, col) = if i < 8 { (left_on, i) } else { (right_on, i - 8) };
            let gapped = col >= 8 - col_gap;
            *pixel = if on && !gapped { fg } else { bg };
        }
    }

    fn render_glyph(&self, code: u8, out: &mut [u32; 16]) {
        let fg = COLORS[self.fg];
        let bg = COLORS[self.bg];
        out.fill(bg);

        // Glyphs occupy scanlines 2..16 of the 19-line row, two lines per
        // font row. Double height stretches the top half across the row.
        let font_row = if self.double_height {
            (self.scanline / 4) as i32 - 1
        } else {
            (self.scanline / 2) as i32 - 1
        };
        if !(0..7).contains(&font_row) {
            return;
        }

        let row_bits = GLYPHS[(code - 0x20) as usize][font_row as usize];
        for col in 0..5usize {
            if (row_bits >> (4 - col)) & 1 != 0 {
                let x = 3 + col * 2;
                out[x] = fg;
                out[x + 1] = fg;
            }
        }
    }
}

impl Default for Teletext {
    fn default() -> Self {
        Teletext::new()
    }
}

/// 5x7 glyph rows for codes 0x20..0x7F, MSB leftmost. Teletext variants
/// (the 0x23 pound, 0x60 pound, arrows, divide, the 0x7F block) replace
/// their ASCII slots.
#[rustfmt::skip]
const GLYPHS: [[u8; 7]; 96] = [
    [0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b00000], // space
    [0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00000, 0b00100], // !
    [0b01010, 0b01010, 0b01010, 0b00000, 0b00000, 0b00000, 0b00000], // "
    [0b00110, 0b01001, 0b01000, 0b11110, 0b01000, 0b01000, 0b11111], // pound
    [0b00100, 0b01111, 0b10100, 0b01110, 0b00101, 0b11110, 0b00100], // $
    [0b11000, 0b11001, 0b00010, 0b00100, 0b01000, 0b10011, 0b00011], // %
    [0b01100, 0b10010, 0b10100, 0b01000, 0b10101, 0b10010, 0b01101], // &
    [0b00100, 0b00100, 0b01000, 0b00000, 0b00000, 0b00000, 0b00000], // '
    [0b00010, 0b00100, 0b01000, 0b01000, 0b01000, 0b00100, 0b00010], // (
    [0b01000, 0b00100, 0b00010, 0b00010, 0b00010, 0b00100, 0b01000], // )
    [0b00000, 0b00100, 0b10101, 0b01110, 0b10101, 0b00100, 0b00000], // *
    [0b00000, 0b00100, 0b00100, 0b11111, 0b00100, 0b00100, 0b00000], // +
    [0b00000, 0b00000, 0b00000, 0b00000, 0b00110, 0b00100, 0b01000], // ,
    [0b00000, 0b00000, 0b00000, 0b11111, 0b00000, 0b00000, 0b00000], // -
    [0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b01100, 0b01100], // .
    [0b00000, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b00000], // /
    [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110], // 0
    [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110], // 1
    [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111], // 2
    [0b11111, 0b00010, 0b00100, 0b00010, 0b00001, 0b10001, 0b01110], // 3
    [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010], // 4
    [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110], // 5
    [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110], // 6
    [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000], // 7
    [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110], // 8
    [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100], // 9
    [0b00000, 0b01100, 0b01100, 0b00000, 0b01100, 0b01100, 0b00000], // :
    [0b00000, 0b01100, 0b01100, 0b00000, 0b01100, 0b00100, 0b01000], // ;
    [0b00010, 0b00100, 0b01000, 0b10000, 0b01000, 0b00100, 0b00010], // <
    [0b00000, 0b00000, 0b11111, 0b00000, 0b11111, 0b00000, 0b00000], // =
    [0b01000, 0b00100, 0b00010, 0b00001, 0b00010, 0b00100, 0b01000], // >
    [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b00000, 0b00100], // ?
    [0b01110, 0b10001, 0b10111, 0b10101, 0b10111, 0b10000, 0b01110], // @
    [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001], // A
    [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110], // B
    [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110], // C
    [0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110], // D
    [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111], // E
    [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000], // F
    [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111], // G
    [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001], // H
    [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110], // I
    [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100], // J
    [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001], // K
    [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111], // L
    [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001], // M
    [0b10001, 0b11001, 0b10101, 0b10011, 0b10001, 0b10001, 0b10001], // N
    [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110], // O
    [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000], // P
    [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101], // Q
    [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001], // R
    [0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110], // S
    [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100], // T
    [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110], // U
    [0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b01010, 0b00100], // V
    [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010], // W
    [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001], // X
    [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100], // Y
    [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111], // Z
    [0b00000, 0b00100, 0b01000, 0b11111, 0b01000, 0b00100, 0b00000], // left arrow
    [0b10000, 0b01000, 0b01000, 0b00100, 0b00010, 0b00010, 0b00001], // 1/2 slot
    [0b00000, 0b00100, 0b00010, 0b11111, 0b00010, 0b00100, 0b00000], // right arrow
    [0b00100, 0b01110, 0b10101, 0b00100, 0b00100, 0b00100, 0b00100], // up arrow
    [0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b11111], // #
    [0b00110, 0b01001, 0b01000, 0b11110, 0b01000, 0b01000, 0b11111], // pound
    [0b00000, 0b00000, 0b01110, 0b00001, 0b01111, 0b10001, 0b01111], // a
    [0b10000, 0b10000, 0b11110, 0b10001, 0b10001, 0b10001, 0b11110], // b
    [0b00000, 0b00000, 0b01110, 0b10000, 0b10000, 0b10001, 0b01110], // c
    [0b00001, 0b00001, 0b01111, 0b10001, 0b10001, 0b10001, 0b01111], // d
    [0b00000, 0b00000, 0b01110, 0b10001, 0b11111, 0b10000, 0b01110], // e
    [0b00110, 0b01000, 0b11110, 0b01000, 0b01000, 0b01000, 0b01000], // f
    [0b00000, 0b01111, 0b10001, 0b10001, 0b01111, 0b00001, 0b01110], // g
    [0b10000, 0b10000, 0b11110, 0b10001, 0b10001, 0b10001, 0b10001], // h
    [0b00100, 0b00000, 0b01100, 0b00100, 0b00100, 0b00100, 0b01110], // i
    [0b00010, 0b00000, 0b00110, 0b00010, 0b00010, 0b10010, 0b01100], // j
    [0b10000, 0b10000, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010], // k
    [0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110], // l
    [0b00000, 0b00000, 0b11010, 0b10101, 0b10101, 0b10101, 0b10101], // m
    [0b00000, 0b00000, 0b11110, 0b10001, 0b10001, 0b10001, 0b10001], // n
    [0b00000, 0b00000, 0b01110, 0b10001, 0b10001, 0b10001, 0b01110], // o
    [0b00000, 0b00000, 0b11110, 0b10001, 0b11110, 0b10000, 0b10000], // p
    [0b00000, 0b00000, 0b01111, 0b10001, 0b01111, 0b00001, 0b00001], // q
    [0b00000, 0b00000, 0b10110, 0b11000, 0b10000, 0b10000, 0b10000], // r
    [0b00000, 0b00000, 0b01111, 0b10000, 0b01110, 0b00001, 0b11110], // s
    [0b01000, 0b01000, 0b11110, 0b01000, 0b01000, 0b01001, 0b00110], // t
    [0b00000, 0b00000, 0b10001, 0b10001, 0b10001, 0b10011, 0b01101], // u
    [0b00000, 0b00000, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100], // v
    [0b00000, 0b00000, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010], // w
    [0b00000, 0b00000, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001], // x
    [0b00000, 0b00000, 0b10001, 0b10001, 0b01111, 0b00001, 0b01110], // y
    [0b00000, 0b00000, 0b11111, 0b00010, 0b00100, 0b01000, 0b11111], // z
    [0b00100, 0b00100, 0b00100, 0b00000, 0b00000, 0b00000, 0b00000], // 1/4 slot
    [0b01010, 0b01010, 0b01010, 0b01010, 0b01010, 0b01010, 0b01010], // double bar
    [0b11000, 0b00100, 0b11000, 0b00000, 0b00000, 0b00000, 0b00000], // 3/4 slot
    [0b00000, 0b00100, 0b00000, 0b11111, 0b00000, 0b00100, 0b00000], // divide
    [0b11111, 0b11111, 0b11111, 0b11111, 0b11111, 0b11111, 0b11111], // block
];

#[cfg(test)]
mod tests {
    use super::*;

    const WHITE: u32 = 0xFFFF_FFFF;
    const BLACK: u32 = 0xFF00_0000;
    const RED: u32 = 0xFFFF_0000;
    const YELLOW: u32 = 0xFFFF_FF00;

    fn render(tt: &mut Teletext, data: u8) -> [u32; 16] {
        let mut out = [0u32; 16];
        tt.render_char(data, &mut out);
        out
    }

    #[test]
    fn default_attributes_are_white_on_black() {
        let mut tt = Teletext::new();
        tt.new_line(8); // a glyph row scanline
        // 'T' row 3 (scanline 8 -> font row 3) is 00100: two fg pixels.
        let out = render(&mut tt, b'T');
        assert_eq!(out.iter().filter(|&&p| p == WHITE).count(), 2);
        assert!(out.iter().all(|&p| p == WHITE || p == BLACK));
    }

    #[test]
    fn alpha_color_applies_after_control_cell() {
        let mut tt = Teletext::new();
        tt.new_line(8);
        // The control cell itself renders background.
        let control = render(&mut tt, 0x01); // alpha red
        assert!(control.iter().all(|&p| p == BLACK));
        let out = render(&mut tt, b'T');
        assert_eq!(out.iter().filter(|&&p| p == RED).count(), 2);
    }

    #[test]
    fn graphics_sixels_top_row() {
        let mut tt = Teletext::new();
        tt.new_line(0);
        let _ = render(&mut tt, 0x13); // graphics yellow
        // Code 0x21: bit 0 only -> top-left cell lit.
        let out = render(&mut tt, 0x21);
        assert!(out[0..8].iter().all(|&p| p == YELLOW));
        assert!(out[8..16].iter().all(|&p| p == BLACK));
    }

    #[test]
    fn graphics_bottom_row_uses_bit_6() {
        let mut tt = Teletext::new();
        tt.new_line(15);
        let _ = render(&mut tt, 0x17); // graphics white
        // Code 0x60: bit 6 only -> bottom-right cell.
        let out = render(&mut tt, 0x60);
        assert!(out[0..8].iter().all(|&p| p == BLACK));
        assert!(out[8..16].iter().all(|&p| p == WHITE));
    }

    #[test]
    fn separated_graphics_leave_gaps() {
        let mut tt = Teletext::new();
        tt.new_line(0);
        let _ = render(&mut tt, 0x13);
        let _ = render(&mut tt, 0x1A); // separated
        let out = render(&mut tt, 0x3F);
        // Trailing two columns of each half are background.
        assert_eq!(out[6], BLACK);
        assert_eq!(out[7], BLACK);
        assert_eq!(out[14], BLACK);
        assert_eq!(out[15], BLACK);
        assert_eq!(out[0], YELLOW);
    }

    #[test]
    fn new_background_takes_current_foreground() {
        let mut tt = Teletext::new();
        tt.new_line(0);
        let _ = render(&mut tt, 0x01); // alpha red
        let _ = render(&mut tt, 0x1D); // new background (red)
        let out = render(&mut tt, b' ');
        assert!(out.iter().all(|&p| p == RED));
    }

    #[test]
    fn hold_graphics_fills_control_cells() {
        let mut tt = Teletext::new();
        tt.new_line(0);
        let _ = render(&mut tt, 0x17); // graphics white
        let _ = render(&mut tt, 0x1E); // hold
        let _ = render(&mut tt, 0x7F); // block: both top cells lit
        // A further control code now renders the held block, not blank.
        let out = render(&mut tt, 0x08);
        assert!(out.iter().all(|&p| p == WHITE));
    }

    #[test]
    fn attributes_reset_at_line_start() {
        let mut tt = Teletext::new();
        tt.new_line(0);
        let _ = render(&mut tt, 0x11); // graphics red
        tt.new_line(2);
        let out = render(&mut tt, b'H');
        // Back to alpha white.
        assert!(out.iter().any(|&p| p == WHITE));
        assert!(!out.iter().any(|&p| p == RED));
    }

    #[test]
    fn flash_blanks_in_the_off_phase() {
        let mut tt = Teletext::new();
        // Advance to the off phase of the flash cycle.
        for _ in 0..50 {
            tt.vsync();
        }
        tt.new_line(8);
        let _ = render(&mut tt, 0x08); // flash on
        let out = render(&mut tt, b'T');
        assert!(out.iter().all(|&p| p == BLACK));
    }
}
