/*!
keyboard.rs - BBC keyboard matrix with a lock-free writer/reader split.

The UI thread (the single writer) calls `key_pressed` / `key_released` with
system key codes; the CPU thread reads the matrix while emulating the
system VIA's keyboard scan. All cells and counters are atomics so the
reader sees each update at worst one CPU quantum late; no locks are taken
on either side. Consistency is per-cell only: a column count can lag an
individual cell by one update, which mirrors how loosely the real hardware
scan behaves.

Matrix geometry is 16x16 (the machine populates rows 0-7, columns 0-9).
The row/column assignments below follow the standard BBC keyboard matrix.
*/

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// System key codes for keys without a printable ASCII identity.
/// Printable keys use their upper-case ASCII byte directly.
pub const KEY_ESCAPE: u8 = 128;
pub const KEY_BACKSPACE: u8 = 129;
pub const KEY_TAB: u8 = 130;
pub const KEY_ENTER: u8 = 131;
pub const KEY_CTRL_LEFT: u8 = 132;
pub const KEY_SHIFT_LEFT: u8 = 133;
pub const KEY_SHIFT_RIGHT: u8 = 134;
pub const KEY_CAPS_LOCK: u8 = 135;
pub const KEY_F0: u8 = 136;
pub const KEY_F1: u8 = 137;
pub const KEY_F2: u8 = 138;
pub const KEY_F3: u8 = 139;
pub const KEY_F4: u8 = 140;
pub const KEY_F5: u8 = 141;
pub const KEY_F6: u8 = 142;
pub const KEY_F7: u8 = 143;
pub const KEY_F8: u8 = 144;
pub const KEY_F9: u8 = 145;
pub const KEY_ARROW_UP: u8 = 146;
pub const KEY_ARROW_DOWN: u8 = 147;
pub const KEY_ARROW_LEFT: u8 = 148;
pub const KEY_ARROW_RIGHT: u8 = 149;

const ROWS: usize = 16;
const COLS: usize = 16;

pub struct Keyboard {
    cells: [[AtomicBool; COLS]; ROWS],
    count: AtomicU8,
    count_col: [AtomicU8; COLS],
    down: [AtomicBool; 256],
}

/// Map a system key code to its (row, col) in the BBC matrix.
fn key_to_rowcol(key: u8) -> Option<(u8, u8)> {
    let rowcol = match key {
        KEY_SHIFT_LEFT | KEY_SHIFT_RIGHT => (0, 0),
        KEY_CTRL_LEFT => (0, 1),
        b'Q' => (1, 0),
        b'3' => (1, 1),
        b'4' => (1, 2),
        b'5' => (1, 3),
        KEY_F4 => (1, 4),
        b'8' => (1, 5),
        KEY_F7 => (1, 6),
        b'-' => (1, 7),
        b'=' => (1, 8), // BBC ^
        KEY_ARROW_LEFT => (1, 9),
        KEY_F0 => (2, 0),
        b'W' => (2, 1),
        b'E' => (2, 2),
        b'T' => (2, 3),
        b'7' => (2, 4),
        b'I' => (2, 5),
        b'9' => (2, 6),
        b'0' => (2, 7),
        KEY_ARROW_DOWN => (2, 9),
        b'1' => (3, 0),
        b'2' => (3, 1),
        b'D' => (3, 2),
        b'R' => (3, 3),
        b'6' => (3, 4),
        b'U' => (3, 5),
        b'O' => (3, 6),
        b'P' => (3, 7),
        b']' => (3, 8), // BBC [
        KEY_ARROW_UP => (3, 9),
        KEY_CAPS_LOCK => (4, 0),
        b'A' => (4, 1),
        b'X' => (4, 2),
        b'F' => (4, 3),
        b'Y' => (4, 4),
        b'J' => (4, 5),
        b'K' => (4, 6),
        b'[' => (4, 7),  // BBC @
        b'\'' => (4, 8), // BBC :
        KEY_ENTER => (4, 9),
        b'S' => (5, 1),
        b'C' => (5, 2),
        b'G' => (5, 3),
        b'H' => (5, 4),
        b'N' => (5, 5),
        b'L' => (5, 6),
        b';' => (5, 7),
        b'\\' => (5, 8), // BBC ]
        KEY_BACKSPACE => (5, 9),
        KEY_TAB => (6, 0),
        b'Z' => (6, 1),
        b' ' => (6, 2),
        b'V' => (6, 3),
        b'B' => (6, 4),
        b'M' => (6, 5),
        b',' => (6, 6),
        b'.' => (6, 7),
        b'/' => (6, 8),
        KEY_ESCAPE => (7, 0),
        KEY_F1 => (7, 1),
        KEY_F2 => (7, 2),
        KEY_F3 => (7, 3),
        KEY_F5 => (7, 4),
        KEY_F6 => (7, 5),
        KEY_F8 => (7, 6),
        KEY_F9 => (7, 7),
        KEY_ARROW_RIGHT => (7, 9),
        _ => return None,
    };
    Some(rowcol)
}

impl Keyboard {
    pub fn new() -> Keyboard {
        Keyboard {
            cells: std::array::from_fn(|_| std::array::from_fn(|_| AtomicBool::new(false))),
            count: AtomicU8::new(0),
            count_col: std::array::from_fn(|_| AtomicU8::new(0)),
            down: std::array::from_fn(|_| AtomicBool::new(false)),
        }
    }

    // -----------------------------------------------------------------
    // Writer side (UI thread)
    // -----------------------------------------------------------------

    pub fn key_pressed(&self, key: u8) {
        if self.down[key as usize].swap(true, Ordering::Relaxed) {
            return;
        }
        let Some((row, col)) = key_to_rowcol(key) else {
            return;
        };
        // Two host keys can share a matrix cell (both shifts); only the
        // first one down bumps the counters.
        let was = self.cells[row as usize][col as usize].swap(true, Ordering::Relaxed);
        if !was {
            self.count.fetch_add(1, Ordering::Relaxed);
            self.count_col[col as usize].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn key_released(&self, key: u8) {
        if !self.down[key as usize].swap(false, Ordering::Relaxed) {
            return;
        }
        let Some((row, col)) = key_to_rowcol(key) else {
            return;
        };
        // Keep the cell held while a twin host key (the other shift) is
        // still down.
        if self.twin_still_down(key) {
            return;
        }
        let was = self.cells[row as usize][col as usize].swap(false, Ordering::Relaxed);
        if was {
            self.count.fetch_sub(1, Ordering::Relaxed);
            self.count_col[col as usize].fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn twin_still_down(&self, key: u8) -> bool {
        let twin = match key {
            KEY_SHIFT_LEFT => KEY_SHIFT_RIGHT,
            KEY_SHIFT_RIGHT => KEY_SHIFT_LEFT,
            _ => return false,
        };
        self.down[twin as usize].load(Ordering::Relaxed)
    }

    // -----------------------------------------------------------------
    // Reader side (CPU thread; system VIA keyboard scan)
    // -----------------------------------------------------------------

    #[inline]
    pub fn is_pressed(&self, row: u8, col: u8) -> bool {
        self.cells[(row & 0x0F) as usize][(col & 0x0F) as usize].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_column_pressed(&self, col: u8) -> bool {
        self.count_col[(col & 0x0F) as usize].load(Ordering::Relaxed) > 0
    }

    #[inline]
    pub fn any_pressed(&self) -> bool {
        self.count.load(Ordering::Relaxed) > 0
    }
}

impl Default for Keyboard {
    fn default() -> Self {
        Keyboard::new()
    }
}
