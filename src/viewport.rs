use std::ops::Range;

/// Lines taken by the title bar, the help line and the status line.
pub const CHROME_LINES: usize = 4;

/// An item that knows how many terminal lines it renders to.
pub trait Measured {
    fn block_height(&self) -> usize;
}

impl Measured for usize {
    fn block_height(&self) -> usize {
        *self
    }
}

/// Cursor plus the inclusive `view_start..=view_end` window over a list that
/// only grows. Every item occupies its block height plus one separator line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListView {
    cursor: usize,
    view_start: usize,
    view_end: usize,
    window: usize,
}

impl ListView {
    pub fn new(terminal_height: u16) -> Self {
        Self {
            window: window_for(terminal_height),
            ..Self::default()
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn window_height(&self) -> usize {
        self.window
    }

    pub fn bounds(&self) -> (usize, usize) {
        (self.view_start, self.view_end)
    }

    pub fn visible(&self, len: usize) -> Range<usize> {
        if len == 0 {
            return 0..0;
        }
        let end = self.view_end.min(len - 1);
        self.view_start.min(end)..end + 1
    }

    pub fn init<T: Measured>(&mut self, items: &[T]) {
        self.cursor = 0;
        self.view_start = 0;
        self.fill_forward(items);
    }

    pub fn move_down<T: Measured>(&mut self, items: &[T]) {
        if self.cursor + 1 >= items.len() {
            return;
        }
        self.cursor += 1;
        if self.cursor > self.view_end {
            self.view_end = self.cursor;
            self.fill_backward(items);
        }
    }

    pub fn move_up<T: Measured>(&mut self, items: &[T]) {
        if self.cursor == 0 {
            return;
        }
        self.cursor -= 1;
        if self.cursor < self.view_start {
            self.view_start = self.cursor;
            self.fill_forward(items);
        }
    }

    /// New terminal size; the cursor stays on the same item.
    pub fn resize<T: Measured>(&mut self, items: &[T], terminal_height: u16) {
        self.window = window_for(terminal_height);
        self.refresh(items);
    }

    /// Re-lays the window after items were appended or re-rendered.
    pub fn refresh<T: Measured>(&mut self, items: &[T]) {
        if items.is_empty() {
            *self = Self {
                window: self.window,
                ..Self::default()
            };
            return;
        }
        self.cursor = self.cursor.min(items.len() - 1);
        self.view_start = self.view_start.min(self.cursor);
        self.fill_forward(items);
        if self.cursor > self.view_end {
            self.view_end = self.cursor;
            self.fill_backward(items);
        }
    }

    fn fill_forward<T: Measured>(&mut self, items: &[T]) {
        self.view_end = self.view_start;
        let mut used = 0;
        for (idx, item) in items.iter().enumerate().skip(self.view_start) {
            used += item.block_height() + 1;
            if used > self.window {
                break;
            }
            self.view_end = idx;
        }
    }

    fn fill_backward<T: Measured>(&mut self, items: &[T]) {
        let mut used = 0;
        let mut idx = self.view_end.min(items.len().saturating_sub(1));
        loop {
            used += items.get(idx).map_or(0, Measured::block_height) + 1;
            if used > self.window {
                self.view_start = (idx + 1).min(self.view_end);
                return;
            }
            if idx == 0 {
                self.view_start = 0;
                return;
            }
            idx -= 1;
        }
    }
}

fn window_for(terminal_height: u16) -> usize {
    usize::from(terminal_height).saturating_sub(CHROME_LINES)
}
