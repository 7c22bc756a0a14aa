/// A byte offset range into a text model file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Span {
    pub start: u32,
    pub end: u32,
}

impl Span {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn dummy() -> Self {
        Self { start: 0, end: 0 }
    }

    /// Span covering `line` given the byte offset where it starts.
    pub fn of_line(line_start: usize, line: &str) -> Self {
        Self {
            start: line_start as u32,
            end: (line_start + line.len()) as u32,
        }
    }

    pub fn is_dummy(&self) -> bool {
        self.start == 0 && self.end == 0
    }
}
