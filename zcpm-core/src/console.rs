//! Console I/O abstraction.
//!
//! The `Console` trait carries raw bytes between the BDOS/BIOS console
//! functions and whatever terminal the embedder provides. Translation
//! (LF to CR, ^C accounting, echo during line input) happens in the
//! dispatcher, not here, so a backend only moves bytes.

use std::collections::VecDeque;

/// CP/M's end-of-file byte, returned by blocking reads at end of input.
pub const CPM_EOF: u8 = 0x1A;

/// Byte-level console backend.
pub trait Console {
    /// Write one byte to the console output.
    fn write(&mut self, ch: u8);

    /// True if a byte can be read without blocking.
    fn has_input(&mut self) -> bool;

    /// Non-blocking read.
    fn poll_input(&mut self) -> Option<u8>;

    /// Blocking read. Returns `CPM_EOF` once input is exhausted.
    fn read_input(&mut self) -> u8;
}

/// In-memory console for tests and embedding: output is captured, input
/// comes from a queue.
#[derive(Default)]
pub struct HeadlessConsole {
    output: Vec<u8>,
    input: VecDeque<u8>,
}

impl HeadlessConsole {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with pre-queued input.
    pub fn with_input(input: &[u8]) -> Self {
        Self {
            output: Vec::new(),
            input: input.iter().copied().collect(),
        }
    }

    /// Queue more input bytes.
    pub fn queue_input(&mut self, input: &[u8]) {
        self.input.extend(input.iter().copied());
    }

    /// All output so far.
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    /// Output as a string (lossy).
    pub fn output_string(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }

    pub fn clear_output(&mut self) {
        self.output.clear();
    }
}

impl Console for HeadlessConsole {
    fn write(&mut self, ch: u8) {
        self.output.push(ch);
    }

    fn has_input(&mut self) -> bool {
        !self.input.is_empty()
    }

    fn poll_input(&mut self) -> Option<u8> {
        self.input.pop_front()
    }

    fn read_input(&mut self) -> u8 {
        self.input.pop_front().unwrap_or(CPM_EOF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_output() {
        let mut console = HeadlessConsole::new();
        console.write(b'H');
        console.write(b'i');
        assert_eq!(console.output_string(), "Hi");
    }

    #[test]
    fn queued_input_then_eof() {
        let mut console = HeadlessConsole::with_input(b"AB");
        assert!(console.has_input());
        assert_eq!(console.read_input(), b'A');
        assert_eq!(console.poll_input(), Some(b'B'));
        assert!(!console.has_input());
        assert_eq!(console.poll_input(), None);
        assert_eq!(console.read_input(), CPM_EOF);
    }
}
