//! Terminal console backends.
//!
//! On a TTY the emulator runs with the terminal in raw mode and reads
//! keys through crossterm events, so ^C reaches the guest instead of
//! killing the process. When stdin is a pipe, bytes are read directly
//! and end-of-input reads as ^Z.

use std::io::{self, Read, Write};
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

use zcpm_core::console::{Console, CPM_EOF};

/// Console over the process's stdin/stdout.
pub struct CliConsole {
    /// True when stdin is a TTY and key events are available.
    raw_tty: bool,
    stdin: io::Stdin,
    pending: Option<u8>,
    eof: bool,
}

impl CliConsole {
    pub fn new(raw_tty: bool) -> Self {
        Self {
            raw_tty,
            stdin: io::stdin(),
            pending: None,
            eof: false,
        }
    }

    /// Reduce a crossterm key event to the single byte a CP/M console
    /// delivers. Ctrl-letter chords become ASCII control codes by masking
    /// (so ^C arrives as 0x03 for the interrupt counter and ^Z as 0x1A),
    /// backspace and delete both read as DEL, and keys with no byte
    /// representation are dropped.
    fn key_byte(event: &KeyEvent) -> Option<u8> {
        if event.kind == KeyEventKind::Release {
            return None;
        }
        let ctrl = event.modifiers.contains(KeyModifiers::CONTROL);
        match event.code {
            KeyCode::Char(c) if ctrl && c.is_ascii_alphabetic() => {
                Some(c.to_ascii_uppercase() as u8 & 0x1F)
            }
            KeyCode::Char(c) if c.is_ascii() => Some(c as u8),
            KeyCode::Enter => Some(b'\r'),
            KeyCode::Backspace | KeyCode::Delete => Some(0x7F),
            KeyCode::Tab => Some(b'\t'),
            KeyCode::Esc => Some(0x1B),
            _ => None,
        }
    }

    /// Drain events until a translatable key arrives or the poll window
    /// closes. `None` wait means a single non-blocking check.
    fn poll_tty(&mut self, wait: Option<Duration>) -> Option<u8> {
        loop {
            let window = wait.unwrap_or(Duration::ZERO);
            if !event::poll(window).unwrap_or(false) {
                return None;
            }
            if let Ok(Event::Key(key)) = event::read() {
                if let Some(ch) = Self::key_byte(&key) {
                    return Some(ch);
                }
            }
        }
    }

    fn read_pipe_byte(&mut self) -> Option<u8> {
        if self.eof {
            return None;
        }
        let mut buf = [0u8; 1];
        match self.stdin.read(&mut buf) {
            Ok(1) => Some(buf[0]),
            _ => {
                self.eof = true;
                None
            }
        }
    }
}

impl Console for CliConsole {
    fn write(&mut self, ch: u8) {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        let _ = handle.write_all(&[ch]);
        let _ = handle.flush();
    }

    fn has_input(&mut self) -> bool {
        if self.pending.is_some() {
            return true;
        }
        if self.raw_tty {
            if let Some(ch) = self.poll_tty(None) {
                self.pending = Some(ch);
                return true;
            }
            false
        } else {
            // Piped input counts as ready until it runs dry.
            if self.eof {
                return false;
            }
            match self.read_pipe_byte() {
                Some(ch) => {
                    self.pending = Some(ch);
                    true
                }
                None => false,
            }
        }
    }

    fn poll_input(&mut self) -> Option<u8> {
        if let Some(ch) = self.pending.take() {
            return Some(ch);
        }
        if self.raw_tty {
            self.poll_tty(None)
        } else {
            self.read_pipe_byte()
        }
    }

    fn read_input(&mut self) -> u8 {
        if let Some(ch) = self.pending.take() {
            return ch;
        }
        if self.raw_tty {
            loop {
                if let Some(ch) = self.poll_tty(Some(Duration::from_millis(100))) {
                    return ch;
                }
            }
        } else {
            self.read_pipe_byte().unwrap_or(CPM_EOF)
        }
    }
}
