//! Error types for the emulator core.
//!
//! Guest-visible failures (file not found, EOF, seek errors) never surface
//! here: they are reported to the program through the A register per the
//! CP/M conventions. `CpmError` is for the conditions that stop emulation.

use thiserror::Error;

use crate::cpu::CpuFault;

/// Errors that end a run or prevent one from starting.
#[derive(Error, Debug)]
pub enum CpmError {
    #[error("program not found: {0}")]
    ProgramNotFound(String),

    #[error("program too large: {size} bytes exceed the TPA ({limit} bytes)")]
    ProgramTooLarge { size: usize, limit: usize },

    #[error("cpu fault: {0}")]
    Cpu(CpuFault),

    #[error("BIOS disk function at offset {offset} called with disk mode 'error'")]
    BiosDisk { offset: u16 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for emulator operations.
pub type CpmResult<T> = Result<T, CpmError>;
