//! BIOS jump-table layout and the disk-stub policy.
//!
//! The BIOS is a 17-entry table of 3-byte jumps at a fixed high base.
//! Each entry jumps to its own sentinel address; the driver recognizes a
//! fetch from the sentinel range and dispatches by offset. The table is
//! real, executable memory, so guest code that inspects or copies it sees
//! valid instructions.

/// Number of BIOS entry points.
pub const BIOS_ENTRIES: u16 = 17;

/// Byte offsets of the BIOS functions from the table base.
pub mod offset {
    pub const BOOT: u16 = 0;
    pub const WBOOT: u16 = 3;
    pub const CONST: u16 = 6;
    pub const CONIN: u16 = 9;
    pub const CONOUT: u16 = 12;
    pub const LIST: u16 = 15;
    pub const PUNCH: u16 = 18;
    pub const READER: u16 = 21;
    pub const HOME: u16 = 24;
    pub const SELDSK: u16 = 27;
    pub const SETTRK: u16 = 30;
    pub const SETSEC: u16 = 33;
    pub const SETDMA: u16 = 36;
    pub const READ: u16 = 39;
    pub const WRITE: u16 = 42;
    pub const LISTST: u16 = 45;
    pub const SECTRAN: u16 = 48;
}

/// How the disk-primitive stubs (HOME, SETTRK, SETSEC, READ, WRITE,
/// SECTRAN and SETDMA at the BIOS level) respond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiskMode {
    /// Pretend the operation succeeded (A=0).
    #[default]
    Ok,
    /// Report failure to the caller (A=1).
    Fail,
    /// Print a diagnostic and terminate the emulator.
    Error,
}

impl DiskMode {
    /// Parse the `CPM_BIOS_DISK` setting.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "ok" => Some(DiskMode::Ok),
            "fail" => Some(DiskMode::Fail),
            "error" => Some(DiskMode::Error),
            _ => None,
        }
    }
}
