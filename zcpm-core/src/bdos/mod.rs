//! BDOS function numbers and the CP/M memory layout.

pub mod fcb;

pub use fcb::Fcb;

/// CP/M 2.2 BDOS functions dispatched by the C register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BdosFunction {
    /// 0: terminate the program
    SystemReset = 0,
    /// 1: blocking console input
    ConsoleInput = 1,
    /// 2: console output
    ConsoleOutput = 2,
    /// 3: reader (auxiliary) input
    ReaderInput = 3,
    /// 4: punch (auxiliary) output
    PunchOutput = 4,
    /// 5: list (printer) output
    ListOutput = 5,
    /// 6: direct console I/O
    DirectConsoleIo = 6,
    /// 7: get IOBYTE
    GetIoByte = 7,
    /// 8: set IOBYTE
    SetIoByte = 8,
    /// 9: print $-terminated string
    PrintString = 9,
    /// 10: read console buffer with line editing
    ReadConsoleBuffer = 10,
    /// 11: console status
    ConsoleStatus = 11,
    /// 12: return version number
    ReturnVersion = 12,
    /// 13: reset disk system
    ResetDiskSystem = 13,
    /// 14: select disk
    SelectDisk = 14,
    /// 15: open file
    OpenFile = 15,
    /// 16: close file
    CloseFile = 16,
    /// 17: search for first
    SearchFirst = 17,
    /// 18: search for next
    SearchNext = 18,
    /// 19: delete file
    DeleteFile = 19,
    /// 20: read sequential
    ReadSequential = 20,
    /// 21: write sequential
    WriteSequential = 21,
    /// 22: make file
    MakeFile = 22,
    /// 23: rename file
    RenameFile = 23,
    /// 24: return login vector
    ReturnLoginVector = 24,
    /// 25: return current disk
    ReturnCurrentDisk = 25,
    /// 26: set DMA address
    SetDmaAddress = 26,
    /// 27: get allocation vector address
    GetAllocationVector = 27,
    /// 28: write protect disk
    WriteProtectDisk = 28,
    /// 29: get read-only vector
    GetReadOnlyVector = 29,
    /// 30: set file attributes
    SetFileAttributes = 30,
    /// 31: get disk parameter block address
    GetDiskParameters = 31,
    /// 32: get/set user number
    UserCode = 32,
    /// 33: read random
    ReadRandom = 33,
    /// 34: write random
    WriteRandom = 34,
    /// 35: compute file size
    ComputeFileSize = 35,
    /// 36: set random record
    SetRandomRecord = 36,
    /// 37: reset drive
    ResetDrive = 37,
    /// 38: access drive (stub)
    AccessDrive = 38,
    /// 39: free drive (stub)
    FreeDrive = 39,
    /// 40: write random with zero fill
    WriteRandomZeroFill = 40,
}

impl TryFrom<u8> for BdosFunction {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use BdosFunction::*;
        Ok(match value {
            0 => SystemReset,
            1 => ConsoleInput,
            2 => ConsoleOutput,
            3 => ReaderInput,
            4 => PunchOutput,
            5 => ListOutput,
            6 => DirectConsoleIo,
            7 => GetIoByte,
            8 => SetIoByte,
            9 => PrintString,
            10 => ReadConsoleBuffer,
            11 => ConsoleStatus,
            12 => ReturnVersion,
            13 => ResetDiskSystem,
            14 => SelectDisk,
            15 => OpenFile,
            16 => CloseFile,
            17 => SearchFirst,
            18 => SearchNext,
            19 => DeleteFile,
            20 => ReadSequential,
            21 => WriteSequential,
            22 => MakeFile,
            23 => RenameFile,
            24 => ReturnLoginVector,
            25 => ReturnCurrentDisk,
            26 => SetDmaAddress,
            27 => GetAllocationVector,
            28 => WriteProtectDisk,
            29 => GetReadOnlyVector,
            30 => SetFileAttributes,
            31 => GetDiskParameters,
            32 => UserCode,
            33 => ReadRandom,
            34 => WriteRandom,
            35 => ComputeFileSize,
            36 => SetRandomRecord,
            37 => ResetDrive,
            38 => AccessDrive,
            39 => FreeDrive,
            40 => WriteRandomZeroFill,
            other => return Err(other),
        })
    }
}

/// CP/M record size, always 128 bytes.
pub const RECORD_SIZE: usize = 128;

/// Fixed addresses in the 64 KiB image.
pub mod addr {
    /// Transient Program Area, where .COM files load.
    pub const TPA: u16 = 0x0100;
    /// IOBYTE.
    pub const IOBYTE: u16 = 0x0003;
    /// Current drive/user byte.
    pub const DRV_USER: u16 = 0x0004;
    /// `JP BDOS_BASE` lives here; programs CALL 0x0005.
    pub const BDOS_ENTRY: u16 = 0x0005;
    /// Default FCB #1.
    pub const FCB1: u16 = 0x005C;
    /// Default FCB #2.
    pub const FCB2: u16 = 0x006C;
    /// Default DMA buffer; also holds the command tail at startup.
    pub const DEFAULT_DMA: u16 = 0x0080;
    /// Top of the TPA: loading a program may not run into the CCP base.
    pub const CCP_BASE: u16 = 0xFC00;
    /// Executing here triggers BDOS dispatch by the C register.
    pub const BDOS_BASE: u16 = 0xFD00;
    /// The 17-entry BIOS jump table.
    pub const BIOS_BASE: u16 = 0xFE00;
    /// Each BIOS jump lands on a distinct sentinel in this range.
    pub const BIOS_SENTINEL: u16 = 0xFF00;
    /// Disk Parameter Header (16 bytes).
    pub const DPH: u16 = 0xFAE0;
    /// Disk Parameter Block (15 bytes).
    pub const DPB: u16 = 0xFAF0;
    /// Directory buffer (128 bytes).
    pub const DIRBUF: u16 = 0xFB00;
    /// Allocation vector.
    pub const ALV: u16 = 0xFB80;
    /// Check vector (referenced by the DPH, never used).
    pub const CSV: u16 = 0xFBC0;
    /// Initial stack pointer.
    pub const INITIAL_SP: u16 = 0xFFF0;
}
