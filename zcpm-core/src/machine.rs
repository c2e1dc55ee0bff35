//! The emulator driver: memory image setup, the trap-before-fetch run
//! loop, and the BDOS and BIOS dispatchers.
//!
//! Before every instruction the driver inspects PC. A fetch from the BDOS
//! base or a BIOS sentinel never executes: the corresponding handler runs
//! against registers and memory, then the driver pops the return address
//! off the guest stack to simulate the RET the real BDOS would have
//! executed. Everything else goes to the CPU interpreter one instruction
//! at a time, with timer interrupts delivered at the boundaries.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::bdos::fcb::FCB_SIZE;
use crate::bdos::{addr, BdosFunction, Fcb, RECORD_SIZE};
use crate::bios::{offset as bios, DiskMode, BIOS_ENTRIES};
use crate::console::{Console, CPM_EOF};
use crate::cpu::registers::CpuMode;
use crate::cpu::{Cpu, CpuFault, FloatingBus};
use crate::error::{CpmError, CpmResult};
use crate::files::{host_to_cpm_83, match_fcb_pattern, OpenFile, Resolver};
use crate::host::{FileKind, Host};
use crate::memory::Memory;
use crate::{ExitInfo, ExitReason};

/// How many consecutive ^C bytes force an orderly exit.
const CTRL_C_EXIT_COUNT: u32 = 5;

/// Default ceiling on executed instructions, a runaway guard.
const DEFAULT_INSTRUCTION_LIMIT: u64 = 9_000_000_000;

/// One hit from Search First: the canonical 8.3 fields and the host path
/// behind them.
struct SearchEntry {
    name: [u8; 8],
    ext: [u8; 3],
    path: PathBuf,
}

/// A CP/M 2.2 machine: CPU, 64 KiB image, console, host probes, and all
/// BDOS/BIOS state.
pub struct Emulator<C: Console, H: Host> {
    cpu: Cpu,
    mem: Memory,
    console: C,
    host: H,
    pub resolver: Resolver,
    /// Open files keyed by FCB address.
    open_files: HashMap<u16, OpenFile>,
    search_results: Vec<SearchEntry>,
    search_index: usize,
    dma: u16,
    current_drive: u8,
    current_user: u8,
    ctrl_c_run: u32,
    pending_exit: Option<ExitReason>,
    printer: Option<File>,
    aux_in: Option<File>,
    aux_out: Option<File>,
    /// Response policy for the BIOS disk-primitive stubs.
    pub disk_mode: DiskMode,
    /// BDOS function numbers to narrate on stderr.
    pub debug_bdos: HashSet<u8>,
    /// BIOS offsets to narrate on stderr.
    pub debug_bios: HashSet<u16>,
    /// Fire a periodic RST every this many cycles; 0 disables.
    pub int_cycles: u64,
    /// Which RST (0-7) the periodic interrupt uses.
    pub int_rst: u8,
    pub instruction_limit: u64,
    /// Report progress every this many instructions; 0 disables.
    pub progress_interval: u64,
    instructions: u64,
}

impl<C: Console, H: Host> Emulator<C, H> {
    pub fn new(console: C, host: H, mode: CpuMode) -> Self {
        let mut emu = Self {
            cpu: Cpu::new(mode),
            mem: Memory::new(),
            console,
            host,
            resolver: Resolver::new(),
            open_files: HashMap::new(),
            search_results: Vec::new(),
            search_index: 0,
            dma: addr::DEFAULT_DMA,
            current_drive: 0,
            current_user: 0,
            ctrl_c_run: 0,
            pending_exit: None,
            printer: None,
            aux_in: None,
            aux_out: None,
            disk_mode: DiskMode::Ok,
            debug_bdos: HashSet::new(),
            debug_bios: HashSet::new(),
            int_cycles: 0,
            int_rst: 7,
            instruction_limit: DEFAULT_INSTRUCTION_LIMIT,
            progress_interval: 0,
            instructions: 0,
        };
        emu.setup_memory();
        emu
    }

    /// Lay down the CP/M system image: vectors, jump tables, sentinels,
    /// RST slots, and the simulated drive's parameter structures.
    fn setup_memory(&mut self) {
        // JP WBOOT at 0x0000.
        self.mem.write(0x0000, 0xC3);
        self.mem
            .write_word(0x0001, addr::BIOS_BASE + bios::WBOOT);

        self.mem.write(addr::IOBYTE, 0x00);
        self.mem.write(addr::DRV_USER, 0x00);

        // JP BDOS at 0x0005; the BDOS base itself holds a RET so code
        // that inspects it sees a plausible instruction.
        self.mem.write(addr::BDOS_ENTRY, 0xC3);
        self.mem.write_word(addr::BDOS_ENTRY + 1, addr::BDOS_BASE);
        self.mem.write(addr::BDOS_BASE, 0xC9);

        // BIOS jump table: 17 entries of JP <sentinel>. The sentinels get
        // a RET each, so stray reads and falls-through stay well formed.
        for i in 0..BIOS_ENTRIES {
            let entry = addr::BIOS_BASE + i * 3;
            self.mem.write(entry, 0xC3);
            self.mem.write_word(entry + 1, addr::BIOS_SENTINEL + i);
            self.mem.write(addr::BIOS_SENTINEL + i, 0xC9);
        }

        // RST vectors 1-7 each hold a RET.
        for i in 1u16..8 {
            self.mem.write(i * 8, 0xC9);
        }

        // Disk Parameter Header: scratch words, then DIRBUF/DPB/CSV/ALV.
        self.mem.fill(addr::DPH, 8, 0);
        self.mem.write_word(addr::DPH + 8, addr::DIRBUF);
        self.mem.write_word(addr::DPH + 10, addr::DPB);
        self.mem.write_word(addr::DPH + 12, addr::CSV);
        self.mem.write_word(addr::DPH + 14, addr::ALV);

        // Disk Parameter Block for a simulated 8 MB drive: 128 sectors
        // per track, 2 KB blocks, 4096 blocks, 1024 directory entries.
        let dpb: [u8; 15] = [
            128, 0, // SPT
            4,   // BSH
            15,  // BLM
            0,   // EXM
            0xFF, 0x0F, // DSM
            0xFF, 0x03, // DRM
            0xFF, 0x00, // AL0/AL1
            0x00, 0x00, // CKS
            0x00, 0x00, // OFF
        ];
        self.mem.load_at(addr::DPB, &dpb);

        // Directory buffer reads as empty entries; allocation vector
        // reads as all-free.
        self.mem.fill(addr::DIRBUF, RECORD_SIZE, 0xE5);
        self.mem.fill(addr::ALV, 64, 0x00);

        self.cpu.regs.sp.set(addr::INITIAL_SP);
        self.cpu.regs.pc.set(addr::TPA);
        self.dma = addr::DEFAULT_DMA;
    }

    // ---- accessors ----

    pub fn console(&self) -> &C {
        &self.console
    }

    pub fn console_mut(&mut self) -> &mut C {
        &mut self.console
    }

    pub fn memory(&self) -> &Memory {
        &self.mem
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.mem
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut Cpu {
        &mut self.cpu
    }

    // ---- setup ----

    /// Load a .COM image from the host filesystem into the TPA.
    pub fn load_program(&mut self, path: &Path) -> CpmResult<()> {
        let mut file = File::open(path)
            .map_err(|_| CpmError::ProgramNotFound(path.display().to_string()))?;
        let mut image = Vec::new();
        file.read_to_end(&mut image)?;
        info!("loaded {} bytes from {}", image.len(), path.display());
        self.load_image(&image)
    }

    /// Load a .COM image from bytes at 0x0100 and point PC there.
    pub fn load_image(&mut self, image: &[u8]) -> CpmResult<()> {
        let limit = (addr::CCP_BASE - addr::TPA) as usize;
        if image.len() > limit {
            return Err(CpmError::ProgramTooLarge { size: image.len(), limit });
        }
        self.mem.load_at(addr::TPA, image);
        self.cpu.regs.pc.set(addr::TPA);
        Ok(())
    }

    /// Build the command tail at 0x0080 (length byte, then a leading
    /// space before each uppercased argument, long names squeezed to 8.3)
    /// and parse the first two arguments into the default FCBs.
    pub fn set_command_tail(&mut self, args: &[String]) {
        // Default FCBs first: FCB2 only owns 16 bytes before the DMA
        // buffer begins, so its parse must not spill into the tail.
        let mut fcb_buf = [0u8; FCB_SIZE];
        Fcb::new(&mut fcb_buf).blank();
        self.mem.load_at(addr::FCB1, &fcb_buf);
        self.mem.load_at(addr::FCB2, &fcb_buf[..16]);
        if let Some(arg) = args.first() {
            let mut buf = [0u8; FCB_SIZE];
            Fcb::new(&mut buf).parse_filename(Self::tail_name(arg));
            self.mem.load_at(addr::FCB1, &buf);
        }
        if let Some(arg) = args.get(1) {
            let mut buf = [0u8; FCB_SIZE];
            Fcb::new(&mut buf).parse_filename(Self::tail_name(arg));
            self.mem.load_at(addr::FCB2, &buf[..16]);
        }

        let mut tail = String::new();
        for arg in args {
            tail.push(' ');
            let upper = Self::tail_name(arg).to_uppercase();
            match upper.find('.') {
                Some(dot) if dot > 8 => {
                    tail.push_str(&upper[..8]);
                    tail.push_str(&upper[dot..]);
                }
                _ => tail.push_str(&upper),
            }
        }
        let bytes = tail.as_bytes();
        let len = bytes.len().min(127);
        self.mem.write(addr::DEFAULT_DMA, len as u8);
        self.mem.load_at(addr::DEFAULT_DMA + 1, &bytes[..len]);
    }

    fn tail_name(arg: &str) -> &str {
        Path::new(arg)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(arg)
    }

    /// Route LST: output to a host file.
    pub fn set_printer_file(&mut self, path: &Path) {
        match File::create(path) {
            Ok(file) => self.printer = Some(file),
            Err(err) => warn!("cannot open printer file {}: {err}", path.display()),
        }
    }

    /// Route RDR: input from a host file.
    pub fn set_aux_input_file(&mut self, path: &Path) {
        match File::open(path) {
            Ok(file) => self.aux_in = Some(file),
            Err(err) => warn!("cannot open aux input file {}: {err}", path.display()),
        }
    }

    /// Route PUN: output to a host file.
    pub fn set_aux_output_file(&mut self, path: &Path) {
        match File::create(path) {
            Ok(file) => self.aux_out = Some(file),
            Err(err) => warn!("cannot open aux output file {}: {err}", path.display()),
        }
    }

    // ---- the run loop ----

    pub fn run(&mut self) -> CpmResult<ExitInfo> {
        let mut io = FloatingBus;
        let mut next_tick = self.int_cycles;
        let mut last_report = 0u64;

        loop {
            let pc = self.cpu.regs.pc.get();

            if pc == 0x0000 {
                info!("program exit via jp 0");
                return Ok(self.finish(ExitReason::WarmBoot));
            }

            if pc == addr::BDOS_BASE {
                if let Some(reason) = self.handle_bdos() {
                    return Ok(self.finish(reason));
                }
                let ret = self.cpu.pop_word(&self.mem);
                self.cpu.regs.pc.set(ret);
                continue;
            }

            if (addr::BIOS_SENTINEL..addr::BIOS_SENTINEL + BIOS_ENTRIES).contains(&pc) {
                let offset = (pc - addr::BIOS_SENTINEL) * 3;
                match self.handle_bios(offset)? {
                    Some(reason) => return Ok(self.finish(reason)),
                    None => {
                        let ret = self.cpu.pop_word(&self.mem);
                        self.cpu.regs.pc.set(ret);
                        continue;
                    }
                }
            }

            if self.int_cycles > 0 && self.cpu.cycles >= next_tick {
                next_tick = self.cpu.cycles + self.int_cycles;
                self.cpu.request_rst(self.int_rst);
            }
            self.cpu.check_interrupts(&mut self.mem);

            match self.cpu.step(&mut self.mem, &mut io) {
                Ok(()) => {}
                Err(CpuFault::Halted { pc }) => {
                    self.dump_registers("halt");
                    let mut info = self.finish(ExitReason::Halt);
                    info.pc = pc;
                    return Ok(info);
                }
                Err(fault) => {
                    self.close_all_files();
                    return Err(CpmError::Cpu(fault));
                }
            }
            self.instructions += 1;

            if self.progress_interval > 0
                && self.instructions - last_report >= self.progress_interval
            {
                info!("progress: {}M instructions", self.instructions / 1_000_000);
                last_report = self.instructions;
            }

            if self.instructions >= self.instruction_limit {
                warn!(
                    "instruction limit reached at pc {:#06x}",
                    self.cpu.regs.pc.get()
                );
                return Ok(self.finish(ExitReason::InstructionLimit));
            }
        }
    }

    fn finish(&mut self, reason: ExitReason) -> ExitInfo {
        self.close_all_files();
        ExitInfo {
            reason,
            pc: self.cpu.regs.pc.get(),
            cycles: self.cpu.cycles,
            instructions: self.instructions,
        }
    }

    fn close_all_files(&mut self) {
        for (_, mut open) in self.open_files.drain() {
            let _ = open.flush_pending();
        }
    }

    /// Register dump on the host error channel, as HLT demands.
    fn dump_registers(&self, label: &str) {
        let regs = &self.cpu.regs;
        let flags = regs.flags();
        let mut bits = String::new();
        for (mask, ch) in [
            (0x80u8, 'S'),
            (0x40, 'Z'),
            (0x20, 'Y'),
            (0x10, 'H'),
            (0x08, 'X'),
            (0x04, 'P'),
            (0x02, 'N'),
            (0x01, 'C'),
        ] {
            bits.push(if flags & mask != 0 { ch } else { '-' });
        }
        eprintln!(
            "{label}: PC={:04X} AF={:02X}{:02X} BC={:04X} DE={:04X} HL={:04X} SP={:04X} IX={:04X} IY={:04X} [{bits}]",
            regs.pc.get(),
            regs.a(),
            flags,
            regs.bc.get(),
            regs.de.get(),
            regs.hl.get(),
            regs.sp.get(),
            regs.ix.get(),
            regs.iy.get(),
        );
    }

    // ---- console plumbing ----

    fn track_ctrl_c(&mut self, ch: u8) {
        if ch == 0x03 {
            self.ctrl_c_run += 1;
            if self.ctrl_c_run >= CTRL_C_EXIT_COUNT {
                warn!("exiting after {CTRL_C_EXIT_COUNT} consecutive ^C");
                self.pending_exit = Some(ExitReason::ConsoleInterrupt);
            }
        } else {
            self.ctrl_c_run = 0;
        }
    }

    /// Blocking console read with the CP/M translations applied.
    fn console_input_blocking(&mut self) -> u8 {
        let ch = self.console.read_input();
        self.track_ctrl_c(ch);
        if ch == b'\n' {
            b'\r'
        } else {
            ch & 0x7F
        }
    }

    fn printer_output(&mut self, ch: u8) {
        use std::io::Write as _;
        if let Some(printer) = &mut self.printer {
            let _ = printer.write_all(&[ch & 0x7F]);
            let _ = printer.flush();
        } else {
            for b in b"[PRINTER] " {
                self.console.write(*b);
            }
            self.console.write(ch & 0x7F);
        }
    }

    fn punch_output(&mut self, ch: u8, prefix_fallback: bool) {
        use std::io::Write as _;
        if let Some(aux) = &mut self.aux_out {
            let _ = aux.write_all(&[ch & 0x7F]);
            let _ = aux.flush();
        } else if prefix_fallback {
            for b in b"[PUNCH] " {
                self.console.write(*b);
            }
            self.console.write(ch & 0x7F);
        }
    }

    fn reader_input(&mut self) -> u8 {
        if let Some(aux) = &mut self.aux_in {
            let mut buf = [0u8; 1];
            match aux.read(&mut buf) {
                Ok(1) => buf[0] & 0x7F,
                _ => CPM_EOF,
            }
        } else {
            CPM_EOF
        }
    }

    // ---- return conventions ----

    fn ret_a(&mut self, value: u8) {
        self.cpu.regs.set_a(value);
    }

    /// 16-bit return: HL, with A=L and B=H mirrored.
    fn ret_hl(&mut self, value: u16) {
        self.cpu.regs.hl.set(value);
        self.cpu.regs.set_a(value as u8);
        self.cpu.regs.bc.set_high((value >> 8) as u8);
    }

    // ---- BDOS dispatch ----

    fn handle_bdos(&mut self) -> Option<ExitReason> {
        let func = self.cpu.regs.bc.low();
        let e = self.cpu.regs.de.low();
        let de = self.cpu.regs.de.get();

        if self.debug_bdos.contains(&func) {
            eprintln!("[bdos] function {func} (DE={de:#06X})");
        }
        debug!("bdos {func} de={de:#06x}");

        match BdosFunction::try_from(func) {
            Ok(BdosFunction::SystemReset) => {
                info!("program exit via bdos 0");
                return Some(ExitReason::WarmBoot);
            }
            Ok(function) => self.dispatch_bdos(function, e, de),
            Err(unknown) => {
                warn!("unimplemented BDOS function {unknown}");
                self.ret_a(0xFF);
            }
        }

        self.pending_exit.take()
    }

    fn dispatch_bdos(&mut self, function: BdosFunction, e: u8, de: u16) {
        use BdosFunction::*;
        match function {
            SystemReset => unreachable!("handled by caller"),

            ConsoleInput => {
                let ch = self.console_input_blocking();
                self.ret_a(ch);
            }

            ConsoleOutput => {
                self.console.write(e & 0x7F);
            }

            ReaderInput => {
                let ch = self.reader_input();
                self.ret_a(ch);
            }

            PunchOutput => {
                // No configured device: the byte is discarded.
                self.punch_output(e, false);
            }

            ListOutput => {
                self.printer_output(e);
            }

            DirectConsoleIo => match e {
                0xFF => {
                    if self.console.has_input() {
                        let ch = self.console.poll_input().unwrap_or(0);
                        self.track_ctrl_c(ch);
                        let ch = if ch == b'\n' { b'\r' } else { ch & 0x7F };
                        self.ret_a(ch);
                    } else {
                        self.ret_a(0);
                    }
                }
                0xFE => {
                    let ready = if self.console.has_input() { 0xFF } else { 0 };
                    self.ret_a(ready);
                }
                _ => self.console.write(e & 0x7F),
            },

            GetIoByte => {
                let value = self.mem.read(addr::IOBYTE);
                self.ret_a(value);
            }

            SetIoByte => {
                self.mem.write(addr::IOBYTE, e);
            }

            PrintString => {
                let mut ptr = de;
                loop {
                    let ch = self.mem.read(ptr);
                    if ch == b'$' {
                        break;
                    }
                    self.console.write(ch & 0x7F);
                    ptr = ptr.wrapping_add(1);
                }
            }

            ReadConsoleBuffer => {
                self.bdos_read_console_buffer(de);
            }

            ConsoleStatus => {
                let ready = if self.console.has_input() { 0xFF } else { 0 };
                self.ret_a(ready);
            }

            ReturnVersion => {
                self.ret_hl(0x0022);
            }

            ResetDiskSystem => {
                self.close_all_files();
                self.current_drive = 0;
                self.current_user = 0;
                self.mem.write(addr::DRV_USER, 0);
                self.ret_a(0);
            }

            SelectDisk => {
                self.current_drive = e & 0x0F;
                self.mem.write(addr::DRV_USER, self.current_drive);
                self.ret_a(0);
            }

            OpenFile => self.bdos_open_file(de),
            CloseFile => self.bdos_close_file(de),
            SearchFirst => self.bdos_search_first(de),
            SearchNext => self.bdos_search_next(),
            DeleteFile => self.bdos_delete_file(de),
            ReadSequential => self.bdos_read_sequential(de),
            WriteSequential => self.bdos_write_sequential(de),
            MakeFile => self.bdos_make_file(de),
            RenameFile => self.bdos_rename_file(de),

            ReturnLoginVector => {
                self.ret_hl(0x0001);
            }

            ReturnCurrentDisk => {
                let drive = self.current_drive;
                self.ret_a(drive);
            }

            SetDmaAddress => {
                self.dma = de;
            }

            GetAllocationVector => {
                self.ret_hl(addr::ALV);
            }

            WriteProtectDisk => {
                self.ret_a(0);
            }

            GetReadOnlyVector => {
                self.ret_hl(0);
            }

            SetFileAttributes => {
                self.ret_a(0);
            }

            GetDiskParameters => {
                self.ret_hl(addr::DPB);
            }

            UserCode => {
                if e == 0xFF {
                    let user = self.current_user;
                    self.ret_a(user);
                } else {
                    self.current_user = e & 0x0F;
                }
            }

            ReadRandom => self.bdos_read_random(de),
            WriteRandom | WriteRandomZeroFill => self.bdos_write_random(de),
            ComputeFileSize => self.bdos_compute_file_size(de),
            SetRandomRecord => self.bdos_set_random_record(de),

            ResetDrive => {
                self.close_all_files();
                self.ret_a(0);
            }

            AccessDrive => {
                self.ret_a(0);
            }

            FreeDrive => {}
        }
    }

    /// BDOS 10: line-edited console input into `buf[DE]`.
    fn bdos_read_console_buffer(&mut self, buf_addr: u16) {
        let max_len = self.mem.read(buf_addr) as usize;
        if max_len == 0 {
            self.mem.write(buf_addr.wrapping_add(1), 0);
            self.ret_a(0);
            return;
        }

        let mut count = 0usize;
        while count < max_len {
            let ch = self.console.read_input();
            self.track_ctrl_c(ch);
            if self.pending_exit.is_some() {
                break;
            }
            match ch {
                b'\r' | b'\n' => {
                    self.console.write(b'\r');
                    self.console.write(b'\n');
                    break;
                }
                0x08 | 0x7F => {
                    if count > 0 {
                        count -= 1;
                        self.console.write(0x08);
                        self.console.write(b' ');
                        self.console.write(0x08);
                    }
                }
                0x15 => {
                    // ^U erases the whole line.
                    while count > 0 {
                        self.console.write(0x08);
                        self.console.write(b' ');
                        self.console.write(0x08);
                        count -= 1;
                    }
                }
                0x03 => {
                    self.mem
                        .write(buf_addr.wrapping_add(2 + count as u16), 0x03);
                    count += 1;
                    self.console.write(b'^');
                    self.console.write(b'C');
                }
                CPM_EOF => break,
                0x20..=0x7E => {
                    self.mem
                        .write(buf_addr.wrapping_add(2 + count as u16), ch);
                    count += 1;
                    self.console.write(ch);
                }
                _ => {}
            }
        }

        self.mem.write(buf_addr.wrapping_add(1), count as u8);
        self.ret_a(0);
    }

    // ---- BDOS file operations ----

    fn fcb_filename(&self, fcb_addr: u16) -> String {
        let mut buf = [0u8; FCB_SIZE];
        let slice = self.mem.slice(fcb_addr, FCB_SIZE);
        buf[..slice.len()].copy_from_slice(slice);
        Fcb::new(&mut buf).filename()
    }

    /// BDOS 15: resolve and open. Clears the extent and reports a full
    /// extent (RC=0x80); the host file cursor is the real position.
    fn bdos_open_file(&mut self, fcb_addr: u16) {
        let filename = self.fcb_filename(fcb_addr);
        let Some(resolved) = self.resolver.resolve(&self.host, &filename) else {
            debug!("open {filename}: not found");
            self.ret_a(0xFF);
            return;
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&resolved.path)
            .or_else(|_| File::open(&resolved.path));
        match file {
            Ok(file) => {
                debug!(
                    "open {filename} -> {} ({:?})",
                    resolved.path.display(),
                    resolved.mode
                );
                let open = OpenFile::new(
                    file,
                    resolved.path,
                    filename,
                    resolved.mode,
                    resolved.eol_convert,
                );
                if let Some(mut stale) = self.open_files.remove(&fcb_addr) {
                    let _ = stale.flush_pending();
                }
                self.open_files.insert(fcb_addr, open);
                self.mem.write(fcb_addr.wrapping_add(12), 0);
                self.mem.write(fcb_addr.wrapping_add(15), 0x80);
                self.ret_a(0);
            }
            Err(err) => {
                debug!("open {filename}: {err}");
                self.ret_a(0xFF);
            }
        }
    }

    /// BDOS 16: flush and close. Idempotent, always succeeds.
    fn bdos_close_file(&mut self, fcb_addr: u16) {
        if let Some(mut open) = self.open_files.remove(&fcb_addr) {
            let _ = open.flush_pending();
            debug!("close {}", open.cpm_name);
        }
        self.ret_a(0);
    }

    /// BDOS 19: resolve and unlink.
    fn bdos_delete_file(&mut self, fcb_addr: u16) {
        let filename = self.fcb_filename(fcb_addr);
        match self.resolver.resolve(&self.host, &filename) {
            Some(resolved) if std::fs::remove_file(&resolved.path).is_ok() => {
                debug!("delete {filename} -> {}", resolved.path.display());
                self.ret_a(0);
            }
            _ => self.ret_a(0xFF),
        }
    }

    /// BDOS 20: read the next 128-byte record to the DMA buffer.
    fn bdos_read_sequential(&mut self, fcb_addr: u16) {
        let dma = self.dma;
        let Some(open) = self.open_files.get_mut(&fcb_addr) else {
            self.ret_a(0xFF);
            return;
        };

        let mut record = [0u8; RECORD_SIZE];
        let status = match open.read_record(&mut record) {
            Ok(0) => 1,
            Ok(filled) => {
                record[filled..].fill(CPM_EOF);
                self.mem.load_at(dma, &record);
                0
            }
            Err(err) => {
                warn!("sequential read failed: {err}");
                0xFF
            }
        };
        let cr = self.mem.read(fcb_addr.wrapping_add(32)).wrapping_add(1);
        self.mem.write(fcb_addr.wrapping_add(32), cr);
        self.ret_a(status);
    }

    /// BDOS 21: write one record from the DMA buffer. An unopened FCB
    /// gets an implicit open first.
    fn bdos_write_sequential(&mut self, fcb_addr: u16) {
        if !self.open_files.contains_key(&fcb_addr) {
            self.bdos_open_file(fcb_addr);
            if !self.open_files.contains_key(&fcb_addr) {
                self.ret_a(0xFF);
                return;
            }
        }

        let mut record = [0u8; RECORD_SIZE];
        let dma_bytes = self.mem.slice(self.dma, RECORD_SIZE);
        record[..dma_bytes.len()].copy_from_slice(dma_bytes);
        let open = self.open_files.get_mut(&fcb_addr).expect("just opened");
        let status = match open.write_record(&record) {
            Ok(written) if written > 0 => 0,
            Ok(_) => 0xFF,
            Err(err) => {
                warn!("sequential write failed: {err}");
                0xFF
            }
        };
        let cr = self.mem.read(fcb_addr.wrapping_add(32)).wrapping_add(1);
        self.mem.write(fcb_addr.wrapping_add(32), cr);
        self.ret_a(status);
    }

    /// BDOS 22: create (truncate) and register as open.
    fn bdos_make_file(&mut self, fcb_addr: u16) {
        let filename = self.fcb_filename(fcb_addr);
        let resolved = self.resolver.resolve_for_create(&filename);
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&resolved.path)
        {
            Ok(file) => {
                debug!("make {filename} -> {}", resolved.path.display());
                let mut open = OpenFile::new(
                    file,
                    resolved.path,
                    filename,
                    resolved.mode,
                    resolved.eol_convert,
                );
                open.write_mode = true;
                if let Some(mut stale) = self.open_files.remove(&fcb_addr) {
                    let _ = stale.flush_pending();
                }
                self.open_files.insert(fcb_addr, open);
                self.mem.write(fcb_addr.wrapping_add(12), 0);
                self.mem.write(fcb_addr.wrapping_add(15), 0);
                self.ret_a(0);
            }
            Err(err) => {
                warn!("make {filename} failed: {err}");
                self.ret_a(0xFF);
            }
        }
    }

    /// BDOS 23: rename. The new name lands in the old file's directory,
    /// lowercased; the resolver learns the new name.
    fn bdos_rename_file(&mut self, fcb_addr: u16) {
        let old_name = self.fcb_filename(fcb_addr);
        let new_name = self.fcb_filename(fcb_addr.wrapping_add(16));
        let Some(resolved) = self.resolver.resolve(&self.host, &old_name) else {
            self.ret_a(0xFF);
            return;
        };

        let mut new_path = resolved
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        new_path.push(new_name.to_ascii_lowercase());

        match std::fs::rename(&resolved.path, &new_path) {
            Ok(()) => {
                debug!("rename {old_name} -> {}", new_path.display());
                self.resolver.add_exact(&new_name, new_path);
                self.ret_a(0);
            }
            Err(err) => {
                warn!("rename {old_name} failed: {err}");
                self.ret_a(0xFF);
            }
        }
    }

    /// BDOS 33: random read, no line-ending conversion.
    fn bdos_read_random(&mut self, fcb_addr: u16) {
        let dma = self.dma;
        let record_num = self.fcb_random_record(fcb_addr);
        let Some(open) = self.open_files.get_mut(&fcb_addr) else {
            self.ret_a(0xFF);
            return;
        };

        let mut record = [0u8; RECORD_SIZE];
        let status = match open.read_random(record_num, &mut record) {
            Ok(0) => 1,
            Ok(filled) => {
                record[filled..].fill(CPM_EOF);
                self.mem.load_at(dma, &record);
                0
            }
            Err(_) => 0xFF,
        };
        self.ret_a(status);
    }

    /// BDOS 34 and 40: random write.
    fn bdos_write_random(&mut self, fcb_addr: u16) {
        let record_num = self.fcb_random_record(fcb_addr);
        let mut record = [0u8; RECORD_SIZE];
        let dma_bytes = self.mem.slice(self.dma, RECORD_SIZE);
        record[..dma_bytes.len()].copy_from_slice(dma_bytes);
        let Some(open) = self.open_files.get_mut(&fcb_addr) else {
            self.ret_a(0xFF);
            return;
        };

        match open.write_random(record_num, &record) {
            Ok(()) => self.ret_a(0),
            Err(_) => self.ret_a(0xFF),
        }
    }

    fn fcb_random_record(&self, fcb_addr: u16) -> u32 {
        self.mem.read(fcb_addr.wrapping_add(33)) as u32
            | (self.mem.read(fcb_addr.wrapping_add(34)) as u32) << 8
            | (self.mem.read(fcb_addr.wrapping_add(35)) as u32) << 16
    }

    /// BDOS 35: record count into R0..R2.
    fn bdos_compute_file_size(&mut self, fcb_addr: u16) {
        let filename = self.fcb_filename(fcb_addr);
        let Some(resolved) = self.resolver.resolve(&self.host, &filename) else {
            self.ret_a(0xFF);
            return;
        };
        let Some(size) = self.host.file_size(&resolved.path) else {
            self.ret_a(0xFF);
            return;
        };
        let records = size.div_ceil(RECORD_SIZE as u64) as u32;
        self.mem.write(fcb_addr.wrapping_add(33), records as u8);
        self.mem
            .write(fcb_addr.wrapping_add(34), (records >> 8) as u8);
        self.mem
            .write(fcb_addr.wrapping_add(35), (records >> 16) as u8);
        self.ret_a(0);
    }

    /// BDOS 36: random record from the sequential position.
    fn bdos_set_random_record(&mut self, fcb_addr: u16) {
        let ex = self.mem.read(fcb_addr.wrapping_add(12)) as u32;
        let cr = self.mem.read(fcb_addr.wrapping_add(32)) as u32;
        let record = ex * 128 + cr;
        self.mem.write(fcb_addr.wrapping_add(33), record as u8);
        self.mem
            .write(fcb_addr.wrapping_add(34), (record >> 8) as u8);
        self.mem
            .write(fcb_addr.wrapping_add(35), (record >> 16) as u8);
    }

    // ---- directory search ----

    /// BDOS 17: collect matches from mappings, the exact-name map, and
    /// the current directory, deduplicated by canonical 8.3 name, then
    /// emit the first.
    fn bdos_search_first(&mut self, fcb_addr: u16) {
        let mut pattern_name = [0u8; 8];
        let mut pattern_ext = [0u8; 3];
        let name_bytes = self.mem.slice(fcb_addr.wrapping_add(1), 8);
        pattern_name[..name_bytes.len()].copy_from_slice(name_bytes);
        let ext_bytes = self.mem.slice(fcb_addr.wrapping_add(9), 3);
        pattern_ext[..ext_bytes.len()].copy_from_slice(ext_bytes);

        self.search_results.clear();
        self.search_index = 0;
        let mut seen: HashSet<[u8; 11]> = HashSet::new();

        let push = |results: &mut Vec<SearchEntry>,
                        seen: &mut HashSet<[u8; 11]>,
                        name: [u8; 8],
                        ext: [u8; 3],
                        path: PathBuf| {
            let mut key = [0u8; 11];
            key[..8].copy_from_slice(&name);
            key[8..].copy_from_slice(&ext);
            if seen.insert(key) && match_fcb_pattern(&pattern_name, &pattern_ext, &name, &ext) {
                results.push(SearchEntry { name, ext, path });
            }
        };

        for mapping in self.resolver.mappings() {
            if self.host.file_kind(&mapping.host_path) != FileKind::Regular {
                continue;
            }
            // Wildcard patterns carry no concrete name to report.
            let Some((name, ext)) = host_to_cpm_83(&mapping.cpm_pattern) else {
                continue;
            };
            push(
                &mut self.search_results,
                &mut seen,
                name,
                ext,
                mapping.host_path.clone(),
            );
        }

        for (cpm_name, path) in self.resolver.exact_map() {
            if self.host.file_kind(path) != FileKind::Regular {
                continue;
            }
            let Some((name, ext)) = host_to_cpm_83(cpm_name) else {
                continue;
            };
            push(&mut self.search_results, &mut seen, name, ext, path.clone());
        }

        for entry in self.host.list_dir(Path::new(".")) {
            if entry.is_directory || entry.name.starts_with('.') {
                continue;
            }
            let Some((name, ext)) = host_to_cpm_83(&entry.name) else {
                continue;
            };
            push(
                &mut self.search_results,
                &mut seen,
                name,
                ext,
                PathBuf::from(&entry.name),
            );
        }

        debug!("search first: {} matches", self.search_results.len());
        self.emit_search_entry();
    }

    /// BDOS 18: emit the next match or report exhaustion.
    fn bdos_search_next(&mut self) {
        self.emit_search_entry();
    }

    /// Write a 32-byte directory record for the current search entry to
    /// the DMA buffer. RC and the allocation map are sized from the host
    /// file so STAT-style programs see plausible numbers.
    fn emit_search_entry(&mut self) {
        let Some(entry) = self.search_results.get(self.search_index) else {
            self.ret_a(0xFF);
            return;
        };
        self.search_index += 1;

        let size = self.host.file_size(&entry.path).unwrap_or(0);
        let records = size.div_ceil(RECORD_SIZE as u64);
        let rc = records.min(128) as u8;
        let alloc_used = records.div_ceil(8).min(16) as usize;

        let dma = self.dma;
        self.mem.fill(dma, 32, 0);
        self.mem.write(dma, self.current_user);
        let name = entry.name;
        let ext = entry.ext;
        self.mem.load_at(dma.wrapping_add(1), &name);
        self.mem.load_at(dma.wrapping_add(9), &ext);
        self.mem.write(dma.wrapping_add(15), rc);
        for i in 0..16u16 {
            let used = (i as usize) < alloc_used;
            self.mem
                .write(dma.wrapping_add(16 + i), if used { 1 } else { 0 });
        }
        self.ret_a(0);
    }

    // ---- BIOS dispatch ----

    fn handle_bios(&mut self, offset: u16) -> CpmResult<Option<ExitReason>> {
        if self.debug_bios.contains(&offset) {
            eprintln!("[bios] offset {offset}");
        }
        debug!("bios offset {offset}");

        match offset {
            bios::BOOT | bios::WBOOT => {
                info!("program exit via bios warm boot");
                return Ok(Some(ExitReason::WarmBoot));
            }

            bios::CONST => {
                let ready = if self.console.has_input() { 0xFF } else { 0 };
                self.ret_a(ready);
            }

            bios::CONIN => {
                let ch = self.console_input_blocking();
                self.ret_a(ch);
            }

            bios::CONOUT => {
                let ch = self.cpu.regs.bc.low();
                self.console.write(ch & 0x7F);
            }

            bios::LIST => {
                let ch = self.cpu.regs.bc.low();
                self.printer_output(ch);
            }

            bios::PUNCH => {
                let ch = self.cpu.regs.bc.low();
                self.punch_output(ch, true);
            }

            bios::READER => {
                let ch = self.reader_input();
                self.ret_a(ch);
            }

            bios::LISTST => {
                self.ret_a(0xFF);
            }

            bios::SELDSK => {
                let drive = self.cpu.regs.bc.low();
                if drive == 0 {
                    self.ret_hl(addr::DPH);
                } else {
                    self.ret_hl(0);
                }
            }

            bios::HOME | bios::SETTRK | bios::SETSEC | bios::SETDMA | bios::READ
            | bios::WRITE | bios::SECTRAN => match self.disk_mode {
                DiskMode::Ok => self.ret_a(0),
                DiskMode::Fail => self.ret_a(1),
                DiskMode::Error => {
                    eprintln!(
                        "fatal: BIOS disk function at offset {offset}; \
                         file I/O is handled at the BDOS level \
                         (set CPM_BIOS_DISK=ok or fail to continue instead)"
                    );
                    self.close_all_files();
                    return Err(CpmError::BiosDisk { offset });
                }
            },

            other => {
                debug!("unhandled bios offset {other}");
            }
        }

        Ok(self.pending_exit.take())
    }
}
