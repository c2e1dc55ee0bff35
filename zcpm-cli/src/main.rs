//! zcpm - run CP/M 2.2 programs against the host filesystem.
//!
//! Usage:
//!   zcpm [options] <program.com | config.cfg> [args...]
//!
//! Examples:
//!   zcpm mbasic.com                # Z80 mode, current directory as A:
//!   zcpm --8080 tst8080.com        # Intel 8080 mode
//!   zcpm build.cfg                 # mappings and devices from a config
//!   zcpm asm.com prog.asm          # file arguments land in the FCBs

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use crossterm::tty::IsTty;
use log::info;

use zcpm_core::host::FileKind;
use zcpm_core::{CpuMode, DiskMode, Emulator, ExitReason, Host, LocalHost, Memory};

mod config;
mod terminal;

use terminal::CliConsole;

/// Run CP/M programs.
#[derive(Parser, Debug)]
#[command(name = "zcpm")]
#[command(about = "Run CP/M 2.2 programs against the host filesystem")]
struct Args {
    /// Intel 8080 mode
    #[arg(long = "8080", conflicts_with = "z80")]
    mode_8080: bool,

    /// Zilog Z80 mode (default)
    #[arg(long)]
    z80: bool,

    /// Report progress every N million instructions
    #[arg(
        long,
        value_name = "N",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "100"
    )]
    progress: Option<u64>,

    /// On exit, dump memory to FILE
    #[arg(long, value_name = "FILE")]
    save_memory: Option<PathBuf>,

    /// Restrict the memory dump to a hex byte range, e.g. DC00-FFFF
    #[arg(long, value_name = "HHHH-HHHH", requires = "save_memory")]
    save_range: Option<String>,

    /// Trigger a periodic RST every N cycles (0 disables)
    #[arg(long, value_name = "N", default_value_t = 0)]
    int_cycles: u64,

    /// RST number (0-7) used by the periodic interrupt
    #[arg(long, value_name = "N", default_value_t = 7)]
    int_rst: u8,

    /// CP/M program (.com) or configuration file (.cfg)
    program: PathBuf,

    /// Arguments passed to the program's command tail
    args: Vec<String>,
}

/// Raw terminal mode, released on every exit path.
struct RawModeGuard {
    active: bool,
}

impl RawModeGuard {
    fn enable_if_tty() -> Self {
        let active = std::io::stdin().is_tty() && enable_raw_mode().is_ok();
        Self { active }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.active {
            let _ = disable_raw_mode();
        }
    }
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let is_usage_error = err.use_stderr();
            let _ = err.print();
            return if is_usage_error {
                ExitCode::FAILURE
            } else {
                // --help and --version land here.
                ExitCode::SUCCESS
            };
        }
    };

    match run(args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("zcpm: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<ExitCode, Box<dyn Error>> {
    let mode = if args.mode_8080 {
        CpuMode::Intel8080
    } else {
        CpuMode::Z80
    };

    let is_config = args
        .program
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("cfg"));
    let settings = if is_config {
        config::load(&args.program)
            .map_err(|err| format!("cannot open config file {}: {err}", args.program.display()))?
    } else {
        config::Settings::default()
    };

    env_logger::Builder::from_env(
        env_logger::Env::default()
            .default_filter_or(if settings.debug { "debug" } else { "warn" }),
    )
    .init();
    info!("cpu mode: {mode:?}");

    let program_path = if is_config {
        settings
            .program
            .clone()
            .ok_or("no 'program' directive in config file")?
    } else {
        args.program.clone()
    };

    let raw_tty = std::io::stdin().is_tty();
    let console = CliConsole::new(raw_tty);
    let mut emu = Emulator::new(console, LocalHost, mode);

    emu.resolver.default_mode = settings.default_mode;
    emu.resolver.default_eol_convert = settings.eol_convert;
    for (pattern, path, mode, eol) in &settings.mappings {
        emu.resolver.add_mapping(pattern, path, *mode, *eol);
    }

    // Devices: config first, environment overrides.
    if let Some(path) = &settings.printer {
        emu.set_printer_file(path);
    }
    if let Some(path) = &settings.aux_input {
        emu.set_aux_input_file(path);
    }
    if let Some(path) = &settings.aux_output {
        emu.set_aux_output_file(path);
    }
    if let Ok(path) = std::env::var("CPM_PRINTER") {
        emu.set_printer_file(Path::new(&path));
    }
    if let Ok(path) = std::env::var("CPM_AUX_IN") {
        emu.set_aux_input_file(Path::new(&path));
    }
    if let Ok(path) = std::env::var("CPM_AUX_OUT") {
        emu.set_aux_output_file(Path::new(&path));
    }

    if let Ok(value) = std::env::var("CPM_BIOS_DISK") {
        match DiskMode::parse(&value) {
            Some(mode) => emu.disk_mode = mode,
            None => eprintln!(
                "warning: invalid CPM_BIOS_DISK value '{value}' (use ok, fail, or error)"
            ),
        }
    }
    if let Ok(list) = std::env::var("CPM_DEBUG_BDOS") {
        emu.debug_bdos = list
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
    }
    if let Ok(list) = std::env::var("CPM_DEBUG_BIOS") {
        emu.debug_bios = list
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
    }

    // --progress beats CPM_PROGRESS; both count millions of instructions.
    let progress_millions = args.progress.or_else(|| {
        std::env::var("CPM_PROGRESS")
            .ok()
            .and_then(|value| value.parse().ok())
    });
    if let Some(millions) = progress_millions {
        emu.progress_interval = millions.saturating_mul(1_000_000);
    }

    emu.int_cycles = args.int_cycles;
    emu.int_rst = args.int_rst & 7;
    if args.int_cycles > 0 {
        info!(
            "interrupts: rst {} every {} cycles",
            emu.int_rst, emu.int_cycles
        );
        let regs = &mut emu.cpu_mut().regs;
        regs.iff1 = true;
        regs.iff2 = true;
        regs.im = 1;
    }

    // File arguments that exist on the host become name mappings, both
    // under their full uppercased basename and its 8.3 truncation.
    for arg in &args.args {
        let path = Path::new(arg);
        if LocalHost.file_kind(path) != FileKind::Regular {
            continue;
        }
        let Some(base) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let cpm_name = base.to_uppercase();
        emu.resolver.add_exact(&cpm_name, path);
        let truncated = truncate_8_3(&cpm_name);
        if truncated != cpm_name {
            emu.resolver.add_exact(&truncated, path);
        }
    }

    emu.load_program(&program_path)?;
    emu.set_command_tail(&args.args);

    let result = {
        let _guard = RawModeGuard::enable_if_tty();
        emu.run()
    };

    if let Some(path) = &args.save_memory {
        save_memory(emu.memory(), path, args.save_range.as_deref())?;
    }

    match result {
        Ok(info) => {
            log::debug!(
                "exit: {:?} after {} instructions, pc={:#06x}",
                info.reason,
                info.instructions,
                info.pc
            );
            match info.reason {
                ExitReason::InstructionLimit => {
                    eprintln!("zcpm: instruction limit reached at pc {:#06x}", info.pc);
                    Ok(ExitCode::FAILURE)
                }
                _ => Ok(ExitCode::SUCCESS),
            }
        }
        Err(err) => {
            eprintln!("zcpm: {err}");
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Squeeze an uppercased name into 8.3 for FCB lookup.
fn truncate_8_3(name: &str) -> String {
    match name.find('.') {
        Some(dot) => {
            let base = &name[..dot.min(8)];
            let ext: String = name[dot + 1..].chars().take(3).collect();
            if ext.is_empty() {
                base.to_string()
            } else {
                format!("{base}.{ext}")
            }
        }
        None => name.chars().take(8).collect(),
    }
}

/// Dump memory (optionally a `HHHH-HHHH` range) to a file.
fn save_memory(memory: &Memory, path: &Path, range: Option<&str>) -> Result<(), Box<dyn Error>> {
    let (start, end) = match range {
        Some(spec) => parse_range(spec).ok_or_else(|| format!("invalid save range '{spec}'"))?,
        None => (0x0000, 0xFFFF),
    };
    let len = (end as usize) - (start as usize) + 1;
    fs::write(path, memory.slice(start, len))?;
    eprintln!(
        "saved {len} bytes ({start:#06X}-{end:#06X}) to {}",
        path.display()
    );
    Ok(())
}

fn parse_range(spec: &str) -> Option<(u16, u16)> {
    let (start, end) = spec.split_once('-')?;
    let start = u16::from_str_radix(start, 16).ok()?;
    let end = u16::from_str_radix(end, 16).ok()?;
    (start <= end).then_some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_parsing() {
        assert_eq!(parse_range("DC00-FFFF"), Some((0xDC00, 0xFFFF)));
        assert_eq!(parse_range("0-0"), Some((0, 0)));
        assert_eq!(parse_range("FFFF-0000"), None);
        assert_eq!(parse_range("nope"), None);
    }

    #[test]
    fn name_truncation() {
        assert_eq!(truncate_8_3("VERYLONGNAME.DATA"), "VERYLONG.DAT");
        assert_eq!(truncate_8_3("SHORT.TXT"), "SHORT.TXT");
        assert_eq!(truncate_8_3("NOEXTENSIONHERE"), "NOEXTENS");
    }
}
