//! CP/M name resolution and host file access.
//!
//! Guest programs name files in 8.3 form; this module maps those names onto
//! host paths through an ordered list of declared mappings, a legacy
//! exact-name map, and finally the current directory (lowercased first).
//! It also owns the open-file record, including the text-mode line-ending
//! conversion applied to sequential reads and writes.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use log::debug;

use crate::console::CPM_EOF;
use crate::host::{FileKind, Host};

/// How a file's bytes are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Text,
    Binary,
    /// Decide from the extension at resolution time.
    Auto,
}

/// Extensions treated as text under `Auto`. Everything else is binary, so
/// unidentified data is never rewritten.
const TEXT_EXTENSIONS: [&str; 7] = ["BAS", "MAC", "ASM", "TXT", "DOC", "LST", "PRN"];

/// Classify a normalized CP/M name by extension.
pub fn detect_mode(cpm_name: &str) -> FileMode {
    match cpm_name.rsplit_once('.') {
        Some((_, ext)) if TEXT_EXTENSIONS.contains(&ext) => FileMode::Text,
        _ => FileMode::Binary,
    }
}

/// One declared `<cpm-pattern> = <host-path>` mapping.
#[derive(Debug, Clone)]
pub struct FileMapping {
    pub cpm_pattern: String,
    pub host_path: PathBuf,
    pub mode: FileMode,
    pub eol_convert: bool,
}

/// A resolved name: where the bytes live and how to treat them.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub path: PathBuf,
    pub mode: FileMode,
    pub eol_convert: bool,
}

/// Uppercase a CP/M name and drop embedded spaces.
pub fn normalize_cpm_name(name: &str) -> String {
    name.chars()
        .filter(|c| *c != ' ')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Characters CP/M allows in file names.
pub fn is_valid_cpm_char(c: char) -> bool {
    let c = c.to_ascii_uppercase();
    c.is_ascii_uppercase() || c.is_ascii_digit() || "$#@!%'()-{}~".contains(c)
}

/// Convert a host file name to space-padded 8.3 fields. Returns None when
/// the name uses characters CP/M cannot express or does not fit in 8+3.
pub fn host_to_cpm_83(host_name: &str) -> Option<([u8; 8], [u8; 3])> {
    let (name_part, ext_part) = match host_name.rfind('.') {
        Some(pos) if pos > 0 => (&host_name[..pos], &host_name[pos + 1..]),
        _ => (host_name, ""),
    };
    if name_part.is_empty() || name_part.len() > 8 || ext_part.len() > 3 {
        return None;
    }
    let mut name = [b' '; 8];
    for (i, c) in name_part.chars().enumerate() {
        if !is_valid_cpm_char(c) {
            return None;
        }
        name[i] = c.to_ascii_uppercase() as u8;
    }
    let mut ext = [b' '; 3];
    for (i, c) in ext_part.chars().enumerate() {
        if !is_valid_cpm_char(c) {
            return None;
        }
        ext[i] = c.to_ascii_uppercase() as u8;
    }
    Some((name, ext))
}

/// Match space-padded 8.3 fields against an FCB pattern where `?` matches
/// any single character. Case-insensitive.
pub fn match_fcb_pattern(
    pattern_name: &[u8],
    pattern_ext: &[u8],
    name: &[u8; 8],
    ext: &[u8; 3],
) -> bool {
    for i in 0..8 {
        let p = pattern_name.get(i).copied().unwrap_or(b' ') & 0x7F;
        if p != b'?' && p.to_ascii_uppercase() != name[i].to_ascii_uppercase() {
            return false;
        }
    }
    for i in 0..3 {
        let p = pattern_ext.get(i).copied().unwrap_or(b' ') & 0x7F;
        if p != b'?' && p.to_ascii_uppercase() != ext[i].to_ascii_uppercase() {
            return false;
        }
    }
    true
}

/// Maps CP/M names to host paths. First matching declared pattern wins,
/// then the exact-name map, then the current directory.
pub struct Resolver {
    mappings: Vec<FileMapping>,
    exact: HashMap<String, PathBuf>,
    pub default_mode: FileMode,
    pub default_eol_convert: bool,
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver {
    pub fn new() -> Self {
        Self {
            mappings: Vec::new(),
            exact: HashMap::new(),
            default_mode: FileMode::Auto,
            default_eol_convert: true,
        }
    }

    /// Declare a pattern mapping. Order of declaration is match order.
    pub fn add_mapping(
        &mut self,
        cpm_pattern: &str,
        host_path: impl Into<PathBuf>,
        mode: FileMode,
        eol_convert: bool,
    ) {
        let mapping = FileMapping {
            cpm_pattern: normalize_cpm_name(cpm_pattern),
            host_path: host_path.into(),
            mode,
            eol_convert,
        };
        debug!(
            "file mapping: {} -> {} ({:?}, eol={})",
            mapping.cpm_pattern,
            mapping.host_path.display(),
            mapping.mode,
            mapping.eol_convert
        );
        self.mappings.push(mapping);
    }

    /// Register an exact CP/M-name to host-path pair.
    pub fn add_exact(&mut self, cpm_name: &str, host_path: impl Into<PathBuf>) {
        self.exact
            .insert(normalize_cpm_name(cpm_name), host_path.into());
    }

    pub fn mappings(&self) -> &[FileMapping] {
        &self.mappings
    }

    pub fn exact_map(&self) -> &HashMap<String, PathBuf> {
        &self.exact
    }

    /// A pattern matches by exact normalized name, `*` / `*.*` (anything),
    /// or `*.EXT` (any name with that extension).
    fn pattern_matches(pattern: &str, name: &str) -> bool {
        if pattern == name || pattern == "*" || pattern == "*.*" {
            return true;
        }
        if let Some(pat_ext) = pattern.strip_prefix("*.") {
            if let Some((_, ext)) = name.rsplit_once('.') {
                return pat_ext == ext;
            }
        }
        false
    }

    fn finish(&self, path: PathBuf, mode: FileMode, eol_convert: bool, name: &str) -> Resolved {
        let mode = match mode {
            FileMode::Auto => detect_mode(name),
            other => other,
        };
        Resolved { path, mode, eol_convert }
    }

    /// Resolve a CP/M name to an existing host file.
    pub fn resolve(&self, host: &dyn Host, cpm_name: &str) -> Option<Resolved> {
        let name = normalize_cpm_name(cpm_name);

        for mapping in &self.mappings {
            if Self::pattern_matches(&mapping.cpm_pattern, &name)
                && host.file_kind(&mapping.host_path) != FileKind::Missing
            {
                return Some(self.finish(
                    mapping.host_path.clone(),
                    mapping.mode,
                    mapping.eol_convert,
                    &name,
                ));
            }
        }

        if let Some(path) = self.exact.get(&name) {
            return Some(self.finish(
                path.clone(),
                FileMode::Auto,
                self.default_eol_convert,
                &name,
            ));
        }

        let lowercase = PathBuf::from(name.to_ascii_lowercase());
        if host.file_kind(&lowercase) != FileKind::Missing {
            return Some(self.finish(lowercase, FileMode::Auto, self.default_eol_convert, &name));
        }

        let as_is = PathBuf::from(&name);
        if host.file_kind(&as_is) != FileKind::Missing {
            return Some(self.finish(as_is, FileMode::Auto, self.default_eol_convert, &name));
        }

        None
    }

    /// Resolve a CP/M name for file creation: a matching declared pattern
    /// supplies the path without requiring it to exist; otherwise the file
    /// is created under the lowercased name in the current directory.
    pub fn resolve_for_create(&self, cpm_name: &str) -> Resolved {
        let name = normalize_cpm_name(cpm_name);
        for mapping in &self.mappings {
            if Self::pattern_matches(&mapping.cpm_pattern, &name) {
                return self.finish(
                    mapping.host_path.clone(),
                    mapping.mode,
                    mapping.eol_convert,
                    &name,
                );
            }
        }
        self.finish(
            PathBuf::from(name.to_ascii_lowercase()),
            self.default_mode,
            self.default_eol_convert,
            &name,
        )
    }
}

/// An open host file backing an FCB.
pub struct OpenFile {
    pub file: File,
    pub host_path: PathBuf,
    pub cpm_name: String,
    pub mode: FileMode,
    pub eol_convert: bool,
    pub write_mode: bool,
    /// Latched once a ^Z is seen on a text read.
    pub eof_seen: bool,
    /// One byte of read lookahead, used when an expanded `\r\n` pair does
    /// not fit the current record.
    pushback: Option<u8>,
    /// A trailing `\r` held across record boundaries so a split `\r\n`
    /// still collapses on write. Flushed on close.
    pending_cr: bool,
}

impl OpenFile {
    pub fn new(
        file: File,
        host_path: PathBuf,
        cpm_name: String,
        mode: FileMode,
        eol_convert: bool,
    ) -> Self {
        Self {
            file,
            host_path,
            cpm_name,
            mode,
            eol_convert,
            write_mode: false,
            eof_seen: false,
            pushback: None,
            pending_cr: false,
        }
    }

    fn next_byte(&mut self) -> io::Result<Option<u8>> {
        if let Some(byte) = self.pushback.take() {
            return Ok(Some(byte));
        }
        let mut buf = [0u8; 1];
        match self.file.read(&mut buf)? {
            0 => Ok(None),
            _ => Ok(Some(buf[0])),
        }
    }

    /// Read one 128-byte record at the current position, applying the
    /// text-mode conversions. Returns how many bytes of `out` were filled;
    /// the caller pads the rest.
    pub fn read_record(&mut self, out: &mut [u8; 128]) -> io::Result<usize> {
        if self.eof_seen {
            return Ok(0);
        }

        if self.mode == FileMode::Binary || !self.eol_convert {
            let mut filled = 0;
            while filled < out.len() {
                let n = self.file.read(&mut out[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            // Text files honor ^Z as end of data even without conversion.
            if self.mode == FileMode::Text {
                if let Some(pos) = out[..filled].iter().position(|&b| b == CPM_EOF) {
                    self.eof_seen = true;
                    return Ok(pos);
                }
            }
            return Ok(filled);
        }

        let mut pos = 0;
        while pos < out.len() {
            let Some(byte) = self.next_byte()? else {
                break;
            };
            match byte {
                b'\n' => {
                    if pos + 1 < out.len() {
                        out[pos] = b'\r';
                        out[pos + 1] = b'\n';
                        pos += 2;
                    } else {
                        // No room for the pair; replay it next record.
                        self.pushback = Some(b'\n');
                        break;
                    }
                }
                CPM_EOF => {
                    self.eof_seen = true;
                    break;
                }
                other => {
                    out[pos] = other;
                    pos += 1;
                }
            }
        }
        Ok(pos)
    }

    /// Write one record at the current position with text-mode conversion:
    /// `\r\n` collapses to `\n` (a lone `\r` passes through), ^Z ends the
    /// record. Returns the number of host bytes written.
    pub fn write_record(&mut self, data: &[u8]) -> io::Result<usize> {
        self.write_mode = true;

        if self.mode == FileMode::Binary || !self.eol_convert {
            self.file.write_all(data)?;
            self.file.flush()?;
            return Ok(data.len());
        }

        let mut written = 0;
        for &byte in data {
            match byte {
                CPM_EOF => break,
                b'\r' => {
                    if self.pending_cr {
                        self.file.write_all(b"\r")?;
                        written += 1;
                    }
                    self.pending_cr = true;
                }
                b'\n' => {
                    // Collapses \r\n (including a pair split across
                    // records) to \n.
                    self.pending_cr = false;
                    self.file.write_all(b"\n")?;
                    written += 1;
                }
                other => {
                    if self.pending_cr {
                        self.file.write_all(b"\r")?;
                        written += 1;
                        self.pending_cr = false;
                    }
                    self.file.write_all(&[other])?;
                    written += 1;
                }
            }
        }
        self.file.flush()?;
        Ok(written)
    }

    /// Flush the held `\r`, if any. Called on close.
    pub fn flush_pending(&mut self) -> io::Result<()> {
        if self.pending_cr {
            self.pending_cr = false;
            self.file.write_all(b"\r")?;
        }
        self.file.flush()
    }

    /// Seek to a 128-byte record for random access. Read lookahead is
    /// discarded; random transfers never convert line endings.
    pub fn seek_record(&mut self, record: u32) -> io::Result<()> {
        self.pushback = None;
        self.file
            .seek(SeekFrom::Start(record as u64 * 128))
            .map(|_| ())
    }

    /// Random read: seek and read raw bytes. Returns how much of `out`
    /// was filled.
    pub fn read_random(&mut self, record: u32, out: &mut [u8; 128]) -> io::Result<usize> {
        self.seek_record(record)?;
        let mut filled = 0;
        while filled < out.len() {
            let n = self.file.read(&mut out[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Random write: seek and write one raw record.
    pub fn write_random(&mut self, record: u32, data: &[u8]) -> io::Result<()> {
        self.seek_record(record)?;
        self.write_mode = true;
        self.file.write_all(data)?;
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::LocalHost;
    use std::fs;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn scratch_path(tag: &str) -> PathBuf {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        let n = SEQ.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("zcpm-files-{}-{}-{}", std::process::id(), tag, n))
    }

    #[test]
    fn normalize_uppercases_and_strips_spaces() {
        assert_eq!(normalize_cpm_name("test .txt"), "TEST.TXT");
    }

    #[test]
    fn detect_mode_by_extension() {
        assert_eq!(detect_mode("PROG.BAS"), FileMode::Text);
        assert_eq!(detect_mode("NOTES.TXT"), FileMode::Text);
        assert_eq!(detect_mode("GAME.COM"), FileMode::Binary);
        assert_eq!(detect_mode("STRANGE.QQQ"), FileMode::Binary);
        assert_eq!(detect_mode("NOEXT"), FileMode::Binary);
    }

    #[test]
    fn host_name_conversion() {
        let (name, ext) = host_to_cpm_83("hello.txt").unwrap();
        assert_eq!(&name, b"HELLO   ");
        assert_eq!(&ext, b"TXT");
        assert!(host_to_cpm_83("name_with_underscore.txt").is_none());
        assert!(host_to_cpm_83("waytoolongname.txt").is_none());
        assert!(host_to_cpm_83("ok.toolong").is_none());
        let (name, ext) = host_to_cpm_83("noext").unwrap();
        assert_eq!(&name, b"NOEXT   ");
        assert_eq!(&ext, b"   ");
    }

    #[test]
    fn fcb_pattern_wildcards() {
        let (name, ext) = host_to_cpm_83("a.txt").unwrap();
        assert!(match_fcb_pattern(b"????????", b"TXT", &name, &ext));
        assert!(match_fcb_pattern(b"A       ", b"???", &name, &ext));
        assert!(!match_fcb_pattern(b"B       ", b"TXT", &name, &ext));
    }

    #[test]
    fn pattern_precedence_first_match_wins() {
        let mut resolver = Resolver::new();
        let path_a = scratch_path("a");
        let path_b = scratch_path("b");
        fs::write(&path_a, b"A").unwrap();
        fs::write(&path_b, b"B").unwrap();
        resolver.add_mapping("*.DAT", &path_a, FileMode::Binary, false);
        resolver.add_mapping("X.DAT", &path_b, FileMode::Binary, false);

        let resolved = resolver.resolve(&LocalHost, "X.DAT").unwrap();
        assert_eq!(resolved.path, path_a);

        fs::remove_file(&path_a).unwrap();
        fs::remove_file(&path_b).unwrap();
    }

    #[test]
    fn mapping_requires_existing_target() {
        let mut resolver = Resolver::new();
        resolver.add_mapping("GONE.TXT", scratch_path("missing"), FileMode::Text, true);
        assert!(resolver.resolve(&LocalHost, "GONE.TXT").is_none());
    }

    #[test]
    fn create_ignores_existence_and_detects_mode() {
        let mut resolver = Resolver::new();
        let target = scratch_path("out");
        resolver.add_mapping("OUT.TXT", &target, FileMode::Auto, true);
        let resolved = resolver.resolve_for_create("OUT.TXT");
        assert_eq!(resolved.path, target);
        assert_eq!(resolved.mode, FileMode::Text);

        let fallback = resolver.resolve_for_create("NEW.BIN");
        assert_eq!(fallback.path, PathBuf::from("new.bin"));
        assert_eq!(fallback.mode, FileMode::Binary);
    }

    #[test]
    fn text_read_expands_newlines_and_stops_at_eof_byte() {
        let path = scratch_path("read");
        fs::write(&path, b"ab\ncd\x1Azzz").unwrap();
        let file = File::open(&path).unwrap();
        let mut of = OpenFile::new(file, path.clone(), "R.TXT".into(), FileMode::Text, true);

        let mut out = [0u8; 128];
        let n = of.read_record(&mut out).unwrap();
        assert_eq!(&out[..n], b"ab\r\ncd");
        assert!(of.eof_seen);
        assert_eq!(of.read_record(&mut out).unwrap(), 0);

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn text_write_collapses_crlf_across_records() {
        let path = scratch_path("write");
        let file = File::create(&path).unwrap();
        let mut of = OpenFile::new(file, path.clone(), "W.TXT".into(), FileMode::Text, true);

        // First record ends in \r, second starts with \n.
        let mut rec1 = [0u8; 128];
        rec1[..4].copy_from_slice(b"ab\r\r");
        rec1[4..].fill(CPM_EOF);
        // The record stops at ^Z, so only the 4 leading bytes count.
        of.write_record(&rec1[..4]).unwrap();

        let mut rec2 = [0u8; 128];
        rec2[..3].copy_from_slice(b"\ncd");
        rec2[3..].fill(CPM_EOF);
        of.write_record(&rec2).unwrap();
        of.flush_pending().unwrap();

        // "ab" + lone \r passed through + collapsed \r\n + "cd".
        assert_eq!(fs::read(&path).unwrap(), b"ab\r\ncd");

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn binary_passes_bytes_through() {
        let path = scratch_path("bin");
        let payload: Vec<u8> = (0u16..=255).map(|b| b as u8).collect();
        fs::write(&path, &payload).unwrap();
        let file = File::open(&path).unwrap();
        let mut of = OpenFile::new(file, path.clone(), "B.BIN".into(), FileMode::Binary, true);

        let mut out = [0u8; 128];
        assert_eq!(of.read_record(&mut out).unwrap(), 128);
        assert_eq!(&out[..], &payload[..128]);
        assert_eq!(of.read_record(&mut out).unwrap(), 128);
        assert_eq!(&out[..], &payload[128..]);
        assert_eq!(of.read_record(&mut out).unwrap(), 0);

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn crlf_pair_split_across_read_records() {
        // 127 'a's then a newline: the \r lands in slot 127 and the pair
        // does not fit, so the \n replays into the next record.
        let path = scratch_path("split");
        let mut content = vec![b'a'; 127];
        content.push(b'\n');
        content.push(b'z');
        fs::write(&path, &content).unwrap();
        let file = File::open(&path).unwrap();
        let mut of = OpenFile::new(file, path.clone(), "S.TXT".into(), FileMode::Text, true);

        let mut out = [0u8; 128];
        let n = of.read_record(&mut out).unwrap();
        assert_eq!(n, 127);
        let n = of.read_record(&mut out).unwrap();
        assert_eq!(&out[..n], b"\r\nz");

        fs::remove_file(&path).unwrap();
    }
}
