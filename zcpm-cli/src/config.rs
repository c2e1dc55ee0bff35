//! Configuration-file parsing.
//!
//! The format is `key = value` with `#` comments and `$VAR` / `${VAR}`
//! environment expansion in values. Known keys configure the emulator;
//! any other key declares a file mapping:
//!
//! ```text
//! program = tests/mbasic.com
//! cd = $HOME/work/cpm
//! default_mode = auto
//! OUT.TXT = ./out.txt text
//! *.DAT = ./data.bin binary
//! ```
//!
//! A malformed line is reported to stderr and skipped; parsing continues.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use zcpm_core::FileMode;

/// Everything a config file can set.
#[derive(Debug)]
pub struct Settings {
    pub program: Option<PathBuf>,
    pub default_mode: FileMode,
    pub eol_convert: bool,
    pub debug: bool,
    pub printer: Option<PathBuf>,
    pub aux_input: Option<PathBuf>,
    pub aux_output: Option<PathBuf>,
    /// `(cpm_pattern, host_path, mode, eol_convert)` in declaration order.
    pub mappings: Vec<(String, PathBuf, FileMode, bool)>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            program: None,
            default_mode: FileMode::Auto,
            eol_convert: true,
            debug: false,
            printer: None,
            aux_input: None,
            aux_output: None,
            mappings: Vec::new(),
        }
    }
}

/// Expand `$VAR` and `${VAR}` from the environment. Unknown variables
/// expand to nothing.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }
        let mut var_name = String::new();
        if chars.peek() == Some(&'{') {
            chars.next();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_ascii_alphanumeric() || c == '_' {
                    var_name.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
        }
        if let Ok(value) = std::env::var(&var_name) {
            result.push_str(&value);
        }
    }
    result
}

fn parse_bool(value: &str) -> bool {
    matches!(value, "true" | "1" | "yes")
}

/// Parse one config file. Directory changes (`cd =`) take effect
/// immediately so later relative paths resolve against the new directory.
pub fn load(path: &Path) -> io::Result<Settings> {
    let content = fs::read_to_string(path)?;
    let mut settings = Settings::default();
    parse(&content, &mut settings);
    Ok(settings)
}

fn parse(content: &str, settings: &mut Settings) {
    for (index, raw_line) in content.lines().enumerate() {
        let line_num = index + 1;
        let line = match raw_line.find('#') {
            Some(pos) => &raw_line[..pos],
            None => raw_line,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            eprintln!("config line {line_num}: invalid format (missing =)");
            continue;
        };
        let key = key.trim();
        let value = expand_env_vars(value.trim());

        match key {
            "program" => settings.program = Some(PathBuf::from(value)),
            "cd" | "chdir" => {
                if let Err(err) = std::env::set_current_dir(&value) {
                    eprintln!("config line {line_num}: cannot change directory to '{value}': {err}");
                }
            }
            "default_mode" => {
                settings.default_mode = match value.as_str() {
                    "text" => FileMode::Text,
                    "binary" => FileMode::Binary,
                    _ => FileMode::Auto,
                };
            }
            "eol_convert" => settings.eol_convert = parse_bool(&value),
            "debug" => settings.debug = parse_bool(&value),
            "printer" => settings.printer = Some(PathBuf::from(value)),
            "aux_input" => settings.aux_input = Some(PathBuf::from(value)),
            "aux_output" => settings.aux_output = Some(PathBuf::from(value)),
            pattern => {
                // A file mapping, optionally suffixed with a mode word.
                let mut mode = settings.default_mode;
                let mut eol_convert = settings.eol_convert;
                let mut target = value.as_str();
                if let Some((head, tail)) = value.rsplit_once(' ') {
                    match tail {
                        "text" => {
                            mode = FileMode::Text;
                            target = head;
                        }
                        "binary" => {
                            mode = FileMode::Binary;
                            eol_convert = false;
                            target = head;
                        }
                        _ => {}
                    }
                }
                settings.mappings.push((
                    pattern.to_string(),
                    PathBuf::from(target.trim()),
                    mode,
                    eol_convert,
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_directives_and_mappings() {
        let mut settings = Settings::default();
        parse(
            "# comment\n\
             program = prog.com\n\
             default_mode = text\n\
             eol_convert = false\n\
             OUT.TXT = ./out.txt text\n\
             RAW.BIN = ./raw binary\n\
             PLAIN.DAT = ./plain.dat\n",
            &mut settings,
        );
        assert_eq!(settings.program.as_deref(), Some(Path::new("prog.com")));
        assert_eq!(settings.default_mode, FileMode::Text);
        assert!(!settings.eol_convert);
        assert_eq!(settings.mappings.len(), 3);
        assert_eq!(
            settings.mappings[0],
            (
                "OUT.TXT".to_string(),
                PathBuf::from("./out.txt"),
                FileMode::Text,
                false
            )
        );
        assert_eq!(settings.mappings[1].2, FileMode::Binary);
        assert!(!settings.mappings[1].3);
        // No mode word: inherits the (already updated) defaults.
        assert_eq!(settings.mappings[2].2, FileMode::Text);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let mut settings = Settings::default();
        parse("this line has no equals\nprogram = ok.com\n", &mut settings);
        assert_eq!(settings.program.as_deref(), Some(Path::new("ok.com")));
    }

    #[test]
    fn env_expansion_both_forms() {
        std::env::set_var("ZCPM_TEST_DIR", "/tmp/zcpm");
        assert_eq!(expand_env_vars("$ZCPM_TEST_DIR/f"), "/tmp/zcpm/f");
        assert_eq!(expand_env_vars("${ZCPM_TEST_DIR}x"), "/tmp/zcpmx");
        assert_eq!(expand_env_vars("$ZCPM_UNSET_VAR_42"), "");
        assert_eq!(expand_env_vars("no vars"), "no vars");
    }

    #[test]
    fn comments_can_trail_values() {
        let mut settings = Settings::default();
        parse("debug = true # turn it on\n", &mut settings);
        assert!(settings.debug);
    }
}
