// Veriboard - Embedded Board Emulation Platform
// Copyright (C) 2026 The Veriboard Authors
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Keyed configuration store loaded from INI-style text.
//!
//! Sections are introduced by `[section]` headers, bindings by `name: value`
//! lines. The first binding seen for a `(section, name)` pair wins; later
//! duplicates are ignored, which is how board models install defaults after
//! the user's files have been loaded.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("variable {section}::{name} is not set")]
    Missing { section: String, name: String },
    #[error("variable {section}::{name} is not a valid {expected}")]
    Malformed {
        section: String,
        name: String,
        expected: &'static str,
    },
    #[error("invalid size specification '{0}'")]
    BadSize(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// The configuration store. One instance per process, owned by whoever
/// bootstraps the board and handed to device constructors by reference.
#[derive(Debug, Default)]
pub struct Config {
    vars: HashMap<(String, String), String>,
    curr_section: String,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration file, merging it into the store. Bindings
    /// already present keep their earlier value.
    pub fn read_file<P: AsRef<Path>>(&mut self, path: P) -> ConfigResult<()> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        self.add_string(&text);
        tracing::info!("Configuration file {} loaded", path.display());
        Ok(())
    }

    /// Feed configuration text directly, one or more lines. Used by board
    /// models to register their default wiring.
    pub fn add_string(&mut self, text: &str) {
        for line in text.lines() {
            self.add_line(line);
        }
    }

    fn add_line(&mut self, raw: &str) {
        let line = match raw.find('#') {
            Some(pos) => &raw[..pos],
            None => raw,
        };
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        if let Some(rest) = line.strip_prefix('[') {
            if let Some(end) = rest.find(']') {
                self.curr_section = rest[..end].to_string();
            }
            return;
        }
        let Some(colon) = line.find(':') else {
            tracing::debug!("config line without colon ignored: '{}'", line);
            return;
        };
        let name = line[..colon].trim();
        let value = line[colon + 1..].trim();
        if name.is_empty() || value.is_empty() {
            return;
        }
        if self.curr_section.is_empty() {
            tracing::debug!("config binding '{}' outside any section ignored", name);
            return;
        }
        let key = (self.curr_section.clone(), name.to_string());
        // First binding wins.
        self.vars.entry(key).or_insert_with(|| value.to_string());
    }

    pub fn read_var(&self, section: &str, name: &str) -> Option<&str> {
        self.vars
            .get(&(section.to_string(), name.to_string()))
            .map(String::as_str)
    }

    /// True when the variable exists and contains `needle` as a substring.
    pub fn str_str_var(&self, section: &str, name: &str, needle: &str) -> bool {
        self.read_var(section, name)
            .map(|v| v.contains(needle))
            .unwrap_or(false)
    }

    /// Split a list-valued variable at whitespace or commas. `"…"` quoting
    /// groups separators into one element.
    pub fn read_list(&self, section: &str, name: &str) -> Vec<String> {
        match self.read_var(section, name) {
            Some(value) => split_args(value),
            None => Vec::new(),
        }
    }

    pub fn read_int32(&self, section: &str, name: &str) -> ConfigResult<i32> {
        let value = self.require(section, name)?;
        value.parse::<i32>().map_err(|_| {
            tracing::warn!("Variable {}::{} should be an integer", section, name);
            self.malformed(section, name, "integer")
        })
    }

    pub fn read_uint32(&self, section: &str, name: &str) -> ConfigResult<u32> {
        let value = self.require(section, name)?;
        parse_u64(value).and_then(|v| u32::try_from(v).ok()).ok_or_else(|| {
            tracing::warn!("Variable {}::{} should be an unsigned integer", section, name);
            self.malformed(section, name, "unsigned integer")
        })
    }

    pub fn read_uint64(&self, section: &str, name: &str) -> ConfigResult<u64> {
        let value = self.require(section, name)?;
        parse_u64(value).ok_or_else(|| {
            tracing::warn!("Variable {}::{} should be an unsigned integer", section, name);
            self.malformed(section, name, "unsigned integer")
        })
    }

    pub fn read_float32(&self, section: &str, name: &str) -> ConfigResult<f32> {
        let value = self.require(section, name)?;
        value.parse::<f32>().map_err(|_| {
            tracing::warn!("Variable {}::{} should be a float", section, name);
            self.malformed(section, name, "float")
        })
    }

    fn require(&self, section: &str, name: &str) -> ConfigResult<&str> {
        self.read_var(section, name).ok_or_else(|| ConfigError::Missing {
            section: section.to_string(),
            name: name.to_string(),
        })
    }

    fn malformed(&self, section: &str, name: &str, expected: &'static str) -> ConfigError {
        ConfigError::Malformed {
            section: section.to_string(),
            name: name.to_string(),
            expected,
        }
    }

    /// Render the effective store, mainly for startup diagnostics.
    pub fn dump(&self) -> String {
        let mut keys: Vec<_> = self.vars.keys().collect();
        keys.sort();
        let mut out = String::new();
        for key in keys {
            let _ = writeln!(out, "{}::{}: {}", key.0, key.1, self.vars[key]);
        }
        out
    }
}

fn parse_u64(value: &str) -> Option<u64> {
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        value.parse::<u64>().ok()
    }
}

fn split_args(value: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut in_arg = false;
    for ch in value.chars() {
        if in_quote {
            if ch == '"' {
                in_quote = false;
            } else {
                current.push(ch);
            }
            continue;
        }
        match ch {
            '"' => {
                in_quote = true;
                in_arg = true;
            }
            ' ' | '\t' | ',' => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            _ => {
                in_arg = true;
                current.push(ch);
            }
        }
    }
    if in_arg {
        args.push(current);
    }
    args
}

/// Parse a memory-size string. The bare `k`/`m`/`g` suffix form ("64k",
/// "16M") used by board files means binary multiples; everything else goes
/// through `human-size` ("1MB", "128 kB", "2MiB").
pub fn parse_memsize(value: &str) -> ConfigResult<u64> {
    let trimmed = value.trim();
    let bare_suffix = match trimmed.chars().last() {
        Some('k') | Some('K') => Some(1024u64),
        Some('m') | Some('M') => Some(1024 * 1024),
        Some('g') | Some('G') => Some(1024 * 1024 * 1024),
        _ => None,
    };
    if let Some(factor) = bare_suffix {
        if let Ok(n) = trimmed[..trimmed.len() - 1].trim().parse::<u64>() {
            return Ok(n * factor);
        }
    }
    if let Ok(n) = trimmed.parse::<u64>() {
        return Ok(n);
    }
    use human_size::{Byte, Size, SpecificSize};
    if let Ok(s) = trimmed.parse::<Size>() {
        let bytes: SpecificSize<Byte> = s.into();
        return Ok(bytes.value() as u64);
    }
    Err(ConfigError::BadSize(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sections_and_bindings() {
        let mut cfg = Config::new();
        cfg.add_string(
            "[global]\nimagedir: /var/lib/emu\n[dm9000]\nmouse: 1\n# comment\nirqpin: 3 # trailing\n",
        );
        assert_eq!(cfg.read_var("global", "imagedir"), Some("/var/lib/emu"));
        assert_eq!(cfg.read_var("dm9000", "mouse"), Some("1"));
        assert_eq!(cfg.read_var("dm9000", "irqpin"), Some("3"));
        assert_eq!(cfg.read_var("dm9000", "missing"), None);
    }

    #[test]
    fn test_first_binding_wins() {
        let mut cfg = Config::new();
        cfg.add_string("[uart0]\nbaud: 115200\n");
        cfg.add_string("[uart0]\nbaud: 9600\n");
        assert_eq!(cfg.read_var("uart0", "baud"), Some("115200"));
    }

    #[test]
    fn test_binding_outside_section_ignored() {
        let mut cfg = Config::new();
        cfg.add_string("stray: 1\n[sec]\nbound: 2\n");
        assert_eq!(cfg.read_var("", "stray"), None);
        assert_eq!(cfg.read_var("sec", "bound"), Some("2"));
    }

    #[test]
    fn test_empty_value_ignored() {
        let mut cfg = Config::new();
        cfg.add_string("[sec]\nempty:\nempty: later\n");
        // The empty binding was dropped, so the later one is first-seen.
        assert_eq!(cfg.read_var("sec", "empty"), Some("later"));
    }

    #[test]
    fn test_typed_readers() {
        let mut cfg = Config::new();
        cfg.add_string("[n]\na: -5\nb: 0x20\nc: 1.5\nd: banana\ne: 4000000000\n");
        assert_eq!(cfg.read_int32("n", "a").unwrap(), -5);
        assert_eq!(cfg.read_uint32("n", "b").unwrap(), 0x20);
        assert_eq!(cfg.read_uint64("n", "e").unwrap(), 4_000_000_000);
        assert!((cfg.read_float32("n", "c").unwrap() - 1.5).abs() < f32::EPSILON);
        assert!(matches!(
            cfg.read_int32("n", "d"),
            Err(ConfigError::Malformed { .. })
        ));
        assert!(matches!(
            cfg.read_int32("n", "nope"),
            Err(ConfigError::Missing { .. })
        ));
    }

    #[test]
    fn test_list_splitting() {
        let mut cfg = Config::new();
        cfg.add_string("[global]\nlibs: libflash.so libeth.so,libsnd.so\n");
        assert_eq!(
            cfg.read_list("global", "libs"),
            vec!["libflash.so", "libeth.so", "libsnd.so"]
        );
    }

    #[test]
    fn test_list_quoting() {
        let mut cfg = Config::new();
        cfg.add_string("[x]\npaths: \"with space\" plain\n");
        assert_eq!(cfg.read_list("x", "paths"), vec!["with space", "plain"]);
    }

    #[test]
    fn test_str_str_var() {
        let mut cfg = Config::new();
        cfg.add_string("[flash0]\ntype: AM29LV640ML\n");
        assert!(cfg.str_str_var("flash0", "type", "29LV640"));
        assert!(!cfg.str_str_var("flash0", "type", "M25P16"));
        assert!(!cfg.str_str_var("flash0", "nokey", ""));
    }

    #[test]
    fn test_parse_memsize() {
        assert_eq!(parse_memsize("64k").unwrap(), 64 * 1024);
        assert_eq!(parse_memsize("16M").unwrap(), 16 * 1024 * 1024);
        assert_eq!(parse_memsize("512").unwrap(), 512);
        assert!(parse_memsize("sixteen").is_err());
    }
}
