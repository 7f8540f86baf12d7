//! Register dump parsing.
//!
//! Accepts the line shapes gdb and simulator monitors print:
//!
//! ```text
//! x0             0x2a                42
//! d0             {f = 0x0, u = 0x3ff8000000000000, s = 0x3ff8000000000000}
//! d1             1.5                 (raw 0x3ff8000000000000)
//! r1 = 0x00000007
//! ```
//!
//! Unknown lines are ignored; only a dump without any recognizable register
//! is an error.

use crate::isa::Isa;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DumpError {
    #[error("no registers found in dump")]
    Empty,
}

/// Raw register contents after a run. Float registers hold IEEE bit patterns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterSnapshot {
    pub integer: Vec<Option<u64>>,
    pub float: Vec<Option<u64>>,
    pub raw: String,
}

impl RegisterSnapshot {
    /// A snapshot with every register of `isa` unknown.
    pub fn new(isa: Isa) -> Self {
        Self {
            integer: vec![None; isa.integer_registers().len()],
            float: vec![None; isa.float_registers().len()],
            raw: String::new(),
        }
    }

    pub fn integer(&self, index: usize) -> Option<u64> {
        self.integer.get(index).copied().flatten()
    }

    pub fn float(&self, index: usize) -> Option<u64> {
        self.float.get(index).copied().flatten()
    }

    pub fn with_integer(mut self, index: usize, value: u64) -> Self {
        if let Some(slot) = self.integer.get_mut(index) {
            *slot = Some(value);
        }
        self
    }

    pub fn with_float(mut self, index: usize, bits: u64) -> Self {
        if let Some(slot) = self.float.get_mut(index) {
            *slot = Some(bits);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.integer.iter().chain(&self.float).all(Option::is_none)
    }
}

/// Parse a textual register dump for `isa`.
pub fn parse_register_dump(isa: Isa, text: &str) -> Result<RegisterSnapshot, DumpError> {
    let mut snapshot = RegisterSnapshot::new(isa);
    snapshot.raw = text.to_string();

    for line in text.lines() {
        let line = line.trim();
        let Some((name, rest)) = split_name(line) else {
            continue;
        };
        let name = name.to_ascii_lowercase();
        if let Some(index) = isa.integer_registers().iter().position(|r| *r == name) {
            if let Some(value) = integer_value(rest) {
                snapshot.integer[index] = Some(value);
            }
        } else if let Some(index) = isa.float_registers().iter().position(|r| *r == name) {
            if let Some(bits) = float_bits(rest) {
                snapshot.float[index] = Some(bits);
            }
        }
    }

    if snapshot.is_empty() {
        return Err(DumpError::Empty);
    }
    Ok(snapshot)
}

fn split_name(line: &str) -> Option<(&str, &str)> {
    let end = line.find(|c: char| c.is_whitespace() || c == '=' || c == ':')?;
    let (name, rest) = line.split_at(end);
    let rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '=' || c == ':');
    Some((name, rest))
}

/// First token of `name 0xHEX ...` or `name = N`.
fn integer_value(rest: &str) -> Option<u64> {
    parse_number(rest.split_whitespace().next()?)
}

/// Bits of a floating register: `u = N` inside a gdb union, `(raw 0xHEX)`,
/// or a bare hex value.
fn float_bits(rest: &str) -> Option<u64> {
    if let Some(pos) = rest.find("u = ") {
        let token = rest[pos + 4..].split([',', '}', ' ']).next()?;
        return parse_number(token);
    }
    if let Some(pos) = rest.find("(raw ") {
        let token = rest[pos + 5..].split(')').next()?;
        return parse_number(token.trim());
    }
    let token = rest.split_whitespace().next()?;
    token.starts_with("0x").then(|| parse_number(token)).flatten()
}

fn parse_number(token: &str) -> Option<u64> {
    let token = token.trim_end_matches(',');
    match token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => token
            .parse::<u64>()
            .ok()
            .or_else(|| token.parse::<i64>().ok().map(|v| v as u64)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AARCH64_DUMP: &str = "\
Breakpoint 1, 0x0000000040080040 in crossjit_stop ()
x0             0x80000000          2147483648
x1             0x1                 1
x29            0x0                 0
sp             0x48000000          0x48000000
pc             0x40080040          0x40080040 <crossjit_stop>
d0             {f = 0x0, u = 0x3ff8000000000000, s = 0x3ff8000000000000}
d1             1.5                 (raw 0x3ff8000000000000)
";

    #[test]
    fn test_parse_gdb_aarch64() {
        let snapshot = parse_register_dump(Isa::Aarch64, AARCH64_DUMP).unwrap();
        assert_eq!(snapshot.integer(0), Some(0x8000_0000));
        assert_eq!(snapshot.integer(1), Some(1));
        assert_eq!(snapshot.integer(2), None);
        assert_eq!(snapshot.integer(31), Some(0x4800_0000));
        assert_eq!(snapshot.float(0), Some(0x3ff8_0000_0000_0000));
        assert_eq!(snapshot.float(1), Some(0x3ff8_0000_0000_0000));
        assert_eq!(snapshot.raw, AARCH64_DUMP);
    }

    #[test]
    fn test_parse_simple_armv7() {
        let dump = "R0 = 0xfffffffe\nr1 = 4294967295\nd0: 0x8000000000000000\nnoise line\n";
        let snapshot = parse_register_dump(Isa::Armv7, dump).unwrap();
        assert_eq!(snapshot.integer(0), Some(0xffff_fffe));
        assert_eq!(snapshot.integer(1), Some(0xffff_ffff));
        assert_eq!(snapshot.float(0), Some(0x8000_0000_0000_0000));
    }

    #[test]
    fn test_empty_dump() {
        assert_eq!(
            parse_register_dump(Isa::Aarch64, "Remote connection closed\n"),
            Err(DumpError::Empty)
        );
    }
}
