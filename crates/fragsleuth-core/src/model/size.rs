/// Size helpers: human-readable byte counts, size parsing for options,
/// and the six file-size buckets reported during analysis.
///
/// All internal sizes are `u64` bytes. Floating point is only used
/// at the display and parsing boundaries.
use serde::{Deserialize, Serialize};

const KIB: u64 = 1024;
const MIB: u64 = KIB * 1024;
const GIB: u64 = MIB * 1024;
const TIB: u64 = GIB * 1024;

/// Format a byte count into a human-readable string with binary units.
pub fn format_size(bytes: u64) -> String {
    let b = bytes as f64;
    if bytes < KIB {
        format!("{bytes} B")
    } else if bytes < MIB {
        format!("{:.1} KB", b / KIB as f64)
    } else if bytes < GIB {
        format!("{:.1} MB", b / MIB as f64)
    } else if bytes < TIB {
        format!("{:.2} GB", b / GIB as f64)
    } else {
        format!("{:.2} TB", b / TIB as f64)
    }
}

/// Format a count with thousand separators.
pub fn format_count(count: u64) -> String {
    let digits = count.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Parse a size such as `4096`, `20M`, `1.5G` or `64 KiB` into bytes.
///
/// Suffixes are binary and case-insensitive; an optional trailing `B` or
/// `iB` is accepted. Returns `None` for malformed or overflowing input.
pub fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, suffix) = text.split_at(split);
    if number.is_empty() {
        return None;
    }

    let suffix = suffix.trim().to_ascii_uppercase();
    let unit = suffix
        .strip_suffix("IB")
        .or_else(|| suffix.strip_suffix('B'))
        .unwrap_or(&suffix);
    let multiplier: u64 = match unit {
        "" => 1,
        "K" => KIB,
        "M" => MIB,
        "G" => GIB,
        "T" => TIB,
        "P" => TIB * 1024,
        "E" => TIB * 1024 * 1024,
        _ => return None,
    };

    if let Ok(whole) = number.parse::<u64>() {
        return whole.checked_mul(multiplier);
    }
    let value: f64 = number.parse().ok()?;
    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes < 0.0 || bytes >= u64::MAX as f64 {
        return None;
    }
    Some(bytes as u64)
}

/// File size bucket used by the analysis counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeBucket {
    Tiny,
    Small,
    Average,
    Big,
    Huge,
    Giant,
}

impl SizeBucket {
    pub fn of(bytes: u64) -> Self {
        if bytes >= 128 * MIB {
            SizeBucket::Giant
        } else if bytes >= 16 * MIB {
            SizeBucket::Huge
        } else if bytes >= MIB {
            SizeBucket::Big
        } else if bytes >= 100 * KIB {
            SizeBucket::Average
        } else if bytes >= 10 * KIB {
            SizeBucket::Small
        } else {
            SizeBucket::Tiny
        }
    }
}

/// Number of files seen in each size bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeCounters {
    pub tiny: u64,
    pub small: u64,
    pub average: u64,
    pub big: u64,
    pub huge: u64,
    pub giant: u64,
}

impl SizeCounters {
    pub fn record(&mut self, bytes: u64) {
        match SizeBucket::of(bytes) {
            SizeBucket::Tiny => self.tiny += 1,
            SizeBucket::Small => self.small += 1,
            SizeBucket::Average => self.average += 1,
            SizeBucket::Big => self.big += 1,
            SizeBucket::Huge => self.huge += 1,
            SizeBucket::Giant => self.giant += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.tiny + self.small + self.average + self.big + self.huge + self.giant
    }
}
