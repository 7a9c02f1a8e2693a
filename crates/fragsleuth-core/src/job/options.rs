/// Job options and the engine's tuning constants.
///
/// Options deserialize from JSON with every field optional and can be
/// overridden from `FRAGSLEUTH_*` environment variables. Zero means
/// "not set" for every limit, as it does on the command line.
use crate::model::size::parse_size;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Fragment size threshold used by the partial defragmentation round that
/// runs when no threshold was configured.
pub const PART_DEFRAG_MAGIC_CONSTANT: u64 = 20 * 1024 * 1024;

/// Files below this size are packed tightly by the optimizer; it is also
/// the group size at which an already-sorted run of files is left alone.
pub const OPTIMIZER_MAGIC_CONSTANT: u64 = 20 * 1024 * 1024;

/// A sorted run of at least this many files is left in place.
pub const OPTIMIZER_GROUP_FILE_COUNT: u64 = 10;

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    /// `;`-separated wildcard patterns a path must match to be processed.
    pub in_filter: String,
    /// `;`-separated wildcard patterns excluding a path.
    pub ex_filter: String,
    /// `;`-separated patterns restricting the job to a sub-tree.
    pub cut_filter: String,
    /// Files larger than this are skipped. Zero means no limit.
    pub size_limit: u64,
    /// Files with fewer fragments are skipped. Zero means no limit.
    pub fragments_limit: u64,
    /// Fragments at least this large are left alone. Zero means unset.
    pub fragment_size_threshold: u64,
    /// Largest file the optimizer moves to the front. Zero means 20 MiB.
    pub optimizer_size_limit: u64,
    /// Skip defragmentation below this fragmentation percentage.
    pub fragmentation_threshold: f64,
    /// Seconds; zero means no limit.
    pub time_limit: u64,
    /// Milliseconds between progress snapshots. Zero means 100 ms.
    pub refresh_interval: u64,
    /// Count moves without issuing them.
    pub dry_run: bool,
    pub disable_reports: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            in_filter: String::new(),
            ex_filter: String::new(),
            cut_filter: String::new(),
            size_limit: 0,
            fragments_limit: 0,
            fragment_size_threshold: 0,
            optimizer_size_limit: 0,
            fragmentation_threshold: 0.0,
            time_limit: 0,
            refresh_interval: DEFAULT_REFRESH_INTERVAL.as_millis() as u64,
            dry_run: false,
            disable_reports: false,
        }
    }
}

impl JobOptions {
    pub fn effective_size_limit(&self) -> u64 {
        if self.size_limit == 0 {
            u64::MAX
        } else {
            self.size_limit
        }
    }

    pub fn effective_optimizer_size_limit(&self) -> u64 {
        if self.optimizer_size_limit == 0 {
            OPTIMIZER_MAGIC_CONSTANT
        } else {
            self.optimizer_size_limit
        }
    }

    pub fn refresh(&self) -> Duration {
        if self.refresh_interval == 0 {
            DEFAULT_REFRESH_INTERVAL
        } else {
            Duration::from_millis(self.refresh_interval)
        }
    }

    pub fn time_limit(&self) -> Option<Duration> {
        (self.time_limit > 0).then(|| Duration::from_secs(self.time_limit))
    }

    /// Override fields from `FRAGSLEUTH_*` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_vars(|name| std::env::var(name).ok());
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("FRAGSLEUTH_IN_FILTER") {
            self.in_filter = v;
        }
        if let Some(v) = var("FRAGSLEUTH_EX_FILTER") {
            self.ex_filter = v;
        }
        if let Some(v) = var("FRAGSLEUTH_CUT_FILTER") {
            self.cut_filter = v;
        }
        let size = |name: &str| {
            let raw = var(name)?;
            let parsed = parse_size(&raw);
            if parsed.is_none() {
                tracing::warn!("ignoring {name}={raw}: not a size");
            }
            parsed
        };
        if let Some(v) = size("FRAGSLEUTH_SIZE_LIMIT") {
            self.size_limit = v;
        }
        if let Some(v) = size("FRAGSLEUTH_FRAGMENT_SIZE_THRESHOLD") {
            self.fragment_size_threshold = v;
        }
        if let Some(v) = size("FRAGSLEUTH_OPTIMIZER_SIZE_LIMIT") {
            self.optimizer_size_limit = v;
        }
        if let Some(v) = var("FRAGSLEUTH_FRAGMENTS_THRESHOLD").and_then(|v| v.trim().parse().ok()) {
            self.fragments_limit = v;
        }
        if let Some(v) = var("FRAGSLEUTH_FRAGMENTATION_THRESHOLD")
            .and_then(|v| v.trim().parse().ok())
        {
            self.fragmentation_threshold = v;
        }
        if let Some(v) = var("FRAGSLEUTH_TIME_LIMIT").and_then(|v| parse_duration(&v)) {
            self.time_limit = v.as_secs();
        }
        if let Some(v) = var("FRAGSLEUTH_REFRESH_INTERVAL").and_then(|v| v.trim().parse().ok()) {
            self.refresh_interval = v;
        }
        if let Some(v) = var("FRAGSLEUTH_DRY_RUN") {
            self.dry_run = v.trim() == "1";
        }
        if let Some(v) = var("FRAGSLEUTH_DISABLE_REPORTS") {
            self.disable_reports = v.trim() == "1";
        }
    }
}

/// Parse a duration such as `90`, `1h 30m` or `2d4h` (units `y d h m s`;
/// a bare number is seconds).
pub fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(secs) = text.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let mut total: u64 = 0;
    let mut number = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            number.push(ch);
            continue;
        }
        if ch.is_whitespace() {
            continue;
        }
        let unit: u64 = match ch.to_ascii_lowercase() {
            'y' => 365 * 24 * 3600,
            'd' => 24 * 3600,
            'h' => 3600,
            'm' => 60,
            's' => 1,
            _ => return None,
        };
        let n: u64 = number.parse().ok()?;
        total = total.checked_add(n.checked_mul(unit)?)?;
        number.clear();
    }
    if !number.is_empty() {
        return None;
    }
    Some(Duration::from_secs(total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let opts = JobOptions::default();
        assert_eq!(opts.effective_size_limit(), u64::MAX);
        assert_eq!(opts.effective_optimizer_size_limit(), OPTIMIZER_MAGIC_CONSTANT);
        assert_eq!(opts.refresh(), Duration::from_millis(100));
        assert_eq!(opts.time_limit(), None);
    }

    #[test]
    fn test_json_with_missing_fields() {
        let opts: JobOptions =
            serde_json::from_str(r#"{ "ex_filter": "*temp*", "dry_run": true }"#).unwrap();
        assert_eq!(opts.ex_filter, "*temp*");
        assert!(opts.dry_run);
        assert_eq!(opts.refresh_interval, 100);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("1h 30m"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration("2d4h"), Some(Duration::from_secs(187_200)));
        assert_eq!(parse_duration("5x"), None);
        assert_eq!(parse_duration("h"), None);
        assert_eq!(parse_duration("12"), Some(Duration::from_secs(12)));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("FRAGSLEUTH_SIZE_LIMIT", "1G"),
            ("FRAGSLEUTH_FRAGMENT_SIZE_THRESHOLD", "bogus"),
            ("FRAGSLEUTH_TIME_LIMIT", "1m"),
            ("FRAGSLEUTH_DRY_RUN", "1"),
            ("FRAGSLEUTH_EX_FILTER", "*.iso;*.vhd"),
        ]
        .into_iter()
        .collect();
        let mut opts = JobOptions::default();
        opts.apply_vars(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(opts.size_limit, 1 << 30);
        assert_eq!(opts.fragment_size_threshold, 0);
        assert_eq!(opts.time_limit, 60);
        assert!(opts.dry_run);
        assert_eq!(opts.ex_filter, "*.iso;*.vhd");
    }
}
