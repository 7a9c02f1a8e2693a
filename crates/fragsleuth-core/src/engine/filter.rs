/// File filters applied during analysis and re-applied after every move.
///
/// Path patterns are globs matched case-insensitively against the whole
/// path (without the `\??\` prefix) and separated by `;`. `*` crosses
/// directory boundaries. Double quotes are stripped, so `"C:\My Files\*"`
/// works.
use crate::model::{Disposition, FileFlags, FileRecord};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use tracing::warn;

/// A parsed `;`-separated list of glob patterns.
#[derive(Debug, Clone)]
pub struct PatternList {
    /// Patterns as given, quotes removed.
    patterns: Vec<String>,
    set: GlobSet,
}

impl Default for PatternList {
    fn default() -> Self {
        Self {
            patterns: Vec::new(),
            set: GlobSet::empty(),
        }
    }
}

impl PatternList {
    pub fn parse(text: &str) -> Self {
        let patterns: Vec<String> = text
            .split(';')
            .map(|p| p.replace('"', "").trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();

        let mut builder = GlobSetBuilder::new();
        for pattern in &patterns {
            let glob = GlobBuilder::new(&to_slashes(pattern))
                .case_insensitive(true)
                .literal_separator(false)
                .backslash_escape(false)
                .build();
            match glob {
                Ok(glob) => {
                    builder.add(glob);
                }
                Err(err) => warn!("ignoring invalid path pattern '{pattern}': {err}"),
            }
        }
        let set = builder.build().unwrap_or_else(|err| {
            warn!("cannot compile path patterns '{text}': {err}");
            GlobSet::empty()
        });
        Self { patterns, set }
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.patterns.get(index).map(String::as_str)
    }

    /// `true` if any pattern matches `path`.
    pub fn matches(&self, path: &str) -> bool {
        !self.set.is_empty() && self.set.is_match(to_slashes(path))
    }
}

/// Patterns and candidates both use `/` as the separator on every host.
fn to_slashes(text: &str) -> String {
    text.replace('\\', "/")
}

/// Include, exclude and cut lists of a job.
#[derive(Debug, Clone, Default)]
pub struct PathFilters {
    pub include: PatternList,
    pub exclude: PatternList,
    pub cut: PatternList,
}

impl PathFilters {
    pub fn new(include: &str, exclude: &str, cut: &str) -> Self {
        Self {
            include: PatternList::parse(include),
            exclude: PatternList::parse(exclude),
            cut: PatternList::parse(cut),
        }
    }

    /// `true` if the file must be skipped because of its path.
    pub fn excludes(&self, file: &FileRecord) -> bool {
        let Some(path) = file.path.get(4..) else {
            return true;
        };
        if self.exclude.matches(path) {
            return true;
        }
        if !self.cut.is_empty() && !self.cut.matches(path) {
            return true;
        }
        !self.include.is_empty() && !self.include.matches(path)
    }
}

/// Marks the file `OVER_LIMIT` when it is larger than `size_limit` bytes.
pub fn exclude_by_size(file: &mut FileRecord, size_limit: u64, bytes_per_cluster: u64) -> bool {
    let over = file.size_bytes(bytes_per_cluster) > size_limit;
    file.flags.set(FileFlags::OVER_LIMIT, over);
    over
}

pub fn exclude_by_fragments(disposition: &Disposition, fragments_limit: u64) -> bool {
    fragments_limit != 0 && disposition.fragments < fragments_limit
}

/// `true` when every fragment is at least `threshold` bytes long.
///
/// `None` disables the filter.
pub fn exclude_by_fragment_size(
    disposition: &Disposition,
    threshold: Option<u64>,
    bytes_per_cluster: u64,
) -> bool {
    let Some(threshold) = threshold else {
        return false;
    };
    if disposition.is_empty() {
        return false;
    }
    !disposition
        .to_fragments()
        .iter()
        .any(|f| f.length * bytes_per_cluster < threshold)
}
