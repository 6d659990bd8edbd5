//! Version ordering for image tags
//!
//! Image tags do not follow any single versioning scheme, so the comparator
//! is table-driven: operators configure alias tags that always sort last
//! ("latest", "nightly"), and a suffix table that ranks pre-release markers
//! ("rc" below "GA", both relative to a bare version).

use std::cmp::Ordering;

/// Default delimiter between a version token and its suffix (`1.0_rc`).
pub const DEFAULT_SUFFIX_DELIMITER: char = '_';

/// Total order over version strings.
#[derive(Debug, Clone)]
pub struct VersionComparator {
    /// Tags treated as greater than any ordinary version. Later entries
    /// outrank earlier ones.
    aliases: Vec<String>,

    /// Known suffixes in ascending order ("rc" before "GA" means rc < GA).
    suffixes: Vec<String>,

    /// Delimiter splitting an end-token into (prefix, suffix).
    delimiter: char,

    /// Whether a missing suffix ranks above every known suffix ("1.0" is a
    /// release, "1.0_rc" a pre-release) or below.
    empty_suffix_last: bool,
}

impl Default for VersionComparator {
    fn default() -> Self {
        Self {
            aliases: vec!["latest".to_string()],
            suffixes: Vec::new(),
            delimiter: DEFAULT_SUFFIX_DELIMITER,
            empty_suffix_last: true,
        }
    }
}

impl VersionComparator {
    pub fn new(aliases: Vec<String>, suffixes: Vec<String>, empty_suffix_last: bool) -> Self {
        Self {
            aliases,
            suffixes,
            delimiter: DEFAULT_SUFFIX_DELIMITER,
            empty_suffix_last,
        }
    }

    /// Override the suffix delimiter (defaults to `_`).
    pub fn with_delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Compare two optional version strings. `None` is strictly less than
    /// any version; `None` vs `None` is equal.
    pub fn compare(&self, a: Option<&str>, b: Option<&str>) -> Ordering {
        match (a, b) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => self.compare_versions(a, b),
        }
    }

    /// Pick the greatest version out of an iterator of tags.
    pub fn max<'a>(&self, tags: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
        tags.into_iter()
            .max_by(|a, b| self.compare_versions(a, b))
    }

    fn alias_rank(&self, v: &str) -> Option<usize> {
        self.aliases.iter().position(|a| a == v)
    }

    fn suffix_rank(&self, s: &str) -> Option<usize> {
        self.suffixes.iter().position(|k| k == s)
    }

    fn compare_versions(&self, a: &str, b: &str) -> Ordering {
        match (self.alias_rank(a), self.alias_rank(b)) {
            (Some(ra), Some(rb)) => return ra.cmp(&rb),
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (None, None) => {}
        }

        let ta: Vec<&str> = a.split('.').collect();
        let tb: Vec<&str> = b.split('.').collect();
        let shared = ta.len().min(tb.len());

        // All but the last shared token compare as plain tokens; the last
        // shared token may carry a suffix on either side.
        for i in 0..shared.saturating_sub(1) {
            let ord = compare_token(ta[i], tb[i]);
            if ord != Ordering::Equal {
                return ord;
            }
        }

        let ord = self.compare_end_token(ta[shared - 1], tb[shared - 1]);
        if ord != Ordering::Equal {
            return ord;
        }

        // Equal so far: the side with extra tokens is the later version.
        ta.len().cmp(&tb.len())
    }

    fn compare_end_token(&self, a: &str, b: &str) -> Ordering {
        let (pa, sa) = split_suffix(a, self.delimiter);
        let (pb, sb) = split_suffix(b, self.delimiter);

        let ord = compare_token(pa, pb);
        if ord != Ordering::Equal {
            return ord;
        }
        self.compare_suffix(sa, sb)
    }

    fn compare_suffix(&self, a: &str, b: &str) -> Ordering {
        if a == b {
            return Ordering::Equal;
        }
        if a.is_empty() {
            return if self.empty_suffix_last {
                Ordering::Greater
            } else {
                Ordering::Less
            };
        }
        if b.is_empty() {
            return if self.empty_suffix_last {
                Ordering::Less
            } else {
                Ordering::Greater
            };
        }
        match (self.suffix_rank(a), self.suffix_rank(b)) {
            (Some(ra), Some(rb)) => ra.cmp(&rb),
            // A tabled suffix outranks an unknown one.
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => a.cmp(b),
        }
    }
}

fn split_suffix(token: &str, delimiter: char) -> (&str, &str) {
    match token.split_once(delimiter) {
        Some((prefix, suffix)) => (prefix, suffix),
        None => (token, ""),
    }
}

/// Numeric tokens compare numerically and outrank non-numeric tokens;
/// everything else is lexicographic.
fn compare_token(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(na), Ok(nb)) => na.cmp(&nb),
        (Ok(_), Err(_)) => Ordering::Greater,
        (Err(_), Ok(_)) => Ordering::Less,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain() -> VersionComparator {
        VersionComparator::new(vec![], vec![], true)
    }

    #[test]
    fn test_numeric_tokens() {
        let cmp = plain();
        assert_eq!(cmp.compare(Some("1.10"), Some("1.9")), Ordering::Greater);
        assert_eq!(cmp.compare(Some("1.9"), Some("1.10")), Ordering::Less);
        assert_eq!(cmp.compare(Some("2.0"), Some("2.0")), Ordering::Equal);
        assert_eq!(cmp.compare(Some("1.2.1"), Some("1.2")), Ordering::Greater);
    }

    #[test]
    fn test_latest_alias() {
        let cmp = VersionComparator::new(vec!["latest".into()], vec![], true);
        assert_eq!(cmp.compare(Some("latest"), Some("9.9.9")), Ordering::Greater);
        assert_eq!(cmp.compare(Some("9.9.9"), Some("latest")), Ordering::Less);
        assert_eq!(cmp.compare(Some("latest"), Some("latest")), Ordering::Equal);
    }

    #[test]
    fn test_alias_table_position() {
        let cmp = VersionComparator::new(vec!["latest".into(), "nightly".into()], vec![], true);
        assert_eq!(cmp.compare(Some("nightly"), Some("latest")), Ordering::Greater);
    }

    #[test]
    fn test_suffix_table() {
        let cmp = VersionComparator::new(vec![], vec!["rc".into(), "GA".into()], true);
        assert_eq!(cmp.compare(Some("1.0_rc"), Some("1.0_GA")), Ordering::Less);
        assert_eq!(cmp.compare(Some("1.0"), Some("1.0_rc")), Ordering::Greater);
    }

    #[test]
    fn test_empty_suffix_first() {
        let cmp = VersionComparator::new(vec![], vec!["rc".into()], false);
        assert_eq!(cmp.compare(Some("1.0"), Some("1.0_rc")), Ordering::Less);
    }

    #[test]
    fn test_null_ordering() {
        let cmp = plain();
        assert_eq!(cmp.compare(None, None), Ordering::Equal);
        assert_eq!(cmp.compare(None, Some("1.0")), Ordering::Less);
        assert_eq!(cmp.compare(Some("1.0"), None), Ordering::Greater);
    }

    #[test]
    fn test_sort_idempotence() {
        let cmp = VersionComparator::new(vec!["latest".into()], vec!["rc".into(), "GA".into()], true);
        let mut once = vec!["1.0", "latest", "2.0_rc", "1.10", "1.9", "2.0_GA", "2.0"];
        once.sort_by(|a, b| cmp.compare(Some(a), Some(b)));
        let mut twice = once.clone();
        twice.sort_by(|a, b| cmp.compare(Some(a), Some(b)));
        assert_eq!(once, twice);
        assert_eq!(*once.last().unwrap(), "latest");
    }

    #[test]
    fn test_reconciler_selection() {
        let tags = ["1.0", "1.1", "2.0_rc", "latest"];

        let with_alias = VersionComparator::new(vec!["latest".into()], vec!["rc".into()], true);
        assert_eq!(with_alias.max(tags.iter().copied()), Some("latest"));

        let no_alias = VersionComparator::new(vec![], vec!["rc".into()], true);
        assert_eq!(no_alias.max(tags.iter().copied()), Some("2.0_rc"));
    }
}
