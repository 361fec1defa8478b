//! Environment-tunable FUSE driver parameters.

/// Default dwarfs block cache size.
pub const DWARFS_CACHESIZE: &str = "256M";

/// Default dwarfs block size.
pub const DWARFS_BLOCKSIZE: &str = "256K";

/// Default dwarfs readahead.
pub const DWARFS_READAHEAD: &str = "32M";

/// Tuning values handed to the mount templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuning {
    pub cachesize: String,
    pub blocksize: String,
    pub readahead: String,
    pub workers: String,
    pub fuse_debug: bool,
}

impl Tuning {
    /// Read overrides through `lookup`, falling back to built-in defaults.
    ///
    /// Each override may be a comma-separated list; only the first element is used.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .to_string();

        Self {
            cachesize: first_value(&lookup, "DWARFS_CACHESIZE")
                .unwrap_or_else(|| DWARFS_CACHESIZE.to_string()),
            blocksize: first_value(&lookup, "DWARFS_BLOCKSIZE")
                .unwrap_or_else(|| DWARFS_BLOCKSIZE.to_string()),
            readahead: first_value(&lookup, "DWARFS_READAHEAD")
                .unwrap_or_else(|| DWARFS_READAHEAD.to_string()),
            workers: first_value(&lookup, "DWARFS_WORKERS").unwrap_or(default_workers),
            fuse_debug: lookup("ENABLE_FUSE_DEBUG").is_some_and(|v| !v.is_empty()),
        }
    }
}

fn first_value(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    let raw = lookup(key)?;
    let first = raw.split(',').next()?.trim();
    if first.is_empty() {
        None
    } else {
        Some(first.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let tuning = Tuning::from_lookup(lookup_from(&[]));
        assert_eq!(tuning.cachesize, DWARFS_CACHESIZE);
        assert_eq!(tuning.blocksize, DWARFS_BLOCKSIZE);
        assert_eq!(tuning.readahead, DWARFS_READAHEAD);
        assert!(tuning.workers.parse::<usize>().unwrap() >= 1);
        assert!(!tuning.fuse_debug);
    }

    #[test]
    fn test_first_comma_separated_value_wins() {
        let tuning = Tuning::from_lookup(lookup_from(&[
            ("DWARFS_CACHESIZE", "512M,1G"),
            ("DWARFS_WORKERS", "4, 8"),
            ("ENABLE_FUSE_DEBUG", "1"),
        ]));
        assert_eq!(tuning.cachesize, "512M");
        assert_eq!(tuning.workers, "4");
        assert!(tuning.fuse_debug);
    }

    #[test]
    fn test_empty_override_falls_back() {
        let tuning = Tuning::from_lookup(lookup_from(&[("DWARFS_BLOCKSIZE", ",64K")]));
        assert_eq!(tuning.blocksize, DWARFS_BLOCKSIZE);
    }
}
