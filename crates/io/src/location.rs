use std::{
    fmt::{self, Display, Formatter},
    path::{Path, PathBuf},
    sync::Arc,
};

use regex::Regex;

use crate::error::InvalidLocationError;

/// Characters that make a key or path a wildcard pattern.
pub const WILDCARD_CHARS: [char; 2] = ['*', '?'];

const S3_SCHEME: &str = "s3://";

/// A source or destination of a transfer: either an object in an
/// S3-compatible store or a path on the local filesystem.
///
/// Locations are immutable after construction; all derived fields (prefix,
/// filter, delimiter, match pattern) are computed once. Cloning is cheap,
/// the compiled pattern is shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Local(LocalLocation),
    S3(S3Location),
}

impl Location {
    /// Parse a location string. Anything that does not start with `s3://`
    /// is a local path.
    ///
    /// # Errors
    /// Fails if a remote location has an empty bucket or a bucket containing
    /// wildcard characters.
    pub fn parse(raw: impl AsRef<str>) -> Result<Self, InvalidLocationError> {
        let raw = raw.as_ref();
        if let Some(rest) = raw.strip_prefix(S3_SCHEME) {
            Ok(Location::S3(S3Location::parse(rest, raw)?))
        } else {
            Ok(Location::Local(LocalLocation::new(raw)))
        }
    }

    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self, Location::S3(_))
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self, Location::Local(_))
    }

    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        match self {
            Location::S3(s3) => s3.is_wildcard(),
            Location::Local(local) => local.is_wildcard(),
        }
    }

    /// The last path component, used as the destination name when a batch
    /// operation runs without `parents`.
    #[must_use]
    pub fn basename(&self) -> String {
        let raw = match self {
            Location::S3(s3) => s3.key(),
            Location::Local(local) => local.as_str(),
        };
        let trimmed = raw.trim_end_matches('/');
        trimmed
            .rsplit('/')
            .next()
            .unwrap_or(trimmed)
            .to_string()
    }

    #[must_use]
    pub fn as_s3(&self) -> Option<&S3Location> {
        match self {
            Location::S3(s3) => Some(s3),
            Location::Local(_) => None,
        }
    }

    #[must_use]
    pub fn as_local(&self) -> Option<&LocalLocation> {
        match self {
            Location::Local(local) => Some(local),
            Location::S3(_) => None,
        }
    }

    /// Append a relative path, keeping the location's kind. Used by the
    /// batch expander to derive per-object destinations.
    ///
    /// # Errors
    /// Fails if the joined remote key would be invalid.
    pub fn join(&self, relative: &str) -> Result<Self, InvalidLocationError> {
        match self {
            Location::S3(s3) => Ok(Location::S3(s3.join(relative)?)),
            Location::Local(local) => Ok(Location::Local(local.join(relative))),
        }
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Location::S3(s3) => Display::fmt(s3, f),
            Location::Local(local) => Display::fmt(local, f),
        }
    }
}

impl std::str::FromStr for Location {
    type Err = InvalidLocationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Location::parse(s)
    }
}

/// An `s3://bucket/key` location. The key may contain `*` and `?` wildcards;
/// the bucket may not.
#[derive(Debug, Clone)]
pub struct S3Location {
    bucket: String,
    key: String,
    prefix: String,
    filter: String,
    delimiter: &'static str,
    pattern: Arc<Regex>,
}

impl PartialEq for S3Location {
    fn eq(&self, other: &Self) -> bool {
        self.bucket == other.bucket && self.key == other.key
    }
}

impl Eq for S3Location {}

impl S3Location {
    /// Build a remote location from bucket and key.
    ///
    /// # Errors
    /// Fails if the bucket is empty, contains `/`, or contains wildcards.
    pub fn new(
        bucket: impl Into<String>,
        key: impl Into<String>,
    ) -> Result<Self, InvalidLocationError> {
        let bucket = bucket.into();
        let key = key.into();

        validate_bucket_name(&bucket)
            .map_err(|reason| InvalidLocationError::new(format!("s3://{bucket}/{key}"), reason))?;

        let (prefix, filter) = match key.find(WILDCARD_CHARS) {
            Some(idx) => (key[..idx].to_string(), key[idx..].to_string()),
            None => (key.clone(), String::new()),
        };
        let delimiter = if filter.is_empty() { "/" } else { "" };

        let source = if filter.is_empty() {
            format!("^{}.*$", regex::escape(&prefix))
        } else {
            format!("^{}{}$", regex::escape(&prefix), wildcard_to_regex(&filter))
        };
        let pattern = Regex::new(&source).map_err(|e| {
            InvalidLocationError::new(
                format!("s3://{bucket}/{key}"),
                format!("could not compile match pattern: {e}"),
            )
        })?;

        Ok(Self {
            bucket,
            key,
            prefix,
            filter,
            delimiter,
            pattern: Arc::new(pattern),
        })
    }

    fn parse(rest: &str, raw: &str) -> Result<Self, InvalidLocationError> {
        let (bucket, key) = match rest.split_once('/') {
            Some((bucket, key)) => (bucket, key),
            None => (rest, ""),
        };
        if bucket.is_empty() {
            return Err(InvalidLocationError::new(raw, "bucket name is empty"));
        }
        Self::new(bucket, key)
    }

    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Longest wildcard-free initial segment of the key. `prefix + filter`
    /// reassembles the key exactly.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Wildcard-bearing suffix of the key, empty for literal keys.
    #[must_use]
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// `/` for literal keys (hierarchical listing), empty for wildcards
    /// (flat listing, filtered through the match pattern).
    #[must_use]
    pub fn delimiter(&self) -> &'static str {
        self.delimiter
    }

    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        !self.filter.is_empty()
    }

    /// True when the location names only a bucket.
    #[must_use]
    pub fn is_bucket(&self) -> bool {
        self.key.is_empty()
    }

    /// Match a listed key against this location's pattern. Returns the
    /// relativized key on a match, `None` otherwise.
    ///
    /// For wildcard locations the relative key starts at the final path
    /// component of the prefix (`s3://b/a/b/c/*` matches `a/b/c/x/y` as
    /// `c/x/y`). For literal locations it is the first path segment after
    /// the prefix, which collapses hierarchy the way a delimiter listing
    /// does (`s3://b/a/b/` matches `a/b/sub/x` as `sub/`).
    #[must_use]
    pub fn match_key(&self, key: &str) -> Option<String> {
        if !self.pattern.is_match(key) {
            return None;
        }
        if self.is_wildcard() {
            Some(self.relative_to_prefix(key))
        } else {
            Some(self.first_segment_after_prefix(key))
        }
    }

    /// Strip the prefix up to but excluding its final path component.
    #[must_use]
    pub fn relative_to_prefix(&self, key: &str) -> String {
        let base = self.prefix.trim_end_matches('/');
        let cut = base.rfind('/').map_or(0, |idx| idx + 1);
        key.get(cut..).unwrap_or(key).to_string()
    }

    fn first_segment_after_prefix(&self, key: &str) -> String {
        if key == self.prefix {
            return key.to_string();
        }
        let rel = key.strip_prefix(&self.prefix).unwrap_or(key);
        match rel.find('/') {
            Some(idx) => rel[..=idx].to_string(),
            None => rel.to_string(),
        }
    }

    /// Append a relative key below this location.
    ///
    /// # Errors
    /// Fails if this location is a wildcard.
    pub fn join(&self, relative: &str) -> Result<Self, InvalidLocationError> {
        if self.is_wildcard() {
            return Err(InvalidLocationError::new(
                self.to_string(),
                "cannot join onto a wildcard location",
            ));
        }
        let mut key = self.key.clone();
        if !key.is_empty() && !key.ends_with('/') {
            key.push('/');
        }
        key.push_str(relative);
        Self::new(self.bucket.clone(), key)
    }
}

impl Display for S3Location {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.key.is_empty() {
            write!(f, "{S3_SCHEME}{}", self.bucket)
        } else {
            write!(f, "{S3_SCHEME}{}/{}", self.bucket, self.key)
        }
    }
}

/// A path on the local filesystem, possibly carrying wildcards for batch
/// uploads (`./logs/*.gz`).
#[derive(Debug, Clone)]
pub struct LocalLocation {
    raw: String,
    prefix: String,
    pattern: Option<Arc<Regex>>,
}

impl PartialEq for LocalLocation {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for LocalLocation {}

impl LocalLocation {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let (prefix, pattern) = match raw.find(WILDCARD_CHARS) {
            Some(idx) => {
                let prefix = raw[..idx].to_string();
                let source = format!(
                    "^{}{}$",
                    regex::escape(&prefix),
                    wildcard_to_regex(&raw[idx..])
                );
                // The translation only emits valid regex syntax.
                let pattern = Regex::new(&source).ok().map(Arc::new);
                (prefix, pattern)
            }
            None => (raw.clone(), None),
        };
        Self {
            raw,
            prefix,
            pattern,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The concrete path. Only meaningful for non-wildcard locations.
    #[must_use]
    pub fn path(&self) -> &Path {
        Path::new(&self.raw)
    }

    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.pattern.is_some()
    }

    /// Deepest directory that can be walked without evaluating wildcards.
    #[must_use]
    pub fn walk_root(&self) -> PathBuf {
        if !self.is_wildcard() {
            return PathBuf::from(&self.raw);
        }
        match self.prefix.rfind('/') {
            Some(idx) => PathBuf::from(&self.prefix[..=idx]),
            None => PathBuf::from("."),
        }
    }

    /// Match a walked path against the wildcard pattern. Non-wildcard
    /// locations match everything under their root.
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        match &self.pattern {
            Some(pattern) => pattern.is_match(path),
            None => true,
        }
    }

    /// Strip the wildcard-free prefix up to but excluding its final path
    /// component, mirroring the remote relativization rule.
    #[must_use]
    pub fn relative_to_prefix(&self, path: &str) -> String {
        let base = self.prefix.trim_end_matches('/');
        let cut = base.rfind('/').map_or(0, |idx| idx + 1);
        path.get(cut..).unwrap_or(path).to_string()
    }

    #[must_use]
    pub fn join(&self, relative: &str) -> Self {
        Self::new(
            Path::new(&self.raw)
                .join(relative)
                .to_string_lossy()
                .into_owned(),
        )
    }
}

impl Display for LocalLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Validate an S3 bucket name. Wildcards are rejected so that expansion is
/// always scoped to exactly one bucket.
///
/// # Errors
/// Returns the reason the name is invalid.
pub fn validate_bucket_name(bucket: &str) -> Result<(), String> {
    if bucket.is_empty() {
        return Err("bucket name is empty".to_string());
    }
    if bucket.contains(WILDCARD_CHARS) {
        return Err("bucket name cannot contain wildcard characters".to_string());
    }
    if bucket.contains('/') {
        return Err("bucket name cannot contain `/`".to_string());
    }
    Ok(())
}

/// Translate a wildcard expression into regex syntax: `?` matches a single
/// character, `*` matches lazily across path boundaries, everything else is
/// literal.
fn wildcard_to_regex(filter: &str) -> String {
    let mut out = String::with_capacity(filter.len() * 2);
    for c in filter.chars() {
        match c {
            '?' => out.push('.'),
            '*' => out.push_str(".*?"),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn s3(raw: &str) -> S3Location {
        match Location::parse(raw).unwrap() {
            Location::S3(s3) => s3,
            Location::Local(_) => panic!("expected a remote location"),
        }
    }

    #[test]
    fn test_parse_display_roundtrip() {
        for raw in [
            "s3://bucket",
            "s3://bucket/key",
            "s3://bucket/a/b/c",
            "s3://bucket/pre*",
            "s3://bucket/a/b/*.gz",
            "s3://bucket/a/?/c",
        ] {
            let location = Location::parse(raw).unwrap();
            assert_eq!(raw, location.to_string());
            assert_eq!(location, Location::parse(location.to_string()).unwrap());
        }
    }

    #[test]
    fn test_prefix_filter_reassemble_key() {
        for raw in ["s3://b/a/b/c", "s3://b/a/*/c", "s3://b/x?y", "s3://b"] {
            let url = s3(raw);
            assert_eq!(format!("{}{}", url.prefix(), url.filter()), url.key());
        }
    }

    #[test]
    fn test_bucket_only_location() {
        let url = s3("s3://bucket");
        assert_eq!(url.key(), "");
        assert_eq!(url.prefix(), "");
        assert_eq!(url.delimiter(), "/");
        assert!(url.is_bucket());
        assert!(url.match_key("any/key/at/all").is_some());
    }

    #[test]
    fn test_delimiter_rule() {
        assert_eq!(s3("s3://b/a/b/c").delimiter(), "/");
        assert_eq!(s3("s3://b/a/b/*").delimiter(), "");
        assert_eq!(s3("s3://b/a?c").delimiter(), "");
    }

    #[test]
    fn test_wildcard_match_and_relative() {
        let url = s3("s3://b/pre*");
        assert_eq!(url.match_key("pre/x/y").as_deref(), Some("pre/x/y"));
        assert_eq!(url.match_key("other"), None);
    }

    #[test]
    fn test_wildcard_relative_keeps_final_prefix_component() {
        let url = s3("s3://b/a/b/c/*");
        assert_eq!(url.match_key("a/b/c/x/y").as_deref(), Some("c/x/y"));
        assert_eq!(url.relative_to_prefix("a/b/c/x/y"), "c/x/y");
    }

    #[test]
    fn test_question_mark_matches_single_character() {
        let url = s3("s3://b/file-?.txt");
        assert!(url.match_key("file-1.txt").is_some());
        assert!(url.match_key("file-10.txt").is_none());
    }

    #[test]
    fn test_literal_prefix_match_collapses_hierarchy() {
        let url = s3("s3://b/a/b/");
        assert_eq!(url.match_key("a/b/file.txt").as_deref(), Some("file.txt"));
        assert_eq!(url.match_key("a/b/sub/").as_deref(), Some("sub/"));
        assert_eq!(url.match_key("a/b/sub/deep.txt").as_deref(), Some("sub/"));
        assert_eq!(url.match_key("a/other/file.txt"), None);
    }

    #[test]
    fn test_wildcard_bucket_is_rejected() {
        assert!(Location::parse("s3://buck*t/key").is_err());
        assert!(Location::parse("s3://buck?t").is_err());
        assert!(Location::parse("s3://").is_err());
    }

    #[test]
    fn test_regex_metacharacters_in_keys_are_literal() {
        let url = s3("s3://b/logs/app.2024-01-01.log*");
        assert!(url.match_key("logs/app.2024-01-01.log.gz").is_some());
        assert!(url.match_key("logs/appX2024-01-01Xlog.gz").is_none());
    }

    #[test]
    fn test_join_remote() {
        let url = s3("s3://b/out");
        assert_eq!(url.join("x/y").unwrap().key(), "out/x/y");
        assert_eq!(s3("s3://b/out/").join("z").unwrap().key(), "out/z");
        assert_eq!(s3("s3://b").join("z").unwrap().key(), "z");
        assert!(s3("s3://b/out/*").join("z").is_err());
    }

    #[test]
    fn test_local_location() {
        let location = Location::parse("/tmp/data/file.txt").unwrap();
        assert!(location.is_local());
        assert!(!location.is_wildcard());
        assert_eq!(location.basename(), "file.txt");
        assert_eq!(location.to_string(), "/tmp/data/file.txt");
    }

    #[test]
    fn test_local_wildcard_walk_root_and_match() {
        let local = LocalLocation::new("/var/log/*.gz");
        assert!(local.is_wildcard());
        assert_eq!(local.walk_root(), PathBuf::from("/var/log/"));
        assert!(local.matches("/var/log/syslog.1.gz"));
        assert!(!local.matches("/var/log/syslog.1"));

        let bare = LocalLocation::new("*.txt");
        assert_eq!(bare.walk_root(), PathBuf::from("."));
    }

    #[test]
    fn test_local_relative_to_prefix() {
        let dir = LocalLocation::new("/data/logs/");
        assert_eq!(dir.relative_to_prefix("/data/logs/sub/f.txt"), "logs/sub/f.txt");

        let glob = LocalLocation::new("/var/log/*.gz");
        assert_eq!(glob.relative_to_prefix("/var/log/syslog.1.gz"), "log/syslog.1.gz");

        let bare = LocalLocation::new("*.txt");
        assert_eq!(bare.relative_to_prefix("a.txt"), "a.txt");
    }

    #[test]
    fn test_basename() {
        assert_eq!(Location::parse("s3://b/a/b/c.txt").unwrap().basename(), "c.txt");
        assert_eq!(Location::parse("s3://b/a/b/").unwrap().basename(), "b");
        assert_eq!(Location::parse("dir/file").unwrap().basename(), "file");
    }
}
