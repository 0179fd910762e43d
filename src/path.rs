//! Parse `s3://bucket/key` URIs into `(bucket, key)` pairs.
//!
//! Grounded on `sourcefrog-conserve/src/transport/s3.rs`, which pulls the
//! bucket out of `Url::authority()` and the key out of `Url::path()`
//! (stripping the leading `/`); this module formalizes that into a
//! standalone, I/O-free parser with an `allow_empty_key` switch for callers
//! that want to address the bucket itself rather than a key within it.

use url::Url;

use crate::error::{Error, Result};

/// Split `s3://bucket/key` into its bucket and key. `allow_empty_key`
/// permits a URI with no key (meaning "the bucket itself"); without it, an
/// empty key after stripping the leading `/` is a parse error.
pub fn parse(path: &str, allow_empty_key: bool) -> Result<(String, String)> {
    let url = Url::parse(path)
        .map_err(|err| Error::with_source(crate::error::ErrorKind::InvalidArgument, path, err))?;
    if url.scheme() != "s3" {
        return Err(Error::invalid_argument(format!(
            "not an s3:// URI: {path:?}"
        )));
    }
    let bucket = url.host_str().unwrap_or_default().to_owned();
    if bucket.is_empty() || bucket == "." {
        return Err(Error::invalid_argument(format!(
            "empty or invalid bucket in {path:?}"
        )));
    }
    let key = url.path().strip_prefix('/').unwrap_or_else(|| url.path());
    if key.is_empty() && !allow_empty_key {
        return Err(Error::invalid_argument(format!(
            "missing key in {path:?}"
        )));
    }
    Ok((bucket, key.to_owned()))
}

/// Join a directory-style prefix with a name, the way `list` and `rename`
/// need to when rewriting keys under a prefix. Never produces a doubled
/// slash or a leading slash, mirroring `join_paths` in
/// `sourcefrog-conserve/src/transport/s3.rs`.
pub fn join(prefix: &str, name: &str) -> String {
    if name.is_empty() {
        return prefix.to_owned();
    }
    if prefix.is_empty() {
        return name.to_owned();
    }
    let mut joined = prefix.to_owned();
    if !joined.ends_with('/') {
        joined.push('/');
    }
    joined.push_str(name);
    joined
}

/// Ensure a directory-style key ends in exactly one trailing `/`, the
/// canonical directory-marker form this crate uses throughout.
pub fn ensure_trailing_slash(key: &str) -> String {
    if key.is_empty() || key.ends_with('/') {
        key.to_owned()
    } else {
        format!("{key}/")
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use rstest::rstest;

    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn parse_bucket_and_key() {
        assert_eq!(
            parse("s3://my-bucket/a/b/c", false).unwrap(),
            ("my-bucket".to_owned(), "a/b/c".to_owned())
        );
    }

    #[test]
    fn parse_requires_key_unless_allowed() {
        assert!(parse("s3://b", false).is_err());
        assert_eq!(
            parse("s3://b", true).unwrap(),
            ("b".to_owned(), String::new())
        );
    }

    #[rstest]
    #[case::empty_bucket("s3:///k")]
    #[case::dot_bucket("s3://./k")]
    fn parse_rejects_invalid_bucket(#[case] uri: &str) {
        let err = parse(uri, false).unwrap_err();
        assert_matches!(err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn parse_rejects_non_s3_scheme() {
        let err = parse("http://b/k", false).unwrap_err();
        assert_matches!(err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn join_handles_empty_sides() {
        assert_eq!(join("", "a"), "a");
        assert_eq!(join("a", ""), "a");
        assert_eq!(join("a", "b"), "a/b");
        assert_eq!(join("a/", "b"), "a/b");
    }

    #[test]
    fn trailing_slash_is_idempotent() {
        assert_eq!(ensure_trailing_slash("dir"), "dir/");
        assert_eq!(ensure_trailing_slash("dir/"), "dir/");
        assert_eq!(ensure_trailing_slash(""), "");
    }
}
