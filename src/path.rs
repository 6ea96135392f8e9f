//! Slash-path utilities for archive entry paths.
//!
//! Archive paths are always relative, forward-slash separated, UTF-8 and
//! free of `.`/`..` segments — distinct from [`std::path::Path`], which is
//! platform-dependent and happily represents absolute paths and traversal
//! segments.

/// Why a user-supplied path was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathErrorKind {
    Invalid(String),
    NotExist,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathError {
    pub op: &'static str,
    pub path: String,
    pub kind: PathErrorKind,
}

impl PathError {
    pub fn invalid(op: &'static str, path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            op,
            path: path.into(),
            kind: PathErrorKind::Invalid(reason.into()),
        }
    }

    pub fn not_exist(op: &'static str, path: impl Into<String>) -> Self {
        Self {
            op,
            path: path.into(),
            kind: PathErrorKind::NotExist,
        }
    }
}

impl std::fmt::Display for PathError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            PathErrorKind::Invalid(reason) => {
                write!(f, "{}: invalid path {:?}: {}", self.op, self.path, reason)
            }
            PathErrorKind::NotExist => write!(f, "{}: path {:?} does not exist", self.op, self.path),
        }
    }
}

impl std::error::Error for PathError {}

/// Validates a path as a well-formed archive entry path: non-empty, no
/// leading or trailing slash, no empty/`.`/`..` components, UTF-8 (implied
/// by `&str`).
///
/// `"."` is accepted as a special case meaning "the archive root" — callers
/// that don't want to accept it (entry paths) should reject it explicitly.
pub fn validate(op: &'static str, path: &str) -> Result<(), PathError> {
    if path.is_empty() {
        return Err(PathError::invalid(op, path, "empty path"));
    }
    if path == "." {
        return Ok(());
    }
    if path.starts_with('/') || path.ends_with('/') {
        return Err(PathError::invalid(op, path, "must not start or end with '/'"));
    }
    if path.contains('\\') {
        return Err(PathError::invalid(op, path, "backslashes are not allowed"));
    }
    for component in path.split('/') {
        match component {
            "" => return Err(PathError::invalid(op, path, "empty path component")),
            "." | ".." => {
                return Err(PathError::invalid(op, path, "'.' and '..' segments are not allowed"))
            }
            _ => {}
        }
    }
    Ok(())
}

/// Returns the final slash-separated component of `path` ("" and "." both
/// yield "").
pub fn base(path: &str) -> &str {
    if path == "." {
        return "";
    }
    match path.rsplit_once('/') {
        Some((_, last)) => last,
        None => path,
    }
}

/// Returns everything before the final slash-separated component, or `"."`
/// if there is none.
pub fn dir(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => parent,
        Some(_) => ".",
        None => ".",
    }
}

/// True if `path` is `prefix` itself, or nested under it. An empty prefix
/// matches everything. A non-empty prefix is normalized to end in `/` for
/// the comparison so `"assets"` doesn't match `"assets2/x"`.
pub fn has_dir_prefix(path: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Returns the first path component strictly after `prefix`, i.e. the name
/// of the immediate child of `prefix` that contains `path`.
///
/// `path` must already satisfy [`has_dir_prefix`] for `prefix`; returns
/// `None` if `path == prefix` (no component left).
pub fn child_component_after<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = if prefix.is_empty() {
        path
    } else {
        path.strip_prefix(prefix)?.strip_prefix('/').unwrap_or("")
    };
    if rest.is_empty() {
        return None;
    }
    Some(match rest.split_once('/') {
        Some((first, _)) => first,
        None => rest,
    })
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("a.txt")]
    #[case("sub/deep/d.go")]
    #[case(".")]
    fn validate_accepts(#[case] p: &str) {
        validate("test", p).expect("must be valid");
    }

    #[rstest]
    #[case("")]
    #[case("/a")]
    #[case("a/")]
    #[case("a//b")]
    #[case("./a")]
    #[case("a/../b")]
    #[case("a\\b")]
    fn validate_rejects(#[case] p: &str) {
        validate("test", p).expect_err("must be invalid");
    }

    #[rstest]
    #[case("a.txt", "a.txt")]
    #[case("sub/deep/d.go", "d.go")]
    #[case(".", "")]
    fn base_cases(#[case] p: &str, #[case] expected: &str) {
        assert_eq!(base(p), expected);
    }

    #[rstest]
    #[case("a.txt", ".")]
    #[case("sub/deep/d.go", "sub/deep")]
    #[case("sub/c.txt", "sub")]
    fn dir_cases(#[case] p: &str, #[case] expected: &str) {
        assert_eq!(dir(p), expected);
    }

    #[test]
    fn prefix_matching() {
        assert!(has_dir_prefix("assets/css/main.css", "assets/css"));
        assert!(!has_dir_prefix("assets2/x", "assets"));
        assert!(has_dir_prefix("anything", ""));
        assert!(has_dir_prefix("assets", "assets"));
    }

    #[test]
    fn child_component() {
        assert_eq!(child_component_after("assets/css/main.css", "assets"), Some("css"));
        assert_eq!(child_component_after("assets/logo.png", "assets"), Some("logo.png"));
        assert_eq!(child_component_after("assets", "assets"), None);
        assert_eq!(child_component_after("a/b/c", ""), Some("a"));
    }
}
