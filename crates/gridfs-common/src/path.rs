//! Namespace paths
//!
//! `FsPath` is a normalized absolute path. The root is `/`, components are
//! separated by a single `/` and there is never a trailing separator.

use crate::error::{Error, Result};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Path separator
pub const SEPARATOR: char = '/';

/// Normalized absolute path in the GridFS namespace
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Serialize, Deserialize)]
#[display("{_0}")]
#[serde(try_from = "String", into = "String")]
pub struct FsPath(String);

impl FsPath {
    /// Parse and normalize a path
    pub fn new(path: impl AsRef<str>) -> Result<Self> {
        let raw = path.as_ref();

        if !raw.starts_with(SEPARATOR) {
            return Err(Error::invalid_path(format!("path must be absolute: {raw:?}")));
        }

        let mut normalized = String::with_capacity(raw.len());

        for component in raw.split(SEPARATOR).filter(|c| !c.is_empty()) {
            Self::validate_name(component)?;
            normalized.push(SEPARATOR);
            normalized.push_str(component);
        }

        if normalized.is_empty() {
            normalized.push(SEPARATOR);
        }

        Ok(Self(normalized))
    }

    /// The namespace root
    #[must_use]
    pub fn root() -> Self {
        Self(SEPARATOR.to_string())
    }

    /// Validate a single path component
    pub fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::invalid_path("path component cannot be empty"));
        }
        if name.contains(SEPARATOR) {
            return Err(Error::invalid_path(format!(
                "path component cannot contain '{SEPARATOR}': {name:?}"
            )));
        }
        if name == "." || name == ".." {
            return Err(Error::invalid_path(format!(
                "relative path component is not allowed: {name:?}"
            )));
        }
        if name.contains('\0') {
            return Err(Error::invalid_path("path component cannot contain NUL"));
        }
        Ok(())
    }

    /// Get the path as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.len() == 1
    }

    /// Name components, root excluded
    #[must_use]
    pub fn components(&self) -> Vec<&str> {
        self.0.split(SEPARATOR).filter(|c| !c.is_empty()).collect()
    }

    /// Number of components below the root
    #[must_use]
    pub fn depth(&self) -> usize {
        if self.is_root() {
            0
        } else {
            self.0.matches(SEPARATOR).count()
        }
    }

    /// Last component, empty for the root
    #[must_use]
    pub fn name(&self) -> &str {
        self.0.rsplit(SEPARATOR).next().unwrap_or_default()
    }

    /// Parent path, `None` for the root
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }

        match self.0.rfind(SEPARATOR) {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Append a single component
    pub fn child(&self, name: &str) -> Result<Self> {
        Self::validate_name(name)?;

        let mut path = self.0.clone();
        if !self.is_root() {
            path.push(SEPARATOR);
        }
        path.push_str(name);

        Ok(Self(path))
    }

    /// Whether `self` lies strictly below `other`.
    #[must_use]
    pub fn is_sub_directory_of(&self, other: &Self) -> bool {
        if self == other {
            return false;
        }
        if other.is_root() {
            return true;
        }

        self.0.len() > other.0.len()
            && self.0.starts_with(&other.0)
            && self.0[other.0.len()..].starts_with(SEPARATOR)
    }

    /// Component-wise prefix match, `true` when the paths are equal.
    #[must_use]
    pub fn starts_with(&self, prefix: &Self) -> bool {
        self == prefix || self.is_sub_directory_of(prefix)
    }
}

impl FromStr for FsPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for FsPath {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<FsPath> for String {
    fn from(path: FsPath) -> Self {
        path.0
    }
}

impl AsRef<str> for FsPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> FsPath {
        FsPath::new(s).unwrap()
    }

    #[test]
    fn test_normalization() {
        assert_eq!(p("/").as_str(), "/");
        assert_eq!(p("//a///b/").as_str(), "/a/b");
        assert!(FsPath::new("a/b").is_err());
        assert!(FsPath::new("/a/../b").is_err());
    }

    #[test]
    fn test_parent_and_name() {
        let path = p("/dir1/dir2/file.txt");
        assert_eq!(path.name(), "file.txt");
        assert_eq!(path.parent(), Some(p("/dir1/dir2")));
        assert_eq!(p("/dir1").parent(), Some(FsPath::root()));
        assert_eq!(FsPath::root().parent(), None);
        assert_eq!(FsPath::root().name(), "");
        assert_eq!(path.components(), vec!["dir1", "dir2", "file.txt"]);
        assert_eq!(path.depth(), 3);
        assert_eq!(FsPath::root().depth(), 0);
    }

    #[test]
    fn test_child() {
        assert_eq!(FsPath::root().child("a").unwrap(), p("/a"));
        assert_eq!(p("/a").child("b").unwrap(), p("/a/b"));
        assert!(p("/a").child("b/c").is_err());
        assert!(p("/a").child("").is_err());
    }

    #[test]
    fn test_sub_directory() {
        assert!(p("/a/b").is_sub_directory_of(&p("/a")));
        assert!(p("/a").is_sub_directory_of(&FsPath::root()));
        assert!(!p("/a").is_sub_directory_of(&p("/a")));
        assert!(!p("/ab").is_sub_directory_of(&p("/a")));
        assert!(p("/a").starts_with(&p("/a")));
        assert!(!p("/ab/c").starts_with(&p("/a")));
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&p("/a/b")).unwrap();
        assert_eq!(json, "\"/a/b\"");
        let back: FsPath = serde_json::from_str("\"/a//b/\"").unwrap();
        assert_eq!(back, p("/a/b"));
        assert!(serde_json::from_str::<FsPath>("\"relative\"").is_err());
    }
}
