//! Common types used throughout etcdform.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A validated, absolute key path in the store.
///
/// Paths are stored as components and rendered with `/` separators. The
/// root path renders as `/`. Validation happens at construction so that a
/// malformed path never reaches the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyPath {
    components: Vec<String>,
}

impl KeyPath {
    /// Create a root path.
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Create a path from string components.
    ///
    /// # Errors
    /// - Returns error if a component is empty, contains a separator,
    ///   is `.` or `..`, or contains control characters
    pub fn from_components(components: Vec<String>) -> crate::Result<Self> {
        for comp in &components {
            validate_component(comp)?;
        }
        Ok(Self { components })
    }

    /// Parse a path string into a KeyPath.
    ///
    /// Uses '/' as separator. A single leading and trailing separator are
    /// accepted; empty components in the middle (`a//b`) are rejected.
    pub fn parse(path: &str) -> crate::Result<Self> {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
        if trimmed.is_empty() {
            return Ok(Self::root());
        }

        let components: Vec<String> = trimmed.split('/').map(String::from).collect();
        Self::from_components(components).map_err(|e| match e {
            crate::Error::InvalidInput(msg) => {
                crate::Error::InvalidInput(format!("{}: {}", path, msg))
            }
            other => other,
        })
    }

    /// Check if this is the root path.
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Get the parent path, if any.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            None
        } else {
            let mut components = self.components.clone();
            components.pop();
            Some(Self { components })
        }
    }

    /// Get the key name (last component).
    pub fn name(&self) -> Option<&str> {
        self.components.last().map(|s| s.as_str())
    }

    /// Join this path with a child component.
    pub fn join(&self, child: &str) -> crate::Result<Self> {
        validate_component(child)?;
        let mut components = self.components.clone();
        components.push(child.to_string());
        Ok(Self { components })
    }

    /// Append every component of `relative` to this path.
    pub fn join_path(&self, relative: &KeyPath) -> Self {
        let mut components = self.components.clone();
        components.extend(relative.components.iter().cloned());
        Self { components }
    }

    /// Whether `self` equals `prefix` or lies below it.
    pub fn starts_with(&self, prefix: &KeyPath) -> bool {
        self.components.len() >= prefix.components.len()
            && self.components[..prefix.components.len()] == prefix.components[..]
    }

    /// Path of `self` relative to `prefix`, if `self` lies below it.
    pub fn strip_prefix(&self, prefix: &KeyPath) -> Option<KeyPath> {
        if !self.starts_with(prefix) {
            return None;
        }
        Some(Self {
            components: self.components[prefix.components.len()..].to_vec(),
        })
    }

    /// Get the path components.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Render as an absolute path string.
    pub fn to_string_path(&self) -> String {
        if self.is_root() {
            "/".to_string()
        } else {
            format!("/{}", self.components.join("/"))
        }
    }

    /// Render without the leading separator, as used for relative entry keys.
    pub fn to_relative_string(&self) -> String {
        self.components.join("/")
    }
}

fn validate_component(comp: &str) -> crate::Result<()> {
    if comp.is_empty() {
        return Err(crate::Error::InvalidInput(
            "Path component cannot be empty".to_string(),
        ));
    }
    if comp.contains('/') {
        return Err(crate::Error::InvalidInput(
            "Path component cannot contain separators".to_string(),
        ));
    }
    if comp == "." || comp == ".." {
        return Err(crate::Error::InvalidInput(format!(
            "Path component cannot be '{}'",
            comp
        )));
    }
    if comp.chars().any(char::is_control) {
        return Err(crate::Error::InvalidInput(
            "Path component cannot contain control characters".to_string(),
        ));
    }
    Ok(())
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_path())
    }
}

impl TryFrom<String> for KeyPath {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::parse(&value)
    }
}

impl From<KeyPath> for String {
    fn from(path: KeyPath) -> Self {
        path.to_string_path()
    }
}

/// Secret string that zeroizes on drop and never prints its contents.
#[derive(Clone, Zeroize, ZeroizeOnDrop, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the secret for the single place that needs it on the wire.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_key_path_root() {
        let path = KeyPath::root();
        assert!(path.is_root());
        assert_eq!(path.to_string_path(), "/");
        assert!(KeyPath::parse("/").unwrap().is_root());
        assert!(KeyPath::parse("").unwrap().is_root());
    }

    #[test]
    fn test_key_path_parse() {
        let path = KeyPath::parse("/services/web/10.0.0.1").unwrap();
        assert_eq!(path.components(), &["services", "web", "10.0.0.1"]);
        assert_eq!(path.to_string_path(), "/services/web/10.0.0.1");

        let relative = KeyPath::parse("services/web/").unwrap();
        assert_eq!(relative.to_string_path(), "/services/web");
    }

    #[test]
    fn test_key_path_rejects_malformed() {
        assert!(KeyPath::parse("/a//b").is_err());
        assert!(KeyPath::parse("/a/../b").is_err());
        assert!(KeyPath::parse("/a/./b").is_err());
        assert!(KeyPath::parse("/a/b\n").is_err());
    }

    #[test]
    fn test_key_path_error_names_path() {
        let err = KeyPath::parse("/a//b").unwrap_err();
        assert!(err.to_string().contains("/a//b"));
    }

    #[test]
    fn test_key_path_join_and_strip() {
        let dir = KeyPath::parse("/discovery").unwrap();
        let child = dir.join_path(&KeyPath::parse("web/1").unwrap());
        assert_eq!(child.to_string_path(), "/discovery/web/1");
        assert!(child.starts_with(&dir));
        assert_eq!(
            child.strip_prefix(&dir).unwrap().to_relative_string(),
            "web/1"
        );
        assert!(dir.strip_prefix(&child).is_none());
        assert!(dir.join("a/b").is_err());
    }

    #[test]
    fn test_key_path_parent_and_name() {
        let path = KeyPath::parse("/foo/bar").unwrap();
        assert_eq!(path.parent().unwrap().to_string_path(), "/foo");
        assert_eq!(path.name(), Some("bar"));
        assert!(KeyPath::root().parent().is_none());
    }

    #[test]
    fn test_key_path_serde_as_string() {
        let path = KeyPath::parse("/a/b").unwrap();
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, "\"/a/b\"");
        assert!(serde_json::from_str::<KeyPath>("\"/a//b\"").is_err());
    }

    #[test]
    fn test_secret_is_redacted() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{:?}", secret), "Secret([REDACTED])");
        assert_eq!(secret.expose(), "hunter2");
    }

    proptest! {
        #[test]
        fn prop_rendered_path_parses_back(components in prop::collection::vec("[a-z0-9_-]{1,8}", 0..6)) {
            let path = KeyPath::from_components(components).unwrap();
            let reparsed = KeyPath::parse(&path.to_string_path()).unwrap();
            prop_assert_eq!(reparsed, path);
        }
    }
}
