use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Normalized, slash-separated virtual path of a resource inside the depot.
///
/// Normalization happens once, at construction: backslashes become forward
/// slashes, empty and `.` segments are dropped and `..` segments are
/// collapsed against their parent. The 64-bit hash is precomputed over the
/// normalized string; equality and hashing are defined over that string
/// only.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ResourcePath {
    path: Arc<str>,
    hash: u64,
}

impl ResourcePath {
    /// Builds a normalized path. An input that escapes the depot root
    /// (too many `..` segments) collapses to the empty path.
    pub fn new(path: impl AsRef<str>) -> Self {
        let mut segments: Vec<&str> = Vec::new();
        for segment in path.as_ref().split(['/', '\\']) {
            match segment {
                "" | "." => {}
                ".." => {
                    segments.pop();
                }
                other => segments.push(other),
            }
        }

        let normalized = segments.join("/");
        Self {
            hash: fnv1a(normalized.as_bytes()),
            path: normalized.into(),
        }
    }

    /// The normalized path string.
    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// Precomputed hash of the normalized path.
    pub fn path_hash(&self) -> u64 {
        self.hash
    }

    /// True for the empty path.
    pub fn is_empty(&self) -> bool {
        self.path.is_empty()
    }

    /// Directory part of the path, including the trailing slash, or an
    /// empty string for a root-level file.
    pub fn directory(&self) -> &str {
        match self.path.rfind('/') {
            Some(index) => &self.path[..=index],
            None => "",
        }
    }

    /// File name part of the path, with its extension.
    pub fn file_name(&self) -> &str {
        match self.path.rfind('/') {
            Some(index) => &self.path[index + 1..],
            None => &self.path,
        }
    }

    /// Extension of the file name, without the dot.
    pub fn extension(&self) -> &str {
        let name = self.file_name();
        match name.rfind('.') {
            Some(index) => &name[index + 1..],
            None => "",
        }
    }

    /// Resolves `relative` against this path's directory. A reference
    /// starting with `/` is taken from the depot root. Returns `None` when
    /// `..` segments escape the depot root.
    pub fn apply_relative(&self, relative: &str) -> Option<Self> {
        if let Some(absolute) = relative.strip_prefix('/') {
            return Some(Self::new(absolute));
        }

        let mut segments: Vec<&str> = self.directory().split('/').filter(|s| !s.is_empty()).collect();
        for segment in relative.split(['/', '\\']) {
            match segment {
                "" | "." => {}
                ".." => {
                    segments.pop()?;
                }
                other => segments.push(other),
            }
        }
        Some(Self::new(segments.join("/")))
    }
}

impl PartialEq for ResourcePath {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.path == other.path
    }
}

impl Eq for ResourcePath {}

impl Hash for ResourcePath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

impl fmt::Debug for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.path)
    }
}

impl From<String> for ResourcePath {
    fn from(path: String) -> Self {
        Self::new(path)
    }
}

impl From<ResourcePath> for String {
    fn from(path: ResourcePath) -> Self {
        path.path.to_string()
    }
}

/// Interned name of a resource class, as registered in the
/// [`crate::TypeRegistry`].
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ResourceType(Arc<str>);

impl ResourceType {
    /// Wraps a class name.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().into())
    }

    /// The class name.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ResourceType {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl From<ResourceType> for String {
    fn from(kind: ResourceType) -> Self {
        kind.0.to_string()
    }
}

/// Identity of a loadable resource: a normalized depot path plus the class
/// it is requested as.
///
/// The class component lets the same file be requested as different,
/// related types. Immutable once constructed.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    path: ResourcePath,
    class: ResourceType,
}

impl ResourceKey {
    /// Builds a key from a path and a resource class.
    pub fn new(path: ResourcePath, class: ResourceType) -> Self {
        Self { path, class }
    }

    /// The depot path of the resource.
    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    /// The class the resource is requested as.
    pub fn class(&self) -> &ResourceType {
        &self.class
    }

    /// The same path requested as a different class.
    pub fn with_class(&self, class: ResourceType) -> Self {
        Self {
            path: self.path.clone(),
            class,
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class, self.path)
    }
}

impl fmt::Debug for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
