//! Path language: keys, segments, paths and path sets.
//!
//! A [`PathSet`] is a pattern over the graph. Each of its segments is a
//! literal key, a list of keys or a contiguous integer range; the set denotes
//! the cartesian expansion of its segments into concrete [`Path`]s.
//!
//! Path sets serialize as JSON arrays, which is also the most convenient way
//! to write them:
//!
//! ```
//! use graph_flow::PathSet;
//!
//! let set: PathSet = serde_json::from_value(serde_json::json!([
//!     "categories", "bySlug", "news", "articles", { "length": 2 }, ["title", "slug"]
//! ]))
//! .unwrap();
//!
//! let paths: Vec<String> = set.paths().map(|p| p.to_string()).collect();
//! assert_eq!(
//!     paths,
//!     [
//!         "categories.bySlug.news.articles.0.title",
//!         "categories.bySlug.news.articles.0.slug",
//!         "categories.bySlug.news.articles.1.title",
//!         "categories.bySlug.news.articles.1.slug",
//!     ]
//! );
//! ```

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A single literal key in the graph.
///
/// Names that spell a canonical unsigned integer are normalized to
/// [`Key::Index`], so `"3"` read from a JSON object member and `3` written in
/// a path set address the same node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(untagged)]
pub enum Key {
    /// Integer key, used for list-like branches.
    Index(u64),
    /// String key.
    Name(String),
}

impl Key {
    /// Create a key from a name, normalizing integer-like names.
    pub fn name(name: impl Into<String>) -> Self {
        let name = name.into();
        match parse_index(&name) {
            Some(index) => Key::Index(index),
            None => Key::Name(name),
        }
    }

    /// Returns the integer value if this is an index key.
    pub fn as_index(&self) -> Option<u64> {
        match self {
            Key::Index(index) => Some(*index),
            Key::Name(_) => None,
        }
    }
}

fn parse_index(name: &str) -> Option<u64> {
    if name.is_empty() || (name.len() > 1 && name.starts_with('0')) {
        return None;
    }
    if !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Index(u64),
            Name(String),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Index(index) => Key::Index(index),
            Raw::Name(name) => Key::name(name),
        })
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Index(index) => write!(f, "{}", index),
            Key::Name(name) => f.write_str(name),
        }
    }
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        Key::name(name)
    }
}

impl From<String> for Key {
    fn from(name: String) -> Self {
        Key::name(name)
    }
}

impl From<u64> for Key {
    fn from(index: u64) -> Self {
        Key::Index(index)
    }
}

/// A contiguous run of integer keys: `from, from + 1, ..., from + length - 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    /// First index of the range.
    #[serde(default)]
    pub from: u64,
    /// Number of indices in the range.
    pub length: u64,
}

impl Range {
    /// Create a range of `length` indices starting at `from`.
    pub fn new(from: u64, length: u64) -> Self {
        Self { from, length }
    }

    /// Number of indices in the range, clipped at the largest index.
    pub fn len(&self) -> u64 {
        let room = (u64::MAX - self.from).saturating_add(1);
        self.length.min(room)
    }

    /// Returns true if the range has no indices.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over the indices of this range.
    pub fn indices(&self) -> impl Iterator<Item = u64> {
        let from = self.from;
        (0..self.len()).map(move |i| from + i)
    }
}

/// One segment of a [`PathSet`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Segment {
    /// A single literal key.
    Key(Key),
    /// A list of literal keys, expanded in list order.
    List(Vec<Key>),
    /// A contiguous integer range.
    Range(Range),
}

impl Segment {
    /// Number of keys this segment expands to.
    pub fn width(&self) -> usize {
        match self {
            Segment::Key(_) => 1,
            Segment::Range(range) => usize::try_from(range.len()).unwrap_or(usize::MAX),
            Segment::List(keys) => keys.len(),
        }
    }

    /// The key at position `i` of the expansion. `i` must be below [`Segment::width`].
    fn key_at(&self, i: usize) -> Key {
        match self {
            Segment::Key(key) => key.clone(),
            Segment::Range(range) => Key::Index(range.from + i as u64),
            Segment::List(keys) => keys[i].clone(),
        }
    }

    /// Iterate over the keys of this segment in expansion order.
    pub fn keys(&self) -> impl Iterator<Item = Key> + '_ {
        (0..self.width()).map(move |i| self.key_at(i))
    }

    /// Returns true if this segment is a range.
    pub fn is_range(&self) -> bool {
        matches!(self, Segment::Range(_))
    }
}

impl From<Key> for Segment {
    fn from(key: Key) -> Self {
        Segment::Key(key)
    }
}

impl From<&str> for Segment {
    fn from(name: &str) -> Self {
        Segment::Key(Key::name(name))
    }
}

impl From<String> for Segment {
    fn from(name: String) -> Self {
        Segment::Key(Key::name(name))
    }
}

impl From<u64> for Segment {
    fn from(index: u64) -> Self {
        Segment::Key(Key::Index(index))
    }
}

impl From<Range> for Segment {
    fn from(range: Range) -> Self {
        Segment::Range(range)
    }
}

impl From<Vec<&str>> for Segment {
    fn from(names: Vec<&str>) -> Self {
        Segment::List(names.into_iter().map(Key::name).collect())
    }
}

impl From<Vec<Key>> for Segment {
    fn from(keys: Vec<Key>) -> Self {
        Segment::List(keys)
    }
}

/// A fully literal key sequence addressing one node of the graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(Vec<Key>);

impl Path {
    /// The empty path, addressing the cache root.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Create a path from keys.
    pub fn new(keys: Vec<Key>) -> Self {
        Self(keys)
    }

    /// The keys of this path.
    pub fn keys(&self) -> &[Key] {
        &self.0
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true for the root path.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append a key.
    pub fn push(&mut self, key: Key) {
        self.0.push(key);
    }

    /// Append every key of `keys`.
    pub fn extend(&mut self, keys: &[Key]) {
        self.0.extend_from_slice(keys);
    }

    /// A new path with `key` appended.
    #[must_use]
    pub fn child(&self, key: Key) -> Self {
        let mut keys = self.0.clone();
        keys.push(key);
        Self(keys)
    }

    /// Returns true if `self` is a prefix of (or equal to) `other`.
    pub fn is_prefix_of(&self, other: &Path) -> bool {
        other.0.starts_with(&self.0)
    }

    /// View this path as a single-path [`PathSet`].
    pub fn to_path_set(&self) -> PathSet {
        PathSet(self.0.iter().cloned().map(Segment::Key).collect())
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, key) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{}", key)?;
        }
        Ok(())
    }
}

impl<K: Into<Key>> FromIterator<K> for Path {
    fn from_iter<T: IntoIterator<Item = K>>(iter: T) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// A path pattern expanding to many [`Path`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PathSet(Vec<Segment>);

impl PathSet {
    /// Create a path set from segments.
    pub fn new(segments: Vec<Segment>) -> Self {
        Self(segments)
    }

    /// The segments of this path set.
    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    /// Lazily expand into concrete paths.
    ///
    /// Every call starts a fresh expansion from the segment description.
    pub fn paths(&self) -> Expand<'_> {
        Expand::new(&self.0)
    }

    /// Returns true if the expansion is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty() || self.0.iter().any(|s| s.width() == 0)
    }

    /// Collect the expansion into an ordered set.
    pub fn path_set(&self) -> BTreeSet<Path> {
        self.paths().collect()
    }

    /// Returns true if both path sets expand to the same paths.
    pub fn equivalent(&self, other: &PathSet) -> bool {
        self.path_set() == other.path_set()
    }

    /// Returns true if the expansions share at least one path.
    pub fn overlaps(&self, other: &PathSet) -> bool {
        let mine = self.path_set();
        other.paths().any(|p| mine.contains(&p))
    }
}

impl<S: Into<Segment>> FromIterator<S> for PathSet {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for PathSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            match segment {
                Segment::Key(key) => write!(f, "{}", key)?,
                Segment::Range(range) => write!(f, "[{}..{}]", range.from, range.from.saturating_add(range.len()))?,
                Segment::List(keys) => {
                    f.write_str("{")?;
                    for (j, key) in keys.iter().enumerate() {
                        if j > 0 {
                            f.write_str(",")?;
                        }
                        write!(f, "{}", key)?;
                    }
                    f.write_str("}")?;
                }
            }
        }
        Ok(())
    }
}

/// Lazy expansion of a [`PathSet`], produced by [`PathSet::paths`].
///
/// Works like an odometer over the segment widths, rightmost segment fastest.
pub struct Expand<'a> {
    segments: &'a [Segment],
    cursor: Vec<usize>,
    done: bool,
}

impl<'a> Expand<'a> {
    fn new(segments: &'a [Segment]) -> Self {
        Self {
            segments,
            cursor: vec![0; segments.len()],
            done: segments.is_empty() || segments.iter().any(|s| s.width() == 0),
        }
    }
}

impl Iterator for Expand<'_> {
    type Item = Path;

    fn next(&mut self) -> Option<Path> {
        if self.done {
            return None;
        }
        let path = Path(
            self.segments
                .iter()
                .zip(&self.cursor)
                .map(|(segment, &i)| segment.key_at(i))
                .collect(),
        );

        self.done = true;
        for (segment, i) in self.segments.iter().zip(self.cursor.iter_mut()).rev() {
            *i += 1;
            if *i < segment.width() {
                self.done = false;
                break;
            }
            *i = 0;
        }
        Some(path)
    }
}
