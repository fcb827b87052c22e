//! Bookmarks and the bookmark manager
//!
//! A bookmark is either a host-supplied name or a generated number. Both
//! forms share one registry; they serialize as a JSON string or a JSON
//! integer respectively, so a persisted bookmark is never ambiguous.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::error::{BookmarkError, BookmarkResult};
use super::flags::BookmarkOptions;
use super::instance::{InstanceId, InstanceTree};

/// Resumption point identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawBookmark", into = "RawBookmark")]
pub enum Bookmark {
    /// Host-supplied name
    Named(String),
    /// Generated id
    Numeric(u64),
}

impl Bookmark {
    /// Named bookmark; empty names are degenerate
    pub fn named(name: impl Into<String>) -> BookmarkResult<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(BookmarkError::Degenerate);
        }
        Ok(Self::Named(name))
    }

    /// Numeric bookmark; zero is degenerate
    pub fn numeric(id: u64) -> BookmarkResult<Self> {
        if id == 0 {
            return Err(BookmarkError::Degenerate);
        }
        Ok(Self::Numeric(id))
    }

    /// Name, for named bookmarks
    pub fn name(&self) -> Option<&str> {
        match self {
            Bookmark::Named(name) => Some(name),
            Bookmark::Numeric(_) => None,
        }
    }
}

impl fmt::Display for Bookmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bookmark::Named(name) => f.write_str(name),
            Bookmark::Numeric(id) => write!(f, "#{id}"),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawBookmark {
    Numeric(u64),
    Named(String),
}

impl TryFrom<RawBookmark> for Bookmark {
    type Error = BookmarkError;

    fn try_from(raw: RawBookmark) -> BookmarkResult<Self> {
        match raw {
            RawBookmark::Named(name) => Self::named(name),
            RawBookmark::Numeric(id) => Self::numeric(id),
        }
    }
}

impl From<Bookmark> for RawBookmark {
    fn from(bookmark: Bookmark) -> Self {
        match bookmark {
            Bookmark::Named(name) => RawBookmark::Named(name),
            Bookmark::Numeric(id) => RawBookmark::Numeric(id),
        }
    }
}

/// A registered bookmark
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkRecord {
    /// Identity
    pub bookmark: Bookmark,
    /// Owning instance
    pub owner: InstanceId,
    /// Options
    pub options: BookmarkOptions,
    /// Owner callback to run on resumption
    pub callback: Option<String>,
}

/// Host-facing result of a resumption attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookmarkResumptionResult {
    /// Callback queued and run
    Success,
    /// No such bookmark
    NotFound,
    /// The instance has not started, or the owner left Executing
    NotReady,
}

/// Persisted bookmark registry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookmarkSnapshot {
    /// Registered bookmarks
    pub records: Vec<BookmarkRecord>,
    /// Next generated id
    pub next_id: u64,
}

/// Registry of live bookmarks
#[derive(Debug)]
pub struct BookmarkManager {
    records: BTreeMap<Bookmark, BookmarkRecord>,
    next_id: u64,
}

impl Default for BookmarkManager {
    fn default() -> Self {
        Self {
            records: BTreeMap::new(),
            next_id: 1,
        }
    }
}

impl BookmarkManager {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bookmark for `owner`; without a name an id is generated
    pub fn create(
        &mut self,
        owner: InstanceId,
        name: Option<&str>,
        options: BookmarkOptions,
        callback: Option<String>,
    ) -> BookmarkResult<Bookmark> {
        let bookmark = match name {
            Some(name) => Bookmark::named(name)?,
            None => {
                let id = self.next_id;
                self.next_id += 1;
                Bookmark::numeric(id)?
            }
        };
        if self.records.contains_key(&bookmark) {
            return Err(BookmarkError::AlreadyExists(bookmark.to_string()));
        }

        tracing::debug!(%bookmark, %owner, options = options.bits(), "bookmark created");
        self.records.insert(
            bookmark.clone(),
            BookmarkRecord {
                bookmark: bookmark.clone(),
                owner,
                options,
                callback,
            },
        );
        Ok(bookmark)
    }

    /// Validate a resumption and consume single-resume bookmarks.
    ///
    /// The caller holds the executor exclusively, so a single-resume
    /// bookmark is gone before any other resume can look for it.
    pub fn resume(&mut self, bookmark: &Bookmark, tree: &InstanceTree) -> BookmarkResult<BookmarkRecord> {
        let record = self
            .records
            .get(bookmark)
            .ok_or_else(|| BookmarkError::NotFound(bookmark.to_string()))?;
        if !tree.is_executing(record.owner) {
            return Err(BookmarkError::OwnerNotExecuting {
                bookmark: bookmark.to_string(),
                owner: record.owner,
            });
        }

        let record = if record.options.is_multiple_resume() {
            record.clone()
        } else {
            self.records
                .remove(bookmark)
                .ok_or_else(|| BookmarkError::NotFound(bookmark.to_string()))?
        };
        tracing::debug!(%bookmark, owner = %record.owner, "bookmark resumed");
        Ok(record)
    }

    /// Look up a bookmark
    pub fn get(&self, bookmark: &Bookmark) -> Option<&BookmarkRecord> {
        self.records.get(bookmark)
    }

    /// Remove a bookmark owned by `owner`
    pub fn remove(&mut self, owner: InstanceId, bookmark: &Bookmark) -> bool {
        if self.records.get(bookmark).is_some_and(|record| record.owner == owner) {
            self.records.remove(bookmark);
            true
        } else {
            false
        }
    }

    /// Remove every bookmark owned by `owner`
    pub fn remove_all_for(&mut self, owner: InstanceId) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| record.owner != owner);
        before - self.records.len()
    }

    /// Whether `owner` has any bookmark
    pub fn has_bookmarks(&self, owner: InstanceId) -> bool {
        self.records.values().any(|record| record.owner == owner)
    }

    /// Bookmarks owned by `owner`
    pub fn bookmarks_of(&self, owner: InstanceId) -> impl Iterator<Item = &BookmarkRecord> {
        self.records.values().filter(move |record| record.owner == owner)
    }

    /// All bookmarks
    pub fn records(&self) -> impl Iterator<Item = &BookmarkRecord> {
        self.records.values()
    }

    /// Bookmarks that keep the instance from being idle-unloadable
    pub fn blocking_count(&self) -> usize {
        self.records
            .values()
            .filter(|record| !record.options.is_non_blocking())
            .count()
    }

    /// Bookmarks that do not
    pub fn non_blocking_count(&self) -> usize {
        self.records.len() - self.blocking_count()
    }

    /// Total registered
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Nothing registered
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Persisted form
    pub fn snapshot(&self) -> BookmarkSnapshot {
        BookmarkSnapshot {
            records: self.records.values().cloned().collect(),
            next_id: self.next_id,
        }
    }

    /// Rebuild from the persisted form
    pub fn restore(snapshot: BookmarkSnapshot) -> Self {
        Self {
            records: snapshot
                .records
                .into_iter()
                .map(|record| (record.bookmark.clone(), record))
                .collect(),
            next_id: snapshot.next_id.max(1),
        }
    }
}
