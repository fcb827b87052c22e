//! Parallel-branch tagging
//!
//! Branch ids are dot-separated token paths registered as a
//! children-visible property. The root has no branch id.

use serde_json::{Value, json};
use std::fmt;
use uuid::Uuid;

use super::properties::ExecutionProperty;

/// Scope key of the branch id property
pub const PARALLEL_BRANCH_PROPERTY: &str = "runtime.parallel-branch";

/// Catalog kind of the persisted branch property
pub const PARALLEL_BRANCH_KIND: &str = "parallel-branch";

/// Separator between branch tokens
pub const BRANCH_SEPARATOR: char = '.';

/// Source of fresh branch tokens
pub type BranchTokenSource = Box<dyn FnMut() -> String + Send>;

/// Random token
pub fn fresh_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Default token source
pub fn random_tokens() -> BranchTokenSource {
    Box::new(fresh_token)
}

/// Hierarchical branch identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParallelBranch {
    id: String,
}

impl ParallelBranch {
    /// `parent.token`, or `token` when there is no parent
    pub fn child_of(parent: Option<&str>, token: &str) -> Self {
        let id = match parent {
            Some(parent) if !parent.is_empty() => format!("{parent}{BRANCH_SEPARATOR}{token}"),
            _ => token.to_string(),
        };
        Self { id }
    }

    /// Restore from a stored id
    pub fn from_id(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Full id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of nested branch levels
    pub fn depth(&self) -> usize {
        self.id.split(BRANCH_SEPARATOR).count()
    }

    /// Whether `other` was created inside this branch
    pub fn is_ancestor_of(&self, other: &ParallelBranch) -> bool {
        other
            .id
            .strip_prefix(self.id.as_str())
            .is_some_and(|rest| rest.starts_with(BRANCH_SEPARATOR))
    }
}

impl fmt::Display for ParallelBranch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Branch id registered at the instance that started the branch
#[derive(Debug)]
pub struct ParallelBranchProperty {
    branch: ParallelBranch,
}

impl ParallelBranchProperty {
    /// Wrap a branch
    pub fn new(branch: ParallelBranch) -> Self {
        Self { branch }
    }

    /// The branch
    pub fn branch(&self) -> &ParallelBranch {
        &self.branch
    }
}

impl ExecutionProperty for ParallelBranchProperty {
    fn persisted_state(&self) -> Option<(&'static str, Value)> {
        Some((PARALLEL_BRANCH_KIND, json!(self.branch.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_branch_has_no_separator() {
        assert_eq!(ParallelBranch::child_of(None, "A").id(), "A");
        assert_eq!(ParallelBranch::child_of(Some(""), "A").id(), "A");
        assert_eq!(ParallelBranch::child_of(Some("A"), "B").id(), "A.B");
    }

    #[test]
    fn test_ancestry() {
        let outer = ParallelBranch::child_of(None, "A");
        let inner = ParallelBranch::child_of(Some(outer.id()), "B");
        let lookalike = ParallelBranch::from_id("AB");

        assert!(outer.is_ancestor_of(&inner));
        assert!(!inner.is_ancestor_of(&outer));
        assert!(!outer.is_ancestor_of(&lookalike));
        assert!(!outer.is_ancestor_of(&outer));
        assert_eq!(inner.depth(), 2);
    }

    #[test]
    fn test_fresh_tokens_are_distinct() {
        let mut source = random_tokens();
        assert_ne!(source(), source());
        assert!(!fresh_token().contains(BRANCH_SEPARATOR));
    }
}
