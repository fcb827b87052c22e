//! Validated bitsets
//!
//! Each flag type is a `u8` newtype with an explicit legality predicate.
//! Construction from raw bits (including deserialization) goes through
//! [`TryFrom<u8>`], so an illegal combination can never be observed inside
//! the runtime.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

use super::error::{ContractError, ContractResult};

/// How far metadata resolution has progressed for an activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct CacheState(u8);

impl CacheState {
    /// Nothing resolved
    pub const UNCACHED: Self = Self(0);
    /// Own metadata resolved, children skipped
    pub const PARTIAL: Self = Self(1);
    /// Own and all descendant metadata resolved
    pub const FULL: Self = Self(2);
    /// Frozen for execution
    pub const RUNTIME_READY: Self = Self(4);

    const KNOWN: u8 = 0b111;

    /// Validate a raw bit pattern
    pub fn from_bits(bits: u8) -> ContractResult<Self> {
        if Self::is_legal(bits) {
            Ok(Self(bits))
        } else {
            Err(ContractError::InvalidFlags {
                kind: "CacheState",
                bits,
            })
        }
    }

    /// Partial and Full are exclusive; no unknown bits
    pub fn is_legal(bits: u8) -> bool {
        bits & !Self::KNOWN == 0 && bits & 0b011 != 0b011
    }

    /// Raw bits
    pub fn bits(self) -> u8 {
        self.0
    }

    /// True if every bit of `other` is set
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Either Partial or Full is set
    pub fn is_cached(self) -> bool {
        self.0 & 0b011 != 0
    }

    /// Full resolution reached
    pub fn is_full(self) -> bool {
        self.contains(Self::FULL)
    }

    /// Metadata frozen for execution
    pub fn is_runtime_ready(self) -> bool {
        self.contains(Self::RUNTIME_READY)
    }

    /// At least Partial+RuntimeReady
    pub fn is_schedulable(self) -> bool {
        self.is_cached() && self.is_runtime_ready()
    }

    /// Record a partial resolution.
    ///
    /// A Full state stays Full. Returns `None` once RuntimeReady is set.
    pub fn with_partial(self) -> Option<Self> {
        if self.is_runtime_ready() {
            return None;
        }
        if self.is_full() {
            return Some(self);
        }
        Some(Self::PARTIAL)
    }

    /// Record a full resolution, upgrading Partial.
    ///
    /// Returns `None` once RuntimeReady is set.
    pub fn with_full(self) -> Option<Self> {
        if self.is_runtime_ready() {
            return None;
        }
        Some(Self::FULL)
    }

    /// OR in RuntimeReady
    pub fn with_runtime_ready(self) -> Self {
        Self(self.0 | Self::RUNTIME_READY.0)
    }
}

impl TryFrom<u8> for CacheState {
    type Error = ContractError;

    fn try_from(bits: u8) -> ContractResult<Self> {
        Self::from_bits(bits)
    }
}

impl From<CacheState> for u8 {
    fn from(state: CacheState) -> u8 {
        state.0
    }
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.contains(Self::PARTIAL) {
            parts.push("Partial");
        }
        if self.is_full() {
            parts.push("Full");
        }
        if self.is_runtime_ready() {
            parts.push("RuntimeReady");
        }
        if parts.is_empty() {
            f.write_str("Uncached")
        } else {
            f.write_str(&parts.join("|"))
        }
    }
}

/// Bookmark behaviour flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct BookmarkOptions(u8);

impl BookmarkOptions {
    /// Single resume, blocks idleness
    pub const NONE: Self = Self(0);
    /// Survives resumption
    pub const MULTIPLE_RESUME: Self = Self(1);
    /// Does not keep the instance from going idle
    pub const NON_BLOCKING: Self = Self(2);

    /// Validate a raw bit pattern
    pub fn from_bits(bits: u8) -> ContractResult<Self> {
        if bits & !0b11 == 0 {
            Ok(Self(bits))
        } else {
            Err(ContractError::InvalidFlags {
                kind: "BookmarkOptions",
                bits,
            })
        }
    }

    /// Raw bits
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Bookmark stays registered after a resume
    pub fn is_multiple_resume(self) -> bool {
        self.0 & Self::MULTIPLE_RESUME.0 != 0
    }

    /// Bookmark does not block idleness
    pub fn is_non_blocking(self) -> bool {
        self.0 & Self::NON_BLOCKING.0 != 0
    }
}

impl BitOr for BookmarkOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl TryFrom<u8> for BookmarkOptions {
    type Error = ContractError;

    fn try_from(bits: u8) -> ContractResult<Self> {
        Self::from_bits(bits)
    }
}

impl From<BookmarkOptions> for u8 {
    fn from(options: BookmarkOptions) -> u8 {
        options.0
    }
}

/// Modifiers on a declared variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct VariableModifiers(u8);

impl VariableModifiers {
    /// Plain read/write variable
    pub const NONE: Self = Self(0);
    /// Writes are rejected
    pub const READ_ONLY: Self = Self(1);
    /// Exposed to the host as a mapped variable
    pub const MAPPED: Self = Self(2);

    /// Validate a raw bit pattern
    pub fn from_bits(bits: u8) -> ContractResult<Self> {
        if bits & !0b11 == 0 {
            Ok(Self(bits))
        } else {
            Err(ContractError::InvalidFlags {
                kind: "VariableModifiers",
                bits,
            })
        }
    }

    /// Raw bits
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Writes rejected
    pub fn is_read_only(self) -> bool {
        self.0 & Self::READ_ONLY.0 != 0
    }

    /// Exposed to the host
    pub fn is_mapped(self) -> bool {
        self.0 & Self::MAPPED.0 != 0
    }
}

impl BitOr for VariableModifiers {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl TryFrom<u8> for VariableModifiers {
    type Error = ContractError;

    fn try_from(bits: u8) -> ContractResult<Self> {
        Self::from_bits(bits)
    }
}

impl From<VariableModifiers> for u8 {
    fn from(modifiers: VariableModifiers) -> u8 {
        modifiers.0
    }
}
