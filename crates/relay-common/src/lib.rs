//! Small shared types used across the relay-dispatch workspace.
//!
//! This crate intentionally stays tiny: it holds the identifier type and
//! loosely-typed attribute/duration helpers that both the dispatch core and
//! any embedding application need, without pulling in async runtimes or
//! provider-specific types.

pub mod attributes;
pub mod duration;

pub use attributes::Attributes;
pub use duration::parse_flexible_duration;

/// Globally unique identifier for a registered credential.
///
/// A plain `String` rather than a newtype: callers mint these from
/// whatever the persisted store already uses as a primary key (UUID,
/// database row id rendered as text, etc.), and the core never parses it.
pub type CredentialId = String;
