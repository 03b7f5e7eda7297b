//! Member name generation.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

use crate::MAX_NAME_LEN;

/// Produces unique names for new group members.
pub trait NameGenerator: Send + Sync {
    /// Generate a fresh member name for `group`.
    fn generate(&self, group: &str) -> String;
}

/// Join `group` and `suffix`, shortening the group part so the result fits
/// in [`MAX_NAME_LEN`].
fn member_name(group: &str, suffix: u64) -> String {
    let suffix = suffix.to_string();
    let keep = MAX_NAME_LEN.saturating_sub(suffix.len() + 1);
    let group = group
        .char_indices()
        .nth(keep)
        .map_or(group, |(end, _)| &group[..end]);
    format!("{group}-{suffix}")
}

/// Appends a random non-negative 63-bit integer to the group name.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSuffix;

impl NameGenerator for RandomSuffix {
    fn generate(&self, group: &str) -> String {
        member_name(group, rand::rng().random::<u64>() >> 1)
    }
}

/// Appends a per-generator counter to the group name.
#[derive(Debug, Default)]
pub struct SequentialNames {
    next: AtomicU64,
}

impl SequentialNames {
    /// Create a generator starting at 0.
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Create a generator starting at `first`.
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }
}

impl NameGenerator for SequentialNames {
    fn generate(&self, group: &str) -> String {
        member_name(group, self.next.fetch_add(1, Ordering::SeqCst))
    }
}
