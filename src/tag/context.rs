//! Scope-attached tag sets.
//!
//! A tag set attached with [`with_tags`] is visible through [`current`] for
//! the whole lifetime of the wrapped future, across `.await` points.

use std::future::Future;

use super::TagSet;

tokio::task_local! {
    static CURRENT_TAGS: TagSet;
}

/// Runs `fut` with `tags` as the current tag set.
pub async fn with_tags<F: Future>(tags: TagSet, fut: F) -> F::Output {
    CURRENT_TAGS.scope(tags, fut).await
}

/// Runs `f` synchronously with `tags` as the current tag set.
pub fn sync_scope<R>(tags: TagSet, f: impl FnOnce() -> R) -> R {
    CURRENT_TAGS.sync_scope(tags, f)
}

/// Returns the tag set of the current scope, or an empty set outside any scope.
pub fn current() -> TagSet {
    CURRENT_TAGS.try_with(TagSet::clone).unwrap_or_default()
}
