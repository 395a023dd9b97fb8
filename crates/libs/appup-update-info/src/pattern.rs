//! Filename matching with POSIX glob semantics.

use reportify::ResultExt;

use crate::UpdateInfoResult;

/// Match a file name against a glob pattern (`*`, `?`, `[...]`).
pub(crate) fn matches(pattern: &str, name: &str) -> UpdateInfoResult<bool> {
    let pattern = glob::Pattern::new(pattern)
        .whatever_with(|_| format!("invalid file name pattern {pattern:?}"))?;
    Ok(pattern.matches(name))
}
