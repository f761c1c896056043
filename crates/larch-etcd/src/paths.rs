//! Mapping from user keys to coordination-service paths.
//!
//! Two parallel naming schemes share the root prefix without colliding in
//! directory listings: value nodes prefix the leaf with `.` (listed by the
//! service), lock-queue directories prefix it with `_` (hidden by the
//! service). Intermediate directories are bare.
//!
//! All functions are pure and total over their string inputs.

use larch_core::constants::LOCK_NODE_PREFIX;
use larch_core::constants::VALUE_NODE_PREFIX;

/// Service path of the value node for `key`.
pub fn node_path(root: &str, key: &str) -> String {
    join(&[
        root,
        dirname(key),
        &format!("{VALUE_NODE_PREFIX}{}", basename(key)),
    ])
}

/// Service path of the directory backing a `list` of `prefix`, with the
/// trailing `/` the service expects for directory reads.
pub fn node_path_dir(root: &str, prefix: &str) -> String {
    format!("{}/", join(&[root, prefix]))
}

/// Service path of the lock-queue directory for `key`, with trailing `/`.
pub fn lock_path(root: &str, key: &str) -> String {
    format!(
        "{}/",
        join(&[
            root,
            dirname(key),
            &format!("{LOCK_NODE_PREFIX}{}", basename(key)),
        ])
    )
}

/// Join path fragments, dropping empty and `.` segments and collapsing
/// duplicate slashes. The result is absolute when the first fragment is.
fn join(parts: &[&str]) -> String {
    let absolute = parts.first().is_some_and(|p| p.starts_with('/'));
    let mut out = String::new();
    for part in parts {
        for seg in part.split('/') {
            if seg.is_empty() || seg == "." {
                continue;
            }
            out.push('/');
            out.push_str(seg);
        }
    }
    if !absolute && !out.is_empty() {
        out.remove(0);
    }
    out
}

/// Everything before the last path separator; `.` when there is none.
fn dirname(key: &str) -> &str {
    let key = key.trim_end_matches('/');
    match key.rfind('/') {
        None => ".",
        Some(0) => "/",
        Some(i) => &key[..i],
    }
}

/// The last path segment.
fn basename(key: &str) -> &str {
    let key = key.trim_end_matches('/');
    match key.rfind('/') {
        None => key,
        Some(i) => &key[i + 1..],
    }
}
