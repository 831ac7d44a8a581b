//! Arithmetic on working-copy relative paths.
//!
//! A relpath is `/`-separated, has no leading or trailing separator, and the
//! working-copy root is the empty string. The depth of a relpath is the number
//! of components, so the root is at depth 0 and `A/B` is at depth 2. Layer
//! op-depths are expressed in the same unit.

/// Number of components in `relpath`.
pub fn depth(relpath: &str) -> i64 {
    if relpath.is_empty() {
        0
    } else {
        relpath.matches('/').count() as i64 + 1
    }
}

/// Parent of `relpath`; the parent of a top-level node (and of the root) is `""`.
pub fn dirname(relpath: &str) -> &str {
    match relpath.rfind('/') {
        Some(idx) => &relpath[..idx],
        None => "",
    }
}

/// Last component of `relpath`.
pub fn basename(relpath: &str) -> &str {
    match relpath.rfind('/') {
        Some(idx) => &relpath[idx + 1..],
        None => relpath,
    }
}

/// Join `base` and `component`, either of which may be empty.
pub fn join(base: &str, component: &str) -> String {
    match (base.is_empty(), component.is_empty()) {
        (true, _) => component.to_string(),
        (_, true) => base.to_string(),
        _ => format!("{base}/{component}"),
    }
}

/// The part of `child` below `parent`, or `None` if `child` is not `parent`
/// or one of its descendants. `skip_ancestor("A", "A")` is `Some("")`.
pub fn skip_ancestor<'a>(parent: &str, child: &'a str) -> Option<&'a str> {
    if parent.is_empty() {
        return Some(child);
    }
    if child == parent {
        return Some("");
    }
    child
        .strip_prefix(parent)
        .and_then(|rest| rest.strip_prefix('/'))
}

/// True if `parent` is `child` or one of its ancestors.
pub fn is_ancestor(parent: &str, child: &str) -> bool {
    skip_ancestor(parent, child).is_some()
}

/// Walk `relpath` up until its depth is at most `target_depth`.
pub fn ancestor_at_depth(relpath: &str, target_depth: i64) -> &str {
    let mut current = relpath;
    while depth(current) > target_depth {
        current = dirname(current);
    }
    current
}

/// Longest relpath that is an ancestor-or-self of both `a` and `b`.
pub fn longest_ancestor(a: &str, b: &str) -> String {
    let common: Vec<&str> = a
        .split('/')
        .zip(b.split('/'))
        .take_while(|(x, y)| x == y && !x.is_empty())
        .map(|(x, _)| x)
        .collect();
    common.join("/")
}
