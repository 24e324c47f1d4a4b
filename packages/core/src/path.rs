//! Route path helpers: prefix normalisation, parameter wildcarding, collision
//! detection and pattern matching.

use std::collections::HashMap;

use crate::consts::API_PREFIX;

/// Marker a path-parameter segment is reduced to when paths are compared.
pub const WILDCARD_SEGMENT: &str = "{}";

/// Mounts `path` under the API prefix unless it already is.
///
/// Returns `None` for an empty path.
#[must_use]
pub fn normalize_api_path(path: &str) -> Option<String> {
    let path = path.trim();
    if path.is_empty() {
        return None;
    }
    if path.starts_with(API_PREFIX) {
        return Some(path.to_string());
    }
    if path.starts_with('/') {
        Some(format!("{API_PREFIX}{path}"))
    } else {
        Some(format!("{API_PREFIX}/{path}"))
    }
}

fn is_param_segment(segment: &str) -> bool {
    segment.len() >= 2 && segment.starts_with('{') && segment.ends_with('}')
}

/// Replaces every `{name}` segment with [`WILDCARD_SEGMENT`].
#[must_use]
pub fn wildcard_path(path: &str) -> String {
    path.split('/')
        .map(|seg| if is_param_segment(seg) { WILDCARD_SEGMENT } else { seg })
        .collect::<Vec<_>>()
        .join("/")
}

/// Whether two route paths can match the same request path.
///
/// Paths collide when they have the same number of segments and each segment
/// pair is equal or contains a parameter on either side.
#[must_use]
pub fn paths_collide(a: &str, b: &str) -> bool {
    let a: Vec<&str> = a.trim_end_matches('/').split('/').collect();
    let b: Vec<&str> = b.trim_end_matches('/').split('/').collect();
    a.len() == b.len()
        && a.iter()
            .zip(&b)
            .all(|(x, y)| x == y || is_param_segment(x) || is_param_segment(y))
}

/// Matches a concrete request path against a route pattern, capturing the
/// values of `{name}` segments.
#[must_use]
pub fn match_path(pattern: &str, path: &str) -> Option<HashMap<String, String>> {
    let pattern: Vec<&str> = pattern.trim_end_matches('/').split('/').collect();
    let path: Vec<&str> = path.trim_end_matches('/').split('/').collect();
    if pattern.len() != path.len() {
        return None;
    }
    let mut captures = HashMap::new();
    for (pat, seg) in pattern.iter().zip(&path) {
        if is_param_segment(pat) {
            if seg.is_empty() {
                return None;
            }
            captures.insert(pat[1..pat.len() - 1].to_string(), (*seg).to_string());
        } else if pat != seg {
            return None;
        }
    }
    Some(captures)
}

/// Whether `path` matches an auth rule `pattern`: exact, or `prefix/*`
/// matching anything strictly below `prefix`.
#[must_use]
pub fn pattern_matches(pattern: &str, path: &str) -> bool {
    match pattern.strip_suffix("/*") {
        Some(prefix) => path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/') && rest.len() > 1),
        None => pattern == path,
    }
}

/// Prefix length of a wildcard pattern, or `None` for an exact pattern.
#[must_use]
pub fn wildcard_prefix_len(pattern: &str) -> Option<usize> {
    pattern.strip_suffix("/*").map(str::len)
}
