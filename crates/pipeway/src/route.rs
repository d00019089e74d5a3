// Copyright 2024-2026 Pipeway Developers <dev@pipeway.dev>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Request classification: canonical paths, reserved paths, receiver counts

/// Paths that belong to static endpoints and can never be rendezvous
/// targets for a sender.
pub const RESERVED_PATHS: [&str; 3] = ["/", "/version", "/help"];

/// Canonical rendezvous key for a request path.
///
/// Trailing slashes are stripped; the root stays `/`. The query string never
/// participates in the key.
pub fn canonical_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_owned()
    } else {
        trimmed.to_owned()
    }
}

/// Whether `path` (already canonical) is reserved.
pub fn is_reserved(path: &str) -> bool {
    RESERVED_PATHS.contains(&path)
}

/// Receiver count from the `n` query parameter.
///
/// Base-10; absent or unparsable values mean one receiver. Zero and negative
/// values do parse, so registration can echo them back in its rejection.
pub fn receiver_count(query: Option<&str>) -> i64 {
    query
        .into_iter()
        .flat_map(|q| q.split('&'))
        .find_map(|pair| pair.strip_prefix("n="))
        .and_then(|v| v.parse().ok())
        .unwrap_or(1)
}
