/// Helper: quote identifier (double-quote, escaping inner double-quotes).
pub fn qi(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Postgres' own `NAMEDATALEN - 1` limit on unquoted identifiers.
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Deterministic, collision-resistant shortening for a generated identifier
/// that may exceed `max_len` (spec §4.3 step 3: "bounded by the DBMS
/// identifier length limit — reduce variable parts until it fits"). Keeps a
/// readable prefix and appends a hash of the full name so two different long
/// names never collide after truncation.
pub fn truncate_identifier(base: &str, max_len: usize) -> String {
    if base.len() <= max_len {
        return base.to_string();
    }
    let hash = xxhash_rust::xxh3::xxh3_64(base.as_bytes());
    let suffix = format!("_{hash:08x}");
    let keep = max_len.saturating_sub(suffix.len());
    let mut prefix: String = base.chars().take(keep).collect();
    prefix.push_str(&suffix);
    prefix
}

/// Appends a numeric suffix counter (`_2`, `_3`, …) until `exists` returns
/// false, re-truncating each candidate to `max_len`. Used by
/// `unique_key::generate_key_name` / `foreign_key::generate_key_name` for the
/// "collision-free by suffix counter" part of spec §4.3 step 3.
pub fn first_free_name(base: &str, max_len: usize, mut exists: impl FnMut(&str) -> bool) -> String {
    let candidate = truncate_identifier(base, max_len);
    if !exists(&candidate) {
        return candidate;
    }
    for n in 2..10_000 {
        let with_suffix = format!("{base}_{n}");
        let candidate = truncate_identifier(&with_suffix, max_len);
        if !exists(&candidate) {
            return candidate;
        }
    }
    unreachable!("exhausted 10000 name collisions for base {base}")
}
