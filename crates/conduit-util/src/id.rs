//! Server identifiers.
//!
//! Imported servers are keyed by a slug of their name. When a name has
//! nothing usable in it, a ULID-based id such as `srv_01hqx...` is minted
//! instead, so ids sort by creation time.

use ulid::Ulid;

const GENERATED_PREFIX: &str = "srv_";

/// Fresh, time-ordered server id.
pub fn generate() -> String {
    format!("{GENERATED_PREFIX}{}", Ulid::new().to_string().to_lowercase())
}

/// Whether `id` came from [`generate`].
pub fn is_generated(id: &str) -> bool {
    id.strip_prefix(GENERATED_PREFIX)
        .is_some_and(|rest| Ulid::from_string(rest).is_ok())
}

/// Lowercase, dash-separated form of a display name, e.g.
/// `"GitHub Tools"` becomes `github-tools`.
///
/// `None` when nothing alphanumeric remains.
pub fn slug(name: &str) -> Option<String> {
    let words: Vec<String> = name
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_ascii_lowercase)
        .collect();
    (!words.is_empty()).then(|| words.join("-"))
}

/// A slug if the name allows one, otherwise a generated id.
pub fn from_name(name: &str) -> String {
    slug(name).unwrap_or_else(generate)
}
