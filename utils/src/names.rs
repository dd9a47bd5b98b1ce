use sha2::{Digest, Sha256};

/// Longest name the orchestrator accepts for labels and most objects.
pub const MAX_NAME_LENGTH: usize = 63;
const HASH_SUFFIX_LENGTH: usize = 8;

/// Joins `parts` with `-` into a lowercase DNS-1123 label.
///
/// Names that do not fit are cut and suffixed with a short hash of the full
/// name, so distinct inputs keep distinct names and the same input always
/// maps to the same name.
pub fn dns_label(parts: &[&str]) -> String {
    let full: String = parts
        .iter()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = full.trim_matches('-');
    if trimmed.len() <= MAX_NAME_LENGTH {
        return trimmed.to_string();
    }

    let digest = hex::encode(Sha256::digest(trimmed.as_bytes()));
    let keep = MAX_NAME_LENGTH - HASH_SUFFIX_LENGTH - 1;
    let prefix = trimmed[..keep].trim_end_matches('-');
    format!("{}-{}", prefix, &digest[..HASH_SUFFIX_LENGTH])
}

/// Last `n` characters of `s`.
pub fn tail(s: &str, n: usize) -> &str {
    let start = s.len().saturating_sub(n);
    let start = (start..=s.len())
        .find(|i| s.is_char_boundary(*i))
        .unwrap_or(s.len());
    &s[start..]
}
