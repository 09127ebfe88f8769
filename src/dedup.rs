use std::collections::HashSet;

/// Shared significant tokens at which two labels count as the same finding.
pub const DEFAULT_THRESHOLD: usize = 3;

/// Tokens shorter than this are ignored ("low", "bp", "148").
pub const MIN_TOKEN_CHARS: usize = 4;

/// Lower-cased alphanumeric runs of a label, minus the short ones. Units and
/// bracketed values split apart, so "(148 mEq/L)" contributes nothing.
pub fn significant_tokens(label: &str) -> HashSet<String> {
    label
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.chars().count() >= MIN_TOKEN_CHARS)
        .map(str::to_string)
        .collect()
}

pub fn shared_tokens(new_label: &str, existing_label: &str) -> usize {
    let new_tokens = significant_tokens(new_label);
    let existing_tokens = significant_tokens(existing_label);
    new_tokens.intersection(&existing_tokens).count()
}

/// Whether a new finding restates the patient's latest open alert.
pub fn is_duplicate(new_label: &str, existing_label: &str, threshold: usize) -> bool {
    if new_label.to_lowercase() == existing_label.to_lowercase() {
        return true;
    }
    shared_tokens(new_label, existing_label) >= threshold
}
