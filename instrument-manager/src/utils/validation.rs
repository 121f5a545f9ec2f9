// Input validation utilities

use regex::Regex;
use std::sync::OnceLock;

use crate::instrument::definition::DEFINITION_EXTENSION;

fn identifier_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]+$").ok()).as_ref()
}

/// Whether `name` can be used as an instrument (and table) name.
///
/// Only letters, digits and underscores; this also keeps names free of path separators.
pub fn is_valid_instrument_name(name: &str) -> bool {
    name.len() <= 64 && identifier_re().is_some_and(|re| re.is_match(name))
}

/// Derive the instrument name from an uploaded file name (`bmi.linst` -> `bmi`).
pub fn instrument_name_from_upload(file_name: &str) -> Result<String, String> {
    let trimmed = file_name.trim();
    if trimmed.is_empty() {
        return Err("No file was uploaded.".to_string());
    }

    let suffix = format!(".{}", DEFINITION_EXTENSION);
    let Some(stem) = trimmed.strip_suffix(&suffix) else {
        return Err(format!(
            "'{}' is not an instrument definition (expected a {} file).",
            trimmed, suffix
        ));
    };

    if !is_valid_instrument_name(stem) {
        return Err(format!(
            "'{}' is not a valid instrument name (letters, digits and underscores only).",
            stem
        ));
    }

    Ok(stem.to_string())
}
