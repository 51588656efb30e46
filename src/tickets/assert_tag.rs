//! Fault signature extraction from a drive status string.

/// Tags whose wiki and ticket spelling differs from what drives report.
const CORRECTIONS: [(&str, &str); 1] = [("ASSERT_DF0049", "ASSERT_DF049")];

/// First whitespace-separated token starting with `ASSERT`, after removing
/// every character that is neither a word character nor whitespace.
pub fn extract_assert_tag(status: &str) -> Option<String> {
    let cleaned: String = status
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || c.is_whitespace())
        .collect();
    let tag = cleaned.split_whitespace().find(|t| t.starts_with("ASSERT"))?;
    Some(correct_tag(tag).to_string())
}

pub fn correct_tag(tag: &str) -> &str {
    CORRECTIONS
        .iter()
        .find(|(from, _)| *from == tag)
        .map_or(tag, |(_, to)| to)
}

/// Full-text ticket search for a tag.
pub fn search_query(tag: &str) -> String {
    format!("text ~ \"{}\"", tag.replace('"', ""))
}
