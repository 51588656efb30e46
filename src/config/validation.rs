//! Config validation: unknown-key detection with Levenshtein suggestions.
//!
//! Two-pass parse approach: first parse raw TOML into `toml::Value`, walk
//! the key tree, compare against the keys of the default configuration, and
//! emit warnings with "did you mean?" suggestions. Then proceed with normal
//! serde deserialization. Warnings never break existing configs.

use std::collections::HashSet;

use super::PipelineConfig;

/// A non-fatal config warning.
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(ref s) = self.suggestion {
            write!(f, " (did you mean '{s}'?)")?;
        }
        Ok(())
    }
}

// ============================================================================
// Known Config Keys
// ============================================================================

/// Keys whose default is `None` and so never appear in the serialized default.
const OPTIONAL_KEYS: &[&str] = &[
    "arma.matrix_profile_window",
    "tickets.base_url",
    "tickets.wiki_url",
    "tickets.noise_path",
    "pool.max_workers",
];

/// Every valid dotted key path of `PipelineConfig`.
pub fn known_config_keys() -> HashSet<String> {
    let mut keys: HashSet<String> = toml::Value::try_from(PipelineConfig::default())
        .map(|v| walk_toml_keys(&v, "").into_iter().collect())
        .unwrap_or_default();
    keys.extend(OPTIONAL_KEYS.iter().map(|k| (*k).to_string()));
    keys
}

// ============================================================================
// TOML Key Walking
// ============================================================================

/// Recursively walks a `toml::Value` tree and collects all dotted key paths.
///
/// For example, a table `{ a = { b = 1, c = 2 } }` yields:
/// `["a", "a.b", "a.c"]`
pub fn walk_toml_keys(value: &toml::Value, prefix: &str) -> Vec<String> {
    let mut keys = Vec::new();
    if let Some(table) = value.as_table() {
        for (k, v) in table {
            let path = if prefix.is_empty() { k.clone() } else { format!("{prefix}.{k}") };
            keys.push(path.clone());
            if v.is_table() {
                keys.extend(walk_toml_keys(v, &path));
            }
        }
    }
    keys
}

// ============================================================================
// Levenshtein Distance
// ============================================================================

fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0; b_chars.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b_chars.len()]
}

/// Largest edit distance still offered as a suggestion.
pub const MAX_SUGGESTION_DISTANCE: usize = 2;

/// Closest known key within `MAX_SUGGESTION_DISTANCE`; ties go to the smaller key.
pub fn suggest_correction(unknown: &str, known: &HashSet<String>) -> Option<String> {
    known
        .iter()
        .map(|k| (levenshtein(unknown, k), k))
        .filter(|(d, _)| *d <= MAX_SUGGESTION_DISTANCE)
        .min()
        .map(|(_, k)| k.clone())
}

// ============================================================================
// Unknown Key Validation (entry point)
// ============================================================================

/// Parse a raw TOML string and return warnings for any unknown config keys.
///
/// Parse errors yield no warnings; serde reports them afterwards.
pub fn validate_unknown_keys(raw_toml: &str) -> Vec<ValidationWarning> {
    let Ok(value) = raw_toml.parse::<toml::Value>() else {
        return Vec::new();
    };

    let known = known_config_keys();
    walk_toml_keys(&value, "")
        .into_iter()
        .filter(|key| !known.contains(key))
        .map(|key| ValidationWarning {
            message: format!("Unknown config key '{key}'"),
            suggestion: suggest_correction(&key, &known),
            field: key,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("seed", "seed"), 0);
        assert_eq!(levenshtein("sede", "seed"), 2);
        assert_eq!(levenshtein("", "abc"), 3);
    }

    #[test]
    fn test_walk_toml_keys_nested() {
        let toml: toml::Value = r#"
            [run]
            seed = 7
            [pool]
            backend = "thread"
        "#
        .parse()
        .unwrap();
        let keys = walk_toml_keys(&toml, "");
        assert!(keys.contains(&"run".to_string()));
        assert!(keys.contains(&"run.seed".to_string()));
        assert!(keys.contains(&"pool.backend".to_string()));
    }

    #[test]
    fn test_typo_key_produces_warning_with_suggestion() {
        let warnings = validate_unknown_keys("[lstm]\nhiden_units = 64\n");
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].field, "lstm.hiden_units");
        assert_eq!(warnings[0].suggestion.as_deref(), Some("lstm.hidden_units"));
        assert!(warnings[0].to_string().contains("did you mean"));
    }

    #[test]
    fn test_optional_keys_are_known() {
        let toml_str = r#"
[tickets]
base_url = "https://tickets.example"
noise_path = "noise.toml"

[pool]
max_workers = 4
"#;
        assert!(validate_unknown_keys(toml_str).is_empty());
    }

    #[test]
    fn test_suggestion_stops_past_two_edits() {
        let known: HashSet<String> = ["lstm.patience".to_string()].into_iter().collect();
        assert_eq!(suggest_correction("lstm.patiense", &known).as_deref(), Some("lstm.patience"));
        assert_eq!(suggest_correction("lstm.potiense", &known).as_deref(), Some("lstm.patience"));
        assert_eq!(suggest_correction("lstm.potiensa", &known), None);
    }

    #[test]
    fn test_garbage_gets_no_suggestion() {
        let warnings = validate_unknown_keys("completely_unrelated_garbage_key_xyz = 1\n");
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].suggestion.is_none());
    }

    #[test]
    fn test_known_keys_cover_every_section() {
        let known = known_config_keys();
        for section in ["run", "decoder", "arma", "lstm", "events", "tickets", "pool"] {
            assert!(known.contains(section), "missing section {}", section);
        }
        assert!(known.contains("decoder.objects_of_interest"));
    }
}
