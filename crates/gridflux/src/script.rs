use gridflux_core::{GridError, Mutation};

/// A mutation read from a script, with the line it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptEntry {
    pub line: usize,
    pub mutation: Mutation,
}

/// Parses a JSON-lines mutation script. Blank lines and lines starting with
/// `#` are skipped. The first malformed line aborts the whole script.
pub fn parse_script(source: &str) -> Result<Vec<ScriptEntry>, GridError> {
    let mut entries = Vec::new();

    for (index, raw) in source.lines().enumerate() {
        let line = index + 1;
        let trimmed = raw.trim();

        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let mutation: Mutation = serde_json::from_str(trimmed)
            .map_err(|e| GridError::invalid(format!("line {line}: {e}")))?;

        entries.push(ScriptEntry { line, mutation });
    }

    Ok(entries)
}
