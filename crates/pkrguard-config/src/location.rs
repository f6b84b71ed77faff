//! Source locations within configuration text

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a finding in a source file (1-based line and column)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Location {
    pub file: String,
    pub line: usize,
    pub column: usize,
    /// Length of the matched span in bytes
    pub length: usize,
}

impl Location {
    /// Build a location from a byte offset into `text`
    ///
    /// Offsets past the end are clamped to the last position.
    #[must_use]
    pub fn from_offset(file: impl Into<String>, text: &str, offset: usize, length: usize) -> Self {
        let offset = offset.min(text.len());
        let before = &text[..floor_char_boundary(text, offset)];
        let line = before.matches('\n').count() + 1;
        let line_start = before.rfind('\n').map_or(0, |i| i + 1);
        let column = before[line_start..].chars().count() + 1;
        Self {
            file: file.into(),
            line,
            column,
            length,
        }
    }

    /// Location used when a structural finding cannot be pinned to text
    #[must_use]
    pub fn whole_file(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            line: 0,
            column: 0,
            length: 0,
        }
    }

    /// Same file, line and column (length ignored)
    #[inline]
    #[must_use]
    pub fn same_position(&self, other: &Self) -> bool {
        self.file == other.file && self.line == other.line && self.column == other.column
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line == 0 {
            write!(f, "{}", self.file)
        } else {
            write!(f, "{}:{}:{}", self.file, self.line, self.column)
        }
    }
}

fn floor_char_boundary(text: &str, mut offset: usize) -> usize {
    while offset > 0 && !text.is_char_boundary(offset) {
        offset -= 1;
    }
    offset
}

/// Locate the `nth` occurrence (0-based) of `key` holding `value` in raw text
///
/// Looks for the quoted key (JSON) or a bare `key:` (YAML) and then for the
/// value on the same line. When the value sits elsewhere (multi-line arrays)
/// the `nth` occurrence of the value itself is used. Falls back to the key
/// position, then to the whole file.
#[must_use]
pub fn locate_field(file: &str, raw: &str, key: &str, value: Option<&str>, nth: usize) -> Location {
    let quoted = format!("\"{key}\"");
    let yaml = format!("{key}:");
    let mut keys: Vec<(usize, usize)> = raw.match_indices(&quoted).map(|(i, m)| (i, m.len())).collect();
    if keys.is_empty() {
        keys = raw
            .match_indices(&yaml)
            .filter(|(i, _)| {
                raw[..*i]
                    .chars()
                    .next_back()
                    .map_or(true, |c| c.is_whitespace() || c == '-')
            })
            .map(|(i, m)| (i, m.len()))
            .collect();
    }

    let value = value.filter(|v| !v.is_empty());
    let Some(value) = value else {
        return keys.get(nth).or(keys.last()).map_or_else(
            || Location::whole_file(file),
            |&(pos, len)| Location::from_offset(file, raw, pos, len),
        );
    };

    let on_key_line: Vec<usize> = keys
        .iter()
        .filter_map(|&(pos, len)| {
            let after = pos + len;
            let line_end = raw[after..].find('\n').map_or(raw.len(), |e| after + e);
            raw[after..line_end].find(value).map(|rel| after + rel)
        })
        .collect();
    if let Some(&pos) = on_key_line.get(nth).or(on_key_line.last()) {
        return Location::from_offset(file, raw, pos, value.len());
    }

    let anywhere: Vec<usize> = raw.match_indices(value).map(|(i, _)| i).collect();
    if let Some(&pos) = anywhere.get(nth).or(anywhere.last()) {
        return Location::from_offset(file, raw, pos, value.len());
    }
    keys.first().map_or_else(
        || Location::whole_file(file),
        |&(pos, len)| Location::from_offset(file, raw, pos, len),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_to_line_and_column() {
        let text = "first\nsecond line\nthird";
        let loc = Location::from_offset("t.json", text, 13, 4);
        assert_eq!((loc.line, loc.column), (2, 8));
    }

    #[test]
    fn offset_zero_is_origin() {
        let loc = Location::from_offset("t.json", "abc", 0, 1);
        assert_eq!((loc.line, loc.column), (1, 1));
    }

    #[test]
    fn locate_field_finds_value_after_key() {
        let raw = "{\n  \"name\": \"x\",\n  \"password\": \"hunter2\"\n}";
        let loc = locate_field("t.json", raw, "password", Some("hunter2"), 0);
        assert_eq!(loc.line, 3);
        assert_eq!(loc.length, 7);
    }

    #[test]
    fn locate_field_picks_nth_occurrence() {
        let raw = "{\"builders\": [\n  {\"ssh_username\": \"root\"},\n  {\"ssh_username\": \"root\"}\n]}";
        assert_eq!(locate_field("t.json", raw, "ssh_username", Some("root"), 0).line, 2);
        assert_eq!(locate_field("t.json", raw, "ssh_username", Some("root"), 1).line, 3);
        // past the end falls back to the last occurrence
        assert_eq!(locate_field("t.json", raw, "ssh_username", Some("root"), 5).line, 3);
    }

    #[test]
    fn locate_field_yaml_and_multiline_values() {
        let yaml = "builders:\n  - type: docker\n    image: ubuntu\n";
        assert_eq!(locate_field("t.yaml", yaml, "image", Some("ubuntu"), 0).line, 3);

        let json = "{\n  \"inline\": [\n    \"curl x | sh\"\n  ]\n}";
        assert_eq!(locate_field("t.json", json, "inline", Some("curl x | sh"), 0).line, 3);
    }

    #[test]
    fn locate_field_falls_back_to_whole_file() {
        let loc = locate_field("t.json", "{}", "missing", None, 0);
        assert_eq!(loc.line, 0);
        assert_eq!(loc.to_string(), "t.json");
    }
}
