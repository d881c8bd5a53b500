use crate::constants::LYRICS_PLACEHOLDER;
use crate::types::LyricSet;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref AUTHOR_CREDIT: Regex =
        Regex::new(r"^作.+\s*[:：]").expect("Invalid author credit regex");
    static ref ARRANGER_CREDIT: Regex =
        Regex::new(r"^编曲\s*[:：]").expect("Invalid arranger credit regex");
}

/// True for "作词: ..." / "作曲：..." / "编曲: ..." style credit lines.
/// Expects an already trimmed line.
pub fn is_credit_line(line: &str) -> bool {
    AUTHOR_CREDIT.is_match(line) || ARRANGER_CREDIT.is_match(line)
}

/// Indices into a `LyricSet`, in the order the lines were numbered in the prompt.
/// Entry `i` is logical prompt line `i + 1`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineMapping(Vec<usize>);

impl LineMapping {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lyric index for a cursor position; `None` once the cursor ran past the end.
    pub fn get(&self, cursor: usize) -> Option<usize> {
        self.0.get(cursor).copied()
    }

    pub fn indices(&self) -> &[usize] {
        &self.0
    }
}

impl From<Vec<usize>> for LineMapping {
    fn from(v: Vec<usize>) -> Self {
        Self(v)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappedLyrics {
    pub original_lyrics: Vec<String>,
    pub mapping: LineMapping,
}

impl MappedLyrics {
    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }
}

/// Keeps the non-empty, non-credit lines of a set together with their indices.
pub fn map_lines(set: &LyricSet) -> MappedLyrics {
    let mut original_lyrics = Vec::new();
    let mut indices = Vec::new();

    for (index, line) in set.lyrics.iter().enumerate() {
        let trimmed = line.original_text.trim();
        if trimmed.is_empty() || is_credit_line(trimmed) {
            continue;
        }
        original_lyrics.push(trimmed.to_string());
        indices.push(index);
    }

    MappedLyrics {
        original_lyrics,
        mapping: LineMapping(indices),
    }
}

/// `1. first\n2. second\n...`
pub fn encode_numbered<S: AsRef<str>>(lines: &[S]) -> String {
    lines
        .iter()
        .enumerate()
        .map(|(i, line)| format!("{}. {}", i + 1, line.as_ref().trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn build_prompt<S: AsRef<str>>(template: &str, lines: &[S]) -> String {
    template.replacen(LYRICS_PLACEHOLDER, &encode_numbered(lines), 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LyricLine;

    fn set(lines: &[&str]) -> LyricSet {
        LyricSet::from_lines("hash", lines.iter().copied())
    }

    #[test]
    fn test_credit_patterns() {
        assert!(is_credit_line("作词 : 某人"));
        assert!(is_credit_line("作曲：某人"));
        assert!(is_credit_line("编曲: 某人"));
        assert!(is_credit_line("编曲 ：某人"));
        assert!(!is_credit_line("作"));
        assert!(!is_credit_line("编曲 某人"));
        assert!(!is_credit_line("我的作词: 不算"));
    }

    #[test]
    fn test_map_lines_skips_blank_and_credits() {
        let mapped = map_lines(&set(&[
            "作词 : A",
            "作曲 : B",
            "",
            "  first line  ",
            "   ",
            "编曲：C",
            "second line",
        ]));
        assert_eq!(mapped.original_lyrics, vec!["first line", "second line"]);
        assert_eq!(mapped.mapping.indices(), &[3, 6]);
    }

    #[test]
    fn test_mapping_is_aligned_with_trimmed_originals() {
        let lyrics = set(&[" a", "", "b ", "作词: x", "c"]);
        let mapped = map_lines(&lyrics);
        assert_eq!(mapped.mapping.len(), mapped.original_lyrics.len());
        for (i, text) in mapped.original_lyrics.iter().enumerate() {
            let idx = match mapped.mapping.get(i) {
                Some(idx) => idx,
                None => panic!("mapping shorter than lyrics"),
            };
            assert_eq!(lyrics.lyrics[idx].original_text.trim(), text);
        }
        assert_eq!(mapped.mapping.get(3), None);
    }

    #[test]
    fn test_empty_set_maps_to_nothing() {
        let mapped = map_lines(&LyricSet::new("h", vec![LyricLine::new("")]));
        assert!(mapped.is_empty());
    }

    #[test]
    fn test_build_prompt_numbers_lines() {
        let prompt = build_prompt("Translate:\n{lyrics}\nend", &["Hello", " World "]);
        assert_eq!(prompt, "Translate:\n1. Hello\n2. World\nend");
    }
}
