//! Maps an append-only text stream of numbered translations back onto lyric lines.
//!
//! The model answers with `1. ...\n2. ...\n...`. Fragments may split that text
//! anywhere, so the reconciler works one character at a time: a newline closes
//! the current line (the cursor only moves past a line that received text), a
//! `\n<digits>.` marker right after a newline is swallowed, and every other
//! character is appended to the line under the cursor.

use crate::line_mapper::LineMapping;
use crate::types::{ContentHash, LyricLine, LyricSet, TaskId, TranslationContributor};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref LINE_NUMBER_MARKER: Regex =
        Regex::new(r"^\n\d+\.").expect("Invalid line number marker regex");
}

#[derive(Debug, Clone)]
pub struct StreamReconciler {
    mapping: LineMapping,
    cur_index: usize,
    buffer: String,
    full_response: String,
    dropped_chars: usize,
}

impl StreamReconciler {
    pub fn new(mapping: LineMapping) -> Self {
        Self {
            mapping,
            cur_index: 0,
            // The stream starts as if a newline had just been seen, so a leading
            // "1." is absorbed like any other marker.
            buffer: "\n".to_string(),
            full_response: String::new(),
            dropped_chars: 0,
        }
    }

    pub fn cursor(&self) -> usize {
        self.cur_index
    }

    pub fn full_response(&self) -> &str {
        &self.full_response
    }

    /// Characters discarded because the cursor ran past the last mapped line.
    pub fn dropped_chars(&self) -> usize {
        self.dropped_chars
    }

    pub fn progress(&self) -> f64 {
        if self.mapping.is_empty() {
            return 100.0;
        }
        (self.cur_index as f64 / self.mapping.len() as f64 * 100.0).min(100.0)
    }

    /// Consumes one fragment, writing into `lines`. `on_progress` fires on every newline.
    pub fn feed<F>(&mut self, fragment: &str, lines: &mut [LyricLine], mut on_progress: F)
    where
        F: FnMut(f64),
    {
        for ch in fragment.chars() {
            self.full_response.push(ch);

            if ch == '\n' {
                self.buffer.clear();
                if self.current_line_done(lines) {
                    self.cur_index += 1;
                }
                on_progress(self.progress());
            }

            self.buffer.push(ch);

            if self.buffer.starts_with('\n') {
                if LINE_NUMBER_MARKER.is_match(&self.buffer) {
                    self.buffer.clear();
                }
                continue;
            }

            self.append_to_current(ch, lines);
        }
    }

    fn current_line_done(&self, lines: &[LyricLine]) -> bool {
        match self.mapping.get(self.cur_index).and_then(|idx| lines.get(idx)) {
            Some(line) => line.has_translation(),
            None => false,
        }
    }

    fn append_to_current(&mut self, ch: char, lines: &mut [LyricLine]) {
        let line = match self
            .mapping
            .get(self.cur_index)
            .and_then(|idx| lines.get_mut(idx))
        {
            Some(line) => line,
            None => {
                self.dropped_chars += 1;
                return;
            }
        };

        let text = line.translated_text.get_or_insert_with(String::new);
        // Stored text is always left-trimmed, so only a leading whitespace
        // character can be trimmed away.
        if text.is_empty() && ch.is_whitespace() {
            return;
        }
        text.push(ch);
    }
}

/// Result of feeding one fragment through an `ActiveReconciliation`.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// New progress maxima, always below 100. The pass owner reports 100 at stream end.
    pub progress: Vec<f64>,
    /// Snapshot of the overlay after it was amended, if it still belonged to this pass.
    pub overlay: Option<LyricSet>,
}

/// Everything a finished pass hands to its completion callback.
#[derive(Debug, Clone)]
pub struct CompletedPass {
    pub task_id: TaskId,
    pub hash: ContentHash,
    pub model: String,
    pub full_response: String,
    pub lyrics: LyricSet,
}

/// One reconciliation pass over one lyric set: the working copy of the lines,
/// the task it reports under, and the model credited in the overlay.
#[derive(Debug, Clone)]
pub struct ActiveReconciliation {
    task_id: TaskId,
    model: String,
    working: LyricSet,
    reconciler: StreamReconciler,
    reported: f64,
}

impl ActiveReconciliation {
    pub fn new(
        task_id: TaskId,
        working: LyricSet,
        mapping: LineMapping,
        model: impl Into<String>,
    ) -> Self {
        Self {
            task_id,
            model: model.into(),
            working,
            reconciler: StreamReconciler::new(mapping),
            reported: 0.0,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn hash(&self) -> &ContentHash {
        &self.working.hash
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn lyrics(&self) -> &LyricSet {
        &self.working
    }

    pub fn reconciler(&self) -> &StreamReconciler {
        &self.reconciler
    }

    /// The pass may only touch an overlay showing the same lyric set.
    pub fn owns(&self, overlay: &Option<LyricSet>) -> bool {
        match overlay {
            Some(o) => o.hash == self.working.hash,
            None => false,
        }
    }

    pub fn apply(&mut self, fragment: &str, overlay: &mut Option<LyricSet>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let mut raw = Vec::new();
        self.reconciler
            .feed(fragment, &mut self.working.lyrics, |p| raw.push(p));
        for p in raw {
            if p > self.reported && p < 100.0 {
                self.reported = p;
                outcome.progress.push(p);
            }
        }

        if let Some(live) = overlay.as_mut() {
            if live.hash == self.working.hash {
                live.lyrics = self.working.lyrics.clone();
                live.amend = true;
                live.contributors.translation = Some(TranslationContributor {
                    name: self.model.clone(),
                });
                outcome.overlay = Some(live.clone());
            }
        }
        outcome
    }

    pub fn finish(self) -> CompletedPass {
        CompletedPass {
            task_id: self.task_id,
            hash: self.working.hash.clone(),
            model: self.model,
            full_response: self.reconciler.full_response,
            lyrics: self.working,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line_mapper::map_lines;

    fn lines(n: usize) -> Vec<LyricLine> {
        (0..n).map(|i| LyricLine::new(format!("line {}", i))).collect()
    }

    fn translated(lines: &[LyricLine]) -> Vec<Option<&str>> {
        lines.iter().map(|l| l.translated_text.as_deref()).collect()
    }

    #[test]
    fn test_two_chunk_scenario() {
        let mut lyrics = lines(2);
        let mut r = StreamReconciler::new(LineMapping::from(vec![0, 1]));
        let mut progress = Vec::new();

        r.feed("1. Hi", &mut lyrics, |p| progress.push(p));
        r.feed("\n2. Bye\n", &mut lyrics, |p| progress.push(p));

        assert_eq!(translated(&lyrics), vec![Some("Hi"), Some("Bye")]);
        assert_eq!(progress, vec![50.0, 100.0]);
        assert_eq!(r.full_response(), "1. Hi\n2. Bye\n");
    }

    #[test]
    fn test_marker_split_across_fragments() {
        let mut lyrics = lines(3);
        let mut r = StreamReconciler::new(LineMapping::from(vec![0, 1, 2]));
        for piece in ["1", ". A", "\n", "1", "0", ".", " B\n3", ".C"] {
            r.feed(piece, &mut lyrics, |_| {});
        }
        assert_eq!(translated(&lyrics), vec![Some("A"), Some("B"), Some("C")]);
    }

    #[test]
    fn test_blank_lines_do_not_advance_cursor() {
        let mut lyrics = lines(2);
        let mut r = StreamReconciler::new(LineMapping::from(vec![0, 1]));
        r.feed("\n\n1. one\n\n\n2. two", &mut lyrics, |_| {});
        assert_eq!(translated(&lyrics), vec![Some("one"), Some("two")]);
        assert_eq!(r.cursor(), 1);
    }

    #[test]
    fn test_writes_follow_mapping_indices() {
        let set = LyricSet::from_lines("h", ["作词: x", "", "alpha", "beta"]);
        let mapped = map_lines(&set);
        let mut lyrics = set.lyrics.clone();
        let mut r = StreamReconciler::new(mapped.mapping);
        r.feed("1. 甲\n2. 乙", &mut lyrics, |_| {});
        assert_eq!(translated(&lyrics), vec![None, None, Some("甲"), Some("乙")]);
    }

    #[test]
    fn test_excess_lines_are_dropped() {
        let mut lyrics = lines(1);
        let mut r = StreamReconciler::new(LineMapping::from(vec![0]));
        let mut progress = Vec::new();
        r.feed("1. only\n2. extra\n3. more", &mut lyrics, |p| progress.push(p));
        assert_eq!(translated(&lyrics), vec![Some("only")]);
        assert_eq!(r.cursor(), 1);
        assert_eq!(r.dropped_chars(), " extra".len() + " more".len());
        assert!(progress.iter().all(|p| *p <= 100.0));
    }

    #[test]
    fn test_leading_whitespace_is_trimmed_inner_kept() {
        let mut lyrics = lines(1);
        let mut r = StreamReconciler::new(LineMapping::from(vec![0]));
        r.feed("1.    a  b ", &mut lyrics, |_| {});
        assert_eq!(lyrics[0].translated_text.as_deref(), Some("a  b "));
    }

    #[test]
    fn test_progress_is_monotonic() {
        let mut lyrics = lines(4);
        let mut r = StreamReconciler::new(LineMapping::from(vec![0, 1, 2, 3]));
        let mut progress = Vec::new();
        for ch in "1. a\n\n2. b\n3. c\n\n4. d\n".chars() {
            r.feed(&ch.to_string(), &mut lyrics, |p| progress.push(p));
        }
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(progress.last().copied(), Some(100.0));
    }

    #[test]
    fn test_active_reconciliation_amends_matching_overlay() {
        let set = LyricSet::from_lines("song-a", ["hello", "world"]);
        let mapped = map_lines(&set);
        let mut active =
            ActiveReconciliation::new(TaskId::new(), set.clone(), mapped.mapping, "gpt-4o");
        let mut overlay = Some(set);

        let outcome = active.apply("1. 你好\n", &mut overlay);
        assert_eq!(outcome.progress, vec![50.0]);
        let live = match outcome.overlay {
            Some(o) => o,
            None => panic!("overlay should be amended"),
        };
        assert!(live.amend);
        assert_eq!(
            live.contributors.translation.map(|c| c.name),
            Some("gpt-4o".to_string())
        );
        assert_eq!(live.lyrics[0].translated_text.as_deref(), Some("你好"));
    }

    #[test]
    fn test_active_reconciliation_holds_back_full_progress() {
        let set = LyricSet::from_lines("song-a", ["one", "two", "three", "four"]);
        let mapped = map_lines(&set);
        let mut active = ActiveReconciliation::new(TaskId::new(), set.clone(), mapped.mapping, "m");
        let mut overlay = Some(set);

        let mut progress = Vec::new();
        for fragment in ["1. a\n\n\n", "2. b\n3. c\n", "4. d\n", "5. extra\n6. more\n"] {
            progress.extend(active.apply(fragment, &mut overlay).progress);
        }
        assert_eq!(progress, vec![25.0, 50.0, 75.0]);
        assert_eq!(active.reconciler().progress(), 100.0);
    }

    #[test]
    fn test_active_reconciliation_leaves_foreign_overlay_alone() {
        let set = LyricSet::from_lines("song-a", ["hello"]);
        let mapped = map_lines(&set);
        let mut active = ActiveReconciliation::new(TaskId::new(), set, mapped.mapping, "m");
        let other = LyricSet::from_lines("song-b", ["other"]);
        let mut overlay = Some(other.clone());

        let outcome = active.apply("1. x", &mut overlay);
        assert!(outcome.overlay.is_none());
        assert_eq!(overlay, Some(other));
        assert!(!active.owns(&overlay));

        let done = active.finish();
        assert_eq!(done.lyrics.lyrics[0].translated_text.as_deref(), Some("x"));
        assert_eq!(done.full_response, "1. x");
    }
}
