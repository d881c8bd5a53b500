use crate::line_mapper::is_credit_line;

/// Scripts present across a lyric set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScriptMix {
    pub chinese: bool,
    pub japanese: bool,
    pub korean: bool,
    pub latin: bool,
}

fn is_chinese(c: char) -> bool {
    ('\u{4e00}'..='\u{9fa5}').contains(&c)
}

fn is_kana(c: char) -> bool {
    ('\u{3040}'..='\u{30ff}').contains(&c)
}

fn is_hangul(c: char) -> bool {
    ('\u{ac00}'..='\u{d7a3}').contains(&c)
}

impl ScriptMix {
    pub fn detect<S: AsRef<str>>(lines: &[S]) -> Self {
        let mut mix = ScriptMix::default();
        for line in lines {
            let line = line.as_ref();
            if is_credit_line(line.trim()) {
                continue;
            }
            for c in line.chars() {
                mix.chinese |= is_chinese(c);
                mix.japanese |= is_kana(c);
                mix.korean |= is_hangul(c);
                mix.latin |= c.is_ascii_alphabetic();
            }
        }
        mix
    }

    /// Chinese lyrics only qualify when mixed with kana or hangul; otherwise
    /// any Latin, kana or hangul text qualifies.
    pub fn is_translatable(&self) -> bool {
        if self.chinese {
            self.japanese || self.korean
        } else {
            self.latin || self.japanese || self.korean
        }
    }
}

pub fn should_translate<S: AsRef<str>>(lines: &[S]) -> bool {
    ScriptMix::detect(lines).is_translatable()
}
