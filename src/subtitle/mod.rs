//! Subtitle layout engine.
//!
//! Converts timed bilingual segments into styled cues: a larger primary
//! tier (the translation, unless the source is already CJK) and a smaller
//! secondary tier beneath it. Wrapping is language-aware and sizing adapts
//! to the target video orientation. The whole module is pure: identical
//! input yields byte-identical output.

pub mod ass;

use crate::store::schema::Segment;

// ────────────────────────────────────────────────────────────────
// Orientation & style
// ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Landscape,
    Portrait,
}

impl Orientation {
    pub fn from_dimensions(width: u32, height: u32) -> Self {
        if width < height {
            Orientation::Portrait
        } else {
            Orientation::Landscape
        }
    }
}

/// Style parameters derived from orientation and play resolution. Portrait
/// video gets a larger relative font and tighter horizontal margins, since
/// viewing distance and aspect differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CueStyle {
    pub primary_size: u32,
    pub secondary_size: u32,
    pub margin_lr: u32,
    pub margin_v: u32,
    /// Maximum characters per wrapped line of the primary tier.
    pub wrap_limit: usize,
}

impl CueStyle {
    pub fn for_orientation(orientation: Orientation, width: u32, height: u32) -> Self {
        match orientation {
            Orientation::Portrait => Self {
                primary_size: ((width as f64 * 0.07).min(180.0)) as u32,
                secondary_size: ((width as f64 * 0.028).min(100.0)) as u32,
                margin_lr: (width as f64 * 0.08) as u32,
                margin_v: (height as f64 * 0.04) as u32,
                wrap_limit: 16,
            },
            Orientation::Landscape => Self {
                primary_size: ((height as f64 * 0.07).min(180.0)) as u32,
                secondary_size: ((height as f64 * 0.035).min(100.0)) as u32,
                margin_lr: (width as f64 * 0.02) as u32,
                margin_v: (height as f64 * 0.06) as u32,
                wrap_limit: 28,
            },
        }
    }
}

// ────────────────────────────────────────────────────────────────
// Cues
// ────────────────────────────────────────────────────────────────

/// Rendered form of one segment: wrapped display lines plus timing. Styling
/// is applied when the cue track is serialized.
#[derive(Debug, Clone, PartialEq)]
pub struct Cue {
    pub start: f64,
    pub end: f64,
    /// Larger tier, wrapped.
    pub primary: Vec<String>,
    /// Smaller tier below the primary one, single line.
    pub secondary: Option<String>,
}

/// Lays out segments into cues. `bilingual` composes a two-tier cue per
/// segment whenever a translation is present; otherwise a single tier
/// carries the source text.
pub fn layout(segments: &[Segment], style: &CueStyle, bilingual: bool) -> Vec<Cue> {
    segments
        .iter()
        .map(|segment| {
            let source = collapse_whitespace(&segment.text);
            let translation = segment
                .translation
                .as_deref()
                .map(collapse_whitespace)
                .filter(|t| !t.is_empty());
            match translation {
                Some(translation) if bilingual => {
                    if is_cjk_language(&segment.language) {
                        // CJK source stays on the large tier, the latin
                        // translation reads fine on one small line.
                        Cue {
                            start: segment.start,
                            end: segment.end,
                            primary: wrap_line(&source, style.wrap_limit),
                            secondary: Some(translation),
                        }
                    } else {
                        Cue {
                            start: segment.start,
                            end: segment.end,
                            primary: wrap_line(&translation, style.wrap_limit),
                            secondary: Some(source),
                        }
                    }
                }
                _ => Cue {
                    start: segment.start,
                    end: segment.end,
                    primary: wrap_line(&source, style.wrap_limit),
                    secondary: None,
                },
            }
        })
        .collect()
}

// ────────────────────────────────────────────────────────────────
// Wrapping
// ────────────────────────────────────────────────────────────────

/// Punctuation a CJK line prefers to break after.
const BREAK_AFTER: &[char] = &[
    '，', '。', '、', '；', '：', '！', '？', ',', '.', ';', ':', '!', '?',
];

/// Connective words a CJK line prefers to break before.
const CONNECTIVES: &[&str] = &[
    "因为", "所以", "因此", "但是", "可是", "然而", "不过", "而且", "并且", "同时", "另外",
    "此外", "然后", "接着", "如果", "那么", "虽然", "即使", "或者", "还是",
];

/// Wraps `text` into lines of at most `limit` characters. Whitespace-
/// delimited scripts break at word boundaries; CJK text breaks by character
/// count, preferring punctuation, then connectives. Splits always land on
/// `char` boundaries, never inside a logical character.
pub fn wrap_line(text: &str, limit: usize) -> Vec<String> {
    if limit == 0 || text.chars().count() <= limit {
        return vec![text.to_string()];
    }
    if contains_cjk(text) {
        wrap_cjk(text, limit)
    } else {
        wrap_words(text, limit)
    }
}

fn wrap_cjk(text: &str, limit: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut line: Vec<char> = Vec::new();

    for ch in text.chars() {
        line.push(ch);
        if line.len() >= limit {
            let split = punctuation_break(&line)
                .or_else(|| connective_break(&line))
                .unwrap_or(line.len());
            lines.push(line[..split].iter().collect());
            line.drain(..split);
        }
    }
    if !line.is_empty() {
        lines.push(line.iter().collect());
    }
    lines
}

/// Rightmost punctuation past the first third of the line; break after it.
fn punctuation_break(line: &[char]) -> Option<usize> {
    let floor = line.len() / 3;
    line.iter()
        .enumerate()
        .rev()
        .find(|(index, ch)| BREAK_AFTER.contains(ch) && index + 1 > floor)
        .map(|(index, _)| index + 1)
}

/// Rightmost connective past the first third of the line; break before it.
fn connective_break(line: &[char]) -> Option<usize> {
    let floor = line.len() / 3;
    let mut best = None;
    for connective in CONNECTIVES {
        let word: Vec<char> = connective.chars().collect();
        if word.len() > line.len() {
            continue;
        }
        for start in (0..=line.len() - word.len()).rev() {
            if start > floor && line[start..start + word.len()] == word[..] {
                best = best.max(Some(start));
                break;
            }
        }
    }
    best
}

fn wrap_words(text: &str, limit: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for word in text.split_whitespace() {
        let word_len = word.chars().count();
        if current_len > 0 && current_len + 1 + word_len <= limit {
            current.push(' ');
            current.push_str(word);
            current_len += 1 + word_len;
            continue;
        }
        if current_len > 0 {
            lines.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if word_len <= limit {
            current.push_str(word);
            current_len = word_len;
        } else {
            // A single word longer than the limit is chunked on char
            // boundaries.
            let chars: Vec<char> = word.chars().collect();
            for chunk in chars.chunks(limit) {
                if chunk.len() == limit {
                    lines.push(chunk.iter().collect());
                } else {
                    current = chunk.iter().collect();
                    current_len = chunk.len();
                }
            }
        }
    }
    if current_len > 0 {
        lines.push(current);
    }
    lines
}

// ────────────────────────────────────────────────────────────────
// Script detection
// ────────────────────────────────────────────────────────────────

fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk_char)
}

fn is_cjk_char(ch: char) -> bool {
    matches!(ch,
        '\u{4E00}'..='\u{9FFF}'     // CJK unified ideographs
        | '\u{3400}'..='\u{4DBF}'   // extension A
        | '\u{3040}'..='\u{30FF}'   // hiragana + katakana
        | '\u{AC00}'..='\u{D7AF}'   // hangul syllables
        | '\u{F900}'..='\u{FAFF}'   // compatibility ideographs
    )
}

fn is_cjk_language(language: &str) -> bool {
    let lower = language.to_ascii_lowercase();
    matches!(
        lower.as_str(),
        "zh" | "zh-cn" | "zh-tw" | "chinese" | "ja" | "japanese" | "ko" | "korean"
    )
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(text: &str, language: &str, translation: Option<&str>) -> Segment {
        Segment {
            start: 0.0,
            end: 2.0,
            text: text.to_string(),
            language: language.to_string(),
            translation: translation.map(str::to_string),
        }
    }

    fn style_landscape() -> CueStyle {
        CueStyle::for_orientation(Orientation::Landscape, 1280, 720)
    }

    #[test]
    fn layout_is_deterministic() {
        let segments = vec![
            segment("hello there, how are you doing today", "en", Some("你好，你今天过得怎么样")),
            segment("fine thanks", "en", Some("很好，谢谢")),
        ];
        let style = style_landscape();
        let first = layout(&segments, &style, true);
        let second = layout(&segments, &style, true);
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[test]
    fn bilingual_cue_puts_translation_on_primary_tier() {
        let segments = vec![segment("good morning", "en", Some("早上好"))];
        let cues = layout(&segments, &style_landscape(), true);
        assert_eq!(cues[0].primary, vec!["早上好".to_string()]);
        assert_eq!(cues[0].secondary.as_deref(), Some("good morning"));
    }

    #[test]
    fn cjk_source_keeps_primary_tier() {
        let segments = vec![segment("早上好", "zh", Some("good morning"))];
        let cues = layout(&segments, &style_landscape(), true);
        assert_eq!(cues[0].primary, vec!["早上好".to_string()]);
        assert_eq!(cues[0].secondary.as_deref(), Some("good morning"));
    }

    #[test]
    fn monolingual_cue_has_single_tier() {
        let segments = vec![segment("good morning", "en", Some("早上好"))];
        let cues = layout(&segments, &style_landscape(), false);
        assert_eq!(cues[0].primary, vec!["good morning".to_string()]);
        assert!(cues[0].secondary.is_none());
    }

    #[test]
    fn cjk_wrap_never_exceeds_limit() {
        let text = "这是一个很长的句子，因为我们需要测试换行逻辑，所以它必须超过限制才行";
        for limit in [8usize, 12, 16, 28] {
            for line in wrap_line(text, limit) {
                assert!(
                    line.chars().count() <= limit,
                    "line {line:?} exceeds {limit}"
                );
            }
        }
    }

    #[test]
    fn cjk_wrap_preserves_every_character() {
        let text = "今天天气很好，我们决定去公园散步，然后喝杯咖啡";
        let joined: String = wrap_line(text, 10).concat();
        assert_eq!(joined, text);
    }

    #[test]
    fn cjk_wrap_prefers_breaking_after_punctuation() {
        let text = "今天天气很好，我们决定去公园散步";
        let lines = wrap_line(text, 10);
        assert!(lines[0].ends_with('，'), "got {lines:?}");
    }

    #[test]
    fn word_wrap_respects_word_boundaries() {
        let text = "the quick brown fox jumps over the lazy dog";
        let lines = wrap_line(text, 15);
        for line in &lines {
            assert!(line.chars().count() <= 15, "line {line:?}");
        }
        assert_eq!(lines.join(" "), text);
    }

    #[test]
    fn overlong_word_is_chunked_on_char_boundaries() {
        let text = "Donaudampfschifffahrtsgesellschaft";
        let lines = wrap_line(text, 10);
        assert!(lines.iter().all(|l| l.chars().count() <= 10));
        assert_eq!(lines.concat(), text);
    }

    #[test]
    fn wrap_never_splits_inside_a_logical_character() {
        // Mixed multi-byte content routes through the CJK wrapper, which
        // partitions the char sequence exactly: rebuilding the lines must
        // reproduce the input, whole characters only.
        let text = "naïve café 日本語のテキストが混ざっている文です";
        for limit in 2..12 {
            let lines = wrap_line(text, limit);
            assert_eq!(lines.concat(), text, "limit {limit}");
            assert!(lines.iter().all(|line| line.chars().count() <= limit));
        }
    }

    #[test]
    fn portrait_primary_font_at_least_landscape() {
        let landscape = CueStyle::for_orientation(Orientation::Landscape, 1280, 720);
        let portrait = CueStyle::for_orientation(Orientation::Portrait, 720, 1280);
        assert!(portrait.primary_size >= landscape.primary_size);
        assert!(portrait.margin_lr > landscape.margin_lr);
        assert!(portrait.wrap_limit < landscape.wrap_limit);
    }

    #[test]
    fn orientation_from_dimensions() {
        assert_eq!(Orientation::from_dimensions(1920, 1080), Orientation::Landscape);
        assert_eq!(Orientation::from_dimensions(1080, 1920), Orientation::Portrait);
        assert_eq!(Orientation::from_dimensions(720, 720), Orientation::Landscape);
    }
}
