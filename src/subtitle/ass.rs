//! ASS subtitle track rendering.
//!
//! Serializes laid-out cues into an Advanced SubStation Alpha track with
//! two styles: `Primary` for the large tier and `Source` for the small
//! tier beneath it. Output is byte-identical for identical input.

use std::fmt::Write as _;

use super::{Cue, CueStyle};

/// Font pair used by the two styles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FontSet {
    pub primary: &'static str,
    pub secondary: &'static str,
}

impl FontSet {
    /// Platform-appropriate CJK-capable fonts.
    pub fn for_platform() -> Self {
        match std::env::consts::OS {
            "macos" => FontSet {
                primary: "PingFang SC",
                secondary: "Helvetica Neue",
            },
            "linux" => FontSet {
                primary: "Noto Sans CJK SC",
                secondary: "DejaVu Sans",
            },
            _ => FontSet {
                primary: "Microsoft YaHei",
                secondary: "Segoe UI",
            },
        }
    }
}

/// Renders a complete ASS track for the given play resolution.
pub fn render_track(
    cues: &[Cue],
    style: &CueStyle,
    fonts: &FontSet,
    width: u32,
    height: u32,
) -> String {
    let mut out = String::new();

    let _ = write!(
        out,
        "[Script Info]\n\
         ScriptType: v4.00+\n\
         Collisions: Normal\n\
         PlayResX: {width}\n\
         PlayResY: {height}\n\
         WrapStyle: 0\n\
         \n\
         [V4+ Styles]\n\
         Format: Name, Fontname, Fontsize, PrimaryColour, SecondaryColour, OutlineColour, BackColour, Bold, Italic, Underline, StrikeOut, ScaleX, ScaleY, Spacing, Angle, BorderStyle, Outline, Shadow, Alignment, MarginL, MarginR, MarginV, Encoding\n\
         Style: Primary,{primary_font},{primary_size},&H00FFFFFF,&H000000FF,&H00000000,&H78000000,0,0,0,0,100,100,0,0,4,4,0,2,{margin_lr},{margin_lr},{margin_v},1\n\
         Style: Source,{secondary_font},{secondary_size},&H00E0FFFF,&H000000FF,&H00000000,&H80000000,0,0,0,0,100,100,0,0,1,3,1.5,2,{margin_lr},{margin_lr},{margin_v},1\n\
         \n\
         [Events]\n\
         Format: Layer, Start, End, Style, Name, MarginL, MarginR, MarginV, Effect, Text\n",
        primary_font = fonts.primary,
        primary_size = style.primary_size,
        secondary_font = fonts.secondary,
        secondary_size = style.secondary_size,
        margin_lr = style.margin_lr,
        margin_v = style.margin_v,
    );

    // When a secondary tier is present the primary tier is lifted above it.
    let line_spacing = style.primary_size * 3 / 10;
    let lifted_margin = style.margin_v + style.secondary_size + line_spacing;

    for cue in cues {
        let start = format_timestamp(cue.start);
        let end = format_timestamp(cue.end);
        let text = cue.primary.join(r"\N");
        match &cue.secondary {
            Some(secondary) => {
                let _ = writeln!(
                    out,
                    "Dialogue: 0,{start},{end},Primary,,0,0,{lifted_margin},,{text}"
                );
                let _ = writeln!(out, "Dialogue: 0,{start},{end},Source,,0,0,0,,{secondary}");
            }
            None => {
                let _ = writeln!(out, "Dialogue: 0,{start},{end},Primary,,0,0,0,,{text}");
            }
        }
    }

    out
}

/// `H:MM:SS.CC` with centisecond precision, the ASS dialogue time format.
pub fn format_timestamp(seconds: f64) -> String {
    let clamped = seconds.max(0.0);
    let whole = clamped as u64;
    let hours = whole / 3600;
    let minutes = (whole % 3600) / 60;
    let secs = whole % 60;
    let centis = ((clamped - whole as f64) * 100.0) as u64;
    format!("{hours}:{minutes:02}:{secs:02}.{centis:02}")
}
