use std::fmt;
use std::sync::LazyLock;

use regex::{Regex, RegexSet};

/// Decoder error messages ffmpeg prints when the incoming feed is damaged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    CorruptFrame,
    DecodeFailure,
    InvalidData,
    BadReference,
    Concealment,
}

impl DecodeErrorKind {
    const ALL: [DecodeErrorKind; 5] = [
        DecodeErrorKind::CorruptFrame,
        DecodeErrorKind::DecodeFailure,
        DecodeErrorKind::InvalidData,
        DecodeErrorKind::BadReference,
        DecodeErrorKind::Concealment,
    ];

    fn pattern(&self) -> &'static str {
        match self {
            DecodeErrorKind::CorruptFrame => r"corrupt decoded frame",
            DecodeErrorKind::DecodeFailure => r"error while decoding",
            DecodeErrorKind::InvalidData => r"invalid data found when processing input",
            DecodeErrorKind::BadReference => r"reference \d+ >= \d+",
            DecodeErrorKind::Concealment => r"concealing \d+ dc, \d+ ac, \d+ mv errors",
        }
    }
}

impl fmt::Display for DecodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeSignal {
    /// Real-time playback ratio, 1.0 means the feed keeps up with wall clock
    Speed(f64),
    Error(DecodeErrorKind),
    Ignored,
}

static SPEED_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"speed=\s*(\d+(?:\.\d+)?)x").expect("valid speed pattern"));

static ERROR_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new(
        DecodeErrorKind::ALL
            .iter()
            .map(|kind| format!("(?i){}", kind.pattern())),
    )
    .expect("valid decoder error patterns")
});

/// Classify one line of probe output. A line carries at most one signal and
/// a speed reading wins over an error message on the same line.
pub fn classify(line: &str) -> ProbeSignal {
    if let Some(speed) = SPEED_PATTERN
        .captures(line)
        .and_then(|captures| captures.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
    {
        return ProbeSignal::Speed(speed);
    }

    match ERROR_PATTERNS.matches(line).iter().next() {
        Some(index) => ProbeSignal::Error(DecodeErrorKind::ALL[index]),
        None => ProbeSignal::Ignored,
    }
}
