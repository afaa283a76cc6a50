use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Grade {
    #[serde(rename = "A+")]
    APlus,
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    pub fn as_str(self) -> &'static str {
        match self {
            Grade::APlus => "A+",
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        }
    }
}

impl std::fmt::Display for Grade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive lower bound per band, highest first. Anything below the last
/// bound is an F.
pub const GRADE_BANDS: [(i64, Grade); 5] = [
    (90, Grade::APlus),
    (80, Grade::A),
    (70, Grade::B),
    (60, Grade::C),
    (50, Grade::D),
];

/// Maps a validated score in [0, 100] to its letter grade.
pub fn classify(score: i64) -> Grade {
    GRADE_BANDS
        .iter()
        .find(|(floor, _)| score >= *floor)
        .map(|(_, grade)| *grade)
        .unwrap_or(Grade::F)
}

/// Average of integer scores rounded to one decimal, as shown on report cards.
pub fn average(scores: &[i64]) -> Option<f64> {
    if scores.is_empty() {
        return None;
    }
    let sum: i64 = scores.iter().sum();
    let avg = sum as f64 / scores.len() as f64;
    Some((avg * 10.0).round() / 10.0)
}

/// Grade for a set of scores, classified from the exact mean rounded half up
/// to a whole score. The one-decimal `average` is for display only.
pub fn overall(scores: &[i64]) -> Option<Grade> {
    if scores.is_empty() {
        return None;
    }
    let n = scores.len() as i64;
    let sum: i64 = scores.iter().sum();
    Some(classify((2 * sum + n) / (2 * n)))
}
