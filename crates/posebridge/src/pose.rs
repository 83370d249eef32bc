//! Pose line recognition and the grid transform.
//!
//! The worker reports its position as free-form log lines such as
//! `Current pose: x: 1.60, y: -0.32`. Only lines starting with
//! [`POSE_PREFIX`] are considered; everything else is ordinary log output.

use serde::Serialize;

/// Literal prefix marking a pose report (case-sensitive).
pub const POSE_PREFIX: &str = "Current pose";

/// Default metres-per-grid-cell divisor.
pub const DEFAULT_SCALE: f64 = 0.08;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PoseParseError {
    #[error("expected at least two 'label: number' fields, found {found}")]
    MissingFields { found: usize },

    #[error("field {index} is not a number: {value:?}")]
    NotANumber { index: usize, value: String },

    #[error("field {index} is not finite: {value}")]
    NonFinite { index: usize, value: f64 },
}

/// Raw coordinates as printed by the worker, before the grid transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawPose {
    pub x: f64,
    pub y: f64,
}

/// Pose in integer grid units, as published on the pose topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoseRecord {
    pub x: i64,
    pub y: i64,
}

impl PoseRecord {
    /// Wire payload: `{"x":<int>,"y":<int>}`.
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Linear transform from the worker's frame into grid units.
///
/// `x' = trunc(x / scale)`, `y' = trunc(-y / scale)`. The y axis is flipped
/// because the map frame grows downwards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseTransform {
    scale: f64,
}

impl Default for PoseTransform {
    fn default() -> Self {
        Self {
            scale: DEFAULT_SCALE,
        }
    }
}

impl PoseTransform {
    pub fn new(scale: f64) -> Self {
        Self { scale }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Apply the transform. `as` truncates toward zero, so `-1.25` becomes
    /// `-1`, not `-2`.
    pub fn apply(&self, raw: RawPose) -> PoseRecord {
        PoseRecord {
            x: (raw.x / self.scale) as i64,
            y: (-raw.y / self.scale) as i64,
        }
    }
}

/// Returns true if `line` is a pose report.
pub fn is_pose_line(line: &str) -> bool {
    line.starts_with(POSE_PREFIX)
}

/// Parse one line.
///
/// `Ok(None)` means the line is not a pose report at all. `Err` means it
/// carries the pose prefix but the coordinates could not be extracted.
///
/// The line is split on `,` and fields 0 and 1 carry x and y; the number
/// is whatever follows the last `:` in the field (or the whole field when
/// it has none). A leading field that is exactly [`POSE_PREFIX`], as in
/// `Current pose, x: 1.6, y: 2`, is skipped first. Fields after the second
/// (`z`, `timestamp`, ...) are ignored.
pub fn parse_pose_line(line: &str) -> Result<Option<RawPose>, PoseParseError> {
    if !is_pose_line(line) {
        return Ok(None);
    }

    let mut fields = line.split(',').peekable();
    fields.next_if(|field| field.trim() == POSE_PREFIX);
    let fields: Vec<&str> = fields.collect();

    let [x, y, ..] = fields.as_slice() else {
        return Err(PoseParseError::MissingFields {
            found: fields.len(),
        });
    };

    Ok(Some(RawPose {
        x: parse_number(0, field_value(x))?,
        y: parse_number(1, field_value(y))?,
    }))
}

fn field_value(field: &str) -> &str {
    field
        .rsplit_once(':')
        .map_or(field, |(_, value)| value)
        .trim()
}

fn parse_number(index: usize, value: &str) -> Result<f64, PoseParseError> {
    let parsed: f64 = value.parse().map_err(|_| PoseParseError::NotANumber {
        index,
        value: value.to_string(),
    })?;
    if !parsed.is_finite() {
        return Err(PoseParseError::NonFinite {
            index,
            value: parsed,
        });
    }
    Ok(parsed)
}

/// Parse a line and apply `transform` in one step.
pub fn pose_from_line(
    line: &str,
    transform: &PoseTransform,
) -> Result<Option<PoseRecord>, PoseParseError> {
    Ok(parse_pose_line(line)?.map(|raw| transform.apply(raw)))
}
