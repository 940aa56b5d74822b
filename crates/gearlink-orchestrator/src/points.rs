//! ---
//! gl_section: "05-orchestration"
//! gl_subsection: "module"
//! gl_type: "source"
//! gl_scope: "code"
//! gl_description: "Coordinate work items and the plain-text points file format."
//! gl_version: "v0.0.0-prealpha"
//! gl_owner: "tbd"
//! ---
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use gearlink_msg::{CommandMessage, WirePayload};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::warn;

use crate::workflow::WorkItem;

const SAMPLE: &[&str] = &[
    "# gearlink sample points file",
    "# format: x,y (one point per line)",
    "# grid scan",
    "0,0",
    "10,0",
    "20,0",
    "0,10",
    "10,10",
    "20,10",
    "0,20",
    "10,20",
    "20,20",
    "# diagonal",
    "5,5",
    "15,15",
    "-5,-5",
    "-10,-10",
];

/// Planar coordinate visited by a `move_point` command.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Horizontal coordinate.
    pub x: f64,
    /// Vertical coordinate.
    pub y: f64,
}

impl Point {
    /// Construct a point.
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// `move_point` work item carrying `{"point": {"x", "y"}}`.
    pub fn to_work_item(&self) -> WorkItem {
        let mut payload = WirePayload::new();
        payload.insert("point".to_owned(), json!({ "x": self.x, "y": self.y }));
        WorkItem::new(self.to_string(), CommandMessage::MOVE_POINT, payload)
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

impl From<[f64; 2]> for Point {
    fn from([x, y]: [f64; 2]) -> Self {
        Self::new(x, y)
    }
}

/// Parse a single `x,y` pair.
impl std::str::FromStr for Point {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (x, y) = s
            .split_once(',')
            .ok_or_else(|| "expected `x,y`".to_owned())?;
        let parse = |value: &str| {
            value
                .trim()
                .parse::<f64>()
                .map_err(|err| format!("{:?}: {err}", value.trim()))
                .and_then(|number| {
                    if number.is_finite() {
                        Ok(number)
                    } else {
                        Err(format!("{:?} is not a finite number", value.trim()))
                    }
                })
        };
        Ok(Self::new(parse(x)?, parse(y)?))
    }
}

/// A line of a points file that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedLine {
    /// 1-based line number.
    pub line: usize,
    /// Trimmed line text.
    pub content: String,
    /// Why it was rejected.
    pub reason: String,
}

/// Parsed points plus the lines that were skipped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointsFile {
    /// Accepted points in file order.
    pub points: Vec<Point>,
    /// Skipped lines.
    pub rejected: Vec<RejectedLine>,
}

impl PointsFile {
    /// Work items in file order.
    pub fn work_items(&self) -> Vec<WorkItem> {
        self.points.iter().map(Point::to_work_item).collect()
    }
}

/// IO failures around points files.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum PointsError {
    #[error("unable to read points file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to write points file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Parse points text: one `x,y` per line, blank lines and `#` comments ignored.
/// Malformed lines are reported and skipped.
pub fn parse_points(text: &str) -> PointsFile {
    let mut parsed = PointsFile::default();
    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.parse::<Point>() {
            Ok(point) => parsed.points.push(point),
            Err(reason) => {
                warn!(line = index + 1, content = line, reason = %reason, "skipping malformed point");
                parsed.rejected.push(RejectedLine {
                    line: index + 1,
                    content: line.to_owned(),
                    reason,
                });
            }
        }
    }
    parsed
}

/// Read and parse a points file.
pub fn read_points_file(path: &Path) -> Result<PointsFile, PointsError> {
    let text = fs::read_to_string(path).map_err(|source| PointsError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_points(&text))
}

/// Write the sample points file (grid scan plus diagonal).
pub fn generate_sample(path: &Path) -> Result<usize, PointsError> {
    let mut contents = SAMPLE.join("\n");
    contents.push('\n');
    fs::write(path, contents).map_err(|source| PointsError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(SAMPLE.iter().filter(|line| !line.starts_with('#')).count())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_blank_and_bad_lines_are_skipped() {
        let parsed = parse_points("# header\n\n10, 5\n12.3,-7.5\nabc\n1;2\n  0,0  \n");
        assert_eq!(
            parsed.points,
            vec![Point::new(10.0, 5.0), Point::new(12.3, -7.5), Point::new(0.0, 0.0)]
        );
        let lines: Vec<usize> = parsed.rejected.iter().map(|rejected| rejected.line).collect();
        assert_eq!(lines, vec![5, 6]);
    }

    #[test]
    fn non_finite_values_are_rejected() {
        assert!("NaN,1".parse::<Point>().is_err());
        assert!("1,inf".parse::<Point>().is_err());
    }

    #[test]
    fn work_item_carries_point_payload() {
        let item = Point::new(-5.2, 8.1).to_work_item();
        assert_eq!(item.kind, "move_point");
        assert_eq!(item.label, "(-5.2, 8.1)");
        assert_eq!(item.payload["point"]["x"], -5.2);
        assert_eq!(item.payload["point"]["y"], 8.1);
    }

    #[test]
    fn generated_sample_round_trips_through_the_parser() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("points.txt");
        let written = generate_sample(&path).expect("generate");
        let parsed = read_points_file(&path).expect("read");
        assert_eq!(parsed.points.len(), written);
        assert_eq!(written, 13);
        assert!(parsed.rejected.is_empty());
        assert_eq!(parsed.points[0], Point::new(0.0, 0.0));
        assert_eq!(parsed.points[12], Point::new(-10.0, -10.0));
    }

    #[test]
    fn missing_file_is_reported_with_its_path() {
        let err = read_points_file(Path::new("/nonexistent/points.txt")).expect_err("missing");
        assert!(err.to_string().contains("/nonexistent/points.txt"));
    }
}
