// ============================================================
// Layer 3 — Point Annotation Domain Types
// ============================================================
// A crowd image is annotated with one (x, y) point per head.
// The count of an image is simply the number of points.
//
// Points are real-valued pixel coordinates:
//   x grows to the right (column), y grows downwards (row).
// Order carries no meaning and duplicates are allowed
// (two heads can overlap in the same pixel).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One annotated head position in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point
    pub fn distance(&self, other: &Point) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// The full set of head points for one image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointAnnotation {
    pub points: Vec<Point>,
}

impl PointAnnotation {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    /// Number of annotated heads
    pub fn count(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// What the annotation loader hands back for one image id:
/// the points plus the geometry of the image they belong to.
#[derive(Debug, Clone)]
pub struct AnnotatedImage {
    /// Identifier of the image, e.g. "IMG_12"
    pub id: String,
    /// Source raster on disk
    pub image_path: PathBuf,
    pub width: usize,
    pub height: usize,
    pub annotation: PointAnnotation,
}
