// ============================================================
// Layer 4 — Annotation Loader
// ============================================================
// Reads a ShanghaiTech-style raw dataset:
//
//   <root>/
//     images/IMG_1.jpg
//     ground-truth/GT_IMG_1.mat    (or .json / .txt / .csv)
//
// Supported ground-truth formats:
//   MAT   image_info{1}.location   (ShanghaiTech, N x 2)
//         annPoints                (N x 2, or 1 x N x 2)
//   JSON  [[x, y], ...]
//         {"points": [[x, y], ...], "count": 2}
//   text  one "x y" or "x,y" pair per line, '#' comments
//
// Image width/height are taken from the image header; every
// point must lie inside [0, width] x [0, height]. Coordinates
// are checked at f64 before being narrowed to f32.
//
// Reference: image crate (image_dimensions)
//            serde_json::Value for hand-validated JSON

use anyhow::{Context, Result};
use serde_json::Value;
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::data::mat::{MatFile, MatValue};
use crate::domain::annotation::{AnnotatedImage, Point, PointAnnotation};
use crate::domain::error::{CrowdError, CrowdResult};
use crate::domain::traits::AnnotationSource;

pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];
pub const ANNOTATION_EXTENSIONS: [&str; 4] = ["mat", "json", "txt", "csv"];

/// Raw (x, y) pairs as read, before bounds checking.
type RawPoints = Vec<(f64, f64)>;

/// Loads point annotations for the images under one dataset root.
pub struct AnnotationLoader {
    root: PathBuf,
}

impl AnnotationLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn ground_truth_dir(&self) -> PathBuf {
        self.root.join("ground-truth")
    }

    fn find_with_extension(dir: &Path, stem: &str, extensions: &[&str]) -> Option<PathBuf> {
        extensions
            .iter()
            .map(|ext| dir.join(format!("{stem}.{ext}")))
            .find(|p| p.is_file())
    }

    fn image_path(&self, image_id: &str) -> Option<PathBuf> {
        Self::find_with_extension(&self.images_dir(), image_id, &IMAGE_EXTENSIONS)
    }

    fn annotation_path(&self, image_id: &str) -> Option<PathBuf> {
        Self::find_with_extension(
            &self.ground_truth_dir(),
            &format!("GT_{image_id}"),
            &ANNOTATION_EXTENSIONS,
        )
    }
}

impl AnnotationSource for AnnotationLoader {
    fn image_ids(&self) -> Result<Vec<String>> {
        let dir = self.images_dir();
        let mut ids = Vec::new();

        for entry in fs::read_dir(&dir)
            .with_context(|| format!("Cannot read image directory '{}'", dir.display()))?
        {
            let path = entry?.path();
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase());
            let is_image = ext.as_deref().is_some_and(|e| IMAGE_EXTENSIONS.contains(&e));
            if !is_image {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }

        ids.sort();
        ids.dedup();
        tracing::debug!("Found {} images in '{}'", ids.len(), dir.display());
        Ok(ids)
    }

    fn load(&self, image_id: &str) -> CrowdResult<AnnotatedImage> {
        let gt_path = self.annotation_path(image_id).ok_or_else(|| {
            let searched = ANNOTATION_EXTENSIONS
                .iter()
                .map(|ext| {
                    self.ground_truth_dir()
                        .join(format!("GT_{image_id}.{ext}"))
                        .display()
                        .to_string()
                })
                .collect::<Vec<_>>()
                .join(", ");
            CrowdError::MissingAnnotation { image_id: image_id.to_string(), searched }
        })?;

        let image_path = self.image_path(image_id).ok_or_else(|| {
            CrowdError::io(
                self.images_dir().join(image_id),
                std::io::Error::new(std::io::ErrorKind::NotFound, "image file not found"),
            )
        })?;

        let (width, height) = image::image_dimensions(&image_path)
            .map_err(|source| CrowdError::Image { path: image_path.clone(), source })?;
        let (width, height) = (width as usize, height as usize);
        if width == 0 || height == 0 {
            return Err(CrowdError::InvalidGeometry { width, height });
        }

        let raw = parse_annotation_file(&gt_path)?;
        let points = validate_bounds(&gt_path, &raw, width, height)?;

        Ok(AnnotatedImage {
            id: image_id.to_string(),
            image_path,
            width,
            height,
            annotation: PointAnnotation::new(points),
        })
    }
}

/// Parse a ground-truth file into raw coordinates, choosing the format by extension.
pub fn parse_annotation_file(path: &Path) -> CrowdResult<RawPoints> {
    let bytes = fs::read(path).map_err(|e| CrowdError::io(path, e))?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    if ext.as_deref() == Some("mat") {
        return parse_mat_points(path, &bytes);
    }
    let text = String::from_utf8(bytes)
        .map_err(|_| CrowdError::corrupt(path, "file is not valid UTF-8"))?;
    if ext.as_deref() == Some("json") {
        parse_json_points(path, &text)
    } else {
        parse_text_points(path, &text)
    }
}

fn parse_mat_points(path: &Path, bytes: &[u8]) -> CrowdResult<RawPoints> {
    let mat = MatFile::parse(bytes).map_err(|e| CrowdError::corrupt(path, e.to_string()))?;

    let matrix = if let Some(info) = mat.get("image_info") {
        info.first_cell()
            .and_then(|s| s.field("location"))
            .ok_or_else(|| CrowdError::corrupt(path, "'image_info' has no 'location' field"))?
    } else if let Some(points) = mat.get("annPoints") {
        points
    } else {
        let found = mat.names().collect::<Vec<_>>().join(", ");
        return Err(CrowdError::corrupt(
            path,
            format!("neither 'image_info' nor 'annPoints' found (variables: [{found}])"),
        ));
    };

    let MatValue::Numeric { dims, data } = matrix else {
        return Err(CrowdError::corrupt(path, "point variable is not a numeric matrix"));
    };
    if data.is_empty() {
        return Ok(Vec::new());
    }

    // [1, N, 2] and friends: drop leading singleton axes
    let mut shape: &[usize] = dims;
    while shape.len() > 2 && shape[0] == 1 {
        shape = &shape[1..];
    }
    let n = match shape {
        [n, 2] => *n,
        _ => {
            return Err(CrowdError::corrupt(path, format!("expected an N x 2 point matrix, found {dims:?}")))
        }
    };

    // column-major: all xs, then all ys
    Ok((0..n).map(|i| (data[i], data[n + i])).collect())
}

fn parse_json_points(path: &Path, text: &str) -> CrowdResult<RawPoints> {
    // Truncated files and non-JSON garbage fail right here
    let value: Value = serde_json::from_str(text)
        .map_err(|e| CrowdError::corrupt(path, format!("invalid JSON: {e}")))?;

    let (raw_points, declared) = match &value {
        Value::Array(items) => (items, None),
        Value::Object(map) => {
            let items = map
                .get("points")
                .and_then(Value::as_array)
                .ok_or_else(|| CrowdError::corrupt(path, "missing 'points' array"))?;
            let declared = match map.get("count") {
                None | Some(Value::Null) => None,
                Some(v) => Some(v.as_u64().ok_or_else(|| {
                    CrowdError::corrupt(path, "'count' must be a non-negative integer")
                })? as usize),
            };
            (items, declared)
        }
        _ => return Err(CrowdError::corrupt(path, "expected an array or an object")),
    };

    let mut points = Vec::with_capacity(raw_points.len());
    for (i, item) in raw_points.iter().enumerate() {
        let pair = item
            .as_array()
            .filter(|a| a.len() == 2)
            .ok_or_else(|| CrowdError::corrupt(path, format!("point {i}: expected [x, y]")))?;
        let x = pair[0].as_f64();
        let y = pair[1].as_f64();
        match (x, y) {
            (Some(x), Some(y)) => points.push((x, y)),
            _ => {
                return Err(CrowdError::corrupt(path, format!("point {i}: non-numeric coordinate")))
            }
        }
    }

    if let Some(n) = declared {
        if n != points.len() {
            return Err(CrowdError::corrupt(
                path,
                format!("declared count {n} but found {} points", points.len()),
            ));
        }
    }

    Ok(points)
}

fn parse_text_points(path: &Path, text: &str) -> CrowdResult<RawPoints> {
    let mut points = Vec::new();

    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .collect();
        if fields.len() != 2 {
            return Err(CrowdError::corrupt(
                path,
                format!("line {}: expected 2 coordinates, found {}", line_no + 1, fields.len()),
            ));
        }

        let parse = |s: &str| {
            s.parse::<f64>().map_err(|_| {
                CrowdError::corrupt(path, format!("line {}: non-numeric value '{s}'", line_no + 1))
            })
        };
        points.push((parse(fields[0])?, parse(fields[1])?));
    }

    Ok(points)
}

fn validate_bounds(path: &Path, raw: &[(f64, f64)], width: usize, height: usize) -> CrowdResult<Vec<Point>> {
    let (w, h) = (width as f64, height as f64);
    raw.iter()
        .enumerate()
        .map(|(i, &(x, y))| {
            let inside = x.is_finite() && y.is_finite() && (0.0..=w).contains(&x) && (0.0..=h).contains(&y);
            if !inside {
                return Err(CrowdError::corrupt(
                    path,
                    format!("point {i} ({x}, {y}) outside {width}x{height} image"),
                ));
            }
            Ok(Point::new(x as f32, y as f32))
        })
        .collect()
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Write images/<id>.png and optionally ground-truth/GT_<id>.<ext>.
    pub(crate) fn write_raw_sample(
        root: &Path,
        id: &str,
        width: u32,
        height: u32,
        annotation: Option<(&str, &str)>,
    ) {
        let images = root.join("images");
        let gt = root.join("ground-truth");
        fs::create_dir_all(&images).unwrap();
        fs::create_dir_all(&gt).unwrap();

        let img = image::RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x * 7 % 255) as u8, (y * 11 % 255) as u8, 128])
        });
        img.save(images.join(format!("{id}.png"))).unwrap();

        if let Some((ext, body)) = annotation {
            fs::write(gt.join(format!("GT_{id}.{ext}")), body).unwrap();
        }
    }

    fn corrupt_reason(err: CrowdError) -> String {
        match err {
            CrowdError::CorruptAnnotation { reason, .. } => reason,
            other => panic!("expected CorruptAnnotation, got {other:?}"),
        }
    }

    #[test]
    fn test_loads_json_object_and_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        write_raw_sample(
            dir.path(),
            "IMG_1",
            40,
            30,
            Some(("json", r#"{"points": [[1.5, 2.0], [39.0, 29.5]], "count": 2}"#)),
        );

        let loaded = AnnotationLoader::new(dir.path()).load("IMG_1").unwrap();
        assert_eq!((loaded.width, loaded.height), (40, 30));
        assert_eq!(loaded.annotation.count(), 2);
        assert_eq!(loaded.annotation.points[0], Point::new(1.5, 2.0));
    }

    #[test]
    fn test_loads_bare_json_and_text_formats() {
        let dir = tempfile::tempdir().unwrap();
        write_raw_sample(dir.path(), "a", 20, 20, Some(("json", "[[1, 1], [2, 2], [3, 3]]")));
        write_raw_sample(dir.path(), "b", 20, 20, Some(("txt", "# x y\n1 1\n\n2.5,4\n")));
        let loader = AnnotationLoader::new(dir.path());

        assert_eq!(loader.load("a").unwrap().annotation.count(), 3);
        let b = loader.load("b").unwrap();
        assert_eq!(b.annotation.points, vec![Point::new(1.0, 1.0), Point::new(2.5, 4.0)]);
        assert_eq!(loader.image_ids().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_empty_annotation_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        write_raw_sample(dir.path(), "empty", 8, 8, Some(("json", "[]")));
        let loaded = AnnotationLoader::new(dir.path()).load("empty").unwrap();
        assert!(loaded.annotation.is_empty());
    }

    #[test]
    fn test_missing_annotation() {
        let dir = tempfile::tempdir().unwrap();
        write_raw_sample(dir.path(), "lonely", 8, 8, None);
        let err = AnnotationLoader::new(dir.path()).load("lonely").unwrap_err();
        assert!(matches!(err, CrowdError::MissingAnnotation { .. }));
    }

    #[test]
    fn test_out_of_bounds_point_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        write_raw_sample(dir.path(), "oob", 16, 16, Some(("json", "[[4, 4], [16.5, 3]]")));
        let err = AnnotationLoader::new(dir.path()).load("oob").unwrap_err();
        assert!(corrupt_reason(err).contains("outside"));
    }

    #[test]
    fn test_negative_point_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        write_raw_sample(dir.path(), "neg", 16, 16, Some(("txt", "-1 3\n")));
        let err = AnnotationLoader::new(dir.path()).load("neg").unwrap_err();
        assert!(corrupt_reason(err).contains("outside"));
    }

    #[test]
    fn test_non_numeric_and_truncated_files_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        write_raw_sample(dir.path(), "word", 16, 16, Some(("json", r#"[[1, "two"]]"#)));
        write_raw_sample(dir.path(), "cut", 16, 16, Some(("json", "[[1, 2], [3,")));
        write_raw_sample(dir.path(), "text", 16, 16, Some(("txt", "1 2\nthree 4\n")));
        write_raw_sample(dir.path(), "half", 16, 16, Some(("txt", "1 2\n3\n")));
        let loader = AnnotationLoader::new(dir.path());

        assert!(corrupt_reason(loader.load("word").unwrap_err()).contains("non-numeric"));
        assert!(corrupt_reason(loader.load("cut").unwrap_err()).contains("invalid JSON"));
        assert!(corrupt_reason(loader.load("text").unwrap_err()).contains("non-numeric"));
        assert!(corrupt_reason(loader.load("half").unwrap_err()).contains("expected 2"));
    }

    #[test]
    fn test_point_just_past_the_edge_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        // rounds to exactly 16.0 as f32
        write_raw_sample(dir.path(), "edge", 16, 16, Some(("json", "[[16.0000001, 3]]")));
        write_raw_sample(dir.path(), "txt", 16, 16, Some(("txt", "3 16.0000001\n")));
        let loader = AnnotationLoader::new(dir.path());

        assert!(corrupt_reason(loader.load("edge").unwrap_err()).contains("outside"));
        assert!(corrupt_reason(loader.load("txt").unwrap_err()).contains("outside"));
    }

    fn with_mat_annotation(root: &Path, id: &str, fixture_name: &str) {
        write_raw_sample(root, id, 32, 24, None);
        let target = root.join("ground-truth").join(format!("GT_{id}.mat"));
        fs::write(target, crate::data::mat::tests::fixture(fixture_name)).unwrap();
    }

    #[test]
    fn test_loads_shanghaitech_image_info() {
        let dir = tempfile::tempdir().unwrap();
        with_mat_annotation(dir.path(), "IMG_1", "GT_shanghaitech.mat");

        let loaded = AnnotationLoader::new(dir.path()).load("IMG_1").unwrap();
        assert_eq!(
            loaded.annotation.points,
            vec![Point::new(4.5, 5.0), Point::new(20.0, 10.25), Point::new(30.0, 20.0)]
        );
    }

    #[test]
    fn test_loads_ann_points_with_leading_singleton_axis() {
        let dir = tempfile::tempdir().unwrap();
        with_mat_annotation(dir.path(), "IMG_2", "GT_annpoints.mat");

        let loaded = AnnotationLoader::new(dir.path()).load("IMG_2").unwrap();
        assert_eq!(
            loaded.annotation.points,
            vec![Point::new(2.0, 3.0), Point::new(16.0, 12.0), Point::new(31.5, 23.75)]
        );
    }

    #[test]
    fn test_mat_without_point_variable_or_truncated_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        with_mat_annotation(dir.path(), "none", "GT_unlabelled.mat");
        write_raw_sample(dir.path(), "cut", 32, 24, None);
        let bytes = crate::data::mat::tests::fixture("GT_shanghaitech.mat");
        fs::write(dir.path().join("ground-truth/GT_cut.mat"), &bytes[..bytes.len() - 20]).unwrap();
        let loader = AnnotationLoader::new(dir.path());

        let reason = corrupt_reason(loader.load("none").unwrap_err());
        assert!(reason.contains("annPoints") && reason.contains("density"));
        assert!(matches!(loader.load("cut").unwrap_err(), CrowdError::CorruptAnnotation { .. }));
    }

    #[test]
    fn test_declared_count_mismatch_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        write_raw_sample(
            dir.path(),
            "count",
            16,
            16,
            Some(("json", r#"{"points": [[1, 2]], "count": 3}"#)),
        );
        let err = AnnotationLoader::new(dir.path()).load("count").unwrap_err();
        assert!(corrupt_reason(err).contains("declared count"));
    }
}
