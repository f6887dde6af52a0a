use crate::domain::{density::DensityMap, image::CrowdImage};

/// One training/evaluation item: an image and its ground-truth density map,
/// both at the same resolution.
#[derive(Debug, Clone)]
pub struct Sample {
    pub id: String,
    pub image: CrowdImage,
    pub density: DensityMap,
}

impl Sample {
    pub fn new(id: impl Into<String>, image: CrowdImage, density: DensityMap) -> Self {
        Self { id: id.into(), image, density }
    }

    /// Ground-truth count carried by the density map
    pub fn count(&self) -> f64 {
        self.density.count()
    }

    pub fn dims(&self) -> (usize, usize) {
        (self.image.height(), self.image.width())
    }
}
