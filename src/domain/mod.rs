// ============================================================
// Layer 3 — Domain Layer
// ============================================================
// Plain Rust types that define what the system talks about:
// points, images, density maps, samples, and the errors that
// can happen to them.
//
// Rules for this layer:
//   - NO Burn framework types
//   - NO file I/O
//   - Only structs, enums, traits and pure array operations

/// Head point annotations and the loaded-annotation record
pub mod annotation;

/// Density map grid and its mass-aware geometry
pub mod density;

/// Error taxonomy shared by every layer
pub mod error;

/// Channel-first RGB raster
pub mod image;

/// (image, density map) pair
pub mod sample;

/// Core abstractions (traits) that other layers implement
pub mod traits;
