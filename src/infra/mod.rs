// ============================================================
// Layer 6 — Infrastructure Layer
// ============================================================
// Durable artifacts and process plumbing used by several
// layers but owned by none of them:
//
//   store.rs      — Processed sample store
//                   One directory per sample with the density
//                   map (.npy) and its metadata (JSON).
//                   Written atomically, wiped by `clean`.
//
//   checkpoint.rs — Checkpoint save / load
//                   Model + optimizer records, versioned
//                   meta.json, latest/best pointers.
//
//   metrics.rs    — Run metrics sink
//                   Append-only (run, step, metric, value) CSV.
//
//   signal.rs     — Cooperative stop flag tripped by Ctrl-C
//
// Reference: Rust Book §7 (Modules)
//            Rust Book §9 (Error Handling with anyhow)
//            Burn Book §5 (Checkpointing)

/// Model checkpoint saving and loading
pub mod checkpoint;

/// Training metrics CSV logger
pub mod metrics;

/// Cooperative stop signal
pub mod signal;

/// Processed (density map + metadata) sample store
pub mod store;
