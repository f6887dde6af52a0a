// ============================================================
// Layer 2 — Application / Use Cases
// ============================================================
// This layer orchestrates all the other layers to accomplish
// one command each: preprocess, train, eval or clean.
//
// Rules for this layer:
//   - No ML math or model code here
//   - No UI or printing here (that's Layer 1)
//   - Only workflow coordination
//
// Every use case takes a plain serde config struct; clap types
// stop at Layer 1.
//
// Reference: Clean Architecture pattern
//            Rust Book §7 (Module System)

// Raw dataset → processed sample store, and `clean`
pub mod preprocess_use_case;

// The training workflow
pub mod train_use_case;

// Checkpoint evaluation
pub mod eval_use_case;
