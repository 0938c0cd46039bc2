//! Pre-submission stages for MinerU conversion.
//!
//! Each submodule implements exactly one step, so each is testable on its own.
//!
//! ## Data Flow
//!
//! ```text
//! classify ──▶ introspect ──▶ validate ──▶ decompose
//! (path/URL)   (page count)   (limits)     (ranges / chunks)
//! ```
//!
//! 1. [`classify`]   resolve format and size; HEAD-probe remote references
//! 2. [`introspect`] best-effort page count; runs in `spawn_blocking`
//!    because pdfium is not async-safe
//! 3. [`validate`]   pure accept / decompose / reject decision
//! 4. [`decompose`]  page-range planning and physical PDF splitting

pub mod classify;
pub mod decompose;
pub mod introspect;
pub mod validate;
