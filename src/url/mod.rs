//! URL handling module for Sumi-Harvest
//!
//! This module provides URL normalization, link resolution, host keys for
//! per-host permission records, and wildcard host matching.

mod host;
mod normalize;

// Re-export main functions
pub use host::{host_key, host_key_str, host_matches_any, matches_host_pattern};
pub use normalize::{is_supported_scheme, normalize_url, resolve_link};
