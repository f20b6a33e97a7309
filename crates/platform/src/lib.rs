//! # espx Platform
//!
//! Core platform types and traits shared by the espx crates.
//!
//! This crate provides:
//! - Unified error types (`EspxError`, `EspxResult`)
//! - The `SecurityModule` trait implemented by every pluggable module
//!
//! # Examples
//!
//! ```
//! use espx_platform::{EspxError, EspxResult};
//!
//! fn example_function() -> EspxResult<String> {
//!     Ok("Hello, espx!".to_string())
//! }
//!
//! # fn main() -> EspxResult<()> {
//! let result = example_function()?;
//! assert_eq!(result, "Hello, espx!");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;
pub mod traits;

pub use error::{EspxError, EspxResult};
pub use traits::SecurityModule;

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
