//! pkrguard configuration model
//!
//! Packer templates loaded into an immutable [`Configuration`], identified by a
//! content hash and flattened into addressable fields for analysis.
//!
//! # Core Concepts
//!
//! - [`Configuration`]: parsed template plus its raw source text
//! - [`ConfigHash`]: 32-byte Blake3 identity over canonical JSON
//! - [`FieldEntry`]: one scalar leaf (`builders[0].ssh_username`)
//! - [`Location`]: file/line/column of a finding
//!
//! # Example
//!
//! ```rust,ignore
//! use pkrguard_config::{load, normalize};
//!
//! let config = load("template.json")?;
//! for field in normalize(&config)? {
//!     println!("{} = {}", field.path, field.text());
//! }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod hash;
mod location;
mod model;
mod normalize;
mod parse;

pub use hash::{canonical_json, ConfigHash, HashError};
pub use location::{locate_field, Location};
pub use model::{Component, ConfigFormat, Configuration, Section, ValidationRule};
pub use normalize::{normalize, unresolved_references, variable_references, FieldEntry, MAX_DEPTH};
pub use parse::{from_document, load, parse_str, ParseError};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
