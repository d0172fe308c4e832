//! Foundation types for kvmap.
//!
//! Every other kvmap crate depends on `kvmap-types`. It defines the dynamic
//! [`Value`] exchanged between domain objects and native records, the
//! [`ValueType`] a scalar property declares, and the [`ConversionService`]
//! that coerces between the two.
//!
//! # Key Types
//!
//! - [`Value`] - A dynamically typed scalar, list, or map value
//! - [`ValueType`] - Declared type of a scalar property
//! - [`ConversionService`] - Pluggable `(from, to)` conversion table
//! - [`TypeError`] - Conversion failures

pub mod convert;
pub mod error;
pub mod value;

pub use convert::{ConversionService, Converter};
pub use error::{TypeError, TypeResult};
pub use value::{Value, ValueType};
