//! Order-preserving string encoding for index keys.
//!
//! An encoded index string is the concatenation of one tagged segment per
//! field. Comparing two encoded strings with plain `<` gives the same result as
//! comparing their field-value tuples.

pub mod index;
pub mod number;
pub mod string;

pub use index::{INDEX_MAX, encode_fields, encode_prefix, encode_prefix_upper};
