//! Message translation: binary body ⇄ [`MessageInstance`] ⇄ JSON.

pub mod binary;
pub mod json;
pub mod value;

pub use binary::{decode, encode, DecodeError, EncodeError};
pub use json::{from_json, to_json, MappingError};
pub use value::{MessageInstance, Value};
