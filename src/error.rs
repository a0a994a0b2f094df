//!
//! # Mask21 Result and Error Types
//!

use std::error::Error;
use std::fmt;

/// # MaskResult Type-Alias
pub type MaskResult<T> = Result<T, MaskError>;

/// # Mask Error Enumeration
/// Most errors are tied in some sense to parsing and decoding.
/// Once a valid [Library](crate::data::Library) is created in memory,
/// it can generally be streamed to bytes.
#[derive(Debug)]
pub enum MaskError {
    /// Invalid record length
    RecordLen(usize),
    /// Other decoding errors
    Decode,
    /// Other encoding errors
    Encode,
    /// Boxed (External) Errors
    Boxed(Box<dyn Error>),
    /// Other errors
    Str(String),
}
impl fmt::Display for MaskError {
    /// Display a [MaskError].
    /// This functionally delegates to the (derived) [fmt::Debug] implementation.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
impl Error for MaskError {}
impl From<std::io::Error> for MaskError {
    fn from(e: std::io::Error) -> Self {
        Self::Boxed(Box::new(e))
    }
}
impl From<std::str::Utf8Error> for MaskError {
    fn from(e: std::str::Utf8Error) -> Self {
        Self::Boxed(Box::new(e))
    }
}
impl From<String> for MaskError {
    fn from(e: String) -> Self {
        MaskError::Str(e)
    }
}
impl From<&str> for MaskError {
    fn from(e: &str) -> Self {
        MaskError::Str(e.to_string())
    }
}
