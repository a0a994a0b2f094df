//!
//! # GDSII Codec
//!
//! Record framing, type enumerations, and the base-16 floating-point
//! encoding shared by the [read] and [write] halves.
//!
//! GDSII streams are a flat sequence of length-prefixed records: a two-byte
//! big-endian total length (header bytes included), a one-byte record type,
//! a one-byte data-type tag, then payload. Element semantics depend on
//! record order: an element-start record opens a current element which
//! subsequent attribute records mutate until ENDEL.
//!

pub mod read;
pub mod write;

use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

/// GDSII stream-format version written by [write::write_gds] (generation 600)
pub const GDS_VERSION: i16 = 0x0258;

///
/// # Gds Record Types
///
/// In the numeric order specified by GDSII, for automatic [FromPrimitive]
/// conversions. The reader handles the subset with layout semantics and
/// skips the rest with a diagnostic.
///
#[derive(FromPrimitive, Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub enum GdsRecordType {
    Header = 0x00,
    BgnLib,
    LibName,
    Units,
    EndLib,
    BgnStr,
    StrName,
    EndStr,
    Boundary,
    Path,
    Sref,
    Aref,
    Text,
    Layer,
    DataType,
    Width,
    Xy,
    EndEl,
    Sname,
    ColRow,
    TextNode, // "Not currently used"
    Node,
    TextType,
    Presentation,
    Spacing, // "Discontinued"
    String,
    Strans,
    Mag,
    Angle,
    Uinteger, // "No longer used"
    Ustring,  // "No longer used"
    RefLibs,
    Fonts,
    PathType,
    Generations,
    AttrTable,
    StypTable, // "Unreleased Feature"
    StrType,   // "Unreleased Feature"
    ElFlags,
    ElKey,    // "Unreleased Feature"
    LinkType, // "Unreleased Feature"
    LinkKeys, // "Unreleased Feature"
    NodeType,
    PropAttr,
    PropValue,
    Box,
    BoxType,
    Plex,
    BgnExtn, // "Only occurs in CustomPlus"
    EndExtn, // "Only occurs in CustomPlus"
    TapeNum,
    TapeCode,
    StrClass, // "Only for Calma internal use"
    Reserved, // "Reserved for future use"
    Format,
    Mask,
    EndMasks,
    LibDirSize,
    SrfName,
    LibSecur,
}

/// # Gds DataType Enumeration
///
/// In order as decoded from the record header's data-type byte.
#[derive(FromPrimitive, Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub enum GdsDataType {
    NoData = 0,
    BitArray = 1,
    I16 = 2,
    I32 = 3,
    F32 = 4,
    F64 = 5,
    Str = 6,
}

/// # GDSII's Home-Grown Floating-Point Format
///
/// GDSII predates IEEE 754 and stores reals in its own base-16 format:
/// bit 63 sign, bits 62-56 a power-of-16 exponent biased by 64, bits 55-0
/// a mantissa with its binary point ahead of bit 55.
///
/// [GdsFloat64] is not a data store, but a namespace for the `encode` and
/// `decode` operations to and from IEEE 754 double-precision format.
pub struct GdsFloat64;
impl GdsFloat64 {
    /// Decode eight GDSII-float bytes (as `u64`) to `f64`
    pub fn decode(val: u64) -> f64 {
        if val == 0 {
            return 0.0;
        }
        let neg = (val & 0x8000_0000_0000_0000) != 0;
        let exp = ((val >> 56) & 0x7F) as i32 - 64;
        // Mantissa normalized to the range (1/16, 1)
        let mantissa = (val & 0x00FF_FFFF_FFFF_FFFF) as f64 / 2f64.powi(56);
        let val = mantissa * 16f64.powi(exp);
        if neg {
            -val
        } else {
            val
        }
    }
    /// Encode `f64` to eight bytes, represented as `u64`
    pub fn encode(mut val: f64) -> u64 {
        if val == 0.0 {
            return 0;
        }
        let mut top: u8 = 0;
        if val < 0.0 {
            top = 0x80;
            val = -val;
        }
        // Power-of-16 exponent, chosen so the top mantissa nibble is non-zero
        let fexp = 0.25 * val.log2();
        let mut exponent = fexp.ceil() as i32;
        if fexp == fexp.ceil() {
            exponent += 1;
        }
        let exponent = (exponent + 64).clamp(0, 127) - 64;
        let mantissa = (val * 16f64.powi(14 - exponent)).round() as u64;
        top += (64 + exponent) as u8;
        ((top as u64) << 56) | (mantissa & 0x00FF_FFFF_FFFF_FFFF)
    }
}
