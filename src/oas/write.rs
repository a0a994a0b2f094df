//!
//! # OASIS Writing
//!
//! The writer keeps things explicit: every element record carries a full
//! info byte and its own attributes rather than leaning on modal
//! inheritance. Cell names, label texts, property names, and property
//! string-values are interned into the four tables emitted after the last
//! cell, with their file offsets recorded in the END record.
//!

// Std-Lib Imports
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

// Crates.io
use flate2::write::DeflateEncoder;
use flate2::Compression;
use log::{error, warn};

// Local Imports
use super::{OasisRecordType, OasisWriter, OASIS_CONFIG_USE_CBLOCK, OASIS_MAGIC};
use crate::data::{
    EndType, Label, Library, Polygon, Property, PropertyName, PropertyValue, RefTarget, Reference,
    Repetition, Vec2,
};
use crate::error::MaskResult;
use crate::geom;

/// Round a scaled coordinate to its on-disk integer, ties to even
fn db(value: f64, scaling: f64) -> i64 {
    (value * scaling).round_ties_even() as i64
}

/// Maps and tables grown while cells are written
struct OasState {
    scaling: f64,
    text_string_map: HashMap<String, u64>,
    property_name_map: HashMap<String, u64>,
    property_values: Vec<Vec<u8>>,
}
impl OasState {
    fn intern_text(&mut self, text: &str) -> u64 {
        let next = self.text_string_map.len() as u64;
        *self
            .text_string_map
            .entry(text.to_string())
            .or_insert(next)
    }
    fn intern_property_name(&mut self, name: &str) -> u64 {
        let next = self.property_name_map.len() as u64;
        *self
            .property_name_map
            .entry(name.to_string())
            .or_insert(next)
    }
    fn intern_property_value(&mut self, bytes: &[u8]) -> u64 {
        self.property_values.push(bytes.to_vec());
        self.property_values.len() as u64 - 1
    }
}

/// PROPERTY records for one property list
fn properties_to_oas(
    out: &mut OasisWriter,
    properties: &[Property],
    state: &mut OasState,
) -> MaskResult<()> {
    for property in properties {
        let name = match &property.name {
            PropertyName::Text(text) => text.clone(),
            PropertyName::Number(number) => number.to_string(),
            PropertyName::NameRef(_) => {
                warn!("property with unresolved name skipped");
                continue;
            }
        };
        let index = state.intern_property_name(&name);
        let count = property.values.len() as u64;
        let info: u8 = 0x06
            | if count >= 15 {
                0xF0
            } else {
                (count as u8) << 4
            };
        out.put(OasisRecordType::Property as u8)?;
        out.put(info)?;
        out.write_unsigned_integer(index)?;
        if count >= 15 {
            out.write_unsigned_integer(count)?;
        }
        for value in property.values.iter() {
            match value {
                PropertyValue::Real(real) => out.write_real(*real)?,
                PropertyValue::Integer(integer) => {
                    out.write_unsigned_integer(9)?;
                    out.write_integer(*integer)?;
                }
                PropertyValue::UnsignedInteger(unsigned) => {
                    out.write_unsigned_integer(8)?;
                    out.write_unsigned_integer(*unsigned)?;
                }
                PropertyValue::Bytes(bytes) => {
                    out.write_unsigned_integer(14)?;
                    out.write_unsigned_integer(state.intern_property_value(bytes))?;
                }
                PropertyValue::StringRef(_) => {
                    warn!("property with unresolved string value skipped");
                }
            }
        }
    }
    Ok(())
}

fn polygon_to_oas(
    out: &mut OasisWriter,
    polygon: &Polygon,
    state: &mut OasState,
) -> MaskResult<()> {
    if polygon.points.len() < 3 {
        warn!("degenerate polygon skipped");
        return Ok(());
    }
    let has_repetition = polygon.repetition.get_size() > 1;
    let mut info: u8 = 0x3B;
    if has_repetition {
        info |= 0x04;
    }
    out.put(OasisRecordType::Polygon as u8)?;
    out.put(info)?;
    out.write_unsigned_integer(polygon.layer as u64)?;
    out.write_unsigned_integer(polygon.datatype as u64)?;
    let scaled: Vec<(i64, i64)> = polygon
        .points
        .iter()
        .map(|p| (db(p.x, state.scaling), db(p.y, state.scaling)))
        .collect();
    let deltas: Vec<(i64, i64)> = scaled
        .windows(2)
        .map(|w| (w[1].0 - w[0].0, w[1].1 - w[0].1))
        .collect();
    out.write_point_list(&deltas)?;
    out.write_integer(scaled[0].0)?;
    out.write_integer(scaled[0].1)?;
    if has_repetition {
        out.write_repetition(&polygon.repetition, state.scaling)?;
    }
    properties_to_oas(out, &polygon.properties, state)
}

/// One native PATH record per path element
#[allow(clippy::too_many_arguments)]
fn path_to_oas(
    out: &mut OasisWriter,
    layer: u32,
    datatype: u32,
    half_width: f64,
    end_type: EndType,
    end_extensions: Vec2,
    spine: &[Vec2],
    repetition: &Repetition,
    properties: &[Property],
    state: &mut OasState,
) -> MaskResult<()> {
    if spine.len() < 2 {
        warn!("degenerate path skipped");
        return Ok(());
    }
    let has_repetition = repetition.get_size() > 1;
    let mut info: u8 = 0xFB;
    if has_repetition {
        info |= 0x04;
    }
    out.put(OasisRecordType::Path as u8)?;
    out.put(info)?;
    out.write_unsigned_integer(layer as u64)?;
    out.write_unsigned_integer(datatype as u64)?;
    out.write_unsigned_integer(db(half_width, state.scaling) as u64)?;
    // Round caps have no OASIS encoding; half-width caps come closest
    let scheme: u8 = match end_type {
        EndType::Flush => 0x01 | 0x04,
        EndType::Round | EndType::HalfWidth => 0x02 | 0x08,
        EndType::Extended => 0x03 | 0x0C,
    };
    out.put(scheme)?;
    if let EndType::Extended = end_type {
        out.write_integer(db(end_extensions.x, state.scaling))?;
        out.write_integer(db(end_extensions.y, state.scaling))?;
    }
    let scaled: Vec<(i64, i64)> = spine
        .iter()
        .map(|p| (db(p.x, state.scaling), db(p.y, state.scaling)))
        .collect();
    let deltas: Vec<(i64, i64)> = scaled
        .windows(2)
        .map(|w| (w[1].0 - w[0].0, w[1].1 - w[0].1))
        .collect();
    out.write_point_list(&deltas)?;
    out.write_integer(scaled[0].0)?;
    out.write_integer(scaled[0].1)?;
    if has_repetition {
        out.write_repetition(repetition, state.scaling)?;
    }
    properties_to_oas(out, properties, state)
}

/// True when `rotation` is an exact quarter-turn multiple, with the
/// signed multiple returned alongside
fn quarter_turns(rotation: f64) -> Option<i64> {
    let m = (rotation / std::f64::consts::FRAC_PI_2).round();
    if (rotation - m * std::f64::consts::FRAC_PI_2).abs() < 1e-12 {
        Some(m as i64)
    } else {
        None
    }
}

fn reference_to_oas(
    out: &mut OasisWriter,
    lib: &Library,
    reference: &Reference,
    cell_name_map: &HashMap<String, u64>,
    state: &mut OasState,
) -> MaskResult<()> {
    if let RefTarget::RawCell(_) = reference.target {
        warn!("reference to a raw cell cannot be used in an OASIS file");
        return Ok(());
    }
    let index = match lib
        .target_name(&reference.target)
        .and_then(|name| cell_name_map.get(name))
    {
        Some(&index) => index,
        None => {
            warn!("reference to a cell outside this library skipped");
            return Ok(());
        }
    };
    let has_repetition = reference.repetition.get_size() > 1;
    let mut info: u8 = 0xF0;
    if has_repetition {
        info |= 0x08;
    }
    if reference.x_reflection {
        info |= 0x01;
    }
    match (reference.magnification == 1.0, quarter_turns(reference.rotation)) {
        (true, Some(m)) => {
            info |= ((m.rem_euclid(4)) as u8 & 0x03) << 1;
            out.put(OasisRecordType::Placement as u8)?;
            out.put(info)?;
            out.write_unsigned_integer(index)?;
        }
        _ => {
            if reference.magnification != 1.0 {
                info |= 0x04;
            }
            if reference.rotation != 0.0 {
                info |= 0x02;
            }
            out.put(OasisRecordType::PlacementTransform as u8)?;
            out.put(info)?;
            out.write_unsigned_integer(index)?;
            if reference.magnification != 1.0 {
                out.write_real(reference.magnification)?;
            }
            if reference.rotation != 0.0 {
                out.write_real(reference.rotation.to_degrees())?;
            }
        }
    }
    out.write_integer(db(reference.origin.x, state.scaling))?;
    out.write_integer(db(reference.origin.y, state.scaling))?;
    if has_repetition {
        out.write_repetition(&reference.repetition, state.scaling)?;
    }
    properties_to_oas(out, &reference.properties, state)
}

fn label_to_oas(out: &mut OasisWriter, label: &Label, state: &mut OasState) -> MaskResult<()> {
    let has_repetition = label.repetition.get_size() > 1;
    let mut info: u8 = 0x7B;
    if has_repetition {
        info |= 0x04;
    }
    out.put(OasisRecordType::Text as u8)?;
    out.put(info)?;
    let index = state.intern_text(&label.text);
    out.write_unsigned_integer(index)?;
    out.write_unsigned_integer(label.layer as u64)?;
    out.write_unsigned_integer(label.texttype as u64)?;
    out.write_integer(db(label.origin.x, state.scaling))?;
    out.write_integer(db(label.origin.y, state.scaling))?;
    if has_repetition {
        out.write_repetition(&label.repetition, state.scaling)?;
    }
    properties_to_oas(out, &label.properties, state)
}

/// Write `lib` as an OASIS stream to the file at `path`
pub(crate) fn write_oas(
    lib: &Library,
    path: &Path,
    tolerance: f64,
    deflate_level: u8,
    config_flags: u16,
) -> MaskResult<()> {
    let mut out = match OasisWriter::open(path) {
        Ok(out) => out,
        Err(e) => {
            error!("unable to open OASIS file {} for output", path.display());
            return Err(e);
        }
    };
    out.put_bytes(OASIS_MAGIC)?;
    out.put(OasisRecordType::Start as u8)?;
    out.write_string(b"1.0")?;
    out.write_real(1e-6 / lib.precision)?;
    // Table offsets are stored in the END record
    out.put(1)?;

    let mut state = OasState {
        scaling: lib.unit / lib.precision,
        text_string_map: HashMap::new(),
        property_name_map: HashMap::new(),
        property_values: Vec::new(),
    };
    // Cell-name indices follow emission order, which CELLNAME_IMPLICIT
    // records later reproduce
    let cell_name_map: HashMap<String, u64> = lib
        .cells
        .iter()
        .enumerate()
        .map(|(i, cell)| (cell.name.clone(), i as u64))
        .collect();

    properties_to_oas(&mut out, &lib.properties, &mut state)?;

    let use_cblock = config_flags & OASIS_CONFIG_USE_CBLOCK != 0;
    for (index, cell) in lib.cells.iter().enumerate() {
        out.put(OasisRecordType::CellRefNum as u8)?;
        out.write_unsigned_integer(index as u64)?;

        if use_cblock {
            out.begin_cblock();
        }

        for polygon in cell.polygons.iter() {
            polygon_to_oas(&mut out, polygon, &mut state)?;
        }
        for path in cell.flexpaths.iter() {
            if path.gdsii_path {
                for element in path.elements.iter() {
                    let half_width = element
                        .half_width_and_offset
                        .first()
                        .map(|hw| hw.x)
                        .unwrap_or(0.0);
                    path_to_oas(
                        &mut out,
                        element.layer,
                        element.datatype,
                        half_width,
                        element.end_type,
                        element.end_extensions,
                        &path.spine,
                        &path.repetition,
                        &path.properties,
                        &mut state,
                    )?;
                }
            } else {
                for element in path.elements.iter() {
                    let tol = if path.tolerance > 0.0 {
                        path.tolerance
                    } else {
                        tolerance
                    };
                    let points = geom::flatten_path(
                        &path.spine,
                        &element.half_width_and_offset,
                        element.end_type,
                        element.end_extensions,
                        tol,
                    );
                    if points.is_empty() {
                        continue;
                    }
                    let polygon = Polygon {
                        layer: element.layer,
                        datatype: element.datatype,
                        points,
                        repetition: path.repetition.clone(),
                        properties: path.properties.clone(),
                    };
                    polygon_to_oas(&mut out, &polygon, &mut state)?;
                }
            }
        }
        for path in cell.robustpaths.iter() {
            for element in path.elements.iter() {
                if path.gdsii_path {
                    path_to_oas(
                        &mut out,
                        element.layer,
                        element.datatype,
                        element.half_width,
                        element.end_type,
                        element.end_extensions,
                        &path.spine,
                        &path.repetition,
                        &path.properties,
                        &mut state,
                    )?;
                } else {
                    let half_widths =
                        vec![Vec2::new(element.half_width, element.offset); path.spine.len()];
                    let tol = if path.tolerance > 0.0 {
                        path.tolerance
                    } else {
                        tolerance
                    };
                    let points = geom::flatten_path(
                        &path.spine,
                        &half_widths,
                        element.end_type,
                        element.end_extensions,
                        tol,
                    );
                    if points.is_empty() {
                        continue;
                    }
                    let polygon = Polygon {
                        layer: element.layer,
                        datatype: element.datatype,
                        points,
                        repetition: path.repetition.clone(),
                        properties: path.properties.clone(),
                    };
                    polygon_to_oas(&mut out, &polygon, &mut state)?;
                }
            }
        }
        for reference in cell.references.iter() {
            reference_to_oas(&mut out, lib, reference, &cell_name_map, &mut state)?;
        }
        for label in cell.labels.iter() {
            label_to_oas(&mut out, label, &mut state)?;
        }

        if use_cblock {
            let data = out.take_cblock();
            let mut encoder =
                DeflateEncoder::new(Vec::new(), Compression::new(deflate_level.min(9) as u32));
            let compressed = encoder
                .write_all(&data)
                .and_then(|_| encoder.finish())
                .ok();
            match compressed {
                Some(compressed) => {
                    out.put(OasisRecordType::Cblock as u8)?;
                    out.put(0)?;
                    out.write_unsigned_integer(data.len() as u64)?;
                    out.write_unsigned_integer(compressed.len() as u64)?;
                    out.put_bytes(&compressed)?;
                }
                None => {
                    // Fall back to the uncompressed records
                    error!("unable to compress CBLOCK");
                    out.put_bytes(&data)?;
                }
            }
        }
    }

    // The four name tables, offsets noted for the END record
    let cell_name_offset = if lib.cells.is_empty() { 0 } else { out.pos()? };
    for cell in lib.cells.iter() {
        out.put(OasisRecordType::CellnameImplicit as u8)?;
        out.write_string(cell.name.as_bytes())?;
        properties_to_oas(&mut out, &cell.properties, &mut state)?;
    }

    let text_string_offset = if state.text_string_map.is_empty() {
        0
    } else {
        out.pos()?
    };
    let text_strings = std::mem::take(&mut state.text_string_map);
    for (text, index) in text_strings.iter() {
        out.put(OasisRecordType::Textstring as u8)?;
        out.write_string(text.as_bytes())?;
        out.write_unsigned_integer(*index)?;
    }

    let prop_name_offset = if state.property_name_map.is_empty() {
        0
    } else {
        out.pos()?
    };
    let property_names = std::mem::take(&mut state.property_name_map);
    for (name, index) in property_names.iter() {
        out.put(OasisRecordType::Propname as u8)?;
        out.write_string(name.as_bytes())?;
        out.write_unsigned_integer(*index)?;
    }

    let prop_string_offset = if state.property_values.is_empty() {
        0
    } else {
        out.pos()?
    };
    let property_values = std::mem::take(&mut state.property_values);
    for bytes in property_values.iter() {
        out.put(OasisRecordType::PropstringImplicit as u8)?;
        out.write_string(bytes)?;
    }

    out.put(OasisRecordType::End as u8)?;
    // END record byte (1) + table offsets + padding-string length prefix
    // (2) + padding + validation byte (1) add up to exactly 256
    let mut pad_len = 252 + out.pos()?;
    for offset in [
        cell_name_offset,
        text_string_offset,
        prop_name_offset,
        prop_string_offset,
    ] {
        out.put(1)?;
        out.write_unsigned_integer(offset)?;
    }
    out.put(1)?;
    out.put(0)?; // LAYERNAME table
    out.put(1)?;
    out.put(0)?; // XNAME table

    pad_len -= out.pos()?;
    out.write_unsigned_integer(pad_len)?;
    for _ in 0..pad_len {
        out.put(0)?;
    }
    // No validation scheme
    out.put(0)?;

    out.finish()
}
