//!
//! # GDSII Reading
//!
//! A streaming reader: records are framed by [GdsReader] and folded into a
//! [Library] by [GdsParser], which keeps at most one current element open
//! (polygon, path, reference, or label). Attribute records mutate the
//! current element; ENDEL closes it into the current cell. ENDLIB triggers
//! the resolution pass rewriting textual reference names into cell indices.
//!

// Std-Lib Imports
use std::collections::HashMap;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;

// Crates.io
use byteorder::{BigEndian, ReadBytesExt};
use log::{error, warn};
use memmap::Mmap;
use num_traits::FromPrimitive;

// Local Imports
use super::{GdsFloat64, GdsRecordType};
use crate::data::{
    set_gds_property, Anchor, Cell, EndType, FlexPath, Label, Library, PathElement, Polygon,
    RefTarget, Reference, Repetition, Vec2,
};
use crate::error::{MaskError, MaskResult};

/// # GdsReader
/// Record framer over a memory-mapped GDSII file.
pub struct GdsReader {
    /// File being read
    file: Cursor<Mmap>,
    // Note an API-compatible [BufReader<File>] works here as well; the
    // memory-mapping is much faster for scanning at the cost of one line
    // of `unsafe` when loading the map.
}
impl GdsReader {
    /// Create a [GdsReader], opening the file at `path`
    pub fn open(path: &Path) -> MaskResult<GdsReader> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(GdsReader {
            file: Cursor::new(mmap),
        })
    }
    /// Read the next record: its type byte and payload.
    /// Returns `None` at a clean end-of-file.
    fn read_record(&mut self) -> MaskResult<Option<(u8, Vec<u8>)>> {
        // Read the 16-bit record size (in bytes, four header bytes included)
        let len = match self.file.read_u16::<BigEndian>() {
            Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
            Ok(num) if num < 4 => return Err(MaskError::RecordLen(num.into())),
            Ok(num) if num % 2 != 0 => return Err(MaskError::RecordLen(num.into())),
            Ok(num) => num,
        };
        let rtype = self.file.read_u8()?;
        let _dtype = self.file.read_u8()?;
        let mut payload = vec![0u8; (len - 4).into()];
        self.file.read_exact(&mut payload)?;
        Ok(Some((rtype, payload)))
    }
}

/// Decode payload bytes as big-endian i16s
fn i16_vec(mut payload: &[u8]) -> Vec<i16> {
    let mut rv = vec![0i16; payload.len() / 2];
    payload.read_i16_into::<BigEndian>(&mut rv).unwrap_or(());
    rv
}
/// Decode payload bytes as big-endian i32s
fn i32_vec(mut payload: &[u8]) -> Vec<i32> {
    let mut rv = vec![0i32; payload.len() / 4];
    payload.read_i32_into::<BigEndian>(&mut rv).unwrap_or(());
    rv
}
/// Decode payload bytes as GDSII 8-byte reals
fn f64_vec(mut payload: &[u8]) -> Vec<f64> {
    let mut rv = vec![0u64; payload.len() / 8];
    payload.read_u64_into::<BigEndian>(&mut rv).unwrap_or(());
    rv.into_iter().map(GdsFloat64::decode).collect()
}
/// First big-endian i16 of a payload, zero when absent
fn i16_0(payload: &[u8]) -> i16 {
    i16_vec(payload).first().copied().unwrap_or(0)
}
/// First big-endian i32 of a payload, zero when absent
fn i32_0(payload: &[u8]) -> i32 {
    i32_vec(payload).first().copied().unwrap_or(0)
}
/// First 8-byte real of a payload, zero when absent
fn f64_0(payload: &[u8]) -> f64 {
    f64_vec(payload).first().copied().unwrap_or(0.0)
}
/// Decode payload bytes as a string, stripping the optional trailing NUL
fn str_of(payload: &[u8]) -> String {
    let bytes = match payload.last() {
        Some(0) => &payload[..payload.len() - 1],
        _ => payload,
    };
    String::from_utf8_lossy(bytes).into_owned()
}

/// # GdsParser
/// Folds the record stream into a [Library].
struct GdsParser {
    rdr: GdsReader,
    /// Requested user unit; zero means take the unit from the file
    unit: f64,
    tolerance: f64,
    /// Database-unit to user-coordinate scale, set by the UNITS record
    factor: f64,
    /// Last WIDTH value, persistent across elements as on the wire
    width: f64,
    /// Last PROPATTR key
    key: u16,
    lib: Library,
    cell: Option<Cell>,
    // Current element: at most one of these is live
    polygon: Option<Polygon>,
    path: Option<FlexPath>,
    reference: Option<Reference>,
    label: Option<Label>,
}
impl GdsParser {
    fn new(rdr: GdsReader, unit: f64, tolerance: f64) -> Self {
        GdsParser {
            rdr,
            unit,
            tolerance,
            factor: 1.0,
            width: 0.0,
            key: 0,
            lib: Library {
                name: String::new(),
                unit: 0.0,
                precision: 0.0,
                ..Default::default()
            },
            cell: None,
            polygon: None,
            path: None,
            reference: None,
            label: None,
        }
    }
    /// Consume records until ENDLIB or end-of-file.
    /// Returns whether ENDLIB was seen.
    fn parse_records(&mut self) -> MaskResult<bool> {
        while let Some((rtype, payload)) = self.rdr.read_record()? {
            let rtype = match GdsRecordType::from_u8(rtype) {
                Some(t) => t,
                None => {
                    warn!("unknown GDSII record type 0x{:02X}", rtype);
                    continue;
                }
            };
            match rtype {
                GdsRecordType::Header | GdsRecordType::BgnLib => (),
                GdsRecordType::LibName => self.lib.name = str_of(&payload),
                GdsRecordType::Units => {
                    let data = f64_vec(&payload);
                    if data.len() < 2 {
                        warn!("malformed UNITS record");
                        continue;
                    }
                    let db_in_user = data[0];
                    let db_in_meters = data[1];
                    if self.unit > 0.0 {
                        self.factor = db_in_meters / self.unit;
                        self.lib.unit = self.unit;
                    } else {
                        self.factor = db_in_user;
                        self.lib.unit = db_in_meters / db_in_user;
                    }
                    self.lib.precision = db_in_meters;
                }
                GdsRecordType::EndLib => return Ok(true),
                GdsRecordType::BgnStr => self.cell = Some(Cell::default()),
                GdsRecordType::StrName => {
                    if let Some(cell) = self.cell.as_mut() {
                        cell.name = str_of(&payload);
                    }
                }
                GdsRecordType::EndStr => {
                    if let Some(cell) = self.cell.take() {
                        self.lib.cells.push(cell);
                    }
                }
                GdsRecordType::Boundary | GdsRecordType::Box => {
                    self.polygon = Some(Polygon::default());
                }
                GdsRecordType::Path => {
                    self.path = Some(FlexPath {
                        tolerance: self.tolerance,
                        elements: vec![PathElement::default()],
                        gdsii_path: true,
                        ..Default::default()
                    });
                }
                GdsRecordType::Sref | GdsRecordType::Aref => {
                    self.reference = Some(Reference::default());
                }
                GdsRecordType::Text => self.label = Some(Label::default()),
                GdsRecordType::Layer => {
                    let layer = i16_0(&payload) as u32;
                    if let Some(polygon) = self.polygon.as_mut() {
                        polygon.layer = layer;
                    } else if let Some(path) = self.path.as_mut() {
                        path.elements[0].layer = layer;
                    } else if let Some(label) = self.label.as_mut() {
                        label.layer = layer;
                    }
                }
                GdsRecordType::DataType | GdsRecordType::BoxType => {
                    let datatype = i16_0(&payload) as u32;
                    if let Some(polygon) = self.polygon.as_mut() {
                        polygon.datatype = datatype;
                    } else if let Some(path) = self.path.as_mut() {
                        path.elements[0].datatype = datatype;
                    }
                }
                GdsRecordType::Width => {
                    let data = i32_0(&payload);
                    if data < 0 {
                        self.width = self.factor * -data as f64;
                        if let Some(path) = self.path.as_mut() {
                            path.scale_width = false;
                        }
                    } else {
                        self.width = self.factor * data as f64;
                        if let Some(path) = self.path.as_mut() {
                            path.scale_width = true;
                        }
                    }
                }
                GdsRecordType::Xy => self.handle_xy(&i32_vec(&payload)),
                GdsRecordType::EndEl => self.end_element(),
                GdsRecordType::Sname => {
                    if let Some(reference) = self.reference.as_mut() {
                        reference.target = RefTarget::Name(str_of(&payload));
                    }
                }
                GdsRecordType::ColRow => {
                    if let Some(reference) = self.reference.as_mut() {
                        let data = i16_vec(&payload);
                        if data.len() >= 2 {
                            reference.repetition = Repetition::Rectangular {
                                columns: data[0] as u64,
                                rows: data[1] as u64,
                                spacing: Vec2::default(),
                            };
                        }
                    }
                }
                GdsRecordType::TextType => {
                    if let Some(label) = self.label.as_mut() {
                        label.texttype = i16_0(&payload) as u32;
                    }
                }
                GdsRecordType::Presentation => {
                    if let Some(label) = self.label.as_mut() {
                        let bits = i16_0(&payload) & 0x000F;
                        match Anchor::from_i16(bits) {
                            Some(anchor) => label.anchor = anchor,
                            None => warn!("invalid text presentation 0x{:02X}", bits),
                        }
                    }
                }
                GdsRecordType::String => {
                    if let Some(label) = self.label.as_mut() {
                        label.text = str_of(&payload);
                    }
                }
                GdsRecordType::Strans => {
                    let data = i16_0(&payload);
                    let reflected = (data as u16 & 0x8000) != 0;
                    if let Some(reference) = self.reference.as_mut() {
                        reference.x_reflection = reflected;
                    } else if let Some(label) = self.label.as_mut() {
                        label.x_reflection = reflected;
                    }
                    if data & 0x0006 != 0 {
                        warn!("absolute magnification and rotation of references is not supported");
                    }
                }
                GdsRecordType::Mag => {
                    let mag = f64_0(&payload);
                    if let Some(reference) = self.reference.as_mut() {
                        reference.magnification = mag;
                    } else if let Some(label) = self.label.as_mut() {
                        label.magnification = mag;
                    }
                }
                GdsRecordType::Angle => {
                    let angle = f64_0(&payload).to_radians();
                    if let Some(reference) = self.reference.as_mut() {
                        reference.rotation = angle;
                    } else if let Some(label) = self.label.as_mut() {
                        label.rotation = angle;
                    }
                }
                GdsRecordType::PathType => {
                    if let Some(path) = self.path.as_mut() {
                        path.elements[0].end_type = match i16_0(&payload) {
                            0 => EndType::Flush,
                            1 => EndType::Round,
                            2 => EndType::HalfWidth,
                            _ => EndType::Extended,
                        };
                    }
                }
                GdsRecordType::PropAttr => self.key = i16_0(&payload) as u16,
                GdsRecordType::PropValue => {
                    let value = match payload.last() {
                        Some(0) => &payload[..payload.len() - 1],
                        _ => &payload[..],
                    };
                    let key = self.key;
                    if let Some(polygon) = self.polygon.as_mut() {
                        set_gds_property(&mut polygon.properties, key, value);
                    } else if let Some(path) = self.path.as_mut() {
                        set_gds_property(&mut path.properties, key, value);
                    } else if let Some(reference) = self.reference.as_mut() {
                        set_gds_property(&mut reference.properties, key, value);
                    } else if let Some(label) = self.label.as_mut() {
                        set_gds_property(&mut label.properties, key, value);
                    }
                }
                GdsRecordType::BgnExtn => {
                    if let Some(path) = self.path.as_mut() {
                        path.elements[0].end_extensions.x =
                            self.factor * i32_0(&payload) as f64;
                    }
                }
                GdsRecordType::EndExtn => {
                    if let Some(path) = self.path.as_mut() {
                        path.elements[0].end_extensions.y =
                            self.factor * i32_0(&payload) as f64;
                    }
                }
                _ => warn!(
                    "GDSII record type {:?} (0x{:02X}) is not supported",
                    rtype, rtype as u8
                ),
            }
        }
        Ok(false)
    }
    /// Apply an XY record to the current element
    fn handle_xy(&mut self, data: &[i32]) {
        let factor = self.factor;
        if let Some(polygon) = self.polygon.as_mut() {
            polygon.points.reserve(data.len() / 2);
            for pair in data.chunks_exact(2) {
                polygon
                    .points
                    .push(Vec2::new(factor * pair[0] as f64, factor * pair[1] as f64));
            }
        } else if let Some(path) = self.path.as_mut() {
            let coords: Vec<Vec2> = data
                .chunks_exact(2)
                .map(|pair| Vec2::new(factor * pair[0] as f64, factor * pair[1] as f64))
                .collect();
            if coords.is_empty() {
                return;
            }
            if path.spine.is_empty() {
                path.spine.push(coords[0]);
                path.elements[0]
                    .half_width_and_offset
                    .push(Vec2::new(self.width / 2.0, 0.0));
                path.segment(&coords[1..], false);
            } else {
                path.segment(&coords, false);
            }
        } else if let Some(reference) = self.reference.as_mut() {
            if data.len() < 2 {
                return;
            }
            let origin = Vec2::new(factor * data[0] as f64, factor * data[1] as f64);
            reference.origin = origin;
            // AREF lattice corners arrive in the same record
            if let Repetition::Rectangular { columns, rows, .. } = reference.repetition {
                if data.len() >= 6 {
                    let cols = columns as f64;
                    let rws = rows as f64;
                    if reference.rotation == 0.0 && !reference.x_reflection {
                        reference.repetition = Repetition::Rectangular {
                            columns,
                            rows,
                            spacing: Vec2::new(
                                (factor * data[2] as f64 - origin.x) / cols,
                                (factor * data[5] as f64 - origin.y) / rws,
                            ),
                        };
                    } else {
                        reference.repetition = Repetition::Regular {
                            columns,
                            rows,
                            v1: Vec2::new(
                                (factor * data[2] as f64 - origin.x) / cols,
                                (factor * data[3] as f64 - origin.y) / cols,
                            ),
                            v2: Vec2::new(
                                (factor * data[4] as f64 - origin.x) / rws,
                                (factor * data[5] as f64 - origin.y) / rws,
                            ),
                        };
                    }
                }
            }
        } else if let Some(label) = self.label.as_mut() {
            if data.len() >= 2 {
                label.origin = Vec2::new(factor * data[0] as f64, factor * data[1] as f64);
            }
        }
    }
    /// ENDEL: close the current element into the current cell
    fn end_element(&mut self) {
        if let Some(mut polygon) = self.polygon.take() {
            // Polygons are closed on disk (first and last points the same)
            polygon.points.pop();
            if let Some(cell) = self.cell.as_mut() {
                cell.polygons.push(polygon);
            }
        }
        if let Some(path) = self.path.take() {
            if let Some(cell) = self.cell.as_mut() {
                cell.flexpaths.push(path);
            }
        }
        if let Some(reference) = self.reference.take() {
            if let Some(cell) = self.cell.as_mut() {
                cell.references.push(reference);
            }
        }
        if let Some(label) = self.label.take() {
            if let Some(cell) = self.cell.as_mut() {
                cell.labels.push(label);
            }
        }
    }
    /// Resolve reference names to cell indices and yield the library
    fn finish(mut self) -> Library {
        if let Some(cell) = self.cell.take() {
            if !cell.name.is_empty() {
                self.lib.cells.push(cell);
            }
        }
        let map: HashMap<String, usize> = self
            .lib
            .cells
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), i))
            .collect();
        for cell in self.lib.cells.iter_mut() {
            for reference in cell.references.iter_mut() {
                if let RefTarget::Name(name) = &reference.target {
                    if let Some(&idx) = map.get(name) {
                        reference.target = RefTarget::Cell(idx);
                    }
                }
            }
        }
        self.lib
    }
}

/// Read a GDSII [Library] from the file at `path`.
///
/// A positive `unit` rescales coordinates into that user unit; zero keeps
/// the unit recorded in the file. `tolerance` seeds the curve tolerance of
/// paths created from native path records. On failure a diagnostic is
/// logged and the partial (possibly empty) library is returned.
pub fn read_gds(path: impl AsRef<Path>, unit: f64, tolerance: f64) -> Library {
    let path = path.as_ref();
    let rdr = match GdsReader::open(path) {
        Ok(rdr) => rdr,
        Err(_) => {
            error!("unable to open GDSII file {} for input", path.display());
            return Library {
                name: String::new(),
                unit: 0.0,
                precision: 0.0,
                ..Default::default()
            };
        }
    };
    let mut parser = GdsParser::new(rdr, unit, tolerance);
    match parser.parse_records() {
        Ok(true) => (),
        Ok(false) => error!("GDSII stream ended before ENDLIB"),
        Err(e) => error!("invalid GDSII stream: {}", e),
    }
    parser.finish()
}

/// Read only the unit pair from the GDSII file at `path`.
/// Returns `(unit, precision)` in meters.
pub fn gds_units(path: impl AsRef<Path>) -> MaskResult<(f64, f64)> {
    let path = path.as_ref();
    let mut rdr = GdsReader::open(path).map_err(|e| {
        error!("unable to open GDSII file {} for input", path.display());
        e
    })?;
    while let Some((rtype, payload)) = rdr.read_record()? {
        if rtype == GdsRecordType::Units as u8 {
            let data = f64_vec(&payload);
            if data.len() < 2 {
                break;
            }
            let precision = data[1];
            let unit = precision / data[0];
            return Ok((unit, precision));
        }
    }
    error!("GDSII file missing units definition");
    Err(MaskError::Decode)
}
