//!
//! # GDSII Writing
//!

// Std-Lib Imports
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

// Crates.io
use byteorder::{BigEndian, WriteBytesExt};
use chrono::{Datelike, NaiveDateTime, Timelike, Utc};
use log::{error, warn};

// Local Imports
use super::{GdsDataType, GdsFloat64, GdsRecordType, GDS_VERSION};
use crate::data::{
    EndType, FlexPath, Label, Library, Polygon, Property, PropertyName, PropertyValue, Reference,
    Repetition, RobustPath, Vec2,
};
use crate::error::{MaskError, MaskResult};
use crate::geom;

/// Round a scaled coordinate to its on-disk integer, ties to even
fn db_round(value: f64) -> i32 {
    value.round_ties_even() as i32
}

/// # Gds Writing Helper
pub struct GdsWriter<'wr> {
    /// Write Destination
    dest: Box<dyn Write + 'wr>,
}
impl<'wr> GdsWriter<'wr> {
    /// Create a new [GdsWriter] with destination file at `path`
    pub fn open(path: &Path) -> MaskResult<Self> {
        let file = BufWriter::new(File::create(path)?);
        Ok(Self::new(file))
    }
    /// Create a new [GdsWriter] to destination `dest`
    pub fn new(dest: impl Write + 'wr) -> Self {
        Self {
            dest: Box::new(dest),
        }
    }
    /// Write a record header: length, record type, and data type
    fn record_header(
        &mut self,
        rtype: GdsRecordType,
        dtype: GdsDataType,
        data_len: usize,
    ) -> MaskResult<()> {
        // Include the four header bytes in the total length
        let total = match u16::try_from(data_len + 4) {
            Ok(val) => val,
            Err(_) => return Err(MaskError::RecordLen(data_len)),
        };
        self.dest.write_u16::<BigEndian>(total)?;
        self.dest.write_u8(rtype as u8)?;
        self.dest.write_u8(dtype as u8)?;
        Ok(())
    }
    fn record_empty(&mut self, rtype: GdsRecordType) -> MaskResult<()> {
        self.record_header(rtype, GdsDataType::NoData, 0)
    }
    fn record_i16(&mut self, rtype: GdsRecordType, data: &[i16]) -> MaskResult<()> {
        self.record_header(rtype, GdsDataType::I16, 2 * data.len())?;
        for val in data {
            self.dest.write_i16::<BigEndian>(*val)?;
        }
        Ok(())
    }
    fn record_i32(&mut self, rtype: GdsRecordType, data: &[i32]) -> MaskResult<()> {
        self.record_header(rtype, GdsDataType::I32, 4 * data.len())?;
        for val in data {
            self.dest.write_i32::<BigEndian>(*val)?;
        }
        Ok(())
    }
    fn record_f64(&mut self, rtype: GdsRecordType, data: &[f64]) -> MaskResult<()> {
        self.record_header(rtype, GdsDataType::F64, 8 * data.len())?;
        for val in data {
            self.dest.write_u64::<BigEndian>(GdsFloat64::encode(*val))?;
        }
        Ok(())
    }
    /// Write a string record, zero-padded to even length
    fn record_str(&mut self, rtype: GdsRecordType, data: &[u8]) -> MaskResult<()> {
        let len = data.len() + data.len() % 2;
        self.record_header(rtype, GdsDataType::Str, len)?;
        self.dest.write_all(data)?;
        if data.len() % 2 != 0 {
            self.dest.write_u8(0x00)?;
        }
        Ok(())
    }
    fn record_bits(&mut self, rtype: GdsRecordType, d0: u8, d1: u8) -> MaskResult<()> {
        self.record_header(rtype, GdsDataType::BitArray, 2)?;
        self.dest.write_u8(d0)?;
        self.dest.write_u8(d1)?;
        Ok(())
    }
    /// Emit the PROPATTR/PROPVALUE pairs representable in GDSII:
    /// number-named properties with a leading byte-string value.
    fn properties(&mut self, properties: &[Property]) -> MaskResult<()> {
        for property in properties {
            if let PropertyName::Number(attr) = property.name {
                if let Some(PropertyValue::Bytes(bytes)) = property.values.first() {
                    self.record_i16(GdsRecordType::PropAttr, &[attr as i16])?;
                    self.record_str(GdsRecordType::PropValue, bytes)?;
                }
            }
        }
        Ok(())
    }
    /// STRANS/MAG/ANGLE triple for references and labels
    fn strans(&mut self, x_reflection: bool, magnification: f64, rotation: f64) -> MaskResult<()> {
        if !x_reflection && magnification == 1.0 && rotation == 0.0 {
            return Ok(());
        }
        self.record_bits(
            GdsRecordType::Strans,
            if x_reflection { 0x80 } else { 0x00 },
            0x00,
        )?;
        if magnification != 1.0 {
            self.record_f64(GdsRecordType::Mag, &[magnification])?;
        }
        if rotation != 0.0 {
            self.record_f64(GdsRecordType::Angle, &[rotation.to_degrees()])?;
        }
        Ok(())
    }
    /// Flattened, scaled, closed XY coordinate list
    fn xy_closed(&mut self, points: &[Vec2], offset: Vec2, scaling: f64) -> MaskResult<()> {
        let mut xy = Vec::with_capacity(2 * (points.len() + 1));
        for p in points.iter().chain(points.first()) {
            xy.push(db_round((p.x + offset.x) * scaling));
            xy.push(db_round((p.y + offset.y) * scaling));
        }
        self.record_i32(GdsRecordType::Xy, &xy)
    }

    fn polygon(
        &mut self,
        polygon: &Polygon,
        scaling: f64,
        max_points: u64,
    ) -> MaskResult<()> {
        let pieces = geom::fracture(polygon.points.clone(), max_points);
        for offset in polygon.repetition.get_offsets() {
            for piece in pieces.iter() {
                self.record_empty(GdsRecordType::Boundary)?;
                self.record_i16(GdsRecordType::Layer, &[polygon.layer as i16])?;
                self.record_i16(GdsRecordType::DataType, &[polygon.datatype as i16])?;
                self.xy_closed(piece, offset, scaling)?;
                self.properties(&polygon.properties)?;
                self.record_empty(GdsRecordType::EndEl)?;
            }
        }
        Ok(())
    }

    /// One native PATH record set per repetition offset
    #[allow(clippy::too_many_arguments)]
    fn path_records(
        &mut self,
        layer: u32,
        datatype: u32,
        half_width: f64,
        end_type: EndType,
        end_extensions: Vec2,
        scale_width: bool,
        spine: &[Vec2],
        repetition: &Repetition,
        properties: &[Property],
        scaling: f64,
    ) -> MaskResult<()> {
        let path_type: i16 = match end_type {
            EndType::Flush => 0,
            EndType::Round => 1,
            EndType::HalfWidth => 2,
            EndType::Extended => 4,
        };
        let width = db_round(2.0 * half_width * scaling);
        let width = if scale_width { width } else { -width };
        for offset in repetition.get_offsets() {
            self.record_empty(GdsRecordType::Path)?;
            self.record_i16(GdsRecordType::Layer, &[layer as i16])?;
            self.record_i16(GdsRecordType::DataType, &[datatype as i16])?;
            self.record_i16(GdsRecordType::PathType, &[path_type])?;
            self.record_i32(GdsRecordType::Width, &[width])?;
            if let EndType::Extended = end_type {
                self.record_i32(
                    GdsRecordType::BgnExtn,
                    &[db_round(end_extensions.x * scaling)],
                )?;
                self.record_i32(
                    GdsRecordType::EndExtn,
                    &[db_round(end_extensions.y * scaling)],
                )?;
            }
            let mut xy = Vec::with_capacity(2 * spine.len());
            for p in spine {
                xy.push(db_round((p.x + offset.x) * scaling));
                xy.push(db_round((p.y + offset.y) * scaling));
            }
            self.record_i32(GdsRecordType::Xy, &xy)?;
            self.properties(properties)?;
            self.record_empty(GdsRecordType::EndEl)?;
        }
        Ok(())
    }

    fn flexpath(&mut self, path: &FlexPath, scaling: f64, max_points: u64) -> MaskResult<()> {
        if path.gdsii_path {
            for element in path.elements.iter() {
                let half_width = element
                    .half_width_and_offset
                    .first()
                    .map(|hw| hw.x)
                    .unwrap_or(0.0);
                self.path_records(
                    element.layer,
                    element.datatype,
                    half_width,
                    element.end_type,
                    element.end_extensions,
                    path.scale_width,
                    &path.spine,
                    &path.repetition,
                    &path.properties,
                    scaling,
                )?;
            }
            return Ok(());
        }
        // Not a native path: flatten each element to its outline polygon
        for element in path.elements.iter() {
            let points = geom::flatten_path(
                &path.spine,
                &element.half_width_and_offset,
                element.end_type,
                element.end_extensions,
                path.tolerance,
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
            self.polygon(&polygon, scaling, max_points)?;
        }
        Ok(())
    }

    fn robustpath(&mut self, path: &RobustPath, scaling: f64, max_points: u64) -> MaskResult<()> {
        for element in path.elements.iter() {
            if path.gdsii_path {
                self.path_records(
                    element.layer,
                    element.datatype,
                    element.half_width,
                    element.end_type,
                    element.end_extensions,
                    path.scale_width,
                    &path.spine,
                    &path.repetition,
                    &path.properties,
                    scaling,
                )?;
            } else {
                let half_widths =
                    vec![Vec2::new(element.half_width, element.offset); path.spine.len()];
                let points = geom::flatten_path(
                    &path.spine,
                    &half_widths,
                    element.end_type,
                    element.end_extensions,
                    path.tolerance,
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
                self.polygon(&polygon, scaling, max_points)?;
            }
        }
        Ok(())
    }

    fn reference(&mut self, lib: &Library, reference: &Reference, scaling: f64) -> MaskResult<()> {
        let name = match lib.target_name(&reference.target) {
            Some(name) => name.to_string(),
            None => {
                warn!("reference with unresolved target skipped");
                return Ok(());
            }
        };
        match reference.repetition {
            Repetition::Rectangular {
                columns,
                rows,
                spacing,
            } => self.array_reference(
                reference,
                &name,
                columns,
                rows,
                Vec2::new(spacing.x, 0.0),
                Vec2::new(0.0, spacing.y),
                scaling,
            ),
            Repetition::Regular {
                columns,
                rows,
                v1,
                v2,
            } => self.array_reference(reference, &name, columns, rows, v1, v2, scaling),
            _ => {
                for offset in reference.repetition.get_offsets() {
                    self.record_empty(GdsRecordType::Sref)?;
                    self.record_str(GdsRecordType::Sname, name.as_bytes())?;
                    self.strans(
                        reference.x_reflection,
                        reference.magnification,
                        reference.rotation,
                    )?;
                    let origin = reference.origin + offset;
                    self.record_i32(
                        GdsRecordType::Xy,
                        &[db_round(origin.x * scaling), db_round(origin.y * scaling)],
                    )?;
                    self.properties(&reference.properties)?;
                    self.record_empty(GdsRecordType::EndEl)?;
                }
                Ok(())
            }
        }
    }

    /// AREF: corner points pass through the reference's own transform,
    /// so readers recover the lattice by dividing the raw deltas.
    #[allow(clippy::too_many_arguments)]
    fn array_reference(
        &mut self,
        reference: &Reference,
        name: &str,
        columns: u64,
        rows: u64,
        v1: Vec2,
        v2: Vec2,
        scaling: f64,
    ) -> MaskResult<()> {
        let transform = |mut v: Vec2| {
            if reference.x_reflection {
                v.y = -v.y;
            }
            v.rotated(reference.rotation)
        };
        let origin = reference.origin;
        let corner1 = origin + transform(v1) * columns as f64;
        let corner2 = origin + transform(v2) * rows as f64;
        self.record_empty(GdsRecordType::Aref)?;
        self.record_str(GdsRecordType::Sname, name.as_bytes())?;
        self.strans(
            reference.x_reflection,
            reference.magnification,
            reference.rotation,
        )?;
        self.record_i16(GdsRecordType::ColRow, &[columns as i16, rows as i16])?;
        self.record_i32(
            GdsRecordType::Xy,
            &[
                db_round(origin.x * scaling),
                db_round(origin.y * scaling),
                db_round(corner1.x * scaling),
                db_round(corner1.y * scaling),
                db_round(corner2.x * scaling),
                db_round(corner2.y * scaling),
            ],
        )?;
        self.properties(&reference.properties)?;
        self.record_empty(GdsRecordType::EndEl)?;
        Ok(())
    }

    fn label(&mut self, label: &Label, scaling: f64) -> MaskResult<()> {
        for offset in label.repetition.get_offsets() {
            self.record_empty(GdsRecordType::Text)?;
            self.record_i16(GdsRecordType::Layer, &[label.layer as i16])?;
            self.record_i16(GdsRecordType::TextType, &[label.texttype as i16])?;
            self.record_bits(GdsRecordType::Presentation, 0x00, label.anchor as u8)?;
            self.strans(label.x_reflection, label.magnification, label.rotation)?;
            let origin = label.origin + offset;
            self.record_i32(
                GdsRecordType::Xy,
                &[db_round(origin.x * scaling), db_round(origin.y * scaling)],
            )?;
            self.record_str(GdsRecordType::String, label.text.as_bytes())?;
            self.properties(&label.properties)?;
            self.record_empty(GdsRecordType::EndEl)?;
        }
        Ok(())
    }
}

/// Encode a timestamp in GDSII's twelve-i16 double-date layout
fn encode_dates(timestamp: &NaiveDateTime) -> Vec<i16> {
    let date = [
        timestamp.year() as i16,
        timestamp.month() as i16,
        timestamp.day() as i16,
        timestamp.hour() as i16,
        timestamp.minute() as i16,
        timestamp.second() as i16,
    ];
    let mut dates = date.to_vec();
    dates.extend_from_slice(&date);
    dates
}

/// Write `lib` as a GDSII stream to the file at `path`
pub(crate) fn write_gds(
    lib: &Library,
    path: &Path,
    max_points: u64,
    timestamp: Option<NaiveDateTime>,
) -> MaskResult<()> {
    let mut writer = match GdsWriter::open(path) {
        Ok(writer) => writer,
        Err(e) => {
            error!("unable to open GDSII file {} for output", path.display());
            return Err(e);
        }
    };
    let timestamp = timestamp.unwrap_or_else(|| Utc::now().naive_utc());
    let dates = encode_dates(&timestamp);

    writer.record_i16(GdsRecordType::Header, &[GDS_VERSION])?;
    writer.record_i16(GdsRecordType::BgnLib, &dates)?;
    writer.record_str(GdsRecordType::LibName, lib.name.as_bytes())?;
    writer.record_f64(
        GdsRecordType::Units,
        &[lib.precision / lib.unit, lib.precision],
    )?;

    let scaling = lib.unit / lib.precision;
    for cell in lib.cells.iter() {
        writer.record_i16(GdsRecordType::BgnStr, &dates)?;
        writer.record_str(GdsRecordType::StrName, cell.name.as_bytes())?;
        for polygon in cell.polygons.iter() {
            writer.polygon(polygon, scaling, max_points)?;
        }
        for path in cell.flexpaths.iter() {
            writer.flexpath(path, scaling, max_points)?;
        }
        for path in cell.robustpaths.iter() {
            writer.robustpath(path, scaling, max_points)?;
        }
        for reference in cell.references.iter() {
            writer.reference(lib, reference, scaling)?;
        }
        for label in cell.labels.iter() {
            writer.label(label, scaling)?;
        }
        writer.record_empty(GdsRecordType::EndStr)?;
    }

    // Pre-serialized cells pass through untouched
    for rawcell in lib.rawcells.iter() {
        writer.dest.write_all(&rawcell.bytes)?;
    }

    writer.record_empty(GdsRecordType::EndLib)?;
    writer.dest.flush()?;
    Ok(())
}
