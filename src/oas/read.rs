//!
//! # OASIS Reading
//!
//! The reader is a state machine over records. A [ModalState] value holds
//! the modal variables that records inherit when their info-byte bits are
//! clear; each record handler takes it by exclusive reference, updates the
//! variables the record carries explicitly, and reads the rest from it.
//!
//! Names arrive out of order: cells, label texts, property names, and
//! property string-values may be referenced by table index before (or
//! after) the table record defining them. Pending indices are queued (or
//! parked in `NameRef`/`StringRef`/`CellRef` variants) and rewritten by a
//! single resolution pass at the END record.
//!

// Std-Lib Imports
use std::collections::HashMap;
use std::f64::consts::PI;
use std::io::Read;
use std::path::Path;

// Crates.io
use flate2::read::DeflateDecoder;
use log::{error, warn};
use num_traits::FromPrimitive;

// Local Imports
use super::{OasisReader, OasisRecordType, OASIS_MAGIC};
use crate::data::{
    Anchor, Cell, EndType, FlexPath, Label, Library, PathElement, Polygon, Property, PropertyName,
    PropertyValue, RefTarget, Reference, Repetition, Vec2,
};
use crate::error::MaskResult;
use crate::geom;

/// One slot of a forward-reference name table
#[derive(Debug, Default)]
struct TableEntry {
    bytes: Vec<u8>,
    properties: Vec<Property>,
}

/// Store `bytes` at table index `index`, growing with empty slots
fn set_table(table: &mut Vec<TableEntry>, index: u64, bytes: Vec<u8>) -> usize {
    let index = index as usize;
    while table.len() <= index {
        table.push(TableEntry::default());
    }
    table[index] = TableEntry {
        bytes,
        properties: Vec::new(),
    };
    index
}

/// The last explicitly-referenced label text: a string, or a
/// text-string-table index not yet defined
#[derive(Debug, Clone)]
enum TextSlot {
    Text(String),
    Ref(u64),
}

/// Where PROPERTY records currently attach: the entity introduced by the
/// most recent non-property record
#[derive(Debug, Clone, Copy)]
enum PropOwner {
    Library,
    Cell(usize),
    Polygon(usize, usize),
    FlexPath(usize, usize),
    Reference(usize, usize),
    Label(usize, usize),
    CellName(usize),
    TextString(usize),
    PropName(usize),
    PropString(usize),
}

/// # Modal Variables
///
/// The attribute values records inherit when not supplied explicitly.
/// Positions reset at each CELL record; the rest persist across cells.
struct ModalState {
    absolute_pos: bool,
    layer: u64,
    datatype: u64,
    textlayer: u64,
    texttype: u64,
    placement_pos: Vec2,
    text_pos: Vec2,
    geom_pos: Vec2,
    geom_dim: Vec2,
    repetition: Repetition,
    placement_target: Option<RefTarget>,
    text_string: Option<TextSlot>,
    polygon_points: Vec<Vec2>,
    path_points: Vec<Vec2>,
    path_halfwidth: f64,
    path_extensions: Vec2,
    ctrapezoid_type: u8,
    circle_radius: f64,
    property_name: Option<PropertyName>,
    property_values: Vec<PropertyValue>,
}
impl ModalState {
    fn new() -> Self {
        Self {
            absolute_pos: true,
            layer: 0,
            datatype: 0,
            textlayer: 0,
            texttype: 0,
            placement_pos: Vec2::default(),
            text_pos: Vec2::default(),
            geom_pos: Vec2::default(),
            geom_dim: Vec2::default(),
            repetition: Repetition::None,
            placement_target: None,
            text_string: None,
            polygon_points: Vec::new(),
            path_points: Vec::new(),
            path_halfwidth: 0.0,
            path_extensions: Vec2::default(),
            ctrapezoid_type: 0,
            circle_radius: 0.0,
            property_name: None,
            property_values: Vec::new(),
        }
    }
    /// Per-cell reset: back to absolute positioning at the origin
    fn begin_cell(&mut self) {
        self.absolute_pos = true;
        self.placement_pos = Vec2::default();
        self.text_pos = Vec2::default();
        self.geom_pos = Vec2::default();
    }
}

/// Apply a coordinate from the stream to a modal position component
fn update(slot: &mut f64, absolute: bool, value: f64) {
    if absolute {
        *slot = value;
    } else {
        *slot += value;
    }
}

/// # OasParser
/// Folds the OASIS record stream into a [Library].
struct OasParser<'rd> {
    stream: OasisReader<'rd>,
    /// Database-unit to user-coordinate scale from the START record
    factor: f64,
    tolerance: f64,
    lib: Library,
    modal: ModalState,
    /// Index of the open cell in `lib.cells`
    cell: Option<usize>,
    // The four forward-reference tables
    cell_names: Vec<TableEntry>,
    text_strings: Vec<TableEntry>,
    prop_names: Vec<TableEntry>,
    prop_strings: Vec<TableEntry>,
    // Pending (slot, table index) pairs resolved at END
    pending_cell_names: Vec<(usize, u64)>,
    pending_label_texts: Vec<(usize, usize, u64)>,
    prop_owner: PropOwner,
}
impl<'rd> OasParser<'rd> {
    fn new(stream: OasisReader<'rd>, tolerance: f64) -> Self {
        Self {
            stream,
            factor: 1.0,
            tolerance,
            lib: Library {
                name: String::new(),
                unit: 0.0,
                precision: 0.0,
                ..Default::default()
            },
            modal: ModalState::new(),
            cell: None,
            cell_names: Vec::new(),
            text_strings: Vec::new(),
            prop_names: Vec::new(),
            prop_strings: Vec::new(),
            pending_cell_names: Vec::new(),
            pending_label_texts: Vec::new(),
            prop_owner: PropOwner::Library,
        }
    }
    /// Check the signature and consume the START record
    fn start(&mut self, unit: f64) -> MaskResult<bool> {
        let mut header = [0u8; 14];
        if self.stream.read_exact(&mut header).is_err()
            || header[..13] != OASIS_MAGIC[..]
            || header[13] != OasisRecordType::Start as u8
        {
            error!("invalid OASIS header");
            return Ok(false);
        }
        let version = self.stream.read_string()?;
        if version != b"1.0" {
            warn!("unsupported OASIS file version");
        }
        self.factor = 1.0 / self.stream.read_real()?;
        self.lib.precision = 1e-6 * self.factor;
        if unit > 0.0 {
            self.lib.unit = unit;
            self.factor *= 1e-6 / unit;
        } else {
            self.lib.unit = 1e-6;
        }
        let offset_table_flag = self.stream.read_unsigned_integer()?;
        if offset_table_flag == 0 {
            // Offset table stored here instead of in END: skip it
            for _ in 0..12 {
                self.stream.read_unsigned_integer()?;
            }
        }
        Ok(true)
    }
    /// Consume records until END or end-of-file.
    /// Returns whether END was seen.
    fn parse_records(&mut self) -> MaskResult<bool> {
        while let Some(byte) = self.stream.next_record()? {
            let record = match OasisRecordType::from_u8(byte) {
                Some(record) => record,
                None => {
                    warn!("unknown OASIS record type 0x{:02X}", byte);
                    continue;
                }
            };
            match record {
                OasisRecordType::Pad => (),
                OasisRecordType::Start => {
                    warn!("unexpected START record out of position");
                }
                OasisRecordType::End => return Ok(true),
                OasisRecordType::CellnameImplicit => {
                    let bytes = self.stream.read_string()?;
                    self.cell_names.push(TableEntry {
                        bytes,
                        properties: Vec::new(),
                    });
                    self.prop_owner = PropOwner::CellName(self.cell_names.len() - 1);
                }
                OasisRecordType::Cellname => {
                    let bytes = self.stream.read_string()?;
                    let index = self.stream.read_unsigned_integer()?;
                    let index = set_table(&mut self.cell_names, index, bytes);
                    self.prop_owner = PropOwner::CellName(index);
                }
                OasisRecordType::TextstringImplicit => {
                    let bytes = self.stream.read_string()?;
                    self.text_strings.push(TableEntry {
                        bytes,
                        properties: Vec::new(),
                    });
                    self.prop_owner = PropOwner::TextString(self.text_strings.len() - 1);
                }
                OasisRecordType::Textstring => {
                    let bytes = self.stream.read_string()?;
                    let index = self.stream.read_unsigned_integer()?;
                    let index = set_table(&mut self.text_strings, index, bytes);
                    self.prop_owner = PropOwner::TextString(index);
                }
                OasisRecordType::PropnameImplicit => {
                    let bytes = self.stream.read_string()?;
                    self.prop_names.push(TableEntry {
                        bytes,
                        properties: Vec::new(),
                    });
                    self.prop_owner = PropOwner::PropName(self.prop_names.len() - 1);
                }
                OasisRecordType::Propname => {
                    let bytes = self.stream.read_string()?;
                    let index = self.stream.read_unsigned_integer()?;
                    let index = set_table(&mut self.prop_names, index, bytes);
                    self.prop_owner = PropOwner::PropName(index);
                }
                OasisRecordType::PropstringImplicit => {
                    let bytes = self.stream.read_string()?;
                    self.prop_strings.push(TableEntry {
                        bytes,
                        properties: Vec::new(),
                    });
                    self.prop_owner = PropOwner::PropString(self.prop_strings.len() - 1);
                }
                OasisRecordType::Propstring => {
                    let bytes = self.stream.read_string()?;
                    let index = self.stream.read_unsigned_integer()?;
                    let index = set_table(&mut self.prop_strings, index, bytes);
                    self.prop_owner = PropOwner::PropString(index);
                }
                OasisRecordType::LayernameData | OasisRecordType::LayernameText => {
                    // Interpretation of the layer-name table is out of scope
                    self.stream.read_string()?;
                    for _ in 0..2 {
                        let interval = self.stream.read_unsigned_integer()?;
                        if interval > 0 {
                            if interval == 4 {
                                self.stream.read_unsigned_integer()?;
                            }
                            self.stream.read_unsigned_integer()?;
                        }
                    }
                    warn!("LAYERNAME record ignored");
                }
                OasisRecordType::CellRefNum | OasisRecordType::Cell => {
                    let mut cell = Cell::default();
                    let mut pending = None;
                    if record == OasisRecordType::CellRefNum {
                        pending = Some(self.stream.read_unsigned_integer()?);
                    } else {
                        cell.name = lossy(&self.stream.read_string()?);
                    }
                    self.lib.cells.push(cell);
                    let index = self.lib.cells.len() - 1;
                    if let Some(name_index) = pending {
                        self.pending_cell_names.push((index, name_index));
                    }
                    self.cell = Some(index);
                    self.prop_owner = PropOwner::Cell(index);
                    self.modal.begin_cell();
                }
                OasisRecordType::XyAbsolute => self.modal.absolute_pos = true,
                OasisRecordType::XyRelative => self.modal.absolute_pos = false,
                OasisRecordType::Placement => self.placement(false)?,
                OasisRecordType::PlacementTransform => self.placement(true)?,
                OasisRecordType::Text => self.text()?,
                OasisRecordType::Rectangle => self.rectangle()?,
                OasisRecordType::Polygon => self.polygon()?,
                OasisRecordType::Path => self.path()?,
                OasisRecordType::TrapezoidAb => self.trapezoid(true, true)?,
                OasisRecordType::TrapezoidA => self.trapezoid(true, false)?,
                OasisRecordType::TrapezoidB => self.trapezoid(false, true)?,
                OasisRecordType::Ctrapezoid => self.ctrapezoid()?,
                OasisRecordType::Circle => self.circle()?,
                OasisRecordType::Property => self.property(false)?,
                OasisRecordType::LastProperty => self.property(true)?,
                OasisRecordType::XnameImplicit => {
                    self.stream.read_unsigned_integer()?;
                    self.stream.read_string()?;
                    warn!("record type XNAME ignored");
                }
                OasisRecordType::Xname => {
                    self.stream.read_unsigned_integer()?;
                    self.stream.read_string()?;
                    self.stream.read_unsigned_integer()?;
                    warn!("record type XNAME ignored");
                }
                OasisRecordType::Xelement => {
                    self.stream.read_unsigned_integer()?;
                    self.stream.read_string()?;
                    warn!("record type XELEMENT ignored");
                }
                OasisRecordType::Xgeometry => self.xgeometry()?,
                OasisRecordType::Cblock => self.cblock()?,
            }
        }
        Ok(false)
    }

    fn read_coord(&mut self) -> MaskResult<f64> {
        Ok(self.factor * self.stream.read_integer()? as f64)
    }
    fn read_udim(&mut self) -> MaskResult<f64> {
        Ok(self.factor * self.stream.read_unsigned_integer()? as f64)
    }
    /// Read the repetition field and copy it onto `target`
    fn take_repetition(&mut self) -> MaskResult<Repetition> {
        self.stream
            .read_repetition(self.factor, &mut self.modal.repetition)?;
        Ok(self.modal.repetition.clone())
    }

    fn push_polygon(&mut self, polygon: Polygon) {
        match self.cell {
            Some(index) => {
                let cell = &mut self.lib.cells[index];
                cell.polygons.push(polygon);
                self.prop_owner = PropOwner::Polygon(index, cell.polygons.len() - 1);
            }
            None => warn!("geometry record outside any cell"),
        }
    }

    fn placement(&mut self, transform: bool) -> MaskResult<()> {
        let info = self.stream.read_byte()?;
        let target = if info & 0x80 != 0 {
            // Explicit reference, by table index or by name
            let target = if info & 0x40 != 0 {
                RefTarget::CellRef(self.stream.read_unsigned_integer()?)
            } else {
                RefTarget::Name(lossy(&self.stream.read_string()?))
            };
            self.modal.placement_target = Some(target.clone());
            target
        } else {
            match self.modal.placement_target.clone() {
                Some(target) => target,
                None => {
                    warn!("PLACEMENT record inherits an unset modal cell");
                    RefTarget::Name(String::new())
                }
            }
        };
        let mut reference = Reference {
            target,
            ..Default::default()
        };
        if !transform {
            reference.rotation = match info & 0x06 {
                0x02 => 0.5 * PI,
                0x04 => PI,
                0x06 => 1.5 * PI,
                _ => 0.0,
            };
        } else {
            if info & 0x04 != 0 {
                reference.magnification = self.stream.read_real()?;
            }
            if info & 0x02 != 0 {
                reference.rotation = self.stream.read_real()?.to_radians();
            }
        }
        reference.x_reflection = info & 0x01 != 0;
        if info & 0x20 != 0 {
            let x = self.read_coord()?;
            update(&mut self.modal.placement_pos.x, self.modal.absolute_pos, x);
        }
        if info & 0x10 != 0 {
            let y = self.read_coord()?;
            update(&mut self.modal.placement_pos.y, self.modal.absolute_pos, y);
        }
        reference.origin = self.modal.placement_pos;
        if info & 0x08 != 0 {
            reference.repetition = self.take_repetition()?;
        }
        match self.cell {
            Some(index) => {
                let cell = &mut self.lib.cells[index];
                cell.references.push(reference);
                self.prop_owner = PropOwner::Reference(index, cell.references.len() - 1);
            }
            None => warn!("PLACEMENT record outside any cell"),
        }
        Ok(())
    }

    fn text(&mut self) -> MaskResult<()> {
        let mut label = Label {
            anchor: Anchor::SW,
            ..Default::default()
        };
        let mut pending = None;
        let info = self.stream.read_byte()?;
        if info & 0x40 != 0 {
            // Explicit text, by table index or by value
            if info & 0x20 != 0 {
                let index = self.stream.read_unsigned_integer()?;
                pending = Some(index);
                self.modal.text_string = Some(TextSlot::Ref(index));
            } else {
                label.text = lossy(&self.stream.read_string()?);
                self.modal.text_string = Some(TextSlot::Text(label.text.clone()));
            }
        } else {
            match self.modal.text_string.clone() {
                Some(TextSlot::Text(text)) => label.text = text,
                Some(TextSlot::Ref(index)) => pending = Some(index),
                None => warn!("TEXT record inherits an unset modal string"),
            }
        }
        if info & 0x01 != 0 {
            self.modal.textlayer = self.stream.read_unsigned_integer()?;
        }
        label.layer = self.modal.textlayer as u32;
        if info & 0x02 != 0 {
            self.modal.texttype = self.stream.read_unsigned_integer()?;
        }
        label.texttype = self.modal.texttype as u32;
        if info & 0x10 != 0 {
            let x = self.read_coord()?;
            update(&mut self.modal.text_pos.x, self.modal.absolute_pos, x);
        }
        if info & 0x08 != 0 {
            let y = self.read_coord()?;
            update(&mut self.modal.text_pos.y, self.modal.absolute_pos, y);
        }
        label.origin = self.modal.text_pos;
        if info & 0x04 != 0 {
            label.repetition = self.take_repetition()?;
        }
        match self.cell {
            Some(index) => {
                let cell = &mut self.lib.cells[index];
                cell.labels.push(label);
                let label_index = cell.labels.len() - 1;
                self.prop_owner = PropOwner::Label(index, label_index);
                if let Some(text_index) = pending {
                    self.pending_label_texts.push((index, label_index, text_index));
                }
            }
            None => warn!("TEXT record outside any cell"),
        }
        Ok(())
    }

    fn rectangle(&mut self) -> MaskResult<()> {
        let info = self.stream.read_byte()?;
        if info & 0x01 != 0 {
            self.modal.layer = self.stream.read_unsigned_integer()?;
        }
        if info & 0x02 != 0 {
            self.modal.datatype = self.stream.read_unsigned_integer()?;
        }
        if info & 0x40 != 0 {
            self.modal.geom_dim.x = self.read_udim()?;
        }
        if info & 0x20 != 0 {
            self.modal.geom_dim.y = self.read_udim()?;
        }
        if info & 0x10 != 0 {
            let x = self.read_coord()?;
            update(&mut self.modal.geom_pos.x, self.modal.absolute_pos, x);
        }
        if info & 0x08 != 0 {
            let y = self.read_coord()?;
            update(&mut self.modal.geom_pos.y, self.modal.absolute_pos, y);
        }
        let pos = self.modal.geom_pos;
        let width = self.modal.geom_dim.x;
        // The square bit reuses the width as the height
        let height = if info & 0x80 != 0 {
            self.modal.geom_dim.x
        } else {
            self.modal.geom_dim.y
        };
        let mut polygon = Polygon {
            layer: self.modal.layer as u32,
            datatype: self.modal.datatype as u32,
            points: vec![
                pos,
                Vec2::new(pos.x + width, pos.y),
                Vec2::new(pos.x + width, pos.y + height),
                Vec2::new(pos.x, pos.y + height),
            ],
            ..Default::default()
        };
        if info & 0x04 != 0 {
            polygon.repetition = self.take_repetition()?;
        }
        self.push_polygon(polygon);
        Ok(())
    }

    fn polygon(&mut self) -> MaskResult<()> {
        let info = self.stream.read_byte()?;
        if info & 0x01 != 0 {
            self.modal.layer = self.stream.read_unsigned_integer()?;
        }
        if info & 0x02 != 0 {
            self.modal.datatype = self.stream.read_unsigned_integer()?;
        }
        if info & 0x20 != 0 {
            let mut points = std::mem::take(&mut self.modal.polygon_points);
            points.clear();
            self.stream.read_point_list(self.factor, true, &mut points)?;
            self.modal.polygon_points = points;
        }
        // The first vertex is implicit at the geometry position
        let mut points = Vec::with_capacity(1 + self.modal.polygon_points.len());
        points.push(Vec2::default());
        points.extend_from_slice(&self.modal.polygon_points);
        if info & 0x10 != 0 {
            let x = self.read_coord()?;
            update(&mut self.modal.geom_pos.x, self.modal.absolute_pos, x);
        }
        if info & 0x08 != 0 {
            let y = self.read_coord()?;
            update(&mut self.modal.geom_pos.y, self.modal.absolute_pos, y);
        }
        let pos = self.modal.geom_pos;
        for point in points.iter_mut() {
            *point += pos;
        }
        let mut polygon = Polygon {
            layer: self.modal.layer as u32,
            datatype: self.modal.datatype as u32,
            points,
            ..Default::default()
        };
        if info & 0x04 != 0 {
            polygon.repetition = self.take_repetition()?;
        }
        self.push_polygon(polygon);
        Ok(())
    }

    fn path(&mut self) -> MaskResult<()> {
        let info = self.stream.read_byte()?;
        if info & 0x01 != 0 {
            self.modal.layer = self.stream.read_unsigned_integer()?;
        }
        if info & 0x02 != 0 {
            self.modal.datatype = self.stream.read_unsigned_integer()?;
        }
        if info & 0x40 != 0 {
            self.modal.path_halfwidth = self.read_udim()?;
        }
        if info & 0x80 != 0 {
            // Extension scheme: two bits each for the start and end caps
            let scheme = self.stream.read_byte()?;
            match scheme & 0x03 {
                0x01 => self.modal.path_extensions.x = 0.0,
                0x02 => self.modal.path_extensions.x = self.modal.path_halfwidth,
                0x03 => self.modal.path_extensions.x = self.read_coord()?,
                _ => (),
            }
            match scheme & 0x0C {
                0x04 => self.modal.path_extensions.y = 0.0,
                0x08 => self.modal.path_extensions.y = self.modal.path_halfwidth,
                0x0C => self.modal.path_extensions.y = self.read_coord()?,
                _ => (),
            }
        }
        let half_width = self.modal.path_halfwidth;
        let extensions = self.modal.path_extensions;
        let end_type = if extensions.x == 0.0 && extensions.y == 0.0 {
            EndType::Flush
        } else if extensions.x == half_width && extensions.y == half_width {
            EndType::HalfWidth
        } else {
            EndType::Extended
        };
        let mut element = PathElement {
            layer: self.modal.layer as u32,
            datatype: self.modal.datatype as u32,
            end_type,
            ..Default::default()
        };
        if let EndType::Extended = end_type {
            element.end_extensions = extensions;
        }
        element
            .half_width_and_offset
            .push(Vec2::new(half_width, 0.0));
        if info & 0x20 != 0 {
            let mut points = std::mem::take(&mut self.modal.path_points);
            points.clear();
            self.stream.read_point_list(self.factor, false, &mut points)?;
            self.modal.path_points = points;
        }
        if info & 0x10 != 0 {
            let x = self.read_coord()?;
            update(&mut self.modal.geom_pos.x, self.modal.absolute_pos, x);
        }
        if info & 0x08 != 0 {
            let y = self.read_coord()?;
            update(&mut self.modal.geom_pos.y, self.modal.absolute_pos, y);
        }
        let mut path = FlexPath {
            tolerance: self.tolerance,
            elements: vec![element],
            gdsii_path: true,
            scale_width: true,
            spine: vec![self.modal.geom_pos],
            ..Default::default()
        };
        let points = self.modal.path_points.clone();
        path.segment(&points, true);
        if info & 0x04 != 0 {
            path.repetition = self.take_repetition()?;
        }
        match self.cell {
            Some(index) => {
                let cell = &mut self.lib.cells[index];
                cell.flexpaths.push(path);
                self.prop_owner = PropOwner::FlexPath(index, cell.flexpaths.len() - 1);
            }
            None => warn!("PATH record outside any cell"),
        }
        Ok(())
    }

    fn trapezoid(&mut self, has_a: bool, has_b: bool) -> MaskResult<()> {
        let info = self.stream.read_byte()?;
        if info & 0x01 != 0 {
            self.modal.layer = self.stream.read_unsigned_integer()?;
        }
        if info & 0x02 != 0 {
            self.modal.datatype = self.stream.read_unsigned_integer()?;
        }
        if info & 0x40 != 0 {
            self.modal.geom_dim.x = self.read_udim()?;
        }
        if info & 0x20 != 0 {
            self.modal.geom_dim.y = self.read_udim()?;
        }
        let delta_a = if has_a {
            self.factor * self.stream.read_1delta()? as f64
        } else {
            0.0
        };
        let delta_b = if has_b {
            self.factor * self.stream.read_1delta()? as f64
        } else {
            0.0
        };
        if info & 0x10 != 0 {
            let x = self.read_coord()?;
            update(&mut self.modal.geom_pos.x, self.modal.absolute_pos, x);
        }
        if info & 0x08 != 0 {
            let y = self.read_coord()?;
            update(&mut self.modal.geom_pos.y, self.modal.absolute_pos, y);
        }
        let pos = self.modal.geom_pos;
        let dim = self.modal.geom_dim;
        let points = if info & 0x80 != 0 {
            // Vertical orientation: parallel sides left and right
            vec![
                pos,
                pos + Vec2::new(dim.x, -delta_a),
                pos + dim + Vec2::new(0.0, -delta_b),
                pos + Vec2::new(0.0, dim.y),
            ]
        } else {
            vec![
                pos + Vec2::new(0.0, dim.y),
                pos + Vec2::new(-delta_a, 0.0),
                pos + Vec2::new(dim.x - delta_b, 0.0),
                pos + dim,
            ]
        };
        let mut polygon = Polygon {
            layer: self.modal.layer as u32,
            datatype: self.modal.datatype as u32,
            points,
            ..Default::default()
        };
        if info & 0x04 != 0 {
            polygon.repetition = self.take_repetition()?;
        }
        self.push_polygon(polygon);
        Ok(())
    }

    fn ctrapezoid(&mut self) -> MaskResult<()> {
        let info = self.stream.read_byte()?;
        if info & 0x01 != 0 {
            self.modal.layer = self.stream.read_unsigned_integer()?;
        }
        if info & 0x02 != 0 {
            self.modal.datatype = self.stream.read_unsigned_integer()?;
        }
        if info & 0x80 != 0 {
            self.modal.ctrapezoid_type = self.stream.read_byte()?;
        }
        if info & 0x40 != 0 {
            self.modal.geom_dim.x = self.read_udim()?;
        }
        if info & 0x20 != 0 {
            self.modal.geom_dim.y = self.read_udim()?;
        }
        if info & 0x10 != 0 {
            let x = self.read_coord()?;
            update(&mut self.modal.geom_pos.x, self.modal.absolute_pos, x);
        }
        if info & 0x08 != 0 {
            let y = self.read_coord()?;
            update(&mut self.modal.geom_pos.y, self.modal.absolute_pos, y);
        }
        let pos = self.modal.geom_pos;
        let dim = self.modal.geom_dim;
        let kind = self.modal.ctrapezoid_type;
        // Types 16-23 are triangles; the rest start from the full dim box
        let mut v = if (16..24).contains(&kind) {
            vec![pos, pos, pos]
        } else {
            vec![
                pos,
                pos + Vec2::new(dim.x, 0.0),
                pos + dim,
                pos + Vec2::new(0.0, dim.y),
            ]
        };
        match kind {
            0 => v[2].x -= dim.y,
            1 => v[1].x -= dim.y,
            2 => v[3].x += dim.y,
            3 => v[0].x += dim.y,
            4 => {
                v[2].x -= dim.y;
                v[3].x += dim.y;
            }
            5 => {
                v[0].x += dim.y;
                v[1].x -= dim.y;
            }
            6 => {
                v[1].x -= dim.y;
                v[3].x += dim.y;
            }
            7 => {
                v[0].x += dim.y;
                v[2].x -= dim.y;
            }
            8 => v[2].y -= dim.x,
            9 => v[3].y -= dim.x,
            10 => v[1].y += dim.x,
            11 => v[0].y += dim.x,
            12 => {
                v[1].x += dim.x;
                v[2].x -= dim.x;
            }
            13 => {
                v[0].x += dim.x;
                v[3].x -= dim.x;
            }
            14 => {
                v[1].x += dim.x;
                v[3].x -= dim.x;
            }
            15 => {
                v[0].x += dim.x;
                v[2].x -= dim.x;
            }
            16 => {
                v[1].x += dim.x;
                v[2].y += dim.x;
            }
            17 => {
                v[1] += Vec2::new(dim.x, dim.x);
                v[2].y += dim.x;
            }
            18 => {
                v[1].x += dim.x;
                v[2] += Vec2::new(dim.x, dim.x);
            }
            19 => {
                v[0].x += dim.x;
                v[1] += Vec2::new(dim.x, dim.x);
                v[2].y += dim.x;
            }
            20 => {
                v[1].x += 2.0 * dim.y;
                v[2] += Vec2::new(dim.y, dim.y);
            }
            21 => {
                v[0].x += dim.y;
                v[1] += Vec2::new(2.0 * dim.y, dim.y);
                v[2].y += dim.y;
            }
            22 => {
                v[1] += Vec2::new(dim.x, dim.x);
                v[2].y += 2.0 * dim.x;
            }
            23 => {
                v[0].x += dim.x;
                v[1] += Vec2::new(dim.x, 2.0 * dim.x);
                v[2].y += dim.x;
            }
            24 => warn!("CTRAPEZOID type 24 is undefined; using the full box"),
            25 => {
                v[2].y = pos.y + dim.x;
                v[3].y = pos.y + dim.x;
            }
            _ => warn!("invalid CTRAPEZOID type {}", kind),
        }
        let mut polygon = Polygon {
            layer: self.modal.layer as u32,
            datatype: self.modal.datatype as u32,
            points: v,
            ..Default::default()
        };
        if info & 0x04 != 0 {
            polygon.repetition = self.take_repetition()?;
        }
        self.push_polygon(polygon);
        Ok(())
    }

    fn circle(&mut self) -> MaskResult<()> {
        let info = self.stream.read_byte()?;
        if info & 0x01 != 0 {
            self.modal.layer = self.stream.read_unsigned_integer()?;
        }
        if info & 0x02 != 0 {
            self.modal.datatype = self.stream.read_unsigned_integer()?;
        }
        if info & 0x20 != 0 {
            self.modal.circle_radius = self.read_udim()?;
        }
        if info & 0x10 != 0 {
            let x = self.read_coord()?;
            update(&mut self.modal.geom_pos.x, self.modal.absolute_pos, x);
        }
        if info & 0x08 != 0 {
            let y = self.read_coord()?;
            update(&mut self.modal.geom_pos.y, self.modal.absolute_pos, y);
        }
        let mut polygon = geom::ellipse(
            self.modal.geom_pos,
            self.modal.circle_radius,
            self.modal.circle_radius,
            self.tolerance,
            self.modal.layer as u32,
            self.modal.datatype as u32,
        );
        if info & 0x04 != 0 {
            polygon.repetition = self.take_repetition()?;
        }
        self.push_polygon(polygon);
        Ok(())
    }

    fn property(&mut self, last: bool) -> MaskResult<()> {
        let info = if last { 0x08 } else { self.stream.read_byte()? };
        let name = if info & 0x04 != 0 {
            // Explicit name, by table index or by value
            let name = if info & 0x02 != 0 {
                PropertyName::NameRef(self.stream.read_unsigned_integer()?)
            } else {
                PropertyName::Text(lossy(&self.stream.read_string()?))
            };
            self.modal.property_name = Some(name.clone());
            name
        } else {
            match self.modal.property_name.clone() {
                Some(name) => name,
                None => {
                    warn!("PROPERTY record inherits an unset modal name");
                    PropertyName::Text(String::new())
                }
            }
        };
        let values = if info & 0x08 != 0 {
            // Reuse the modal value list
            self.modal.property_values.clone()
        } else {
            let mut count = (info >> 4) as u64;
            if count == 15 {
                count = self.stream.read_unsigned_integer()?;
            }
            let mut values = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let kind = self.stream.read_byte()? as u64;
                match kind {
                    0..=7 => values.push(PropertyValue::Real(
                        self.stream.read_real_by_type(kind)?,
                    )),
                    8 => values.push(PropertyValue::UnsignedInteger(
                        self.stream.read_unsigned_integer()?,
                    )),
                    9 => values.push(PropertyValue::Integer(self.stream.read_integer()?)),
                    10..=12 => values.push(PropertyValue::Bytes(self.stream.read_string()?)),
                    13..=15 => values.push(PropertyValue::StringRef(
                        self.stream.read_unsigned_integer()?,
                    )),
                    _ => {
                        warn!("invalid property value type {}", kind);
                        break;
                    }
                }
            }
            self.modal.property_values = values.clone();
            values
        };
        self.append_property(Property { name, values });
        Ok(())
    }

    /// Attach a property to the entity the last record introduced
    fn append_property(&mut self, property: Property) {
        let cells = &mut self.lib.cells;
        match self.prop_owner {
            PropOwner::Library => self.lib.properties.push(property),
            PropOwner::Cell(c) => cells[c].properties.push(property),
            PropOwner::Polygon(c, i) => cells[c].polygons[i].properties.push(property),
            PropOwner::FlexPath(c, i) => cells[c].flexpaths[i].properties.push(property),
            PropOwner::Reference(c, i) => cells[c].references[i].properties.push(property),
            PropOwner::Label(c, i) => cells[c].labels[i].properties.push(property),
            PropOwner::CellName(i) => self.cell_names[i].properties.push(property),
            PropOwner::TextString(i) => self.text_strings[i].properties.push(property),
            PropOwner::PropName(i) => self.prop_names[i].properties.push(property),
            PropOwner::PropString(i) => self.prop_strings[i].properties.push(property),
        }
    }

    fn xgeometry(&mut self) -> MaskResult<()> {
        let info = self.stream.read_byte()?;
        self.stream.read_unsigned_integer()?;
        if info & 0x01 != 0 {
            self.modal.layer = self.stream.read_unsigned_integer()?;
        }
        if info & 0x02 != 0 {
            self.modal.datatype = self.stream.read_unsigned_integer()?;
        }
        self.stream.read_string()?;
        if info & 0x10 != 0 {
            let x = self.read_coord()?;
            update(&mut self.modal.geom_pos.x, self.modal.absolute_pos, x);
        }
        if info & 0x08 != 0 {
            let y = self.read_coord()?;
            update(&mut self.modal.geom_pos.y, self.modal.absolute_pos, y);
        }
        if info & 0x04 != 0 {
            self.stream
                .read_repetition(self.factor, &mut self.modal.repetition)?;
        }
        warn!("record type XGEOMETRY ignored");
        Ok(())
    }

    /// CBLOCK: inflate the compressed sub-stream and continue parsing
    /// records from it until it is exhausted
    fn cblock(&mut self) -> MaskResult<()> {
        let method = self.stream.read_unsigned_integer()?;
        if method != 0 {
            warn!("CBLOCK compression method {} not supported", method);
            self.stream.read_unsigned_integer()?;
            let compressed = self.stream.read_unsigned_integer()?;
            self.stream.skip(compressed)?;
            return Ok(());
        }
        let uncompressed_size = self.stream.read_unsigned_integer()?;
        let compressed_size = self.stream.read_unsigned_integer()?;
        let mut compressed = vec![0u8; compressed_size as usize];
        let mut filled = 0;
        while filled < compressed.len() {
            match self.stream.read_byte() {
                Ok(byte) => {
                    compressed[filled] = byte;
                    filled += 1;
                }
                Err(_) => {
                    warn!("unable to read full CBLOCK");
                    compressed.truncate(filled);
                    break;
                }
            }
        }
        let mut inflated = Vec::with_capacity(uncompressed_size as usize);
        match DeflateDecoder::new(&compressed[..]).read_to_end(&mut inflated) {
            Ok(_) => (),
            Err(_) => warn!("unable to decompress CBLOCK"),
        }
        if !inflated.is_empty() {
            self.stream.push_cblock(inflated);
        }
        Ok(())
    }

    /// End-of-stream resolution: bind pending table indices and reference
    /// names, then hand the library over.
    fn finish(mut self) -> Library {
        self.lib.name = "LIB".to_string();

        // Cells named through the cell-name table; table properties
        // precede the cell's own
        for (cell_index, name_index) in std::mem::take(&mut self.pending_cell_names) {
            match self.cell_names.get_mut(name_index as usize) {
                Some(entry) => {
                    let cell = &mut self.lib.cells[cell_index];
                    cell.name = lossy(&entry.bytes);
                    if !entry.properties.is_empty() {
                        let mut properties = std::mem::take(&mut entry.properties);
                        properties.append(&mut cell.properties);
                        cell.properties = properties;
                    }
                }
                None => warn!("cell references undefined CELLNAME {}", name_index),
            }
        }

        // Label texts through the text-string table; properties are copied
        for (cell_index, label_index, text_index) in std::mem::take(&mut self.pending_label_texts)
        {
            match self.text_strings.get(text_index as usize) {
                Some(entry) => {
                    let label = &mut self.lib.cells[cell_index].labels[label_index];
                    label.text = lossy(&entry.bytes);
                    if !entry.properties.is_empty() {
                        let mut properties = entry.properties.clone();
                        properties.append(&mut label.properties);
                        label.properties = properties;
                    }
                }
                None => warn!("label references undefined TEXTSTRING {}", text_index),
            }
        }

        // References, by table index or by name
        let map: HashMap<String, usize> = self
            .lib
            .cells
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), i))
            .collect();
        for cell in self.lib.cells.iter_mut() {
            for reference in cell.references.iter_mut() {
                let name = match &reference.target {
                    RefTarget::CellRef(index) => match self.cell_names.get(*index as usize) {
                        Some(entry) => lossy(&entry.bytes),
                        None => {
                            warn!("reference to undefined CELLNAME {}", index);
                            continue;
                        }
                    },
                    RefTarget::Name(name) => name.clone(),
                    _ => continue,
                };
                match map.get(&name) {
                    Some(&index) => reference.target = RefTarget::Cell(index),
                    None => reference.target = RefTarget::Name(name),
                }
            }
        }

        // Property names and string values throughout the tree
        let prop_names = std::mem::take(&mut self.prop_names);
        let prop_strings = std::mem::take(&mut self.prop_strings);
        let resolve = |properties: &mut Vec<Property>| {
            for property in properties.iter_mut() {
                if let PropertyName::NameRef(index) = property.name {
                    match prop_names.get(index as usize) {
                        Some(entry) => property.name = PropertyName::Text(lossy(&entry.bytes)),
                        None => warn!("property references undefined PROPNAME {}", index),
                    }
                }
                for value in property.values.iter_mut() {
                    if let PropertyValue::StringRef(index) = value {
                        match prop_strings.get(*index as usize) {
                            Some(entry) => *value = PropertyValue::Bytes(entry.bytes.clone()),
                            None => warn!("property references undefined PROPSTRING {}", index),
                        }
                    }
                }
            }
        };
        resolve(&mut self.lib.properties);
        for cell in self.lib.cells.iter_mut() {
            resolve(&mut cell.properties);
            for polygon in cell.polygons.iter_mut() {
                resolve(&mut polygon.properties);
            }
            for path in cell.flexpaths.iter_mut() {
                resolve(&mut path.properties);
            }
            for path in cell.robustpaths.iter_mut() {
                resolve(&mut path.properties);
            }
            for reference in cell.references.iter_mut() {
                resolve(&mut reference.properties);
            }
            for label in cell.labels.iter_mut() {
                resolve(&mut label.properties);
            }
        }
        self.lib
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Read an OASIS [Library] from the file at `path`.
///
/// A positive `unit` rescales coordinates into that user unit; zero uses
/// the OASIS standard micron. `tolerance` drives circle discretization.
/// On failure a diagnostic is logged and the partial (possibly empty)
/// library is returned.
pub fn read_oas(path: impl AsRef<Path>, unit: f64, tolerance: f64) -> Library {
    let path = path.as_ref();
    let empty = || Library {
        name: String::new(),
        unit: 0.0,
        precision: 0.0,
        ..Default::default()
    };
    let stream = match OasisReader::open(path) {
        Ok(stream) => stream,
        Err(_) => {
            error!("unable to open OASIS file {} for input", path.display());
            return empty();
        }
    };
    let mut parser = OasParser::new(stream, tolerance);
    match parser.start(unit) {
        Ok(true) => (),
        Ok(false) => return empty(),
        Err(e) => {
            error!("invalid OASIS stream: {}", e);
            return empty();
        }
    }
    match parser.parse_records() {
        Ok(true) => (),
        Ok(false) => error!("OASIS stream ended before its END record"),
        Err(e) => error!("invalid OASIS stream: {}", e),
    }
    parser.finish()
}

/// Read only the database precision (meters per database unit) from the
/// OASIS file at `path`.
pub fn oas_precision(path: impl AsRef<Path>) -> MaskResult<f64> {
    let path = path.as_ref();
    let mut stream = OasisReader::open(path).map_err(|e| {
        error!("unable to open OASIS file {} for input", path.display());
        e
    })?;
    let mut header = [0u8; 14];
    stream.read_exact(&mut header)?;
    if header[..13] != OASIS_MAGIC[..] || header[13] != OasisRecordType::Start as u8 {
        error!("invalid OASIS header");
        return Err(crate::error::MaskError::Decode);
    }
    let version = stream.read_string()?;
    if version != b"1.0" {
        warn!("unsupported OASIS file version");
    }
    Ok(1e-6 / stream.read_real()?)
}
