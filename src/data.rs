//!
//! # Mask21 Data Model
//!
//! In-memory form of a mask-layout library: a [Library] owns an ordered set
//! of [Cell]s (plus pre-serialized [RawCell]s), and each [Cell] owns separate
//! typed sequences of [Polygon]s, [FlexPath]s, [RobustPath]s, [Reference]s,
//! and [Label]s. Readers for both wire formats ([GDSII](crate::gds) and
//! [OASIS](crate::oas)) produce this tree; writers consume it.
//!
//! All spatial data is stored as `f64` pairs in *user coordinates*. The two
//! library scale factors relate them to physical lengths and on-disk
//! integers: `unit` is the size of a user coordinate in meters, `precision`
//! the size of a database unit in meters.
//!

// Std-Lib Imports
use std::path::Path;

// Crates.io
use chrono::NaiveDateTime;
use derive_more::{Add, AddAssign, Sub, SubAssign};
use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

// Local Imports
use crate::error::MaskResult;
use crate::{gds, oas};

/// # Two-Dimensional Vector
/// Spatial point or displacement in user coordinates.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, Add, AddAssign, Sub, SubAssign,
)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}
impl Vec2 {
    /// Create a new [Vec2]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
    /// Rotate counter-clockwise by `angle` radians
    pub fn rotated(self, angle: f64) -> Self {
        let (sin, cos) = angle.sin_cos();
        Self {
            x: self.x * cos - self.y * sin,
            y: self.x * sin + self.y * cos,
        }
    }
}
impl std::ops::Mul<f64> for Vec2 {
    type Output = Vec2;
    fn mul(self, rhs: f64) -> Vec2 {
        Vec2::new(self.x * rhs, self.y * rhs)
    }
}

/// # Label Anchor
/// Nine-way text alignment, horizontal crossed with vertical.
/// Discriminants match the low nibble of the GDSII PRESENTATION record
/// (bits 0-1 horizontal, bits 2-3 vertical), hence the gaps.
#[derive(
    FromPrimitive, Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub enum Anchor {
    #[default]
    NW = 0,
    N = 1,
    NE = 2,
    W = 4,
    O = 5,
    E = 6,
    SW = 8,
    S = 9,
    SE = 10,
}

/// # Path End Type
/// How a path is capped past its first and last spine points.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndType {
    /// Ends exactly at the spine endpoints (GDSII PATHTYPE 0)
    #[default]
    Flush,
    /// Semi-circular caps (GDSII PATHTYPE 1)
    Round,
    /// Square caps extended by the half-width (GDSII PATHTYPE 2)
    HalfWidth,
    /// Square caps extended by explicit amounts (GDSII PATHTYPE 4)
    Extended,
}

/// # Element Repetition
///
/// Compact encoding of a periodic family of copies of an element.
/// `None` denotes a single placement. The one-axis-free variants
/// (`ExplicitX`/`ExplicitY`) come from OASIS' irregular-spacing
/// repetition types and store coordinates along the free axis only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum Repetition {
    #[default]
    None,
    /// Axis-aligned grid with per-axis spacing
    Rectangular {
        columns: u64,
        rows: u64,
        spacing: Vec2,
    },
    /// Sheared lattice spanned by two displacement vectors
    Regular {
        columns: u64,
        rows: u64,
        v1: Vec2,
        v2: Vec2,
    },
    /// Arbitrary displacement list, excluding the implicit zero offset
    Explicit { offsets: Vec<Vec2> },
    /// Irregular x-coordinates, y fixed; excludes the implicit zero
    ExplicitX { coords: Vec<f64> },
    /// Irregular y-coordinates, x fixed; excludes the implicit zero
    ExplicitY { coords: Vec<f64> },
}
impl Repetition {
    /// Number of placements this repetition produces. One for [Repetition::None].
    pub fn get_size(&self) -> u64 {
        match self {
            Repetition::None => 1,
            Repetition::Rectangular { columns, rows, .. }
            | Repetition::Regular { columns, rows, .. } => columns * rows,
            Repetition::Explicit { offsets } => offsets.len() as u64 + 1,
            Repetition::ExplicitX { coords } | Repetition::ExplicitY { coords } => {
                coords.len() as u64 + 1
            }
        }
    }
    /// Expand to the full displacement list, zero offset included.
    /// Used by the GDSII writer, which has no general repetition record.
    pub fn get_offsets(&self) -> Vec<Vec2> {
        match self {
            Repetition::None => vec![Vec2::default()],
            Repetition::Rectangular {
                columns,
                rows,
                spacing,
            } => {
                let mut offsets = Vec::with_capacity((columns * rows) as usize);
                for j in 0..*rows {
                    for i in 0..*columns {
                        offsets.push(Vec2::new(spacing.x * i as f64, spacing.y * j as f64));
                    }
                }
                offsets
            }
            Repetition::Regular {
                columns,
                rows,
                v1,
                v2,
            } => {
                let mut offsets = Vec::with_capacity((columns * rows) as usize);
                for j in 0..*rows {
                    for i in 0..*columns {
                        offsets.push(*v1 * i as f64 + *v2 * j as f64);
                    }
                }
                offsets
            }
            Repetition::Explicit { offsets } => {
                let mut all = Vec::with_capacity(offsets.len() + 1);
                all.push(Vec2::default());
                all.extend_from_slice(offsets);
                all
            }
            Repetition::ExplicitX { coords } => {
                let mut all = Vec::with_capacity(coords.len() + 1);
                all.push(Vec2::default());
                all.extend(coords.iter().map(|&x| Vec2::new(x, 0.0)));
                all
            }
            Repetition::ExplicitY { coords } => {
                let mut all = Vec::with_capacity(coords.len() + 1);
                all.push(Vec2::default());
                all.extend(coords.iter().map(|&y| Vec2::new(0.0, y)));
                all
            }
        }
    }
}

/// # Property Name
/// GDSII properties are keyed by a small integer attribute; OASIS properties
/// by an interned string. `NameRef` holds an OASIS property-name-table index
/// awaiting the end-of-stream resolution pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyName {
    Text(String),
    Number(u16),
    NameRef(u64),
}

/// # Property Value
/// One entry of a property's heterogeneous value list.
/// `StringRef` holds an OASIS property-string-table index awaiting
/// resolution into `Bytes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Real(f64),
    Integer(i64),
    UnsignedInteger(u64),
    Bytes(Vec<u8>),
    StringRef(u64),
}

/// # Property
/// Named annotation with an ordered value list.
/// Equal-named properties may repeat within one list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub name: PropertyName,
    pub values: Vec<PropertyValue>,
}

/// Append a GDSII-style numbered property (PROPATTR/PROPVALUE pair)
pub fn set_gds_property(properties: &mut Vec<Property>, attr: u16, value: &[u8]) {
    properties.push(Property {
        name: PropertyName::Number(attr),
        values: vec![PropertyValue::Bytes(value.to_vec())],
    });
}

/// # Polygon
/// Closed shape given by an open vertex ring: the first vertex is *not*
/// repeated at the end, regardless of the on-disk convention.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    pub layer: u32,
    pub datatype: u32,
    pub points: Vec<Vec2>,
    pub repetition: Repetition,
    pub properties: Vec<Property>,
}

/// # Path Element
/// One of the parallel strands of a [FlexPath]: its layer pair, a
/// half-width-and-offset value per spine point, and its end style.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathElement {
    pub layer: u32,
    pub datatype: u32,
    /// Per-spine-point (half-width, centerline offset) pairs
    pub half_width_and_offset: Vec<Vec2>,
    pub end_type: EndType,
    /// Cap extensions (begin, end); used only for [EndType::Extended]
    pub end_extensions: Vec2,
}

/// # Flexible Path
///
/// A polyline spine carrying one or more parallel [PathElement]s.
/// `gdsii_path` marks paths eligible for serialization as native path
/// records; others are flattened to polygons on output. `scale_width`
/// cleared means the width is immune to reference magnification
/// (GDSII's negative-WIDTH convention).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlexPath {
    pub tolerance: f64,
    pub spine: Vec<Vec2>,
    pub elements: Vec<PathElement>,
    pub gdsii_path: bool,
    pub scale_width: bool,
    pub repetition: Repetition,
    pub properties: Vec<Property>,
}
impl FlexPath {
    /// Extend the spine by `points`, replicating each element's last
    /// half-width/offset pair. With `relative` set, each point is a
    /// displacement from the spine point present when the call began.
    pub fn segment(&mut self, points: &[Vec2], relative: bool) {
        let start = self.spine.last().copied().unwrap_or_default();
        for &p in points {
            self.spine.push(if relative { start + p } else { p });
            for element in self.elements.iter_mut() {
                let last = element
                    .half_width_and_offset
                    .last()
                    .copied()
                    .unwrap_or_default();
                element.half_width_and_offset.push(last);
            }
        }
    }
}

/// # Robust Path Element
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RobustPathElement {
    pub layer: u32,
    pub datatype: u32,
    pub half_width: f64,
    pub offset: f64,
    pub end_type: EndType,
    pub end_extensions: Vec2,
}

/// # Robust Path
/// Constant-width sibling of [FlexPath], kept as a separate sequence in
/// each [Cell]. Curved spine evaluation belongs to the external geometry
/// services; this I/O core handles straight spines.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RobustPath {
    pub tolerance: f64,
    pub spine: Vec<Vec2>,
    pub elements: Vec<RobustPathElement>,
    pub gdsii_path: bool,
    pub scale_width: bool,
    pub repetition: Repetition,
    pub properties: Vec<Property>,
}

/// # Reference Target
///
/// Discriminated placement target. `Cell` and `RawCell` are resolved
/// indices into the owning [Library]'s sequences. `Name` and `CellRef`
/// (an OASIS cell-name-table index) are pending states rewritten by the
/// end-of-stream resolution pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RefTarget {
    Cell(usize),
    RawCell(usize),
    Name(String),
    CellRef(u64),
}
impl Default for RefTarget {
    fn default() -> Self {
        RefTarget::Name(String::new())
    }
}

/// # Cell Reference
/// Placement of one cell inside another: affine transform (reflection
/// about the x-axis applied before the counter-clockwise rotation) plus
/// an optional periodic [Repetition].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub target: RefTarget,
    pub origin: Vec2,
    /// Rotation in radians, counter-clockwise
    pub rotation: f64,
    pub magnification: f64,
    /// Reflection about the x-axis, applied before rotation
    pub x_reflection: bool,
    pub repetition: Repetition,
    pub properties: Vec<Property>,
}
impl Default for Reference {
    fn default() -> Self {
        Self {
            target: RefTarget::default(),
            origin: Vec2::default(),
            rotation: 0.0,
            magnification: 1.0,
            x_reflection: false,
            repetition: Repetition::None,
            properties: Vec::new(),
        }
    }
}

/// # Text Label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub text: String,
    pub layer: u32,
    pub texttype: u32,
    pub anchor: Anchor,
    pub origin: Vec2,
    pub rotation: f64,
    pub magnification: f64,
    pub x_reflection: bool,
    pub repetition: Repetition,
    pub properties: Vec<Property>,
}
impl Default for Label {
    fn default() -> Self {
        Self {
            text: String::new(),
            layer: 0,
            texttype: 0,
            anchor: Anchor::default(),
            origin: Vec2::default(),
            rotation: 0.0,
            magnification: 1.0,
            x_reflection: false,
            repetition: Repetition::None,
            properties: Vec::new(),
        }
    }
}

/// # Raw Cell
/// A pre-serialized GDSII cell, re-emitted verbatim by the GDSII writer.
/// The OASIS writer cannot represent references to raw cells and skips
/// them with a diagnostic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawCell {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// # Cell
///
/// Named collection of geometric primitives and sub-cell placements.
/// Elements live in separate typed sequences rather than one heterogeneous
/// list; iteration over a single element kind is the common access
/// pattern. Cell names must be unique within their library: writers
/// assume it, and readers resolve references by name equality.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub name: String,
    pub polygons: Vec<Polygon>,
    pub flexpaths: Vec<FlexPath>,
    pub robustpaths: Vec<RobustPath>,
    pub references: Vec<Reference>,
    pub labels: Vec<Label>,
    pub properties: Vec<Property>,
}
impl Cell {
    /// Create a new and empty [Cell]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// # Library
///
/// The root container: a universe of [Cell]s and [RawCell]s plus the two
/// scale factors. Invariant: `precision <= unit`, both strictly positive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Library {
    pub name: String,
    /// Meters per user coordinate
    pub unit: f64,
    /// Meters per database unit
    pub precision: f64,
    pub cells: Vec<Cell>,
    pub rawcells: Vec<RawCell>,
    pub properties: Vec<Property>,
}
impl Default for Library {
    fn default() -> Self {
        Self {
            name: String::new(),
            unit: 1e-6,
            precision: 1e-9,
            cells: Vec::new(),
            rawcells: Vec::new(),
            properties: Vec::new(),
        }
    }
}
impl Library {
    /// Create a new and empty [Library] with the default micron/nanometer units
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
    /// Indices of the cells and raw cells not placed by any [Reference].
    pub fn top_level(&self) -> (Vec<usize>, Vec<usize>) {
        let mut cell_used = vec![false; self.cells.len()];
        let mut rawcell_used = vec![false; self.rawcells.len()];
        for cell in self.cells.iter() {
            for reference in cell.references.iter() {
                match reference.target {
                    RefTarget::Cell(idx) => {
                        if idx < cell_used.len() {
                            cell_used[idx] = true;
                        }
                    }
                    RefTarget::RawCell(idx) => {
                        if idx < rawcell_used.len() {
                            rawcell_used[idx] = true;
                        }
                    }
                    _ => (),
                }
            }
        }
        let top_cells = (0..self.cells.len()).filter(|&i| !cell_used[i]).collect();
        let top_rawcells = (0..self.rawcells.len())
            .filter(|&i| !rawcell_used[i])
            .collect();
        (top_cells, top_rawcells)
    }
    /// Look up the display name of a reference target
    pub(crate) fn target_name<'a>(&'a self, target: &'a RefTarget) -> Option<&'a str> {
        match target {
            RefTarget::Cell(idx) => self.cells.get(*idx).map(|c| c.name.as_str()),
            RefTarget::RawCell(idx) => self.rawcells.get(*idx).map(|r| r.name.as_str()),
            RefTarget::Name(name) => Some(name.as_str()),
            RefTarget::CellRef(_) => None,
        }
    }
    /// Write this library as a GDSII stream to the file at `path`.
    ///
    /// Polygons with more than `max_points` vertices are fractured before
    /// emission (no fracturing when `max_points` is below five). A `None`
    /// timestamp stamps the stream with the current time.
    pub fn write_gds(
        &self,
        path: impl AsRef<Path>,
        max_points: u64,
        timestamp: Option<NaiveDateTime>,
    ) -> MaskResult<()> {
        gds::write::write_gds(self, path.as_ref(), max_points, timestamp)
    }
    /// Write this library as an OASIS stream to the file at `path`.
    ///
    /// `tolerance` bounds the error of curve discretization, `deflate_level`
    /// (0-9) selects the zlib effort, and `config_flags` holds the
    /// [OASIS_CONFIG_USE_CBLOCK](crate::oas::OASIS_CONFIG_USE_CBLOCK) bit
    /// to compress each cell as a CBLOCK.
    pub fn write_oas(
        &self,
        path: impl AsRef<Path>,
        tolerance: f64,
        deflate_level: u8,
        config_flags: u16,
    ) -> MaskResult<()> {
        oas::write::write_oas(self, path.as_ref(), tolerance, deflate_level, config_flags)
    }
}
