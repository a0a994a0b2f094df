//!
//! # OASIS Codec
//!
//! Byte streams and wire primitives shared by the OASIS [read] and [write]
//! halves: the base-128 variable-length integers, the eight real
//! sub-encodings, the delta family (1-, 2-, 3- and g-deltas), point lists,
//! repetitions, and length-prefixed strings.
//!
//! Both stream types carry an optional in-memory buffer alongside the file
//! handle. The reader parks inflated CBLOCK bytes there and drains them
//! before returning to the file; the writer accumulates a cell's records
//! there so they can be deflated into a CBLOCK record.
//!

pub mod read;
pub mod write;

// Std-Lib Imports
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Seek, Write};
use std::path::Path;

// Crates.io
use log::warn;
use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

// Local Imports
use crate::data::{Repetition, Vec2};
use crate::error::{MaskError, MaskResult};

/// The 13 magic bytes opening every OASIS file; the 14th byte on disk is
/// the START record type.
pub const OASIS_MAGIC: &[u8; 13] = b"%SEMI-OASIS\r\n";

/// Configuration flag for [Library::write_oas](crate::data::Library::write_oas):
/// compress each cell's records into a CBLOCK.
pub const OASIS_CONFIG_USE_CBLOCK: u16 = 0x0001;

///
/// # Oasis Record Types
///
/// In the numeric order specified by OASIS, for automatic [FromPrimitive]
/// conversions.
///
#[derive(FromPrimitive, Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub enum OasisRecordType {
    Pad = 0,
    Start,
    End,
    CellnameImplicit,
    Cellname,
    TextstringImplicit,
    Textstring,
    PropnameImplicit,
    Propname,
    PropstringImplicit,
    Propstring,
    LayernameData,
    LayernameText,
    CellRefNum,
    Cell,
    XyAbsolute,
    XyRelative,
    Placement,
    PlacementTransform,
    Text,
    Rectangle,
    Polygon,
    Path,
    TrapezoidAb,
    TrapezoidA,
    TrapezoidB,
    Ctrapezoid,
    Circle,
    Property,
    LastProperty,
    XnameImplicit,
    Xname,
    Xelement,
    Xgeometry,
    Cblock,
}

/// # Oasis Property-Value Data Types
#[derive(FromPrimitive, Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub enum OasisDataType {
    RealPositiveInteger = 0,
    RealNegativeInteger,
    RealPositiveReciprocal,
    RealNegativeReciprocal,
    RealPositiveRatio,
    RealNegativeRatio,
    RealFloat,
    RealDouble,
    UnsignedInteger,
    SignedInteger,
    AString,
    BString,
    NString,
    ReferenceA,
    ReferenceB,
    ReferenceN,
}

/// # Oasis Byte-Stream Reader
///
/// File-mode reads come from the underlying source; after a CBLOCK is
/// inflated its bytes are staged in `buf` and drained first.
pub struct OasisReader<'rd> {
    src: Box<dyn Read + 'rd>,
    buf: Option<Cursor<Vec<u8>>>,
}
impl<'rd> OasisReader<'rd> {
    /// Open the file at `path` for reading
    pub fn open(path: &Path) -> MaskResult<OasisReader<'static>> {
        let file = BufReader::new(File::open(path)?);
        Ok(OasisReader::new(file))
    }
    /// Create a reader over any byte source
    pub fn new(src: impl Read + 'rd) -> Self {
        Self {
            src: Box::new(src),
            buf: None,
        }
    }
    /// Switch to buffered mode over inflated CBLOCK bytes.
    /// Reads drain the buffer before returning to the file.
    pub fn push_cblock(&mut self, data: Vec<u8>) {
        self.buf = Some(Cursor::new(data));
    }
    /// Read a single byte
    pub fn read_byte(&mut self) -> MaskResult<u8> {
        if let Some(cursor) = self.buf.as_mut() {
            let pos = cursor.position() as usize;
            if pos < cursor.get_ref().len() {
                cursor.set_position(pos as u64 + 1);
                return Ok(cursor.get_ref()[pos]);
            }
            // Buffer exhausted; resume file-mode parsing
            self.buf = None;
        }
        let mut byte = [0u8; 1];
        self.src.read_exact(&mut byte)?;
        Ok(byte[0])
    }
    /// Read the next record-type byte, or `None` at a clean end-of-file
    pub fn next_record(&mut self) -> MaskResult<Option<u8>> {
        match self.read_byte() {
            Ok(byte) => Ok(Some(byte)),
            Err(MaskError::Boxed(e)) => {
                let eof = e
                    .downcast_ref::<std::io::Error>()
                    .map(|io| io.kind() == std::io::ErrorKind::UnexpectedEof)
                    .unwrap_or(false);
                if eof {
                    Ok(None)
                } else {
                    Err(MaskError::Boxed(e))
                }
            }
            Err(e) => Err(e),
        }
    }
    /// Fill `out` exactly
    pub fn read_exact(&mut self, out: &mut [u8]) -> MaskResult<()> {
        for slot in out.iter_mut() {
            *slot = self.read_byte()?;
        }
        Ok(())
    }
    /// Read and discard `count` bytes
    pub fn skip(&mut self, count: u64) -> MaskResult<()> {
        for _ in 0..count {
            self.read_byte()?;
        }
        Ok(())
    }
    /// Little-endian base-128 unsigned integer, low seven bits per byte
    pub fn read_unsigned_integer(&mut self) -> MaskResult<u64> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_byte()?;
            if shift < 64 {
                value |= ((byte & 0x7F) as u64) << shift;
            } else {
                warn!("unsigned integer overflows 64 bits; truncated");
            }
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }
    /// Signed integer: unsigned with the low bit repurposed as sign
    pub fn read_integer(&mut self) -> MaskResult<i64> {
        let value = self.read_unsigned_integer()?;
        let magnitude = (value >> 1) as i64;
        Ok(if value & 1 != 0 { -magnitude } else { magnitude })
    }
    /// 1-delta: a signed displacement along an axis fixed by context
    pub fn read_1delta(&mut self) -> MaskResult<i64> {
        self.read_integer()
    }
    /// 2-delta: two direction bits (E, N, W, S) plus magnitude
    pub fn read_2delta(&mut self) -> MaskResult<(i64, i64)> {
        let value = self.read_unsigned_integer()?;
        let magnitude = (value >> 2) as i64;
        Ok(match value & 0x03 {
            0 => (magnitude, 0),
            1 => (0, magnitude),
            2 => (-magnitude, 0),
            _ => (0, -magnitude),
        })
    }
    /// 3-delta: three direction bits (the octants) plus magnitude
    pub fn read_3delta(&mut self) -> MaskResult<(i64, i64)> {
        let value = self.read_unsigned_integer()?;
        Ok(octant_delta(value & 0x07, (value >> 3) as i64))
    }
    /// g-delta: a 3-delta or a signed coordinate pair, selected by the
    /// low bit of the first unsigned integer
    pub fn read_gdelta(&mut self) -> MaskResult<(i64, i64)> {
        let value = self.read_unsigned_integer()?;
        if value & 1 == 0 {
            return Ok(octant_delta((value >> 1) & 0x07, (value >> 4) as i64));
        }
        let magnitude = (value >> 2) as i64;
        let x = if value & 2 != 0 { -magnitude } else { magnitude };
        let y = self.read_integer()?;
        Ok((x, y))
    }
    /// Real number: one unsigned integer selects among the eight
    /// sub-encodings, the payload follows
    pub fn read_real(&mut self) -> MaskResult<f64> {
        let kind = self.read_unsigned_integer()?;
        self.read_real_by_type(kind)
    }
    pub fn read_real_by_type(&mut self, kind: u64) -> MaskResult<f64> {
        Ok(match kind {
            0 => self.read_unsigned_integer()? as f64,
            1 => -(self.read_unsigned_integer()? as f64),
            2 => 1.0 / self.read_unsigned_integer()? as f64,
            3 => -1.0 / self.read_unsigned_integer()? as f64,
            4 => {
                let num = self.read_unsigned_integer()? as f64;
                num / self.read_unsigned_integer()? as f64
            }
            5 => {
                let num = self.read_unsigned_integer()? as f64;
                -num / self.read_unsigned_integer()? as f64
            }
            6 => {
                let mut bytes = [0u8; 4];
                self.read_exact(&mut bytes)?;
                f32::from_le_bytes(bytes) as f64
            }
            7 => {
                let mut bytes = [0u8; 8];
                self.read_exact(&mut bytes)?;
                f64::from_le_bytes(bytes)
            }
            _ => {
                warn!("invalid real encoding {}", kind);
                0.0
            }
        })
    }
    /// Length-prefixed byte string
    pub fn read_string(&mut self) -> MaskResult<Vec<u8>> {
        let len = self.read_unsigned_integer()?;
        let mut bytes = vec![0u8; len as usize];
        self.read_exact(&mut bytes)?;
        Ok(bytes)
    }
    /// Point list: type, vertex count, then per-type deltas. Points are
    /// appended in user coordinates, cumulative from the implicit origin
    /// (which is *not* appended). With `closed` set, the Manhattan
    /// alternating types 0/1 append their implicit closing vertex.
    pub fn read_point_list(
        &mut self,
        factor: f64,
        closed: bool,
        points: &mut Vec<Vec2>,
    ) -> MaskResult<()> {
        let kind = self.read_unsigned_integer()?;
        let count = self.read_unsigned_integer()?;
        match kind {
            0 | 1 => {
                let mut horizontal = kind == 0;
                let (mut x, mut y) = (0i64, 0i64);
                for _ in 0..count {
                    let delta = self.read_1delta()?;
                    if horizontal {
                        x += delta;
                    } else {
                        y += delta;
                    }
                    points.push(Vec2::new(factor * x as f64, factor * y as f64));
                    horizontal = !horizontal;
                }
                if closed {
                    // Square the ring up with the implicit vertex
                    if horizontal {
                        points.push(Vec2::new(0.0, factor * y as f64));
                    } else {
                        points.push(Vec2::new(factor * x as f64, 0.0));
                    }
                }
            }
            2 | 3 | 4 => {
                let (mut x, mut y) = (0i64, 0i64);
                for _ in 0..count {
                    let (dx, dy) = match kind {
                        2 => self.read_2delta()?,
                        3 => self.read_3delta()?,
                        _ => self.read_gdelta()?,
                    };
                    x += dx;
                    y += dy;
                    points.push(Vec2::new(factor * x as f64, factor * y as f64));
                }
            }
            5 => {
                // Double-deltas: each g-delta accumulates onto the previous delta
                let (mut x, mut y) = (0i64, 0i64);
                let (mut dx, mut dy) = (0i64, 0i64);
                for _ in 0..count {
                    let (gx, gy) = self.read_gdelta()?;
                    dx += gx;
                    dy += gy;
                    x += dx;
                    y += dy;
                    points.push(Vec2::new(factor * x as f64, factor * y as f64));
                }
            }
            _ => warn!("invalid point list type {}", kind),
        }
        Ok(())
    }
    /// Repetition: type 0 reuses the previous repetition, all others
    /// replace `repetition`.
    pub fn read_repetition(
        &mut self,
        factor: f64,
        repetition: &mut Repetition,
    ) -> MaskResult<()> {
        let kind = self.read_unsigned_integer()?;
        match kind {
            0 => (), // Reuse the modal repetition
            1 => {
                let columns = self.read_unsigned_integer()? + 2;
                let rows = self.read_unsigned_integer()? + 2;
                let x = factor * self.read_unsigned_integer()? as f64;
                let y = factor * self.read_unsigned_integer()? as f64;
                *repetition = Repetition::Rectangular {
                    columns,
                    rows,
                    spacing: Vec2::new(x, y),
                };
            }
            2 => {
                let columns = self.read_unsigned_integer()? + 2;
                let x = factor * self.read_unsigned_integer()? as f64;
                *repetition = Repetition::Rectangular {
                    columns,
                    rows: 1,
                    spacing: Vec2::new(x, 0.0),
                };
            }
            3 => {
                let rows = self.read_unsigned_integer()? + 2;
                let y = factor * self.read_unsigned_integer()? as f64;
                *repetition = Repetition::Rectangular {
                    columns: 1,
                    rows,
                    spacing: Vec2::new(0.0, y),
                };
            }
            4 | 5 => {
                let count = self.read_unsigned_integer()? + 1;
                let grid = if kind == 5 {
                    self.read_unsigned_integer()? as f64
                } else {
                    1.0
                };
                let mut coords = Vec::with_capacity(count as usize);
                let mut x = 0.0;
                for _ in 0..count {
                    x += factor * grid * self.read_unsigned_integer()? as f64;
                    coords.push(x);
                }
                *repetition = Repetition::ExplicitX { coords };
            }
            6 | 7 => {
                let count = self.read_unsigned_integer()? + 1;
                let grid = if kind == 7 {
                    self.read_unsigned_integer()? as f64
                } else {
                    1.0
                };
                let mut coords = Vec::with_capacity(count as usize);
                let mut y = 0.0;
                for _ in 0..count {
                    y += factor * grid * self.read_unsigned_integer()? as f64;
                    coords.push(y);
                }
                *repetition = Repetition::ExplicitY { coords };
            }
            8 => {
                let columns = self.read_unsigned_integer()? + 2;
                let rows = self.read_unsigned_integer()? + 2;
                let (x1, y1) = self.read_gdelta()?;
                let (x2, y2) = self.read_gdelta()?;
                *repetition = Repetition::Regular {
                    columns,
                    rows,
                    v1: Vec2::new(factor * x1 as f64, factor * y1 as f64),
                    v2: Vec2::new(factor * x2 as f64, factor * y2 as f64),
                };
            }
            9 => {
                let columns = self.read_unsigned_integer()? + 2;
                let (x, y) = self.read_gdelta()?;
                *repetition = Repetition::Regular {
                    columns,
                    rows: 1,
                    v1: Vec2::new(factor * x as f64, factor * y as f64),
                    v2: Vec2::default(),
                };
            }
            10 | 11 => {
                let count = self.read_unsigned_integer()? + 1;
                let grid = if kind == 11 {
                    self.read_unsigned_integer()? as f64
                } else {
                    1.0
                };
                let mut offsets = Vec::with_capacity(count as usize);
                let mut offset = Vec2::default();
                for _ in 0..count {
                    let (dx, dy) = self.read_gdelta()?;
                    offset += Vec2::new(factor * grid * dx as f64, factor * grid * dy as f64);
                    offsets.push(offset);
                }
                *repetition = Repetition::Explicit { offsets };
            }
            _ => warn!("invalid repetition type {}", kind),
        }
        Ok(())
    }
}

/// Expand an octant direction code and magnitude into a displacement
fn octant_delta(direction: u64, magnitude: i64) -> (i64, i64) {
    match direction {
        0 => (magnitude, 0),
        1 => (0, magnitude),
        2 => (-magnitude, 0),
        3 => (0, -magnitude),
        4 => (magnitude, magnitude),
        5 => (-magnitude, magnitude),
        6 => (-magnitude, -magnitude),
        _ => (magnitude, -magnitude),
    }
}

/// # Oasis Byte-Stream Writer
///
/// In buffered mode bytes accumulate in `buf` awaiting CBLOCK compression;
/// otherwise they go straight to the file.
pub struct OasisWriter {
    file: BufWriter<File>,
    buf: Option<Vec<u8>>,
}
impl OasisWriter {
    /// Create a writer over the file at `path`
    pub fn open(path: &Path) -> MaskResult<Self> {
        Ok(Self {
            file: BufWriter::new(File::create(path)?),
            buf: None,
        })
    }
    /// Begin accumulating bytes for a CBLOCK
    pub fn begin_cblock(&mut self) {
        self.buf = Some(Vec::with_capacity(1024 * 1024));
    }
    /// Leave buffered mode, yielding the accumulated bytes
    pub fn take_cblock(&mut self) -> Vec<u8> {
        self.buf.take().unwrap_or_default()
    }
    /// Current file offset (only meaningful outside buffered mode)
    pub fn pos(&mut self) -> MaskResult<u64> {
        Ok(self.file.stream_position()?)
    }
    pub fn put(&mut self, byte: u8) -> MaskResult<()> {
        match self.buf.as_mut() {
            Some(buf) => buf.push(byte),
            None => self.file.write_all(&[byte])?,
        }
        Ok(())
    }
    pub fn put_bytes(&mut self, bytes: &[u8]) -> MaskResult<()> {
        match self.buf.as_mut() {
            Some(buf) => buf.extend_from_slice(bytes),
            None => self.file.write_all(bytes)?,
        }
        Ok(())
    }
    pub fn finish(&mut self) -> MaskResult<()> {
        self.file.flush()?;
        Ok(())
    }
    pub fn write_unsigned_integer(&mut self, mut value: u64) -> MaskResult<()> {
        loop {
            let mut byte = (value & 0x7F) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            self.put(byte)?;
            if value == 0 {
                return Ok(());
            }
        }
    }
    pub fn write_integer(&mut self, value: i64) -> MaskResult<()> {
        let sign = if value < 0 { 1 } else { 0 };
        self.write_unsigned_integer(value.unsigned_abs() << 1 | sign)
    }
    /// Real number: whole values use the integer sub-encodings, all
    /// others IEEE 754 double
    pub fn write_real(&mut self, value: f64) -> MaskResult<()> {
        if value == value.trunc() && value.abs() < 9.0e15 {
            if value >= 0.0 {
                self.write_unsigned_integer(0)?;
                self.write_unsigned_integer(value as u64)?;
            } else {
                self.write_unsigned_integer(1)?;
                self.write_unsigned_integer(-value as u64)?;
            }
            return Ok(());
        }
        self.write_unsigned_integer(7)?;
        self.put_bytes(&value.to_le_bytes())
    }
    /// g-delta in the coordinate-pair form
    pub fn write_gdelta(&mut self, dx: i64, dy: i64) -> MaskResult<()> {
        let sign = if dx < 0 { 2 } else { 0 };
        self.write_unsigned_integer(dx.unsigned_abs() << 2 | sign | 1)?;
        self.write_integer(dy)
    }
    /// Length-prefixed byte string
    pub fn write_string(&mut self, bytes: &[u8]) -> MaskResult<()> {
        self.write_unsigned_integer(bytes.len() as u64)?;
        self.put_bytes(bytes)
    }
    /// Point list over integer deltas, choosing the tightest of the
    /// Manhattan (2), octangular (3), and general (4) encodings.
    pub fn write_point_list(&mut self, deltas: &[(i64, i64)]) -> MaskResult<()> {
        let manhattan = deltas.iter().all(|&(dx, dy)| dx == 0 || dy == 0);
        let octangular = deltas
            .iter()
            .all(|&(dx, dy)| dx == 0 || dy == 0 || dx.abs() == dy.abs());
        let kind: u64 = if manhattan {
            2
        } else if octangular {
            3
        } else {
            4
        };
        self.write_unsigned_integer(kind)?;
        self.write_unsigned_integer(deltas.len() as u64)?;
        for &(dx, dy) in deltas {
            match kind {
                2 => {
                    let (direction, magnitude) = if dy == 0 {
                        (if dx >= 0 { 0 } else { 2 }, dx.unsigned_abs())
                    } else {
                        (if dy >= 0 { 1 } else { 3 }, dy.unsigned_abs())
                    };
                    self.write_unsigned_integer(magnitude << 2 | direction)?;
                }
                3 => {
                    let (direction, magnitude) = octant_code(dx, dy);
                    self.write_unsigned_integer(magnitude << 3 | direction)?;
                }
                _ => self.write_gdelta(dx, dy)?,
            }
        }
        Ok(())
    }
    /// Repetition record body for any [Repetition] with more than one placement
    pub fn write_repetition(
        &mut self,
        repetition: &Repetition,
        scaling: f64,
    ) -> MaskResult<()> {
        let round = |v: f64| (v * scaling).round_ties_even();
        match repetition {
            Repetition::None => Ok(()),
            Repetition::Rectangular {
                columns,
                rows,
                spacing,
            } => {
                if *columns > 1 && *rows > 1 {
                    self.write_unsigned_integer(1)?;
                    self.write_unsigned_integer(columns - 2)?;
                    self.write_unsigned_integer(rows - 2)?;
                    self.write_unsigned_integer(round(spacing.x) as u64)?;
                    self.write_unsigned_integer(round(spacing.y) as u64)
                } else if *rows == 1 {
                    self.write_unsigned_integer(2)?;
                    self.write_unsigned_integer(columns - 2)?;
                    self.write_unsigned_integer(round(spacing.x) as u64)
                } else {
                    self.write_unsigned_integer(3)?;
                    self.write_unsigned_integer(rows - 2)?;
                    self.write_unsigned_integer(round(spacing.y) as u64)
                }
            }
            Repetition::Regular {
                columns,
                rows,
                v1,
                v2,
            } => {
                if *columns > 1 && *rows > 1 {
                    self.write_unsigned_integer(8)?;
                    self.write_unsigned_integer(columns - 2)?;
                    self.write_unsigned_integer(rows - 2)?;
                    self.write_gdelta(round(v1.x) as i64, round(v1.y) as i64)?;
                    self.write_gdelta(round(v2.x) as i64, round(v2.y) as i64)
                } else if *rows == 1 {
                    self.write_unsigned_integer(9)?;
                    self.write_unsigned_integer(columns - 2)?;
                    self.write_gdelta(round(v1.x) as i64, round(v1.y) as i64)
                } else {
                    self.write_unsigned_integer(9)?;
                    self.write_unsigned_integer(rows - 2)?;
                    self.write_gdelta(round(v2.x) as i64, round(v2.y) as i64)
                }
            }
            Repetition::Explicit { offsets } => {
                self.write_unsigned_integer(10)?;
                self.write_unsigned_integer(offsets.len() as u64 - 1)?;
                let mut previous = Vec2::default();
                for offset in offsets {
                    self.write_gdelta(
                        round(offset.x - previous.x) as i64,
                        round(offset.y - previous.y) as i64,
                    )?;
                    previous = *offset;
                }
                Ok(())
            }
            Repetition::ExplicitX { coords } => {
                self.write_unsigned_integer(4)?;
                self.write_unsigned_integer(coords.len() as u64 - 1)?;
                let mut previous = 0.0;
                for &coord in coords {
                    self.write_unsigned_integer(round(coord - previous) as u64)?;
                    previous = coord;
                }
                Ok(())
            }
            Repetition::ExplicitY { coords } => {
                self.write_unsigned_integer(6)?;
                self.write_unsigned_integer(coords.len() as u64 - 1)?;
                let mut previous = 0.0;
                for &coord in coords {
                    self.write_unsigned_integer(round(coord - previous) as u64)?;
                    previous = coord;
                }
                Ok(())
            }
        }
    }
}

/// Octant direction code and magnitude for an octangular displacement
fn octant_code(dx: i64, dy: i64) -> (u64, u64) {
    if dy == 0 {
        (if dx >= 0 { 0 } else { 2 }, dx.unsigned_abs())
    } else if dx == 0 {
        (if dy >= 0 { 1 } else { 3 }, dy.unsigned_abs())
    } else if dx > 0 {
        (if dy > 0 { 4 } else { 7 }, dx.unsigned_abs())
    } else {
        (if dy > 0 { 5 } else { 6 }, dx.unsigned_abs())
    }
}
