use super::*;

use std::f64::consts::{FRAC_PI_2, PI};
use std::io::Write;

use crate::gds::{GdsFloat64, GdsRecordType};
use crate::oas::{OasisReader, OasisRecordType, OasisWriter, OASIS_MAGIC};

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * (1.0 + a.abs() + b.abs())
}
fn assert_close(a: f64, b: f64) {
    assert!(close(a, b), "{} != {}", a, b);
}
fn assert_points_close(a: &[Vec2], b: &[(f64, f64)]) {
    assert_eq!(a.len(), b.len(), "{:?} vs {:?}", a, b);
    for (p, q) in a.iter().zip(b.iter()) {
        assert!(close(p.x, q.0) && close(p.y, q.1), "{:?} vs {:?}", a, b);
    }
}

/// A library exercising the shared element kinds, on the µm/nm grid
fn sample_library() -> Library {
    let mut lib = Library::new("LIB");
    let mut a = Cell::new("A");
    a.polygons.push(Polygon {
        layer: 1,
        datatype: 2,
        points: vec![
            Vec2::new(0.0, 0.0),
            Vec2::new(1.0, 0.0),
            Vec2::new(1.5, 2.0),
            Vec2::new(0.0, 1.0),
        ],
        repetition: Repetition::Rectangular {
            columns: 3,
            rows: 2,
            spacing: Vec2::new(5.0, 6.0),
        },
        properties: vec![Property {
            name: PropertyName::Text("COMMENT".into()),
            values: vec![
                PropertyValue::Real(2.5),
                PropertyValue::Integer(-7),
                PropertyValue::UnsignedInteger(9),
                PropertyValue::Bytes(b"hello".to_vec()),
            ],
        }],
    });
    a.flexpaths.push(FlexPath {
        tolerance: 1e-2,
        spine: vec![Vec2::new(0.0, 0.0), Vec2::new(10.0, 0.0), Vec2::new(10.0, 10.0)],
        elements: vec![PathElement {
            layer: 2,
            datatype: 0,
            half_width_and_offset: vec![Vec2::new(0.5, 0.0); 3],
            end_type: EndType::Extended,
            end_extensions: Vec2::new(0.25, 0.125),
        }],
        gdsii_path: true,
        scale_width: true,
        repetition: Repetition::None,
        properties: Vec::new(),
    });
    a.labels.push(Label {
        text: "PIN".into(),
        layer: 3,
        texttype: 4,
        anchor: Anchor::SW,
        origin: Vec2::new(2.0, 3.0),
        ..Default::default()
    });
    lib.cells.push(a);
    let mut b = Cell::new("B");
    b.references.push(Reference {
        target: RefTarget::Name("A".into()),
        origin: Vec2::new(1.0, 2.0),
        rotation: FRAC_PI_2,
        ..Default::default()
    });
    b.references.push(Reference {
        target: RefTarget::Name("A".into()),
        origin: Vec2::new(-3.0, 4.0),
        rotation: 0.3,
        magnification: 2.0,
        ..Default::default()
    });
    lib.cells.push(b);
    lib.properties.push(Property {
        name: PropertyName::Text("OWNER".into()),
        values: vec![PropertyValue::Bytes(b"mask21".to_vec())],
    });
    lib
}

fn tempdir() -> tempfile::TempDir {
    tempfile::tempdir().unwrap()
}

#[test]
fn gdsii_real_round_trips() {
    for x in [0.0, 1.0, -1.0, 1e-3, -1e-3, 1e6, -1e6, PI, 2f64.powi(-50)] {
        let decoded = GdsFloat64::decode(GdsFloat64::encode(x));
        assert!(
            (decoded - x).abs() <= 1e-15 * x.abs(),
            "{} decoded as {}",
            x,
            decoded
        );
    }
}

#[test]
fn it_round_trips_gds() -> MaskResult<()> {
    let dir = tempdir();
    let path = dir.path().join("roundtrip.gds");
    let lib = sample_library();
    lib.write_gds(&path, 199, None)?;

    let read = read_gds(&path, 0.0, 1e-2);
    assert_eq!(read.name, "LIB");
    assert_close(read.unit, 1e-6);
    assert_close(read.precision, 1e-9);
    assert_eq!(read.cells.len(), 2);

    let a = &read.cells[0];
    assert_eq!(a.name, "A");
    // The rectangular repetition was expanded into 3x2 boundaries
    assert_eq!(a.polygons.len(), 6);
    let polygon = &a.polygons[0];
    assert_eq!((polygon.layer, polygon.datatype), (1, 2));
    assert_points_close(
        &polygon.points,
        &[(0.0, 0.0), (1.0, 0.0), (1.5, 2.0), (0.0, 1.0)],
    );
    assert_points_close(&a.polygons[5].points[..1], &[(10.0, 6.0)]);
    // String-named properties have no GDSII representation
    assert!(polygon.properties.is_empty());

    let path_elem = &a.flexpaths[0];
    assert_eq!(path_elem.elements[0].end_type, EndType::Extended);
    assert_close(path_elem.elements[0].end_extensions.x, 0.25);
    assert_close(path_elem.elements[0].end_extensions.y, 0.125);
    assert_close(path_elem.elements[0].half_width_and_offset[0].x, 0.5);
    assert!(path_elem.scale_width);

    let label = &a.labels[0];
    assert_eq!(label.text, "PIN");
    assert_eq!((label.layer, label.texttype), (3, 4));
    assert_eq!(label.anchor, Anchor::SW);

    let b = &read.cells[1];
    assert_eq!(b.references.len(), 2);
    assert_eq!(b.references[0].target, RefTarget::Cell(0));
    assert_close(b.references[0].rotation, FRAC_PI_2);
    assert_close(b.references[1].magnification, 2.0);
    assert_close(b.references[1].rotation, 0.3);

    let (unit, precision) = gds_units(&path)?;
    assert_close(unit, 1e-6);
    assert_close(precision, 1e-9);
    Ok(())
}

/// Only the first byte-string value of number-named properties fits GDSII
#[test]
fn it_round_trips_gds_properties() -> MaskResult<()> {
    let dir = tempdir();
    let path = dir.path().join("props.gds");
    let mut lib = Library::new("plib");
    let mut cell = Cell::new("P");
    let mut polygon = Polygon {
        layer: 7,
        datatype: 0,
        points: vec![Vec2::new(0.0, 0.0), Vec2::new(1.0, 0.0), Vec2::new(0.0, 1.0)],
        ..Default::default()
    };
    set_gds_property(&mut polygon.properties, 12, b"net0");
    cell.polygons.push(polygon);
    lib.cells.push(cell);
    lib.write_gds(&path, 199, None)?;

    let read = read_gds(&path, 0.0, 1e-2);
    assert_eq!(
        read.cells[0].polygons[0].properties,
        vec![Property {
            name: PropertyName::Number(12),
            values: vec![PropertyValue::Bytes(b"net0".to_vec())],
        }]
    );
    Ok(())
}

#[test]
fn it_round_trips_gds_arrays() -> MaskResult<()> {
    let dir = tempdir();
    let path = dir.path().join("aref.gds");
    let mut lib = Library::new("alib");
    lib.cells.push(Cell::new("unit"));
    let mut top = Cell::new("top");
    top.references.push(Reference {
        target: RefTarget::Cell(0),
        origin: Vec2::new(1.0, 1.0),
        repetition: Repetition::Rectangular {
            columns: 3,
            rows: 2,
            spacing: Vec2::new(2.0, 3.0),
        },
        ..Default::default()
    });
    lib.cells.push(top);
    lib.write_gds(&path, 199, None)?;

    let read = read_gds(&path, 0.0, 1e-2);
    let reference = &read.cells[1].references[0];
    assert_eq!(reference.target, RefTarget::Cell(0));
    match &reference.repetition {
        Repetition::Rectangular {
            columns,
            rows,
            spacing,
        } => {
            assert_eq!((*columns, *rows), (3, 2));
            assert_close(spacing.x, 2.0);
            assert_close(spacing.y, 3.0);
        }
        other => panic!("expected a rectangular repetition, got {:?}", other),
    }
    Ok(())
}

/// Scan the raw record stream of a GDSII file
fn scan_gds(bytes: &[u8]) -> Vec<(u8, Vec<u8>)> {
    let mut records = Vec::new();
    let mut at = 0;
    while at + 4 <= bytes.len() {
        let len = u16::from_be_bytes([bytes[at], bytes[at + 1]]) as usize;
        records.push((bytes[at + 2], bytes[at + 4..at + len].to_vec()));
        at += len;
    }
    records
}

#[test]
fn it_encodes_units_and_vertices_exactly() -> MaskResult<()> {
    let dir = tempdir();
    let path = dir.path().join("exact.gds");
    let mut lib = Library::new("lib");
    let mut top = Cell::new("TOP");
    top.polygons.push(Polygon {
        layer: 1,
        datatype: 0,
        points: vec![
            Vec2::new(0.0, 0.0),
            Vec2::new(1.0, 0.0),
            Vec2::new(1.0, 1.0),
            Vec2::new(0.0, 1.0),
        ],
        ..Default::default()
    });
    lib.cells.push(top);
    lib.write_gds(&path, 199, None)?;

    let bytes = std::fs::read(&path).unwrap();
    let records = scan_gds(&bytes);
    let units = records
        .iter()
        .find(|(rtype, _)| *rtype == GdsRecordType::Units as u8)
        .expect("missing UNITS");
    let mut expected = GdsFloat64::encode(1e-9 / 1e-6).to_be_bytes().to_vec();
    expected.extend_from_slice(&GdsFloat64::encode(1e-9).to_be_bytes());
    assert_eq!(units.1, expected);
    assert_close(GdsFloat64::decode(GdsFloat64::encode(1e-9 / 1e-6)), 1e-3);

    let xy = records
        .iter()
        .find(|(rtype, _)| *rtype == GdsRecordType::Xy as u8)
        .expect("missing XY");
    let expected: Vec<u8> = [0i32, 0, 1000, 0, 1000, 1000, 0, 1000, 0, 0]
        .iter()
        .flat_map(|v| v.to_be_bytes())
        .collect();
    assert_eq!(xy.1, expected);
    Ok(())
}

/// Append one record to a hand-built GDSII stream
fn gds_record(out: &mut Vec<u8>, rtype: GdsRecordType, dtype: u8, payload: &[u8]) {
    out.extend_from_slice(&((payload.len() as u16 + 4).to_be_bytes()));
    out.push(rtype as u8);
    out.push(dtype);
    out.extend_from_slice(payload);
}
fn i16be(values: &[i16]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_be_bytes()).collect()
}
fn i32be(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_be_bytes()).collect()
}

/// PATHTYPE 4 with explicit extensions and an unscaled negative width
#[test]
fn it_reads_extended_paths() {
    let dir = tempdir();
    let path = dir.path().join("pathtype4.gds");
    let mut bytes = Vec::new();
    let mut units = GdsFloat64::encode(1e-3).to_be_bytes().to_vec();
    units.extend_from_slice(&GdsFloat64::encode(1e-9).to_be_bytes());
    gds_record(&mut bytes, GdsRecordType::Units, 5, &units);
    gds_record(&mut bytes, GdsRecordType::BgnStr, 2, &i16be(&[0; 12]));
    gds_record(&mut bytes, GdsRecordType::StrName, 6, b"C\0");
    gds_record(&mut bytes, GdsRecordType::Path, 0, &[]);
    gds_record(&mut bytes, GdsRecordType::Layer, 2, &i16be(&[2]));
    gds_record(&mut bytes, GdsRecordType::DataType, 2, &i16be(&[3]));
    gds_record(&mut bytes, GdsRecordType::PathType, 2, &i16be(&[4]));
    gds_record(&mut bytes, GdsRecordType::Width, 3, &i32be(&[-40]));
    gds_record(&mut bytes, GdsRecordType::BgnExtn, 3, &i32be(&[20]));
    gds_record(&mut bytes, GdsRecordType::EndExtn, 3, &i32be(&[10]));
    gds_record(&mut bytes, GdsRecordType::Xy, 3, &i32be(&[0, 0, 100, 0]));
    gds_record(&mut bytes, GdsRecordType::EndEl, 0, &[]);
    gds_record(&mut bytes, GdsRecordType::EndStr, 0, &[]);
    gds_record(&mut bytes, GdsRecordType::EndLib, 0, &[]);
    std::fs::write(&path, &bytes).unwrap();

    let read = read_gds(&path, 0.0, 1e-2);
    let flexpath = &read.cells[0].flexpaths[0];
    let element = &flexpath.elements[0];
    assert_eq!((element.layer, element.datatype), (2, 3));
    assert_eq!(element.end_type, EndType::Extended);
    assert_close(element.end_extensions.x, 0.02);
    assert_close(element.end_extensions.y, 0.01);
    assert_close(element.half_width_and_offset[0].x, 0.02);
    assert!(!flexpath.scale_width);
    assert_points_close(&flexpath.spine, &[(0.0, 0.0), (0.1, 0.0)]);
}

/// A reference may name a cell defined later in the stream
#[test]
fn it_binds_forward_references() -> MaskResult<()> {
    let dir = tempdir();
    let path = dir.path().join("forward.gds");
    let mut lib = Library::new("flib");
    let mut a = Cell::new("A");
    a.references.push(Reference {
        target: RefTarget::Name("X".into()),
        ..Default::default()
    });
    lib.cells.push(a);
    lib.cells.push(Cell::new("X"));
    lib.write_gds(&path, 199, None)?;

    let read = read_gds(&path, 0.0, 1e-2);
    assert_eq!(read.cells[0].references[0].target, RefTarget::Cell(1));
    Ok(())
}

#[test]
fn it_finds_top_level_cells() {
    let mut lib = Library::new("toplib");
    lib.cells.push(Cell::new("leaf"));
    let mut top = Cell::new("top");
    top.references.push(Reference {
        target: RefTarget::Cell(0),
        ..Default::default()
    });
    lib.cells.push(top);
    lib.rawcells.push(RawCell {
        name: "raw".into(),
        bytes: Vec::new(),
    });
    let (top_cells, top_rawcells) = lib.top_level();
    assert_eq!(top_cells, vec![1]);
    assert_eq!(top_rawcells, vec![0]);

    // A raw-cell placement marks the raw cell as used
    lib.cells[1].references.push(Reference {
        target: RefTarget::RawCell(0),
        ..Default::default()
    });
    let (top_cells, top_rawcells) = lib.top_level();
    assert_eq!(top_cells, vec![1]);
    assert!(top_rawcells.is_empty());
}

#[test]
fn it_round_trips_oas() -> MaskResult<()> {
    let dir = tempdir();
    let path = dir.path().join("roundtrip.oas");
    let lib = sample_library();
    lib.write_oas(&path, 1e-2, 6, 0)?;

    let read = read_oas(&path, 0.0, 1e-2);
    assert_eq!(read.name, "LIB");
    assert_close(read.unit, 1e-6);
    assert_close(read.precision, 1e-9);
    assert_eq!(read.cells.len(), 2);

    let a = &read.cells[0];
    assert_eq!(a.name, "A");
    assert_eq!(a.polygons.len(), 1);
    let polygon = &a.polygons[0];
    assert_eq!((polygon.layer, polygon.datatype), (1, 2));
    assert_points_close(
        &polygon.points,
        &[(0.0, 0.0), (1.0, 0.0), (1.5, 2.0), (0.0, 1.0)],
    );
    match &polygon.repetition {
        Repetition::Rectangular {
            columns,
            rows,
            spacing,
        } => {
            assert_eq!((*columns, *rows), (3, 2));
            assert_close(spacing.x, 5.0);
            assert_close(spacing.y, 6.0);
        }
        other => panic!("expected a rectangular repetition, got {:?}", other),
    }
    assert_eq!(polygon.properties.len(), 1);
    assert_eq!(
        polygon.properties[0].name,
        PropertyName::Text("COMMENT".into())
    );
    assert_eq!(
        polygon.properties[0].values,
        vec![
            PropertyValue::Real(2.5),
            PropertyValue::Integer(-7),
            PropertyValue::UnsignedInteger(9),
            PropertyValue::Bytes(b"hello".to_vec()),
        ]
    );

    let flexpath = &a.flexpaths[0];
    let element = &flexpath.elements[0];
    assert_eq!(element.end_type, EndType::Extended);
    assert_close(element.end_extensions.x, 0.25);
    assert_close(element.end_extensions.y, 0.125);
    assert_close(element.half_width_and_offset[0].x, 0.5);
    assert_points_close(
        &flexpath.spine,
        &[(0.0, 0.0), (10.0, 0.0), (10.0, 10.0)],
    );

    let label = &a.labels[0];
    assert_eq!(label.text, "PIN");
    assert_eq!((label.layer, label.texttype), (3, 4));
    assert_points_close(std::slice::from_ref(&label.origin), &[(2.0, 3.0)]);

    let b = &read.cells[1];
    assert_eq!(b.references[0].target, RefTarget::Cell(0));
    assert_close(b.references[0].rotation, FRAC_PI_2);
    assert_points_close(std::slice::from_ref(&b.references[0].origin), &[(1.0, 2.0)]);
    assert_close(b.references[1].magnification, 2.0);
    assert_close(b.references[1].rotation, 0.3);

    assert_eq!(read.properties.len(), 1);
    assert_eq!(read.properties[0].name, PropertyName::Text("OWNER".into()));

    assert_close(oas_precision(&path)?, 1e-9);
    Ok(())
}

/// With and without CBLOCK the inflated record stream must agree
#[test]
fn it_round_trips_oas_cblock() -> MaskResult<()> {
    let dir = tempdir();
    let plain_path = dir.path().join("plain.oas");
    let cblock_path = dir.path().join("cblock.oas");
    let lib = sample_library();
    lib.write_oas(&plain_path, 1e-2, 6, 0)?;
    lib.write_oas(&cblock_path, 1e-2, 6, OASIS_CONFIG_USE_CBLOCK)?;

    let plain = read_oas(&plain_path, 0.0, 1e-2);
    let cblock = read_oas(&cblock_path, 0.0, 1e-2);
    assert_eq!(plain, cblock);
    assert_eq!(plain.cells.len(), 2);
    Ok(())
}

/// Begin a hand-built OASIS stream: signature, START, grid 1000/µm
fn oas_prologue(out: &mut OasisWriter) {
    out.put_bytes(OASIS_MAGIC).unwrap();
    out.put(OasisRecordType::Start as u8).unwrap();
    out.write_string(b"1.0").unwrap();
    out.write_real(1000.0).unwrap();
    out.put(1).unwrap();
}

/// A fully-explicit rectangle record at (x, y), 100 x 50, layer 1 / 5
fn oas_full_rectangle(out: &mut OasisWriter, x: i64, y: i64) {
    out.put(OasisRecordType::Rectangle as u8).unwrap();
    out.put(0x7B).unwrap();
    out.write_unsigned_integer(1).unwrap();
    out.write_unsigned_integer(5).unwrap();
    out.write_unsigned_integer(100).unwrap();
    out.write_unsigned_integer(50).unwrap();
    out.write_integer(x).unwrap();
    out.write_integer(y).unwrap();
}

/// Full info bits and maximum modal inheritance must parse identically
#[test]
fn it_inherits_modal_state() {
    let dir = tempdir();
    let explicit_path = dir.path().join("explicit.oas");
    let modal_path = dir.path().join("modal.oas");

    let mut out = OasisWriter::open(&explicit_path).unwrap();
    oas_prologue(&mut out);
    out.put(OasisRecordType::Cell as u8).unwrap();
    out.write_string(b"A").unwrap();
    oas_full_rectangle(&mut out, 10, 20);
    oas_full_rectangle(&mut out, 110, 20);
    out.put(OasisRecordType::End as u8).unwrap();
    out.finish().unwrap();

    let mut out = OasisWriter::open(&modal_path).unwrap();
    oas_prologue(&mut out);
    out.put(OasisRecordType::Cell as u8).unwrap();
    out.write_string(b"A").unwrap();
    oas_full_rectangle(&mut out, 10, 20);
    out.put(OasisRecordType::XyRelative as u8).unwrap();
    // Everything but the x displacement inherited from modal state
    out.put(OasisRecordType::Rectangle as u8).unwrap();
    out.put(0x10).unwrap();
    out.write_integer(100).unwrap();
    out.put(OasisRecordType::End as u8).unwrap();
    out.finish().unwrap();

    let explicit = read_oas(&explicit_path, 0.0, 1e-2);
    let modal = read_oas(&modal_path, 0.0, 1e-2);
    assert_eq!(explicit, modal);
    assert_eq!(explicit.cells[0].polygons.len(), 2);
    assert_points_close(
        &explicit.cells[0].polygons[1].points,
        &[(0.11, 0.02), (0.21, 0.02), (0.21, 0.07), (0.11, 0.07)],
    );
}

/// Cells and placements by reference number, CELLNAME tables last;
/// the second placement inherits the modal cell and position
#[test]
fn it_resolves_oas_forward_references() {
    let dir = tempdir();
    let early_path = dir.path().join("names_last.oas");
    let late_path = dir.path().join("names_first.oas");

    let body = |out: &mut OasisWriter| {
        out.put(OasisRecordType::CellRefNum as u8).unwrap();
        out.write_unsigned_integer(0).unwrap();
        out.put(OasisRecordType::Placement as u8).unwrap();
        out.put(0xF2).unwrap(); // explicit refnum, x, y, rotation 90
        out.write_unsigned_integer(1).unwrap();
        out.write_integer(1000).unwrap();
        out.write_integer(2000).unwrap();
        out.put(OasisRecordType::Placement as u8).unwrap();
        out.put(0x30).unwrap(); // modal cell, new absolute x and y
        out.write_integer(500).unwrap();
        out.write_integer(600).unwrap();
        out.put(OasisRecordType::CellRefNum as u8).unwrap();
        out.write_unsigned_integer(1).unwrap();
    };
    let names = |out: &mut OasisWriter| {
        out.put(OasisRecordType::CellnameImplicit as u8).unwrap();
        out.write_string(b"A").unwrap();
        out.put(OasisRecordType::CellnameImplicit as u8).unwrap();
        out.write_string(b"B").unwrap();
    };

    let mut out = OasisWriter::open(&early_path).unwrap();
    oas_prologue(&mut out);
    body(&mut out);
    names(&mut out);
    out.put(OasisRecordType::End as u8).unwrap();
    out.finish().unwrap();

    let mut out = OasisWriter::open(&late_path).unwrap();
    oas_prologue(&mut out);
    names(&mut out);
    body(&mut out);
    out.put(OasisRecordType::End as u8).unwrap();
    out.finish().unwrap();

    let early = read_oas(&early_path, 0.0, 1e-2);
    let late = read_oas(&late_path, 0.0, 1e-2);
    assert_eq!(early, late);

    assert_eq!(early.cells[0].name, "A");
    assert_eq!(early.cells[1].name, "B");
    let refs = &early.cells[0].references;
    assert_eq!(refs.len(), 2);
    assert_eq!(refs[0].target, RefTarget::Cell(1));
    assert_close(refs[0].rotation, FRAC_PI_2);
    assert_points_close(std::slice::from_ref(&refs[0].origin), &[(1.0, 2.0)]);
    assert_eq!(refs[1].target, RefTarget::Cell(1));
    assert_close(refs[1].rotation, 0.0);
    assert_points_close(std::slice::from_ref(&refs[1].origin), &[(0.5, 0.6)]);
}

#[test]
fn it_builds_ctrapezoids() {
    let dir = tempdir();
    let path = dir.path().join("ctrap.oas");
    let mut out = OasisWriter::open(&path).unwrap();
    oas_prologue(&mut out);
    out.put(OasisRecordType::Cell as u8).unwrap();
    out.write_string(b"T").unwrap();
    out.put(OasisRecordType::Ctrapezoid as u8).unwrap();
    out.put(0xFB).unwrap();
    out.write_unsigned_integer(1).unwrap(); // layer
    out.write_unsigned_integer(0).unwrap(); // datatype
    out.put(0).unwrap(); // trapezoid type
    out.write_unsigned_integer(100).unwrap();
    out.write_unsigned_integer(50).unwrap();
    out.write_integer(0).unwrap();
    out.write_integer(0).unwrap();
    out.put(OasisRecordType::End as u8).unwrap();
    out.finish().unwrap();

    let read = read_oas(&path, 0.0, 1e-2);
    assert_points_close(
        &read.cells[0].polygons[0].points,
        &[(0.0, 0.0), (0.1, 0.0), (0.05, 0.05), (0.0, 0.05)],
    );
}

/// Two rectangles inside a CBLOCK, the second inheriting modal position
#[test]
fn it_reads_cblocks() {
    let dir = tempdir();
    let path = dir.path().join("cblock_modal.oas");
    let mut out = OasisWriter::open(&path).unwrap();
    oas_prologue(&mut out);
    out.put(OasisRecordType::Cell as u8).unwrap();
    out.write_string(b"A").unwrap();

    out.begin_cblock();
    oas_full_rectangle(&mut out, 10, 20);
    out.put(OasisRecordType::XyRelative as u8).unwrap();
    out.put(OasisRecordType::Rectangle as u8).unwrap();
    out.put(0x10).unwrap();
    out.write_integer(100).unwrap();
    let data = out.take_cblock();

    let mut encoder =
        flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::new(6));
    encoder.write_all(&data).unwrap();
    let compressed = encoder.finish().unwrap();
    out.put(OasisRecordType::Cblock as u8).unwrap();
    out.put(0).unwrap();
    out.write_unsigned_integer(data.len() as u64).unwrap();
    out.write_unsigned_integer(compressed.len() as u64).unwrap();
    out.put_bytes(&compressed).unwrap();
    out.put(OasisRecordType::End as u8).unwrap();
    out.finish().unwrap();

    let read = read_oas(&path, 0.0, 1e-2);
    let polygons = &read.cells[0].polygons;
    assert_eq!(polygons.len(), 2);
    assert_points_close(&polygons[0].points[..1], &[(0.01, 0.02)]);
    assert_points_close(&polygons[1].points[..1], &[(0.11, 0.02)]);
}

#[test]
fn it_round_trips_oas_integers_and_reals() {
    let dir = tempdir();
    let path = dir.path().join("codec.bin");
    let mut out = OasisWriter::open(&path).unwrap();
    let unsigneds = [0u64, 1, 127, 128, 300, 16383, 16384, 0xFFFF_FFFF_FFFF];
    let signeds = [0i64, -1, 1, -300, 300, -123456789];
    let reals = [0.0, 3.0, -4.0, 2.5, -0.125, PI];
    for value in unsigneds {
        out.write_unsigned_integer(value).unwrap();
    }
    for value in signeds {
        out.write_integer(value).unwrap();
    }
    for value in reals {
        out.write_real(value).unwrap();
    }
    out.write_gdelta(-5, 7).unwrap();
    out.finish().unwrap();

    let mut input = OasisReader::open(&path).unwrap();
    for value in unsigneds {
        assert_eq!(input.read_unsigned_integer().unwrap(), value);
    }
    for value in signeds {
        assert_eq!(input.read_integer().unwrap(), value);
    }
    for value in reals {
        assert_eq!(input.read_real().unwrap(), value);
    }
    assert_eq!(input.read_gdelta().unwrap(), (-5, 7));
}

#[test]
fn it_round_trips_point_lists() {
    let dir = tempdir();
    let path = dir.path().join("points.bin");
    let manhattan = [(5i64, 0i64), (0, 3), (-2, 0)];
    let octangular = [(2i64, 2i64), (3, -3), (0, 4)];
    let general = [(1i64, 5i64), (-2, -7)];
    let mut out = OasisWriter::open(&path).unwrap();
    out.write_point_list(&manhattan).unwrap();
    out.write_point_list(&octangular).unwrap();
    out.write_point_list(&general).unwrap();
    out.finish().unwrap();

    let mut input = OasisReader::open(&path).unwrap();
    let mut points = Vec::new();
    input.read_point_list(1.0, false, &mut points).unwrap();
    assert_points_close(&points, &[(5.0, 0.0), (5.0, 3.0), (3.0, 3.0)]);
    points.clear();
    input.read_point_list(1.0, false, &mut points).unwrap();
    assert_points_close(&points, &[(2.0, 2.0), (5.0, -1.0), (5.0, 3.0)]);
    points.clear();
    input.read_point_list(1.0, false, &mut points).unwrap();
    assert_points_close(&points, &[(1.0, 5.0), (-1.0, -2.0)]);
}

#[test]
fn it_round_trips_repetitions() {
    let dir = tempdir();
    let path = dir.path().join("reps.bin");
    let reps = [
        Repetition::Rectangular {
            columns: 3,
            rows: 2,
            spacing: Vec2::new(5.0, 6.0),
        },
        Repetition::Rectangular {
            columns: 4,
            rows: 1,
            spacing: Vec2::new(7.0, 0.0),
        },
        Repetition::Regular {
            columns: 2,
            rows: 3,
            v1: Vec2::new(1.0, 2.0),
            v2: Vec2::new(-3.0, 4.0),
        },
        Repetition::Explicit {
            offsets: vec![Vec2::new(1.0, 2.0), Vec2::new(3.0, 4.0)],
        },
        Repetition::ExplicitX {
            coords: vec![1.0, 3.0, 6.0],
        },
        Repetition::ExplicitY {
            coords: vec![2.0, 4.0],
        },
    ];
    let mut out = OasisWriter::open(&path).unwrap();
    for rep in reps.iter() {
        out.write_repetition(rep, 1.0).unwrap();
    }
    out.finish().unwrap();

    let mut input = OasisReader::open(&path).unwrap();
    for rep in reps.iter() {
        let mut read = Repetition::None;
        input.read_repetition(1.0, &mut read).unwrap();
        assert_eq!(&read, rep);
        assert_eq!(read.get_size(), rep.get_size());
    }
}

/// The whole tree is serde-serializable, handy for golden data and debug
#[test]
fn it_serializes_to_json() {
    let lib = sample_library();
    let json = serde_json::to_string(&lib).unwrap();
    let back: Library = serde_json::from_str(&json).unwrap();
    assert_eq!(lib, back);
}

#[test]
fn it_fractures_large_polygons() {
    // A long staircase with more vertices than the limit
    let mut points = Vec::new();
    for i in 0..24 {
        points.push(Vec2::new(i as f64, i as f64));
        points.push(Vec2::new(i as f64 + 1.0, i as f64));
    }
    points.push(Vec2::new(24.0, 30.0));
    points.push(Vec2::new(0.0, 30.0));
    let pieces = geom::fracture(points.clone(), 12);
    assert!(pieces.len() > 1);
    for piece in pieces.iter() {
        assert!(piece.len() >= 3);
    }
    // Limit below five disables fracturing
    assert_eq!(geom::fracture(points, 4).len(), 1);
}

#[test]
fn it_discretizes_circles() {
    let polygon = geom::ellipse(Vec2::new(1.0, 2.0), 5.0, 5.0, 1e-2, 3, 0);
    assert!(polygon.points.len() >= 8);
    for point in polygon.points.iter() {
        let dx = point.x - 1.0;
        let dy = point.y - 2.0;
        assert_close((dx * dx + dy * dy).sqrt(), 5.0);
    }
    assert_eq!((polygon.layer, polygon.datatype), (3, 0));
}
