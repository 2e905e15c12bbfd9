use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use cgmath::{Point3, Vector3};
use log::warn;
use rustc_hash::FxHashMap;

use crate::error::{VolumeError, VolumeResult};
use crate::systems::transaction::{OpDesc, ZoneGrid, ZoneId};
use crate::volume::allocator::NarrowBandAllocator;
use crate::volume::bounds::Aabb;
use crate::volume::field::{FieldOpts, FieldState, SdfManager};
use crate::volume::material::{MaterialId, MaterialModel};
use crate::volume::octree::{NodeKind, OctreeNodeManager, INDEX_NONE};

pub const MAGIC: [u8; 4] = *b"SVDF";
pub const FORMAT_VERSION: u16 = 1;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SerializeMode {
    Full = 0,
    Delta = 1,
    Streaming = 2,
    Partial = 3,
}

/// Compression levels accepted in the header. Only `None` payloads are
/// produced; readers reject the rest so a future writer cannot silently
/// feed compressed data to an old reader.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Compression {
    None = 0,
    Fast = 1,
    Normal = 2,
    High = 3,
}

const SECTION_NODES: u8 = 1;
const SECTION_FIELDS: u8 = 2;
const SECTION_MATERIALS: u8 = 3;
const SECTION_DELTA: u8 = 4;

/// Borrowed read view of the volume for serialization.
pub struct VolumeParts<'a> {
    pub octree: &'a OctreeNodeManager,
    pub sdf: &'a SdfManager,
    pub band: &'a NarrowBandAllocator,
    pub materials: &'a MaterialModel,
}

fn io_err(e: std::io::Error) -> VolumeError {
    VolumeError::corrupted(e.to_string())
}

// ---- header -----------------------------------------------------------------

struct Header {
    mode: SerializeMode,
    volume_version: u64,
    material_count: u32,
}

fn write_header(
    w: &mut impl Write,
    mode: SerializeMode,
    volume_version: u64,
    material_count: u32,
) -> VolumeResult<()> {
    w.write_all(&MAGIC).map_err(io_err)?;
    w.write_u16::<LittleEndian>(FORMAT_VERSION).map_err(io_err)?;
    w.write_u8(mode as u8).map_err(io_err)?;
    w.write_u8(Compression::None as u8).map_err(io_err)?;
    w.write_u64::<LittleEndian>(volume_version).map_err(io_err)?;
    w.write_u32::<LittleEndian>(material_count).map_err(io_err)?;
    w.write_u16::<LittleEndian>(0).map_err(io_err)?; // reserved
    Ok(())
}

fn read_header(r: &mut impl Read) -> VolumeResult<Header> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).map_err(io_err)?;
    if magic != MAGIC {
        return Err(VolumeError::corrupted("bad magic"));
    }
    let format = r.read_u16::<LittleEndian>().map_err(io_err)?;
    if format != FORMAT_VERSION {
        return Err(VolumeError::corrupted(format!("unsupported format version {}", format)));
    }
    let mode = match r.read_u8().map_err(io_err)? {
        0 => SerializeMode::Full,
        1 => SerializeMode::Delta,
        2 => SerializeMode::Streaming,
        3 => SerializeMode::Partial,
        n => return Err(VolumeError::corrupted(format!("unknown mode {}", n))),
    };
    let compression = r.read_u8().map_err(io_err)?;
    if compression != Compression::None as u8 {
        return Err(VolumeError::corrupted(format!(
            "compression level {} not supported by this reader",
            compression
        )));
    }
    let volume_version = r.read_u64::<LittleEndian>().map_err(io_err)?;
    let material_count = r.read_u32::<LittleEndian>().map_err(io_err)?;
    let _reserved = r.read_u16::<LittleEndian>().map_err(io_err)?;
    Ok(Header { mode, volume_version, material_count })
}

fn write_section(w: &mut impl Write, id: u8, payload: &[u8]) -> VolumeResult<()> {
    w.write_u8(id).map_err(io_err)?;
    w.write_u32::<LittleEndian>(payload.len() as u32).map_err(io_err)?;
    w.write_all(payload).map_err(io_err)?;
    Ok(())
}

// ---- op descriptors ---------------------------------------------------------

fn write_op(w: &mut impl Write, op: &OpDesc) -> VolumeResult<()> {
    let point = |w: &mut dyn Write, p: Point3<f32>| -> VolumeResult<()> {
        w.write_f32::<LittleEndian>(p.x).map_err(io_err)?;
        w.write_f32::<LittleEndian>(p.y).map_err(io_err)?;
        w.write_f32::<LittleEndian>(p.z).map_err(io_err)?;
        Ok(())
    };
    match *op {
        OpDesc::Union { center, radius, material, strength } => {
            w.write_u8(0).map_err(io_err)?;
            point(w, center)?;
            w.write_f32::<LittleEndian>(radius).map_err(io_err)?;
            w.write_u8(material).map_err(io_err)?;
            w.write_f32::<LittleEndian>(strength).map_err(io_err)?;
        }
        OpDesc::Subtract { center, radius, material, strength } => {
            w.write_u8(1).map_err(io_err)?;
            point(w, center)?;
            w.write_f32::<LittleEndian>(radius).map_err(io_err)?;
            w.write_u8(material).map_err(io_err)?;
            w.write_f32::<LittleEndian>(strength).map_err(io_err)?;
        }
        OpDesc::Blend { center, radius, src, dst, factor } => {
            w.write_u8(2).map_err(io_err)?;
            point(w, center)?;
            w.write_f32::<LittleEndian>(radius).map_err(io_err)?;
            w.write_u8(src).map_err(io_err)?;
            w.write_u8(dst).map_err(io_err)?;
            w.write_f32::<LittleEndian>(factor).map_err(io_err)?;
        }
        OpDesc::Fill { material } => {
            w.write_u8(3).map_err(io_err)?;
            w.write_u8(material).map_err(io_err)?;
        }
        OpDesc::Clear { material } => {
            w.write_u8(4).map_err(io_err)?;
            w.write_u8(material).map_err(io_err)?;
        }
        OpDesc::Opaque => w.write_u8(5).map_err(io_err)?,
    }
    Ok(())
}

fn read_op(r: &mut impl Read) -> VolumeResult<OpDesc> {
    let point = |r: &mut dyn Read| -> VolumeResult<Point3<f32>> {
        Ok(Point3::new(
            r.read_f32::<LittleEndian>().map_err(io_err)?,
            r.read_f32::<LittleEndian>().map_err(io_err)?,
            r.read_f32::<LittleEndian>().map_err(io_err)?,
        ))
    };
    Ok(match r.read_u8().map_err(io_err)? {
        0 => OpDesc::Union {
            center: point(r)?,
            radius: r.read_f32::<LittleEndian>().map_err(io_err)?,
            material: r.read_u8().map_err(io_err)?,
            strength: r.read_f32::<LittleEndian>().map_err(io_err)?,
        },
        1 => OpDesc::Subtract {
            center: point(r)?,
            radius: r.read_f32::<LittleEndian>().map_err(io_err)?,
            material: r.read_u8().map_err(io_err)?,
            strength: r.read_f32::<LittleEndian>().map_err(io_err)?,
        },
        2 => OpDesc::Blend {
            center: point(r)?,
            radius: r.read_f32::<LittleEndian>().map_err(io_err)?,
            src: r.read_u8().map_err(io_err)?,
            dst: r.read_u8().map_err(io_err)?,
            factor: r.read_f32::<LittleEndian>().map_err(io_err)?,
        },
        3 => OpDesc::Fill { material: r.read_u8().map_err(io_err)? },
        4 => OpDesc::Clear { material: r.read_u8().map_err(io_err)? },
        5 => OpDesc::Opaque,
        n => return Err(VolumeError::corrupted(format!("unknown op tag {}", n))),
    })
}

// ---- node & field kinds -----------------------------------------------------

fn kind_to_wire(kind: NodeKind) -> (u8, u8) {
    match kind {
        NodeKind::Empty => (0, 0),
        NodeKind::Homogeneous(m) => (1, m),
        NodeKind::Interface => (2, 0),
        NodeKind::Custom(tag) => (3, tag),
    }
}

fn kind_from_wire(kind: u8, aux: u8) -> VolumeResult<NodeKind> {
    Ok(match kind {
        0 => NodeKind::Empty,
        1 => NodeKind::Homogeneous(aux),
        2 => NodeKind::Interface,
        3 => NodeKind::Custom(aux),
        n => return Err(VolumeError::corrupted(format!("unknown node kind {}", n))),
    })
}

fn state_to_wire(state: FieldState) -> (u8, u8) {
    match state {
        FieldState::Unallocated => (0, 0),
        FieldState::Empty => (1, 0),
        FieldState::Homogeneous(m) => (2, m),
        FieldState::Interface => (3, 0),
    }
}

fn state_from_wire(state: u8, aux: u8) -> VolumeResult<FieldState> {
    Ok(match state {
        0 => FieldState::Unallocated,
        1 => FieldState::Empty,
        2 => FieldState::Homogeneous(aux),
        3 => FieldState::Interface,
        n => return Err(VolumeError::corrupted(format!("unknown field state {}", n))),
    })
}

// ---- full serialization -----------------------------------------------------

/// Writes the complete volume: header, node tree, field payloads, material
/// model. Sections are length-prefixed so future sections can be skipped
/// by this reader's successors.
pub fn serialize_full(
    w: &mut impl Write,
    parts: &VolumeParts,
    volume_version: u64,
) -> VolumeResult<()> {
    write_header(w, SerializeMode::Full, volume_version, parts.sdf.material_count())?;

    // node section: geometry, then records sorted by locational code so
    // parents precede children
    let mut payload = Vec::new();
    let bounds = parts.octree.world_bounds();
    for v in [bounds.min.x, bounds.min.y, bounds.min.z, bounds.max.x, bounds.max.y, bounds.max.z] {
        payload.write_f32::<LittleEndian>(v).map_err(io_err)?;
    }
    payload.write_u8(parts.octree.max_depth()).map_err(io_err)?;

    let mut records: Vec<(u32, u8, NodeKind, u32)> = parts
        .octree
        .iter_live()
        .map(|(idx, node)| {
            (
                parts.octree.locational_code(idx),
                node.depth(),
                node.kind(),
                node.field().unwrap_or(INDEX_NONE),
            )
        })
        .collect();
    records.sort_unstable_by_key(|&(code, ..)| code);

    payload.write_u32::<LittleEndian>(records.len() as u32).map_err(io_err)?;
    for (code, depth, kind, field) in records {
        let (kind_tag, aux) = kind_to_wire(kind);
        payload.write_u32::<LittleEndian>(code).map_err(io_err)?;
        payload.write_u8(depth).map_err(io_err)?;
        payload.write_u8(kind_tag).map_err(io_err)?;
        payload.write_u8(aux).map_err(io_err)?;
        payload.write_u32::<LittleEndian>(field).map_err(io_err)?;
    }
    write_section(w, SECTION_NODES, &payload)?;

    // field section, addressed by node locational code
    let mut payload = Vec::new();
    let mut fields: Vec<(u32, u32)> = parts
        .sdf
        .iter_live()
        .map(|field| (parts.octree.locational_code(parts.sdf.node_of(field)), field))
        .collect();
    fields.sort_unstable();

    payload.write_u32::<LittleEndian>(fields.len() as u32).map_err(io_err)?;
    for (code, field) in fields {
        payload.write_u32::<LittleEndian>(code).map_err(io_err)?;
        let origin = parts.sdf.origin(field);
        for v in [origin.x, origin.y, origin.z] {
            payload.write_f32::<LittleEndian>(v).map_err(io_err)?;
        }
        payload.write_f32::<LittleEndian>(parts.sdf.cell_size(field)).map_err(io_err)?;
        payload.write_u32::<LittleEndian>(parts.sdf.resolution(field)).map_err(io_err)?;
        let (state, aux) = state_to_wire(parts.sdf.state(field));
        payload.write_u8(state).map_err(io_err)?;
        payload.write_u8(aux).map_err(io_err)?;
        payload.write_u8(parts.sdf.primary_material(field)).map_err(io_err)?;
        payload.write_u64::<LittleEndian>(parts.sdf.field_version(field)).map_err(io_err)?;

        match parts.sdf.read_all_samples(parts.band, field) {
            Some(samples) => {
                payload.write_u32::<LittleEndian>(samples.len() as u32).map_err(io_err)?;
                for s in samples {
                    payload.write_f32::<LittleEndian>(s).map_err(io_err)?;
                }
            }
            None => payload.write_u32::<LittleEndian>(0).map_err(io_err)?,
        }
    }
    write_section(w, SECTION_FIELDS, &payload)?;

    // material model section
    let mut payload = Vec::new();
    parts.materials.serialize(&mut payload)?;
    write_section(w, SECTION_MATERIALS, &payload)?;

    Ok(())
}

/// Rebuilds the volume from a full serialization. The subsystems are
/// replaced wholesale; the material channel count must match the stream.
/// Returns the serialized volume version.
pub fn deserialize_full(
    r: &mut impl Read,
    octree: &mut OctreeNodeManager,
    sdf: &mut SdfManager,
    band: &mut NarrowBandAllocator,
    materials: &mut MaterialModel,
) -> VolumeResult<u64> {
    let header = read_header(r)?;
    if header.mode != SerializeMode::Full {
        return Err(VolumeError::corrupted("expected a full serialization"));
    }
    if header.material_count != sdf.material_count() {
        return Err(VolumeError::corrupted(format!(
            "stream has {} material channels, volume configured for {}",
            header.material_count,
            sdf.material_count()
        )));
    }

    loop {
        let id = match r.read_u8() {
            Ok(id) => id,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(io_err(e)),
        };
        let len = r.read_u32::<LittleEndian>().map_err(io_err)? as usize;
        let mut payload = vec![0u8; len];
        r.read_exact(&mut payload).map_err(io_err)?;
        let mut payload = payload.as_slice();

        match id {
            SECTION_NODES => read_nodes(&mut payload, octree)?,
            SECTION_FIELDS => read_fields(&mut payload, octree, sdf, band)?,
            SECTION_MATERIALS => materials.deserialize(&mut payload)?,
            other => {
                // future sections are skippable by construction
                warn!("skipping unknown section {} ({} bytes)", other, len);
            }
        }
    }

    Ok(header.volume_version)
}

fn read_nodes(r: &mut impl Read, octree: &mut OctreeNodeManager) -> VolumeResult<()> {
    let mut geom = [0f32; 6];
    for g in geom.iter_mut() {
        *g = r.read_f32::<LittleEndian>().map_err(io_err)?;
    }
    let bounds = Aabb::new(
        Point3::new(geom[0], geom[1], geom[2]),
        Point3::new(geom[3], geom[4], geom[5]),
    );
    if !bounds.is_valid() {
        return Err(VolumeError::corrupted("invalid world bounds"));
    }
    let max_depth = r.read_u8().map_err(io_err)?;
    *octree = OctreeNodeManager::new(bounds, max_depth);

    let count = r.read_u32::<LittleEndian>().map_err(io_err)?;
    for _ in 0..count {
        let code = r.read_u32::<LittleEndian>().map_err(io_err)?;
        let depth = r.read_u8().map_err(io_err)?;
        let kind_tag = r.read_u8().map_err(io_err)?;
        let aux = r.read_u8().map_err(io_err)?;
        let _field = r.read_u32::<LittleEndian>().map_err(io_err)?;

        let kind = kind_from_wire(kind_tag, aux)?;
        let node = octree
            .materialize_code(code)
            .ok_or_else(|| VolumeError::corrupted(format!("node code {:#x} out of depth", code)))?;
        if octree.depth(node) != depth {
            return Err(VolumeError::corrupted(format!(
                "node code {:#x} claims depth {}, tree says {}",
                code,
                depth,
                octree.depth(node)
            )));
        }
        octree.set_kind(node, kind);
    }
    Ok(())
}

fn read_fields(
    r: &mut impl Read,
    octree: &mut OctreeNodeManager,
    sdf: &mut SdfManager,
    band: &mut NarrowBandAllocator,
) -> VolumeResult<()> {
    let count = r.read_u32::<LittleEndian>().map_err(io_err)?;
    for _ in 0..count {
        let code = r.read_u32::<LittleEndian>().map_err(io_err)?;
        let origin = Point3::new(
            r.read_f32::<LittleEndian>().map_err(io_err)?,
            r.read_f32::<LittleEndian>().map_err(io_err)?,
            r.read_f32::<LittleEndian>().map_err(io_err)?,
        );
        let cell_size = r.read_f32::<LittleEndian>().map_err(io_err)?;
        let resolution = r.read_u32::<LittleEndian>().map_err(io_err)?;
        let state_tag = r.read_u8().map_err(io_err)?;
        let state_aux = r.read_u8().map_err(io_err)?;
        let primary = r.read_u8().map_err(io_err)?;
        let version = r.read_u64::<LittleEndian>().map_err(io_err)?;
        let sample_count = r.read_u32::<LittleEndian>().map_err(io_err)? as usize;

        if !(2..=64).contains(&resolution) || cell_size <= 0.0 {
            return Err(VolumeError::corrupted("bad field geometry"));
        }
        let state = state_from_wire(state_tag, state_aux)?;

        let node = octree
            .materialize_code(code)
            .ok_or_else(|| VolumeError::corrupted(format!("field node code {:#x} invalid", code)))?;

        let size = cell_size * (resolution - 1) as f32;
        let bounds = Aabb::new(origin, origin + Vector3::new(size, size, size));
        let field = sdf.create_field(
            band,
            node,
            bounds,
            FieldOpts { resolution, default_material: primary, initialize_empty: true },
        )?;
        octree.set_field(node, Some(field));

        if sample_count > 0 {
            let expected = (resolution.pow(3) * sdf.material_count()) as usize;
            if sample_count != expected {
                return Err(VolumeError::corrupted(format!(
                    "field carries {} samples, geometry implies {}",
                    sample_count, expected
                )));
            }
            let mut samples = vec![0f32; sample_count];
            for s in samples.iter_mut() {
                *s = r.read_f32::<LittleEndian>().map_err(io_err)?;
            }
            sdf.write_all_samples(band, field, &samples)?;
        } else {
            sdf.release_storage(band, field);
        }

        sdf.restore_state(field, state, primary);
        sdf.restore_version(field, version);
    }
    Ok(())
}

// ---- delta serialization ----------------------------------------------------

/// One changed zone in a delta stream.
struct ZoneEntry {
    zone: ZoneId,
    new_version: u64,
    op: OpDesc,
    patches: Vec<(u32, u32, MaterialId)>,
}

/// Writes the changes after `since_sdf_version` as per-zone channel
/// patches. `volume_version` is the delta's target; the base is the
/// caller's volume version mapping.
#[allow(clippy::too_many_arguments)]
pub fn serialize_delta(
    w: &mut impl Write,
    parts: &VolumeParts,
    zones: &ZoneGrid,
    zone_version_of: &dyn Fn(ZoneId) -> u64,
    since_sdf_version: u64,
    volume_version: u64,
) -> VolumeResult<()> {
    write_header(w, SerializeMode::Delta, volume_version, parts.sdf.material_count())?;

    // group changed channels by the zone holding the field's center; the
    // log may still name fields that refinement has since released
    let mut by_zone: FxHashMap<ZoneId, ZoneEntry> = FxHashMap::default();
    for (field, mat) in parts.sdf.modified_since(since_sdf_version) {
        if parts.sdf.state(field) == FieldState::Unallocated {
            continue;
        }
        let center = parts.sdf.field_bounds(field).center();
        let Some(zone) = zones.zone_at(center) else {
            continue;
        };
        let code = parts.octree.locational_code(parts.sdf.node_of(field));
        by_zone
            .entry(zone)
            .or_insert_with(|| ZoneEntry {
                zone,
                new_version: zone_version_of(zone),
                op: OpDesc::Opaque,
                patches: Vec::new(),
            })
            .patches
            .push((code, field, mat));
    }
    let mut entries: Vec<ZoneEntry> = by_zone.into_values().collect();
    entries.sort_unstable_by_key(|e| e.zone);

    let mut payload = Vec::new();
    payload.write_u32::<LittleEndian>(entries.len() as u32).map_err(io_err)?;
    for entry in entries {
        payload.write_u32::<LittleEndian>(entry.zone).map_err(io_err)?;
        payload.write_u64::<LittleEndian>(entry.new_version).map_err(io_err)?;
        write_op(&mut payload, &entry.op)?;

        payload.write_u32::<LittleEndian>(entry.patches.len() as u32).map_err(io_err)?;
        for (code, field, mat) in entry.patches {
            payload.write_u32::<LittleEndian>(code).map_err(io_err)?;
            payload.write_u8(mat).map_err(io_err)?;
            let (state, aux) = state_to_wire(parts.sdf.state(field));
            payload.write_u8(state).map_err(io_err)?;
            payload.write_u8(aux).map_err(io_err)?;
            payload.write_u8(parts.sdf.primary_material(field)).map_err(io_err)?;
            let origin = parts.sdf.origin(field);
            for v in [origin.x, origin.y, origin.z] {
                payload.write_f32::<LittleEndian>(v).map_err(io_err)?;
            }
            payload.write_f32::<LittleEndian>(parts.sdf.cell_size(field)).map_err(io_err)?;
            payload.write_u32::<LittleEndian>(parts.sdf.resolution(field)).map_err(io_err)?;

            let channel = parts.sdf.read_channel(parts.band, field, mat).unwrap_or_default();
            payload.write_u32::<LittleEndian>(channel.len() as u32).map_err(io_err)?;
            for s in channel {
                payload.write_f32::<LittleEndian>(s).map_err(io_err)?;
            }
        }
    }
    write_section(w, SECTION_DELTA, &payload)?;
    Ok(())
}

/// Applies a delta stream. Zone versions are published through
/// `publish_zone`; returns the target volume version from the header.
pub fn apply_delta(
    r: &mut impl Read,
    octree: &mut OctreeNodeManager,
    sdf: &mut SdfManager,
    band: &mut NarrowBandAllocator,
    publish_zone: &mut dyn FnMut(ZoneId, u64),
) -> VolumeResult<u64> {
    let header = read_header(r)?;
    if header.mode != SerializeMode::Delta {
        return Err(VolumeError::corrupted("expected a delta serialization"));
    }
    if header.material_count != sdf.material_count() {
        return Err(VolumeError::corrupted("material channel count mismatch"));
    }

    loop {
        let id = match r.read_u8() {
            Ok(id) => id,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(io_err(e)),
        };
        let len = r.read_u32::<LittleEndian>().map_err(io_err)? as usize;
        let mut payload = vec![0u8; len];
        r.read_exact(&mut payload).map_err(io_err)?;
        let mut payload = payload.as_slice();

        if id != SECTION_DELTA {
            warn!("skipping section {} in delta stream", id);
            continue;
        }

        let entry_count = payload.read_u32::<LittleEndian>().map_err(io_err)?;
        for _ in 0..entry_count {
            let zone = payload.read_u32::<LittleEndian>().map_err(io_err)?;
            let new_version = payload.read_u64::<LittleEndian>().map_err(io_err)?;
            let _op = read_op(&mut payload)?;

            let patch_count = payload.read_u32::<LittleEndian>().map_err(io_err)?;
            for _ in 0..patch_count {
                apply_patch(&mut payload, octree, sdf, band)?;
            }
            publish_zone(zone, new_version);
        }
    }

    Ok(header.volume_version)
}

fn apply_patch(
    r: &mut impl Read,
    octree: &mut OctreeNodeManager,
    sdf: &mut SdfManager,
    band: &mut NarrowBandAllocator,
) -> VolumeResult<()> {
    let code = r.read_u32::<LittleEndian>().map_err(io_err)?;
    let mat = r.read_u8().map_err(io_err)?;
    let state_tag = r.read_u8().map_err(io_err)?;
    let state_aux = r.read_u8().map_err(io_err)?;
    let primary = r.read_u8().map_err(io_err)?;
    let origin = Point3::new(
        r.read_f32::<LittleEndian>().map_err(io_err)?,
        r.read_f32::<LittleEndian>().map_err(io_err)?,
        r.read_f32::<LittleEndian>().map_err(io_err)?,
    );
    let cell_size = r.read_f32::<LittleEndian>().map_err(io_err)?;
    let resolution = r.read_u32::<LittleEndian>().map_err(io_err)?;
    let sample_count = r.read_u32::<LittleEndian>().map_err(io_err)? as usize;

    if !(2..=64).contains(&resolution) || cell_size <= 0.0 {
        return Err(VolumeError::corrupted("bad patch geometry"));
    }
    let state = state_from_wire(state_tag, state_aux)?;

    let node = octree
        .materialize_code(code)
        .ok_or_else(|| VolumeError::corrupted(format!("patch node code {:#x} invalid", code)))?;
    let field = match sdf.field_for_node(node) {
        Some(field) => field,
        None => {
            let size = cell_size * (resolution - 1) as f32;
            let bounds = Aabb::new(origin, origin + Vector3::new(size, size, size));
            let field = sdf.create_field(
                band,
                node,
                bounds,
                FieldOpts { resolution, default_material: primary, initialize_empty: true },
            )?;
            octree.set_field(node, Some(field));
            field
        }
    };
    if sdf.resolution(field) != resolution {
        sdf.set_resolution(band, field, resolution)?;
    }

    if sample_count > 0 {
        let expected = resolution.pow(3) as usize;
        if sample_count != expected {
            return Err(VolumeError::corrupted(format!(
                "patch carries {} samples, geometry implies {}",
                sample_count, expected
            )));
        }
        let mut samples = vec![0f32; sample_count];
        for s in samples.iter_mut() {
            *s = r.read_f32::<LittleEndian>().map_err(io_err)?;
        }
        sdf.write_channel(band, field, mat, &samples)?;
    }

    sdf.restore_state(field, state, primary);
    let node_kind = match state {
        FieldState::Empty => NodeKind::Empty,
        FieldState::Homogeneous(m) => NodeKind::Homogeneous(m),
        FieldState::Interface => NodeKind::Interface,
        FieldState::Unallocated => NodeKind::Empty,
    };
    octree.set_kind(node, node_kind);
    Ok(())
}

#[cfg(test)]
mod tests {
    use cgmath::Point3;

    use super::*;
    use crate::systems::jobs::SerialScheduler;
    use crate::systems::transaction::ZoneGrid;
    use crate::volume::material::{BlendKind, PairRule, RelationKind};

    const M: u32 = 4;

    struct Parts {
        octree: OctreeNodeManager,
        sdf: SdfManager,
        band: NarrowBandAllocator,
        materials: MaterialModel,
    }

    impl Parts {
        fn empty() -> Parts {
            let bounds = Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(8.0, 8.0, 8.0));
            Parts {
                octree: OctreeNodeManager::new(bounds, 3),
                sdf: SdfManager::new(M, 1024),
                band: NarrowBandAllocator::new(32 * 1024 * 1024),
                materials: MaterialModel::new(BlendKind::Linear, 0),
            }
        }

        /// Volume with a subdivided octree, one sculpted interface field,
        /// one storage-less homogeneous field, and material rules.
        fn populated() -> Parts {
            let mut p = Parts::empty();
            let root = p.octree.root();
            let children = p.octree.subdivide(root).unwrap();

            let interface_node = children[0];
            let field = p
                .sdf
                .create_field(
                    &mut p.band,
                    interface_node,
                    p.octree.bounds(interface_node),
                    FieldOpts::default(),
                )
                .unwrap();
            p.octree.set_field(interface_node, Some(field));
            p.sdf
                .union_material(
                    &mut p.band,
                    &SerialScheduler,
                    field,
                    Point3::new(2.0, 2.0, 2.0),
                    1.5,
                    0,
                    1.0,
                )
                .unwrap();
            p.octree.set_kind(interface_node, NodeKind::Interface);

            let solid_node = children[7];
            let solid = p
                .sdf
                .create_field(
                    &mut p.band,
                    solid_node,
                    p.octree.bounds(solid_node),
                    FieldOpts { default_material: 2, initialize_empty: false, ..Default::default() },
                )
                .unwrap();
            p.octree.set_field(solid_node, Some(solid));
            p.octree.set_kind(solid_node, NodeKind::Homogeneous(2));
            p.sdf.release_storage(&mut p.band, solid);

            p.materials.set_pair(
                0,
                2,
                PairRule { kind: RelationKind::Incompatible, ..PairRule::default() },
            );
            p.materials.set_priority(2, 8);
            p
        }
    }

    #[test]
    fn full_roundtrip_preserves_structure_and_samples() {
        let src = Parts::populated();
        let parts = VolumeParts {
            octree: &src.octree,
            sdf: &src.sdf,
            band: &src.band,
            materials: &src.materials,
        };

        let mut bytes = Vec::new();
        serialize_full(&mut bytes, &parts, 17).unwrap();

        let mut dst = Parts::empty();
        let version = deserialize_full(
            &mut bytes.as_slice(),
            &mut dst.octree,
            &mut dst.sdf,
            &mut dst.band,
            &mut dst.materials,
        )
        .unwrap();
        assert_eq!(version, 17);

        assert_eq!(dst.octree.node_count(), src.octree.node_count());
        assert_eq!(dst.octree.stats(), src.octree.stats());

        // sculpted samples survive bit-exact
        for probe in [
            Point3::new(2.0, 2.0, 2.0),
            Point3::new(3.0, 2.0, 2.0),
            Point3::new(0.5, 0.5, 0.5),
        ] {
            let src_node = src.octree.find_leaf_at(probe).unwrap();
            let dst_node = dst.octree.find_leaf_at(probe).unwrap();
            let src_field = src.sdf.field_for_node(src_node).unwrap();
            let dst_field = dst.sdf.field_for_node(dst_node).unwrap();
            assert_eq!(
                src.sdf.evaluate(&src.band, src_field, probe, 0),
                dst.sdf.evaluate(&dst.band, dst_field, probe, 0),
                "{:?}",
                probe
            );
        }

        // the storage-less homogeneous field stays storage-less
        let solid_probe = Point3::new(7.5, 7.5, 7.5);
        let node = dst.octree.find_leaf_at(solid_probe).unwrap();
        let solid = dst.sdf.field_for_node(node).unwrap();
        assert!(!dst.sdf.has_storage(solid));
        assert_eq!(dst.sdf.state(solid), FieldState::Homogeneous(2));

        // material model came along
        assert_eq!(dst.materials.get_pair(0, 2).kind, RelationKind::Incompatible);
        assert_eq!(dst.materials.get_priority(2), 8);
    }

    #[test]
    fn unknown_sections_are_skipped() {
        let src = Parts::populated();
        let parts = VolumeParts {
            octree: &src.octree,
            sdf: &src.sdf,
            band: &src.band,
            materials: &src.materials,
        };

        let mut bytes = Vec::new();
        serialize_full(&mut bytes, &parts, 3).unwrap();
        // a future section this reader has never heard of
        bytes.push(200);
        bytes.extend_from_slice(&8u32.to_le_bytes());
        bytes.extend_from_slice(&[0xAB; 8]);

        let mut dst = Parts::empty();
        let version = deserialize_full(
            &mut bytes.as_slice(),
            &mut dst.octree,
            &mut dst.sdf,
            &mut dst.band,
            &mut dst.materials,
        )
        .unwrap();
        assert_eq!(version, 3);
        assert_eq!(dst.octree.node_count(), src.octree.node_count());
    }

    #[test]
    fn corrupted_streams_are_rejected() {
        let src = Parts::empty();
        let parts = VolumeParts {
            octree: &src.octree,
            sdf: &src.sdf,
            band: &src.band,
            materials: &src.materials,
        };
        let mut bytes = Vec::new();
        serialize_full(&mut bytes, &parts, 1).unwrap();

        // bad magic
        let mut broken = bytes.clone();
        broken[0] = b'X';
        let mut dst = Parts::empty();
        assert!(matches!(
            deserialize_full(
                &mut broken.as_slice(),
                &mut dst.octree,
                &mut dst.sdf,
                &mut dst.band,
                &mut dst.materials,
            ),
            Err(VolumeError::Corrupted(_))
        ));

        // compressed payloads are not accepted by this reader
        let mut compressed = bytes.clone();
        compressed[7] = Compression::High as u8;
        let mut dst = Parts::empty();
        assert!(deserialize_full(
            &mut compressed.as_slice(),
            &mut dst.octree,
            &mut dst.sdf,
            &mut dst.band,
            &mut dst.materials,
        )
        .is_err());

        // truncated stream
        let truncated = &bytes[..bytes.len() / 2];
        let mut dst = Parts::empty();
        assert!(deserialize_full(
            &mut &truncated[..],
            &mut dst.octree,
            &mut dst.sdf,
            &mut dst.band,
            &mut dst.materials,
        )
        .is_err());
    }

    #[test]
    fn delta_roundtrip_converges_clone() {
        // start from a shared baseline
        let mut src = Parts::populated();
        let baseline = {
            let parts = VolumeParts {
                octree: &src.octree,
                sdf: &src.sdf,
                band: &src.band,
                materials: &src.materials,
            };
            let mut bytes = Vec::new();
            serialize_full(&mut bytes, &parts, 1).unwrap();
            bytes
        };
        let mut clone = Parts::empty();
        deserialize_full(
            &mut baseline.as_slice(),
            &mut clone.octree,
            &mut clone.sdf,
            &mut clone.band,
            &mut clone.materials,
        )
        .unwrap();

        // mutate the source past the baseline
        let since = src.sdf.version();
        let probe = Point3::new(2.0, 2.0, 2.0);
        let node = src.octree.find_leaf_at(probe).unwrap();
        let field = src.sdf.field_for_node(node).unwrap();
        src.sdf
            .subtract_material(&mut src.band, &SerialScheduler, field, probe, 1.0, 0, 1.0)
            .unwrap();

        let zones = ZoneGrid::new(src.octree.world_bounds(), 2);
        let mut bytes = Vec::new();
        serialize_delta(
            &mut bytes,
            &VolumeParts {
                octree: &src.octree,
                sdf: &src.sdf,
                band: &src.band,
                materials: &src.materials,
            },
            &zones,
            &|_| 2,
            since,
            2,
        )
        .unwrap();

        // apply to the clone; zone versions are published and samples match
        let mut published = Vec::new();
        let target = apply_delta(
            &mut bytes.as_slice(),
            &mut clone.octree,
            &mut clone.sdf,
            &mut clone.band,
            &mut |zone, version| published.push((zone, version)),
        )
        .unwrap();
        assert_eq!(target, 2);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].1, 2);

        let clone_node = clone.octree.find_leaf_at(probe).unwrap();
        let clone_field = clone.sdf.field_for_node(clone_node).unwrap();
        assert_eq!(
            src.sdf.evaluate(&src.band, field, probe, 0),
            clone.sdf.evaluate(&clone.band, clone_field, probe, 0)
        );
        assert!(clone.sdf.evaluate(&clone.band, clone_field, probe, 0) > 0.0);
    }
}
