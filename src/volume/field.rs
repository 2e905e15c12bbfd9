use cgmath::{InnerSpace, Point3, Vector3};
use log::{debug, warn};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{VolumeError, VolumeResult};
use crate::systems::jobs::WorkScheduler;
use crate::volume::allocator::{BandHandle, NarrowBandAllocator};
use crate::volume::bounds::Aabb;
use crate::volume::material::{BlendKind, MaterialId, MaterialModel};
use crate::volume::morton;
use crate::volume::octree::NodeIndex;

pub type FieldIndex = u32;

/// Distance reported for space no field covers, and by the constant fast
/// path of storage-less fields.
pub const FAR_DISTANCE: f32 = 1.0;

/// Initial sample magnitude for channels no sculpt has touched yet. Large
/// enough that distance-combining ops always write their true influence,
/// so stored magnitudes stay real distances near every surface.
pub const UNCARVED_DISTANCE: f32 = 1.0e6;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FieldState {
    /// Slot is free or the field has been released.
    Unallocated,
    /// Every channel positive everywhere.
    Empty,
    /// Exactly one material inside, no boundary crossing.
    Homogeneous(MaterialId),
    /// At least two materials meet, or a surface crosses the node.
    Interface,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct FieldOpts {
    /// Samples per axis; rounded up to a power of two.
    pub resolution: u32,
    pub default_material: MaterialId,
    /// Initialize all channels positive; otherwise filled with the default
    /// material.
    pub initialize_empty: bool,
}

impl Default for FieldOpts {
    fn default() -> FieldOpts {
        FieldOpts { resolution: 8, default_material: 0, initialize_empty: true }
    }
}

#[derive(Clone, Debug)]
struct Field {
    node: NodeIndex,
    origin: Point3<f32>,
    cell_size: f32,
    resolution: u32,
    state: FieldState,
    primary_material: MaterialId,
    version: u64,
    handle: Option<BandHandle>,
    live: bool,
}

impl Field {
    fn cells(&self) -> usize {
        (self.resolution * self.resolution * self.resolution) as usize
    }

    fn size(&self) -> f32 {
        self.cell_size * (self.resolution - 1) as f32
    }

    fn bounds(&self) -> Aabb {
        let s = self.size();
        Aabb::new(self.origin, self.origin + Vector3::new(s, s, s))
    }
}

/// Undo journal for one transaction: per-(field, channel) snapshots taken
/// before the first mutation, replayed in reverse on abort.
#[derive(Default)]
pub struct UndoJournal {
    entries: Vec<(FieldIndex, MaterialId, Vec<f32>)>,
    seen: FxHashSet<(FieldIndex, MaterialId)>,
}

impl UndoJournal {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct FieldStats {
    pub live_fields: u32,
    pub empty: u32,
    pub homogeneous: u32,
    pub interface: u32,
    pub with_storage: u32,
    pub sample_bytes: u64,
}

/// Owner of all per-node SDF storage. Fields live in an arena keyed by
/// [`FieldIndex`]; sample arrays sit in narrow-band chunks and are laid out
/// `morton3(x,y,z) * M + material`, so spatially close samples share cache
/// lines. All sculpting runs here; the octree only learns the resulting
/// state.
pub struct SdfManager {
    fields: Vec<Field>,
    free_list: Vec<FieldIndex>,
    node_field: FxHashMap<NodeIndex, FieldIndex>,
    material_count: u32,
    max_fields: u32,
    version: u64,
    /// Append-only (version, field, channel) log; versions are monotonic so
    /// "modified since v" is a binary search.
    mod_log: Vec<(u64, FieldIndex, MaterialId)>,
    journal: Option<UndoJournal>,
}

impl SdfManager {
    pub fn new(material_count: u32, max_fields: u32) -> SdfManager {
        SdfManager {
            fields: Vec::new(),
            free_list: Vec::new(),
            node_field: FxHashMap::default(),
            material_count,
            max_fields,
            version: 0,
            mod_log: Vec::new(),
            journal: None,
        }
    }

    pub fn material_count(&self) -> u32 {
        self.material_count
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn field_version(&self, field: FieldIndex) -> u64 {
        self.fields[field as usize].version
    }

    pub fn field_for_node(&self, node: NodeIndex) -> Option<FieldIndex> {
        self.node_field.get(&node).copied()
    }

    pub fn node_of(&self, field: FieldIndex) -> NodeIndex {
        self.fields[field as usize].node
    }

    pub fn state(&self, field: FieldIndex) -> FieldState {
        match self.fields.get(field as usize) {
            Some(f) if f.live => f.state,
            _ => FieldState::Unallocated,
        }
    }

    pub fn primary_material(&self, field: FieldIndex) -> MaterialId {
        self.fields[field as usize].primary_material
    }

    pub fn resolution(&self, field: FieldIndex) -> u32 {
        self.fields[field as usize].resolution
    }

    pub fn cell_size(&self, field: FieldIndex) -> f32 {
        self.fields[field as usize].cell_size
    }

    pub fn origin(&self, field: FieldIndex) -> Point3<f32> {
        self.fields[field as usize].origin
    }

    pub fn field_bounds(&self, field: FieldIndex) -> Aabb {
        self.fields[field as usize].bounds()
    }

    pub fn has_storage(&self, field: FieldIndex) -> bool {
        self.fields[field as usize].handle.is_some()
    }

    /// Narrow-band chunk backing this field, if any. The façade uses it to
    /// re-tag live storage when a region's priority changes.
    pub fn storage_handle(&self, field: FieldIndex) -> Option<BandHandle> {
        self.fields[field as usize].handle
    }

    // ---- lifecycle ----------------------------------------------------------

    /// Creates a field covering `bounds` for `node`. Storage comes from the
    /// narrow-band allocator; the sample grid is vertex-centered with
    /// `resolution` samples per axis.
    pub fn create_field(
        &mut self,
        band: &mut NarrowBandAllocator,
        node: NodeIndex,
        bounds: Aabb,
        opts: FieldOpts,
    ) -> VolumeResult<FieldIndex> {
        if self.node_field.contains_key(&node) {
            return Err(VolumeError::invalid(format!("node {} already has a field", node)));
        }
        let live = self.fields.len() - self.free_list.len();
        if live as u32 >= self.max_fields {
            return Err(VolumeError::OutOfMemory { requested: 0 });
        }

        let resolution = opts.resolution.clamp(2, 64).next_power_of_two();
        let m = self.material_count;
        let floats = resolution.pow(3) * m;

        let priority = band.region_priority(&bounds);
        let handle = band
            .alloc(floats, opts.default_material, priority)
            .ok_or(VolumeError::OutOfMemory { requested: floats as usize * 4 })?;

        let (state, primary) = if opts.initialize_empty {
            (FieldState::Empty, opts.default_material)
        } else {
            (FieldState::Homogeneous(opts.default_material), opts.default_material)
        };

        let field = Field {
            node,
            origin: bounds.min,
            cell_size: bounds.size().x / (resolution - 1) as f32,
            resolution,
            state,
            primary_material: primary,
            version: self.version,
            handle: Some(handle),
            live: true,
        };

        // fill channels: all far outside, or the default material inside
        {
            let samples = band.samples_mut(handle);
            let m = m as usize;
            for (i, s) in samples.iter_mut().enumerate() {
                let channel = (i % m) as MaterialId;
                *s = if !opts.initialize_empty && channel == opts.default_material {
                    -UNCARVED_DISTANCE
                } else {
                    UNCARVED_DISTANCE
                };
            }
        }

        let index = if let Some(slot) = self.free_list.pop() {
            self.fields[slot as usize] = field;
            slot
        } else {
            self.fields.push(field);
            (self.fields.len() - 1) as FieldIndex
        };
        self.node_field.insert(node, index);
        Ok(index)
    }

    /// Releases the field and its storage. Safe to call with stale indices.
    pub fn release(&mut self, band: &mut NarrowBandAllocator, field: FieldIndex) {
        let Some(f) = self.fields.get_mut(field as usize) else {
            return;
        };
        if !f.live {
            return;
        }
        if let Some(handle) = f.handle.take() {
            band.free(handle);
        }
        f.live = false;
        f.state = FieldState::Unallocated;
        self.node_field.remove(&f.node);
        self.free_list.push(field);
    }

    /// Drops the sample storage of an Empty or Homogeneous field, keeping
    /// the record. Evaluation falls back to the constant fast path until a
    /// mutation re-allocates.
    pub fn release_storage(&mut self, band: &mut NarrowBandAllocator, field: FieldIndex) {
        let f = &mut self.fields[field as usize];
        if matches!(f.state, FieldState::Interface) {
            return;
        }
        if let Some(handle) = f.handle.take() {
            band.free(handle);
        }
    }

    /// Releases storage of every Empty/Homogeneous field. Returns the bytes
    /// handed back to the allocator.
    pub fn release_unused_fields(&mut self, band: &mut NarrowBandAllocator) -> u64 {
        let mut reclaimed = 0u64;
        for i in 0..self.fields.len() {
            let f = &self.fields[i];
            if f.live && f.handle.is_some() && !matches!(f.state, FieldState::Interface) {
                reclaimed += f.cells() as u64 * self.material_count as u64 * 4;
                self.release_storage(band, i as FieldIndex);
            }
        }
        if reclaimed > 0 {
            debug!("released {} bytes of non-interface field storage", reclaimed);
        }
        reclaimed
    }

    /// Applies relocations reported by [`NarrowBandAllocator::defragment`].
    pub fn patch_relocations(&mut self, moves: &[(BandHandle, BandHandle)]) {
        if moves.is_empty() {
            return;
        }
        let map: FxHashMap<BandHandle, BandHandle> = moves.iter().copied().collect();
        for f in self.fields.iter_mut().filter(|f| f.live) {
            if let Some(handle) = f.handle {
                if let Some(&new) = map.get(&handle) {
                    f.handle = Some(new);
                }
            }
        }
    }

    /// Re-samples the field at a new resolution (trilinear across all
    /// channels).
    pub fn set_resolution(
        &mut self,
        band: &mut NarrowBandAllocator,
        field: FieldIndex,
        resolution: u32,
    ) -> VolumeResult<()> {
        let resolution = resolution.clamp(2, 64).next_power_of_two();
        let f = self.fields[field as usize].clone();
        if f.resolution == resolution {
            return Ok(());
        }
        let Some(old_handle) = f.handle else {
            self.fields[field as usize].resolution = resolution;
            self.fields[field as usize].cell_size = f.size() / (resolution - 1) as f32;
            return Ok(());
        };

        let m = self.material_count;
        let floats = resolution.pow(3) * m;
        let priority = band.region_priority(&f.bounds());
        let new_handle = band
            .alloc(floats, f.primary_material, priority)
            .ok_or(VolumeError::OutOfMemory { requested: floats as usize * 4 })?;

        let new_cell = f.size() / (resolution - 1) as f32;
        let mut resampled = vec![0.0f32; floats as usize];
        {
            let old = band.samples(old_handle);
            for code in 0..resolution.pow(3) {
                let (x, y, z) = morton::decode(code);
                let p = f.origin + Vector3::new(x as f32, y as f32, z as f32) * new_cell;
                for mat in 0..m {
                    resampled[(code * m + mat) as usize] =
                        trilinear(old, &f, m as usize, p, mat as MaterialId);
                }
            }
        }
        band.samples_mut(new_handle).copy_from_slice(&resampled);
        band.free(old_handle);

        let f = &mut self.fields[field as usize];
        f.handle = Some(new_handle);
        f.resolution = resolution;
        f.cell_size = new_cell;
        let primary_material = f.primary_material;
        self.touch(field, primary_material);
        Ok(())
    }

    /// Halves the resolution of interface fields whose node priority is
    /// lowest, until `target_bytes` have been reclaimed. Returns bytes
    /// actually reclaimed.
    pub fn degrade_interface_fields(
        &mut self,
        band: &mut NarrowBandAllocator,
        target_bytes: u64,
        priority_of: &dyn Fn(NodeIndex) -> u8,
    ) -> u64 {
        let mut candidates: Vec<(u8, FieldIndex, u32)> = self
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.live && f.handle.is_some() && f.state == FieldState::Interface)
            .filter(|(_, f)| f.resolution > 2)
            .map(|(i, f)| (priority_of(f.node), i as FieldIndex, f.resolution))
            .collect();
        candidates.sort();

        let m = self.material_count as u64;
        let mut reclaimed = 0u64;
        for (_, field, resolution) in candidates {
            if reclaimed >= target_bytes {
                break;
            }
            let old_bytes = (resolution as u64).pow(3) * m * 4;
            let new_res = resolution / 2;
            if self.set_resolution(band, field, new_res).is_ok() {
                reclaimed += old_bytes - (new_res as u64).pow(3) * m * 4;
            }
        }
        reclaimed
    }

    // ---- journal ------------------------------------------------------------

    pub fn journal_begin(&mut self) {
        self.journal = Some(UndoJournal::default());
    }

    pub fn journal_take(&mut self) -> Option<UndoJournal> {
        self.journal.take()
    }

    /// Replays a journal in reverse, restoring the pre-transaction samples
    /// and re-deriving field states.
    pub fn journal_rollback(&mut self, band: &mut NarrowBandAllocator, journal: UndoJournal) {
        for (field, mat, snapshot) in journal.entries.into_iter().rev() {
            let f = &self.fields[field as usize];
            if !f.live {
                continue;
            }
            // fields resampled since the snapshot (memory-pressure degrade)
            // cannot take their old samples back
            if snapshot.len() != f.cells() {
                continue;
            }
            let m = self.material_count as usize;
            if let Some(handle) = f.handle {
                let samples = band.samples_mut(handle);
                for (cell, &old) in snapshot.iter().enumerate() {
                    samples[cell * m + mat as usize] = old;
                }
            }
            self.touch(field, mat);
            self.update_state(band, field);
        }
    }

    fn journal_snapshot(&mut self, band: &NarrowBandAllocator, field: FieldIndex, mat: MaterialId) {
        let Some(journal) = self.journal.as_mut() else {
            return;
        };
        if !journal.seen.insert((field, mat)) {
            return;
        }
        let f = &self.fields[field as usize];
        if let Some(handle) = f.handle {
            let m = self.material_count as usize;
            let snapshot: Vec<f32> = band
                .samples(handle)
                .iter()
                .skip(mat as usize)
                .step_by(m)
                .copied()
                .collect();
            journal.entries.push((field, mat, snapshot));
        }
    }

    // ---- sampling -----------------------------------------------------------

    /// Trilinear sample of one channel at a world position. Fields without
    /// storage answer from their state: Empty is far outside, Homogeneous
    /// is inside its primary material and outside every other.
    pub fn evaluate(
        &self,
        band: &NarrowBandAllocator,
        field: FieldIndex,
        world: Point3<f32>,
        mat: MaterialId,
    ) -> f32 {
        let f = &self.fields[field as usize];
        if mat as u32 >= self.material_count {
            return FAR_DISTANCE;
        }
        match f.handle {
            None => match f.state {
                FieldState::Homogeneous(primary) if primary == mat => -FAR_DISTANCE,
                _ => FAR_DISTANCE,
            },
            Some(handle) => {
                trilinear(band.samples(handle), f, self.material_count as usize, world, mat)
            }
        }
    }

    pub fn evaluate_all(
        &self,
        band: &NarrowBandAllocator,
        field: FieldIndex,
        world: Point3<f32>,
    ) -> Vec<f32> {
        (0..self.material_count)
            .map(|mat| self.evaluate(band, field, world, mat as MaterialId))
            .collect()
    }

    /// Direct sample read at grid coordinates.
    pub fn get_distance(
        &self,
        band: &NarrowBandAllocator,
        field: FieldIndex,
        x: u32,
        y: u32,
        z: u32,
        mat: MaterialId,
    ) -> f32 {
        let f = &self.fields[field as usize];
        match f.handle {
            None => match f.state {
                FieldState::Homogeneous(primary) if primary == mat => -FAR_DISTANCE,
                _ => FAR_DISTANCE,
            },
            Some(handle) => {
                let code = morton::encode(x, y, z);
                band.samples(handle)[(code * self.material_count + mat as u32) as usize]
            }
        }
    }

    /// Direct sample write. A no-op on fields without storage.
    pub fn set_distance(
        &mut self,
        band: &mut NarrowBandAllocator,
        field: FieldIndex,
        x: u32,
        y: u32,
        z: u32,
        mat: MaterialId,
        value: f32,
    ) {
        if mat as u32 >= self.material_count {
            warn!("set_distance: material {} out of range", mat);
            return;
        }
        let f = &self.fields[field as usize];
        let Some(handle) = f.handle else {
            return;
        };
        self.journal_snapshot(band, field, mat);
        let code = morton::encode(x, y, z);
        let m = self.material_count;
        band.samples_mut(handle)[(code * m + mat as u32) as usize] = value;
        self.touch(field, mat);
        self.update_state(band, field);
    }

    // ---- sculpting ----------------------------------------------------------

    /// Assigns `value` to every sample of the channel inside the sphere.
    pub fn apply_sphere(
        &mut self,
        band: &mut NarrowBandAllocator,
        scheduler: &dyn WorkScheduler,
        field: FieldIndex,
        center: Point3<f32>,
        radius: f32,
        mat: MaterialId,
        value: f32,
    ) -> VolumeResult<FieldState> {
        self.apply_op(band, scheduler, field, mat, center, radius, move |p, d| {
            if (p - center).magnitude() <= radius {
                value
            } else {
                d
            }
        })
    }

    /// `d <- min(d, (|p - c| - r) * strength)`.
    pub fn union_material(
        &mut self,
        band: &mut NarrowBandAllocator,
        scheduler: &dyn WorkScheduler,
        field: FieldIndex,
        center: Point3<f32>,
        radius: f32,
        mat: MaterialId,
        strength: f32,
    ) -> VolumeResult<FieldState> {
        self.apply_op(band, scheduler, field, mat, center, radius, move |p, d| {
            d.min(((p - center).magnitude() - radius) * strength)
        })
    }

    /// `d <- max(d, (r - |p - c|) * strength)`.
    pub fn subtract_material(
        &mut self,
        band: &mut NarrowBandAllocator,
        scheduler: &dyn WorkScheduler,
        field: FieldIndex,
        center: Point3<f32>,
        radius: f32,
        mat: MaterialId,
        strength: f32,
    ) -> VolumeResult<FieldState> {
        self.apply_op(band, scheduler, field, mat, center, radius, move |p, d| {
            d.max((radius - (p - center).magnitude()) * strength)
        })
    }

    /// `d <- max(d, -(smooth_min(-d, |p-c| - r, k)))` style carve with the
    /// polynomial smooth blend from the interaction model.
    pub fn smooth_subtract_material(
        &mut self,
        band: &mut NarrowBandAllocator,
        scheduler: &dyn WorkScheduler,
        model: &MaterialModel,
        field: FieldIndex,
        center: Point3<f32>,
        radius: f32,
        mat: MaterialId,
        strength: f32,
        smoothing: f32,
    ) -> VolumeResult<FieldState> {
        self.apply_op(band, scheduler, field, mat, center, radius, move |p, d| {
            let sphere = ((p - center).magnitude() - radius) * strength;
            model.combine(
                d,
                -sphere,
                crate::volume::material::BooleanOp::SmoothSubtraction,
                smoothing,
            )
        })
    }

    pub fn smooth_union_material(
        &mut self,
        band: &mut NarrowBandAllocator,
        scheduler: &dyn WorkScheduler,
        model: &MaterialModel,
        field: FieldIndex,
        center: Point3<f32>,
        radius: f32,
        mat: MaterialId,
        strength: f32,
        smoothing: f32,
    ) -> VolumeResult<FieldState> {
        self.apply_op(band, scheduler, field, mat, center, radius, move |p, d| {
            let sphere = ((p - center).magnitude() - radius) * strength;
            model.combine(d, sphere, crate::volume::material::BooleanOp::SmoothUnion, smoothing)
        })
    }

    /// `d <- max(d, (|p - c| - r) * strength)` keeps only the intersection
    /// of the existing channel with the sphere.
    pub fn intersect_material(
        &mut self,
        band: &mut NarrowBandAllocator,
        scheduler: &dyn WorkScheduler,
        field: FieldIndex,
        center: Point3<f32>,
        radius: f32,
        mat: MaterialId,
        strength: f32,
    ) -> VolumeResult<FieldState> {
        self.apply_op(band, scheduler, field, mat, center, radius, move |p, d| {
            d.max(((p - center).magnitude() - radius) * strength)
        })
    }

    /// Crossfades the src and dst channels toward each other, weighted by
    /// `max(0, 1 - |p-c|/r) * factor` shaped through the pair's blend
    /// function.
    #[allow(clippy::too_many_arguments)]
    pub fn blend_materials(
        &mut self,
        band: &mut NarrowBandAllocator,
        scheduler: &dyn WorkScheduler,
        model: &MaterialModel,
        blend: BlendKind,
        field: FieldIndex,
        center: Point3<f32>,
        radius: f32,
        src: MaterialId,
        dst: MaterialId,
        factor: f32,
    ) -> VolumeResult<FieldState> {
        if src as u32 >= self.material_count || dst as u32 >= self.material_count {
            warn!("blend_materials: material pair ({}, {}) out of range", src, dst);
            return Ok(self.fields[field as usize].state);
        }
        if radius <= 0.0 {
            return Err(VolumeError::invalid("blend radius must be positive"));
        }
        self.ensure_storage(band, field)?;

        self.journal_snapshot(band, field, src);
        self.journal_snapshot(band, field, dst);

        let f = self.fields[field as usize].clone();
        let handle = f.handle.expect("storage ensured above");
        let m = self.material_count as usize;
        let (src_i, dst_i) = (src as usize, dst as usize);

        let samples = band.samples_mut(handle);
        let cells = f.cells();
        let base = SendPtr(samples.as_mut_ptr());
        scheduler.run_chunks(0..cells, 64, &|chunk| {
            // force capture of the whole `base` value (not just its `.0`
            // field) so the closure picks up SendPtr's unsafe Sync impl
            let base = &base;
            for code in chunk {
                let (x, y, z) = morton::decode(code as u32);
                let p = f.origin
                    + Vector3::new(x as f32, y as f32, z as f32) * f.cell_size;
                let w = (1.0 - (p - center).magnitude() / radius).max(0.0) * factor;
                if w <= 0.0 {
                    continue;
                }
                // each cell owns its own M-channel group, so writes are disjoint
                unsafe {
                    let cell = base.0.add(code * m);
                    let a = *cell.add(src_i);
                    let b = *cell.add(dst_i);
                    *cell.add(src_i) = model.blend(a, b, blend, w);
                    *cell.add(dst_i) = model.blend(b, a, blend, w);
                }
            }
        });

        self.touch(field, src);
        self.touch(field, dst);
        Ok(self.update_state(band, field))
    }

    /// Resets one channel to far-outside everywhere.
    pub fn clear_material(
        &mut self,
        band: &mut NarrowBandAllocator,
        field: FieldIndex,
        mat: MaterialId,
    ) -> VolumeResult<FieldState> {
        if mat as u32 >= self.material_count {
            return Ok(self.fields[field as usize].state);
        }
        let f = &self.fields[field as usize];
        let Some(handle) = f.handle else {
            return Ok(f.state);
        };
        self.journal_snapshot(band, field, mat);
        let m = self.material_count as usize;
        for s in band.samples_mut(handle).iter_mut().skip(mat as usize).step_by(m) {
            *s = FAR_DISTANCE;
        }
        self.touch(field, mat);
        Ok(self.update_state(band, field))
    }

    /// Fills the node with one material: that channel deep inside, all
    /// others outside.
    pub fn fill_with_material(
        &mut self,
        band: &mut NarrowBandAllocator,
        field: FieldIndex,
        mat: MaterialId,
    ) -> VolumeResult<FieldState> {
        if mat as u32 >= self.material_count {
            return Ok(self.fields[field as usize].state);
        }
        self.ensure_storage(band, field)?;
        let f = &self.fields[field as usize];
        let handle = f.handle.expect("storage ensured above");
        let m = self.material_count as usize;

        for channel in 0..m {
            self.journal_snapshot(band, field, channel as MaterialId);
        }
        let samples = band.samples_mut(handle);
        for (i, s) in samples.iter_mut().enumerate() {
            *s = if i % m == mat as usize { -UNCARVED_DISTANCE } else { UNCARVED_DISTANCE };
        }
        for channel in 0..m {
            self.touch(field, channel as MaterialId);
        }
        Ok(self.update_state(band, field))
    }

    /// Shared sculpt driver: ensures storage, journals the channel, then
    /// maps `op(world_pos, old) -> new` over the sample grid in parallel
    /// chunks. Distance combines write their true influence everywhere in
    /// the field (samples keep real magnitudes across the narrow band);
    /// spatially bounded ops short-circuit per sample.
    fn apply_op(
        &mut self,
        band: &mut NarrowBandAllocator,
        scheduler: &dyn WorkScheduler,
        field: FieldIndex,
        mat: MaterialId,
        _center: Point3<f32>,
        radius: f32,
        op: impl Fn(Point3<f32>, f32) -> f32 + Sync,
    ) -> VolumeResult<FieldState> {
        if mat as u32 >= self.material_count {
            warn!("sculpt: material {} out of range", mat);
            return Ok(self.state(field));
        }
        if radius <= 0.0 || !radius.is_finite() {
            return Err(VolumeError::invalid("sculpt radius must be positive and finite"));
        }
        self.ensure_storage(band, field)?;
        self.journal_snapshot(band, field, mat);

        let f = self.fields[field as usize].clone();
        let handle = f.handle.expect("storage ensured above");
        let m = self.material_count as usize;

        let samples = band.samples_mut(handle);
        let base = SendPtr(samples.as_mut_ptr());
        scheduler.run_chunks(0..f.cells(), 64, &|chunk| {
            // force capture of the whole `base` value (not just its `.0`
            // field) so the closure picks up SendPtr's unsafe Sync impl
            let base = &base;
            for code in chunk {
                let (x, y, z) = morton::decode(code as u32);
                let p = f.origin + Vector3::new(x as f32, y as f32, z as f32) * f.cell_size;
                // one writer per sample slot: cells are unique per chunk set
                unsafe {
                    let slot = base.0.add(code * m + mat as usize);
                    *slot = op(p, *slot);
                }
            }
        });

        self.touch(field, mat);
        Ok(self.update_state(band, field))
    }

    /// Lazily (re-)allocates storage for a field whose backing was
    /// released, rebuilding the constant contents its state implies.
    fn ensure_storage(
        &mut self,
        band: &mut NarrowBandAllocator,
        field: FieldIndex,
    ) -> VolumeResult<()> {
        let f = &self.fields[field as usize];
        if f.handle.is_some() {
            return Ok(());
        }
        let floats = f.cells() as u32 * self.material_count;
        let bounds = f.bounds();
        let primary = f.primary_material;
        let state = f.state;
        let priority = band.region_priority(&bounds);
        let handle = band
            .alloc(floats, primary, priority)
            .ok_or(VolumeError::OutOfMemory { requested: floats as usize * 4 })?;

        let m = self.material_count as usize;
        let samples = band.samples_mut(handle);
        for (i, s) in samples.iter_mut().enumerate() {
            let channel = (i % m) as MaterialId;
            *s = match state {
                FieldState::Homogeneous(primary) if channel == primary => -UNCARVED_DISTANCE,
                _ => UNCARVED_DISTANCE,
            };
        }
        self.fields[field as usize].handle = Some(handle);
        Ok(())
    }

    // ---- state classification ----------------------------------------------

    /// Re-derives the field state from a stride-4 sample of the grid:
    /// which materials are inside anywhere, and whether the inside material
    /// changes between neighboring probes.
    pub fn update_state(
        &mut self,
        band: &NarrowBandAllocator,
        field: FieldIndex,
    ) -> FieldState {
        let f = &self.fields[field as usize];
        let Some(handle) = f.handle else {
            return f.state;
        };
        let samples = band.samples(handle);
        let m = self.material_count as usize;
        let r = f.resolution;

        let probes: Vec<u32> = (0..r).step_by(4).chain(std::iter::once(r - 1)).collect();
        let mut probes = probes;
        probes.dedup();

        let inside_at = |x: u32, y: u32, z: u32| -> Option<MaterialId> {
            let cell = morton::encode(x, y, z) as usize * m;
            let mut best: Option<(f32, MaterialId)> = None;
            for mat in 0..m {
                let d = samples[cell + mat];
                if best.map(|(bd, _)| d < bd).unwrap_or(true) {
                    best = Some((d, mat as MaterialId));
                }
            }
            best.filter(|&(d, _)| d < 0.0).map(|(_, mat)| mat)
        };

        let mut materials = FxHashSet::default();
        let mut boundary = false;
        let mut counts: FxHashMap<MaterialId, u32> = FxHashMap::default();
        let n = probes.len();

        let mut grid = vec![None; n * n * n];
        for (zi, &z) in probes.iter().enumerate() {
            for (yi, &y) in probes.iter().enumerate() {
                for (xi, &x) in probes.iter().enumerate() {
                    let inside = inside_at(x, y, z);
                    grid[(zi * n + yi) * n + xi] = inside;
                    if let Some(mat) = inside {
                        materials.insert(mat);
                        *counts.entry(mat).or_default() += 1;
                    }
                }
            }
        }
        'scan: for zi in 0..n {
            for yi in 0..n {
                for xi in 0..n {
                    let here = grid[(zi * n + yi) * n + xi];
                    if xi + 1 < n && grid[(zi * n + yi) * n + xi + 1] != here
                        || yi + 1 < n && grid[(zi * n + yi + 1) * n + xi] != here
                        || zi + 1 < n && grid[((zi + 1) * n + yi) * n + xi] != here
                    {
                        boundary = true;
                        break 'scan;
                    }
                }
            }
        }

        let new_state = if materials.is_empty() {
            FieldState::Empty
        } else if materials.len() == 1 && !boundary {
            FieldState::Homogeneous(*materials.iter().next().unwrap())
        } else {
            FieldState::Interface
        };

        let primary = counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(&mat, _)| mat)
            .unwrap_or(0);

        let f = &mut self.fields[field as usize];
        if f.state != new_state {
            debug!("field {} state {:?} -> {:?}", field, f.state, new_state);
        }
        f.state = new_state;
        f.primary_material = primary;
        new_state
    }

    // ---- continuity ---------------------------------------------------------

    /// Pull/stretch step: for every neighbor field (not itself mutated)
    /// whose boundary touches a changed field, overwrite the neighbor's
    /// face samples with the changed field's interpolated values so the
    /// surface stays continuous across node seams.
    pub fn pull_boundary_samples(
        &mut self,
        band: &mut NarrowBandAllocator,
        changed: &[FieldIndex],
        neighbors: &[FieldIndex],
        mats: &[MaterialId],
    ) {
        let changed_set: FxHashSet<FieldIndex> = changed.iter().copied().collect();

        for &target in neighbors {
            if changed_set.contains(&target) {
                continue;
            }
            let t = self.fields[target as usize].clone();
            let Some(t_handle) = t.handle else { continue };
            let t_bounds = t.bounds();

            for &source in changed {
                let s_bounds = self.fields[source as usize].bounds();
                if !t_bounds.dilated(t.cell_size * 0.5).intersects(&s_bounds) {
                    continue;
                }

                for &mat in mats {
                    self.journal_snapshot(band, target, mat);
                    let mut touched = false;
                    let r = t.resolution;
                    let m = self.material_count;
                    for code in 0..r.pow(3) {
                        let (x, y, z) = morton::decode(code);
                        let on_face = x == 0 || y == 0 || z == 0 || x == r - 1 || y == r - 1 || z == r - 1;
                        if !on_face {
                            continue;
                        }
                        let p = t.origin + Vector3::new(x as f32, y as f32, z as f32) * t.cell_size;
                        if !s_bounds.dilated(1e-4).contains(p) {
                            continue;
                        }
                        let v = self.evaluate(band, source, p, mat);
                        let t_handle_samples = band.samples_mut(t_handle);
                        t_handle_samples[(code * m + mat as u32) as usize] = v;
                        touched = true;
                    }
                    if touched {
                        self.touch(target, mat);
                    }
                }
            }
            self.update_state(band, target);
        }
    }

    // ---- serialization support ----------------------------------------------

    /// Restores classifier outputs from serialized form.
    pub fn restore_state(&mut self, field: FieldIndex, state: FieldState, primary: MaterialId) {
        let f = &mut self.fields[field as usize];
        f.state = state;
        f.primary_material = primary;
    }

    /// Restores a field's version stamp from serialized form.
    pub fn restore_version(&mut self, field: FieldIndex, version: u64) {
        self.fields[field as usize].version = version;
        self.version = self.version.max(version);
    }

    /// Raw snapshot of the whole sample array (all channels, Morton
    /// order), if the field has storage.
    pub fn read_all_samples(
        &self,
        band: &NarrowBandAllocator,
        field: FieldIndex,
    ) -> Option<Vec<f32>> {
        let f = &self.fields[field as usize];
        f.handle.map(|handle| band.samples(handle).to_vec())
    }

    /// Raw restore of the whole sample array. Skips journaling and the
    /// classifier; callers restore state and version explicitly.
    pub fn write_all_samples(
        &mut self,
        band: &mut NarrowBandAllocator,
        field: FieldIndex,
        samples: &[f32],
    ) -> VolumeResult<()> {
        self.ensure_storage(band, field)?;
        let f = &self.fields[field as usize];
        let expected = f.cells() * self.material_count as usize;
        if samples.len() != expected {
            return Err(VolumeError::corrupted(format!(
                "sample array has {} entries, field holds {}",
                samples.len(),
                expected
            )));
        }
        let handle = f.handle.expect("storage ensured above");
        band.samples_mut(handle).copy_from_slice(samples);
        Ok(())
    }

    /// Full copy of one channel in Morton order, if the field has storage.
    pub fn read_channel(
        &self,
        band: &NarrowBandAllocator,
        field: FieldIndex,
        mat: MaterialId,
    ) -> Option<Vec<f32>> {
        let f = &self.fields[field as usize];
        let handle = f.handle?;
        let m = self.material_count as usize;
        Some(
            band.samples(handle)
                .iter()
                .skip(mat as usize)
                .step_by(m)
                .copied()
                .collect(),
        )
    }

    /// Overwrites one channel from Morton-ordered samples; used when
    /// applying deltas. Journals and reclassifies like any mutation.
    pub fn write_channel(
        &mut self,
        band: &mut NarrowBandAllocator,
        field: FieldIndex,
        mat: MaterialId,
        samples: &[f32],
    ) -> VolumeResult<FieldState> {
        if mat as u32 >= self.material_count {
            return Err(VolumeError::invalid(format!("material {} out of range", mat)));
        }
        self.ensure_storage(band, field)?;
        let f = &self.fields[field as usize];
        if samples.len() != f.cells() {
            return Err(VolumeError::corrupted(format!(
                "channel patch has {} samples, field holds {}",
                samples.len(),
                f.cells()
            )));
        }
        let handle = f.handle.expect("storage ensured above");
        self.journal_snapshot(band, field, mat);

        let m = self.material_count as usize;
        let dst = band.samples_mut(handle);
        for (cell, &v) in samples.iter().enumerate() {
            dst[cell * m + mat as usize] = v;
        }
        self.touch(field, mat);
        Ok(self.update_state(band, field))
    }

    // ---- modification tracking ----------------------------------------------

    fn touch(&mut self, field: FieldIndex, mat: MaterialId) {
        self.version += 1;
        self.fields[field as usize].version = self.version;
        self.mod_log.push((self.version, field, mat));
    }

    /// Distinct (field, material) pairs modified after `version`, in
    /// modification order. O(changes) via binary search on the monotonic log.
    pub fn modified_since(&self, version: u64) -> Vec<(FieldIndex, MaterialId)> {
        let start = self.mod_log.partition_point(|&(v, _, _)| v <= version);
        let mut seen = FxHashSet::default();
        self.mod_log[start..]
            .iter()
            .filter(|&&(_, f, m)| seen.insert((f, m)))
            .map(|&(_, f, m)| (f, m))
            .collect()
    }

    // ---- stats --------------------------------------------------------------

    pub fn field_stats(&self) -> FieldStats {
        let mut stats = FieldStats::default();
        for f in self.fields.iter().filter(|f| f.live) {
            stats.live_fields += 1;
            match f.state {
                FieldState::Empty => stats.empty += 1,
                FieldState::Homogeneous(_) => stats.homogeneous += 1,
                FieldState::Interface => stats.interface += 1,
                FieldState::Unallocated => {}
            }
            if f.handle.is_some() {
                stats.with_storage += 1;
                stats.sample_bytes += f.cells() as u64 * self.material_count as u64 * 4;
            }
        }
        stats
    }

    pub fn memory_usage(&self) -> u64 {
        (self.fields.len() * std::mem::size_of::<Field>()) as u64
            + (self.mod_log.len() * std::mem::size_of::<(u64, FieldIndex, MaterialId)>()) as u64
    }

    pub fn iter_live(&self) -> impl Iterator<Item = FieldIndex> + '_ {
        self.fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.live)
            .map(|(i, _)| i as FieldIndex)
    }
}

struct SendPtr(*mut f32);
unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

/// Trilinear interpolation of one channel at a world position, clamped to
/// the sample grid.
fn trilinear(samples: &[f32], f: &Field, m: usize, world: Point3<f32>, mat: MaterialId) -> f32 {
    let r = f.resolution;
    let local = (world - f.origin) / f.cell_size;
    let clamp = |v: f32| v.clamp(0.0, (r - 1) as f32);
    let (lx, ly, lz) = (clamp(local.x), clamp(local.y), clamp(local.z));

    let x0 = lx.floor() as u32;
    let y0 = ly.floor() as u32;
    let z0 = lz.floor() as u32;
    let x1 = (x0 + 1).min(r - 1);
    let y1 = (y0 + 1).min(r - 1);
    let z1 = (z0 + 1).min(r - 1);
    let (fx, fy, fz) = (lx - x0 as f32, ly - y0 as f32, lz - z0 as f32);

    let at = |x: u32, y: u32, z: u32| -> f32 {
        samples[morton::encode(x, y, z) as usize * m + mat as usize]
    };

    let c00 = at(x0, y0, z0) * (1.0 - fx) + at(x1, y0, z0) * fx;
    let c10 = at(x0, y1, z0) * (1.0 - fx) + at(x1, y1, z0) * fx;
    let c01 = at(x0, y0, z1) * (1.0 - fx) + at(x1, y0, z1) * fx;
    let c11 = at(x0, y1, z1) * (1.0 - fx) + at(x1, y1, z1) * fx;

    let c0 = c00 * (1.0 - fy) + c10 * fy;
    let c1 = c01 * (1.0 - fy) + c11 * fy;

    c0 * (1.0 - fz) + c1 * fz
}

#[cfg(test)]
mod tests {
    use cgmath::Point3;

    use super::*;
    use crate::systems::jobs::SerialScheduler;
    use crate::volume::material::{BlendKind, MaterialModel};

    const M: u32 = 4;

    fn setup() -> (SdfManager, NarrowBandAllocator) {
        (SdfManager::new(M, 1024), NarrowBandAllocator::new(64 * 1024 * 1024))
    }

    fn cube(extent: f32) -> Aabb {
        Aabb::new(
            Point3::new(-extent, -extent, -extent),
            Point3::new(extent, extent, extent),
        )
    }

    /// Unit-spaced grid: with the default resolution of 8, samples land
    /// exactly on integer coordinates, so distances read back exactly.
    fn grid_box() -> Aabb {
        Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(7.0, 7.0, 7.0))
    }

    #[test]
    fn create_initializes_empty_or_filled() {
        let (mut sdf, mut band) = setup();

        let empty = sdf.create_field(&mut band, 1, cube(4.0), FieldOpts::default()).unwrap();
        assert_eq!(sdf.state(empty), FieldState::Empty);
        assert!(sdf.evaluate(&band, empty, Point3::new(0.0, 0.0, 0.0), 0) > 0.0);

        let filled = sdf
            .create_field(
                &mut band,
                2,
                cube(4.0),
                FieldOpts { default_material: 2, initialize_empty: false, ..Default::default() },
            )
            .unwrap();
        assert_eq!(sdf.state(filled), FieldState::Homogeneous(2));
        assert!(sdf.evaluate(&band, filled, Point3::new(0.0, 0.0, 0.0), 2) < 0.0);
        assert!(sdf.evaluate(&band, filled, Point3::new(0.0, 0.0, 0.0), 0) > 0.0);

        assert_eq!(sdf.field_for_node(1), Some(empty));
        assert_eq!(sdf.field_for_node(2), Some(filled));
        assert!(sdf.create_field(&mut band, 1, cube(4.0), FieldOpts::default()).is_err());
    }

    #[test]
    fn union_writes_signed_distances() {
        let (mut sdf, mut band) = setup();
        let field = sdf.create_field(&mut band, 1, grid_box(), FieldOpts::default()).unwrap();
        let c = Point3::new(3.0, 3.0, 3.0);

        let state = sdf.union_material(&mut band, &SerialScheduler, field, c, 2.0, 0, 1.0).unwrap();
        assert_eq!(state, FieldState::Interface);

        // grid-aligned probes read samples back exactly
        assert_eq!(sdf.evaluate(&band, field, c, 0), -2.0);
        assert_eq!(sdf.evaluate(&band, field, Point3::new(5.0, 3.0, 3.0), 0), 0.0);
        assert_eq!(sdf.evaluate(&band, field, Point3::new(6.0, 3.0, 3.0), 0), 1.0);

        // other channels untouched
        assert!(sdf.evaluate(&band, field, c, 1) > 0.0);
    }

    #[test]
    fn subtract_carves_union() {
        let (mut sdf, mut band) = setup();
        let field = sdf.create_field(&mut band, 1, grid_box(), FieldOpts::default()).unwrap();
        let scheduler = SerialScheduler;

        sdf.union_material(&mut band, &scheduler, field, Point3::new(3.0, 3.0, 3.0), 3.0, 0, 1.0)
            .unwrap();
        sdf.subtract_material(&mut band, &scheduler, field, Point3::new(5.0, 3.0, 3.0), 2.0, 0, 1.0)
            .unwrap();

        assert!(sdf.evaluate(&band, field, Point3::new(5.0, 3.0, 3.0), 0) > 0.0);
        assert!(sdf.evaluate(&band, field, Point3::new(1.0, 3.0, 3.0), 0) < 0.0);
    }

    #[test]
    fn out_of_range_material_is_ignored() {
        let (mut sdf, mut band) = setup();
        let field = sdf.create_field(&mut band, 1, cube(4.0), FieldOpts::default()).unwrap();

        let state = sdf
            .union_material(&mut band, &SerialScheduler, field, Point3::new(0.0, 0.0, 0.0), 2.0, 200, 1.0)
            .unwrap();
        assert_eq!(state, FieldState::Empty);
        assert_eq!(sdf.modified_since(0), Vec::new());
    }

    #[test]
    fn classifier_tracks_fill_and_clear() {
        let (mut sdf, mut band) = setup();
        let field = sdf.create_field(&mut band, 1, cube(4.0), FieldOpts::default()).unwrap();

        assert_eq!(sdf.fill_with_material(&mut band, field, 1).unwrap(), FieldState::Homogeneous(1));
        assert_eq!(sdf.clear_material(&mut band, field, 1).unwrap(), FieldState::Empty);
    }

    #[test]
    fn blend_converges_channels() {
        let (mut sdf, mut band) = setup();
        let model = MaterialModel::new(BlendKind::Linear, 0);
        let field = sdf.create_field(&mut band, 1, grid_box(), FieldOpts::default()).unwrap();
        let scheduler = SerialScheduler;
        let p = Point3::new(3.0, 3.0, 3.0);

        sdf.union_material(&mut band, &scheduler, field, p, 3.0, 0, 1.0).unwrap();
        sdf.union_material(&mut band, &scheduler, field, p, 2.0, 1, 1.0).unwrap();
        assert_eq!(sdf.evaluate(&band, field, p, 0), -3.0);
        assert_eq!(sdf.evaluate(&band, field, p, 1), -2.0);

        // at the center the falloff weight is exactly `factor`, so a 0.5
        // crossfade meets in the middle
        sdf.blend_materials(&mut band, &scheduler, &model, BlendKind::Linear, field, p, 3.0, 0, 1, 0.5)
            .unwrap();
        let a = sdf.evaluate(&band, field, p, 0);
        let b = sdf.evaluate(&band, field, p, 1);
        assert!((a - b).abs() < 1e-3, "{} vs {}", a, b);
        assert!((a + 2.5).abs() < 1e-3, "midpoint {}", a);
    }

    #[test]
    fn journal_rollback_restores_samples() {
        let (mut sdf, mut band) = setup();
        let field = sdf.create_field(&mut band, 1, grid_box(), FieldOpts::default()).unwrap();
        let scheduler = SerialScheduler;
        let p = Point3::new(3.0, 3.0, 3.0);

        sdf.union_material(&mut band, &scheduler, field, p, 3.0, 0, 1.0).unwrap();
        let before = sdf.evaluate(&band, field, p, 0);
        let version_before = sdf.version();

        sdf.journal_begin();
        sdf.subtract_material(&mut band, &scheduler, field, p, 5.0, 0, 1.0).unwrap();
        assert!(sdf.evaluate(&band, field, p, 0) > 0.0);

        let journal = sdf.journal_take().unwrap();
        sdf.journal_rollback(&mut band, journal);

        assert_eq!(sdf.evaluate(&band, field, p, 0), before);
        assert_eq!(sdf.state(field), FieldState::Interface);
        assert!(sdf.version() > version_before);
    }

    #[test]
    fn modified_since_reports_changes_in_order() {
        let (mut sdf, mut band) = setup();
        let f1 = sdf.create_field(&mut band, 1, cube(4.0), FieldOpts::default()).unwrap();
        let f2 = sdf.create_field(&mut band, 2, cube(4.0), FieldOpts::default()).unwrap();
        let scheduler = SerialScheduler;
        let p = Point3::new(0.0, 0.0, 0.0);

        let v0 = sdf.version();
        sdf.union_material(&mut band, &scheduler, f1, p, 2.0, 0, 1.0).unwrap();
        let v1 = sdf.version();
        sdf.union_material(&mut band, &scheduler, f2, p, 2.0, 1, 1.0).unwrap();
        sdf.union_material(&mut band, &scheduler, f1, p, 1.0, 0, 1.0).unwrap();

        assert_eq!(sdf.modified_since(v0), vec![(f1, 0), (f2, 1)]);
        assert_eq!(sdf.modified_since(v1), vec![(f2, 1), (f1, 0)]);
        assert_eq!(sdf.modified_since(sdf.version()), Vec::new());
    }

    #[test]
    fn storage_release_keeps_constant_answers() {
        let (mut sdf, mut band) = setup();
        let field = sdf
            .create_field(
                &mut band,
                1,
                cube(4.0),
                FieldOpts { default_material: 1, initialize_empty: false, ..Default::default() },
            )
            .unwrap();

        sdf.release_storage(&mut band, field);
        assert!(!sdf.has_storage(field));
        assert_eq!(sdf.state(field), FieldState::Homogeneous(1));
        assert_eq!(sdf.evaluate(&band, field, Point3::new(0.0, 0.0, 0.0), 1), -FAR_DISTANCE);
        assert_eq!(sdf.evaluate(&band, field, Point3::new(0.0, 0.0, 0.0), 0), FAR_DISTANCE);

        // allocate-on-write: sculpting re-creates backing storage
        sdf.union_material(&mut band, &SerialScheduler, field, Point3::new(0.0, 0.0, 0.0), 1.0, 0, 1.0)
            .unwrap();
        assert!(sdf.has_storage(field));
        assert!(sdf.evaluate(&band, field, Point3::new(0.0, 0.0, 0.0), 1) < 0.0);
    }

    #[test]
    fn set_distance_is_noop_without_storage() {
        let (mut sdf, mut band) = setup();
        let field = sdf.create_field(&mut band, 1, cube(4.0), FieldOpts::default()).unwrap();
        sdf.release_storage(&mut band, field);

        sdf.set_distance(&mut band, field, 0, 0, 0, 0, -5.0);
        assert!(!sdf.has_storage(field));
        assert_eq!(sdf.evaluate(&band, field, Point3::new(-4.0, -4.0, -4.0), 0), FAR_DISTANCE);
    }

    #[test]
    fn resample_preserves_surface() {
        let (mut sdf, mut band) = setup();
        let field = sdf
            .create_field(&mut band, 1, grid_box(), FieldOpts { resolution: 16, ..Default::default() })
            .unwrap();
        let p = Point3::new(3.0, 3.0, 3.0);
        let probe = Point3::new(3.0, 3.0, 1.0);

        sdf.union_material(&mut band, &SerialScheduler, field, p, 2.0, 0, 1.0).unwrap();
        let before = sdf.evaluate(&band, field, probe, 0);

        sdf.set_resolution(&mut band, field, 8).unwrap();
        assert_eq!(sdf.resolution(field), 8);
        let after = sdf.evaluate(&band, field, probe, 0);
        assert!((before - after).abs() < 0.5, "{} vs {}", before, after);
    }

    #[test]
    fn boundary_pull_keeps_seams_continuous() {
        let (mut sdf, mut band) = setup();
        // two side-by-side nodes sharing the x = 0 face
        let left = sdf
            .create_field(
                &mut band,
                1,
                Aabb::new(Point3::new(-8.0, -4.0, -4.0), Point3::new(0.0, 4.0, 4.0)),
                FieldOpts::default(),
            )
            .unwrap();
        let right = sdf
            .create_field(
                &mut band,
                2,
                Aabb::new(Point3::new(0.0, -4.0, -4.0), Point3::new(8.0, 4.0, 4.0)),
                FieldOpts::default(),
            )
            .unwrap();

        // sculpt only the left node, overlapping the shared face
        sdf.union_material(&mut band, &SerialScheduler, left, Point3::new(-1.0, 0.0, 0.0), 3.0, 0, 1.0)
            .unwrap();
        sdf.pull_boundary_samples(&mut band, &[left], &[right], &[0]);

        let seam = Point3::new(0.0, 0.0, 0.0);
        let from_left = sdf.evaluate(&band, left, seam, 0);
        let from_right = sdf.evaluate(&band, right, seam, 0);
        assert!((from_left - from_right).abs() < 1e-3, "{} vs {}", from_left, from_right);
        assert!(from_right < 0.0);
    }

    #[test]
    fn degrade_halves_lowest_priority_interfaces() {
        let (mut sdf, mut band) = setup();
        let f1 = sdf
            .create_field(&mut band, 1, cube(4.0), FieldOpts { resolution: 16, ..Default::default() })
            .unwrap();
        let f2 = sdf
            .create_field(&mut band, 2, cube(4.0), FieldOpts { resolution: 16, ..Default::default() })
            .unwrap();
        let scheduler = SerialScheduler;
        let p = Point3::new(0.0, 0.0, 0.0);
        sdf.union_material(&mut band, &scheduler, f1, p, 3.0, 0, 1.0).unwrap();
        sdf.union_material(&mut band, &scheduler, f2, p, 3.0, 0, 1.0).unwrap();

        // node 1 is low priority, node 2 high
        let reclaimed = sdf.degrade_interface_fields(&mut band, 1, &|node| if node == 1 { 0 } else { 9 });
        assert!(reclaimed > 0);
        assert_eq!(sdf.resolution(f1), 8);
        assert_eq!(sdf.resolution(f2), 16);
    }

    #[test]
    fn release_returns_slot_to_free_list() {
        let (mut sdf, mut band) = setup();
        let field = sdf.create_field(&mut band, 1, cube(4.0), FieldOpts::default()).unwrap();

        sdf.release(&mut band, field);
        assert_eq!(sdf.state(field), FieldState::Unallocated);
        assert_eq!(sdf.field_for_node(1), None);

        let again = sdf.create_field(&mut band, 3, cube(4.0), FieldOpts::default()).unwrap();
        assert_eq!(again, field);
    }
}
