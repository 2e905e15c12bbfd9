use log::{debug, warn};
use rustc_hash::FxHashMap;

use crate::volume::bounds::Aabb;
use crate::volume::material::MaterialId;

/// Samples per block: 1 MiB of f32 data.
pub const BLOCK_FLOATS: u32 = 1 << 18;
/// Smallest chunk handed out: 64 bytes.
pub const MIN_CHUNK_FLOATS: u32 = 16;
/// Largest size-classed chunk: 4 KiB. Bigger requests take a contiguous run.
pub const MAX_CHUNK_FLOATS: u32 = 1024;
/// Chunk offsets stay multiples of 4 floats (16 bytes) for vector loads.
pub const ALIGN_FLOATS: u32 = 4;

/// Handle to a live chunk inside the allocator. Stands in for the raw
/// pointer of a classic pool: the owning field stores the handle and asks
/// the allocator for slices on demand.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BandHandle {
    pub block: u32,
    pub offset: u32,
    pub len: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct FreeChunk {
    offset: u32,
    len: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct UsedChunk {
    len: u32,
    priority: u8,
    allocated_at: u64,
}

struct BandBlock {
    data: Vec<f32>,
    material: MaterialId,
    free: Vec<FreeChunk>,
    used: FxHashMap<u32, UsedChunk>,
    used_floats: u32,
}

impl BandBlock {
    fn new(material: MaterialId, capacity: u32) -> BandBlock {
        BandBlock {
            data: vec![0.0; capacity as usize],
            material,
            free: vec![FreeChunk { offset: 0, len: capacity }],
            used: FxHashMap::default(),
            used_floats: 0,
        }
    }

    fn capacity(&self) -> u32 {
        self.data.len() as u32
    }

    fn is_unused(&self) -> bool {
        self.used.is_empty()
    }

    /// Highest priority among live chunks; eviction spares high values.
    fn priority(&self) -> u8 {
        self.used.values().map(|c| c.priority).max().unwrap_or(0)
    }

    /// First-fit allocation within this block's free ranges.
    fn take(&mut self, len: u32, priority: u8, clock: u64) -> Option<u32> {
        let slot = self.free.iter().position(|c| c.len >= len)?;
        let chunk = self.free[slot];

        if chunk.len == len {
            self.free.remove(slot);
        } else {
            self.free[slot] = FreeChunk { offset: chunk.offset + len, len: chunk.len - len };
        }

        self.used.insert(chunk.offset, UsedChunk { len, priority, allocated_at: clock });
        self.used_floats += len;
        Some(chunk.offset)
    }

    /// Returns the chunk at `offset` to the free list, coalescing with
    /// adjacent free ranges.
    fn give_back(&mut self, offset: u32) -> bool {
        let Some(chunk) = self.used.remove(&offset) else {
            return false;
        };
        self.used_floats -= chunk.len;

        let at = self.free.partition_point(|c| c.offset < offset);
        self.free.insert(at, FreeChunk { offset, len: chunk.len });

        // coalesce with the right neighbor, then the left
        if at + 1 < self.free.len() && self.free[at].offset + self.free[at].len == self.free[at + 1].offset {
            self.free[at].len += self.free[at + 1].len;
            self.free.remove(at + 1);
        }
        if at > 0 && self.free[at - 1].offset + self.free[at - 1].len == self.free[at].offset {
            self.free[at - 1].len += self.free[at].len;
            self.free.remove(at);
        }
        true
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct BandStats {
    pub allocated_bytes: u64,
    pub used_bytes: u64,
    pub block_count: u32,
    pub free_chunks: u32,
    pub allocation_count: u64,
    /// used / allocated; 1.0 for an empty allocator.
    pub fragmentation: f32,
}

/// Block-pool allocator for SDF sample data near material interfaces.
/// Hands out [`BandHandle`]s into per-material blocks; low-priority free
/// blocks are evicted when the budget tightens. Never panics on
/// exhaustion: `alloc` returns `None` and the caller degrades.
pub struct NarrowBandAllocator {
    blocks: Vec<Option<BandBlock>>,
    pools: FxHashMap<MaterialId, Vec<u32>>,
    priority_regions: Vec<(Aabb, u8)>,
    budget_floats: u64,
    allocation_count: u64,
    clock: u64,
}

impl NarrowBandAllocator {
    pub fn new(budget_bytes: u64) -> NarrowBandAllocator {
        NarrowBandAllocator {
            blocks: Vec::new(),
            pools: FxHashMap::default(),
            priority_regions: Vec::new(),
            budget_floats: budget_bytes / 4,
            allocation_count: 0,
            clock: 0,
        }
    }

    /// Rounds a request up to its size class: power-of-two between the min
    /// and max chunk size, aligned contiguous run above the max.
    fn class_of(len: u32) -> u32 {
        if len <= MAX_CHUNK_FLOATS {
            len.max(MIN_CHUNK_FLOATS).next_power_of_two()
        } else {
            (len + ALIGN_FLOATS - 1) / ALIGN_FLOATS * ALIGN_FLOATS
        }
    }

    /// Allocates `len` floats for `material`. Tries a free chunk in the
    /// material's pool, then a fresh block, then eviction of low-priority
    /// unused blocks. Returns `None` once the budget is truly exhausted.
    pub fn alloc(&mut self, len: u32, material: MaterialId, priority: u8) -> Option<BandHandle> {
        if len == 0 {
            return None;
        }
        let len = Self::class_of(len);
        self.clock += 1;

        // reuse path: any block of this material with a fitting free chunk
        let pool = self.pools.entry(material).or_default().clone();
        for &block_idx in &pool {
            if let Some(block) = self.blocks[block_idx as usize].as_mut() {
                if let Some(offset) = block.take(len, priority, self.clock) {
                    self.allocation_count += 1;
                    return Some(BandHandle { block: block_idx, offset, len });
                }
            }
        }

        // fresh block path
        let capacity = BLOCK_FLOATS.max(len);
        if self.allocated_floats() + capacity as u64 > self.budget_floats {
            self.evict_unused_blocks(capacity as u64);
        }
        if self.allocated_floats() + capacity as u64 > self.budget_floats {
            debug!(
                "narrow-band budget exhausted: {} floats requested, {} of {} in use",
                len,
                self.allocated_floats(),
                self.budget_floats
            );
            return None;
        }

        let block_idx = self.insert_block(BandBlock::new(material, capacity));
        self.pools.entry(material).or_default().push(block_idx);

        let block = self.blocks[block_idx as usize].as_mut().unwrap();
        let offset = block.take(len, priority, self.clock)?;
        self.allocation_count += 1;
        debug!("narrow-band block {} allocated for material {}", block_idx, material);
        Some(BandHandle { block: block_idx, offset, len })
    }

    /// Frees a previously allocated chunk. Freeing a handle the allocator
    /// does not own is a logged no-op.
    pub fn free(&mut self, handle: BandHandle) {
        let Some(block) = self.blocks.get_mut(handle.block as usize).and_then(Option::as_mut)
        else {
            warn!("free of foreign narrow-band handle {:?}", handle);
            return;
        };
        if !block.give_back(handle.offset) {
            warn!("free of foreign narrow-band handle {:?}", handle);
        }
    }

    /// Grows or shrinks a chunk, preserving the overlapping prefix.
    pub fn reallocate(&mut self, handle: BandHandle, new_len: u32) -> Option<BandHandle> {
        if !self.own(handle) {
            return None;
        }
        let material = self.blocks[handle.block as usize].as_ref().unwrap().material;
        let priority = self.chunk_priority(handle).unwrap_or(0);

        let new = self.alloc(new_len, material, priority)?;
        let copy = handle.len.min(new.len) as usize;

        // handles never alias, but the two chunks may share a block
        let old_samples: Vec<f32> = self.samples(handle)[..copy].to_vec();
        self.samples_mut(new)[..copy].copy_from_slice(&old_samples);

        self.free(handle);
        Some(new)
    }

    /// Sample slice behind a handle. Panics on a foreign handle; callers
    /// hold handles only for chunks they own.
    pub fn samples(&self, handle: BandHandle) -> &[f32] {
        let block = self.blocks[handle.block as usize].as_ref().expect("released block");
        &block.data[handle.offset as usize..(handle.offset + handle.len) as usize]
    }

    pub fn samples_mut(&mut self, handle: BandHandle) -> &mut [f32] {
        let block = self.blocks[handle.block as usize].as_mut().expect("released block");
        &mut block.data[handle.offset as usize..(handle.offset + handle.len) as usize]
    }

    pub fn own(&self, handle: BandHandle) -> bool {
        self.blocks
            .get(handle.block as usize)
            .and_then(Option::as_ref)
            .map(|b| b.used.get(&handle.offset).map(|c| c.len) == Some(handle.len))
            .unwrap_or(false)
    }

    /// Tags a region so that chunks allocated inside it inherit `priority`
    /// and eviction spares them.
    pub fn prioritize(&mut self, region: Aabb, priority: u8) {
        self.priority_regions.retain(|(r, _)| *r != region);
        self.priority_regions.push((region, priority));
    }

    /// Priority a chunk allocated for data at `position_box` should get.
    pub fn region_priority(&self, position_box: &Aabb) -> u8 {
        self.priority_regions
            .iter()
            .filter(|(r, _)| r.intersects(position_box))
            .map(|&(_, p)| p)
            .max()
            .unwrap_or(0)
    }

    /// Re-tags a live chunk, e.g. after `prioritize` covers its field.
    pub fn set_chunk_priority(&mut self, handle: BandHandle, priority: u8) {
        if let Some(block) = self.blocks.get_mut(handle.block as usize).and_then(Option::as_mut) {
            if let Some(chunk) = block.used.get_mut(&handle.offset) {
                chunk.priority = priority;
            }
        }
    }

    /// Warms a pool so the first sculpt into a new material does not pay
    /// for block allocation.
    pub fn preallocate(&mut self, material: MaterialId, floats: u32) {
        let mut have = 0u64;
        if let Some(pool) = self.pools.get(&material) {
            for &idx in pool {
                if let Some(block) = self.blocks[idx as usize].as_ref() {
                    have += (block.capacity() - block.used_floats) as u64;
                }
            }
        }
        while have < floats as u64 && self.allocated_floats() + BLOCK_FLOATS as u64 <= self.budget_floats {
            let idx = self.insert_block(BandBlock::new(material, BLOCK_FLOATS));
            self.pools.entry(material).or_default().push(idx);
            have += BLOCK_FLOATS as u64;
        }
    }

    /// Releases fully-free blocks down to the keep-floor: at least five
    /// blocks, or twice the number of blocks with live data.
    pub fn compact(&mut self) {
        let used_blocks = self.live_blocks().filter(|(_, b)| !b.is_unused()).count() as u32;
        let floor = (used_blocks * 2).max(5);
        self.release_free_blocks_above(floor);
    }

    /// Releases every fully-free block regardless of the keep-floor.
    pub fn release_unused(&mut self) {
        self.release_free_blocks_above(0);
    }

    /// Repacks live chunks into the smallest number of blocks per material.
    /// Returns the relocated handle pairs so owning field tables can patch
    /// themselves; addresses are stable outside this call.
    pub fn defragment(&mut self) -> Vec<(BandHandle, BandHandle)> {
        let mut moves = Vec::new();
        let materials: Vec<MaterialId> = self.pools.keys().copied().collect();

        for material in materials {
            let pool = self.pools.get(&material).cloned().unwrap_or_default();

            // gather live chunks, oldest first, then re-pack front-to-back
            let mut live: Vec<(BandHandle, u8, u64, Vec<f32>)> = Vec::new();
            for &idx in &pool {
                if let Some(block) = self.blocks[idx as usize].as_mut() {
                    let offsets: Vec<u32> = block.used.keys().copied().collect();
                    for offset in offsets {
                        let chunk = block.used[&offset];
                        let data = block.data
                            [offset as usize..(offset + chunk.len) as usize]
                            .to_vec();
                        live.push((
                            BandHandle { block: idx, offset, len: chunk.len },
                            chunk.priority,
                            chunk.allocated_at,
                            data,
                        ));
                        block.give_back(offset);
                    }
                }
            }
            live.sort_by_key(|&(_, _, at, _)| at);

            for (old, priority, at, data) in live {
                let mut placed = None;
                for &idx in &pool {
                    if let Some(block) = self.blocks[idx as usize].as_mut() {
                        if let Some(offset) = block.take(old.len, priority, at) {
                            placed = Some(BandHandle { block: idx, offset, len: old.len });
                            break;
                        }
                    }
                }
                let new = placed.expect("defragment lost capacity");
                self.samples_mut(new).copy_from_slice(&data);
                if new != old {
                    moves.push((old, new));
                }
            }
        }

        self.release_unused();
        if !moves.is_empty() {
            debug!("defragment relocated {} chunks", moves.len());
        }
        moves
    }

    pub fn stats(&self) -> BandStats {
        let allocated = self.allocated_floats() * 4;
        let used: u64 = self.live_blocks().map(|(_, b)| b.used_floats as u64 * 4).sum();
        let free_chunks = self.live_blocks().map(|(_, b)| b.free.len() as u32).sum();
        BandStats {
            allocated_bytes: allocated,
            used_bytes: used,
            block_count: self.live_blocks().count() as u32,
            free_chunks,
            allocation_count: self.allocation_count,
            fragmentation: if allocated == 0 { 1.0 } else { used as f32 / allocated as f32 },
        }
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget_floats * 4
    }

    /// Walks block metadata; inconsistencies here mean the structure has
    /// been corrupted and the volume cannot continue.
    pub fn validate(&self) {
        for (idx, block) in self.live_blocks() {
            let mut total = 0u64;
            for chunk in &block.free {
                assert!(
                    chunk.offset + chunk.len <= block.capacity(),
                    "free chunk out of range in block {}",
                    idx
                );
                total += chunk.len as u64;
            }
            for (&offset, chunk) in &block.used {
                assert!(
                    offset + chunk.len <= block.capacity(),
                    "used chunk out of range in block {}",
                    idx
                );
                total += chunk.len as u64;
            }
            assert_eq!(total, block.capacity() as u64, "chunk accounting broken in block {}", idx);
        }
    }

    fn insert_block(&mut self, block: BandBlock) -> u32 {
        if let Some(slot) = self.blocks.iter().position(Option::is_none) {
            self.blocks[slot] = Some(block);
            slot as u32
        } else {
            self.blocks.push(Some(block));
            (self.blocks.len() - 1) as u32
        }
    }

    fn live_blocks(&self) -> impl Iterator<Item = (u32, &BandBlock)> {
        self.blocks
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.as_ref().map(|b| (i as u32, b)))
    }

    fn allocated_floats(&self) -> u64 {
        self.live_blocks().map(|(_, b)| b.capacity() as u64).sum()
    }

    /// Priority tag of a live chunk; `None` for a foreign handle.
    pub fn chunk_priority(&self, handle: BandHandle) -> Option<u8> {
        self.blocks.get(handle.block as usize)?
            .as_ref()?
            .used
            .get(&handle.offset)
            .map(|c| c.priority)
    }

    /// Drops fully-free blocks, lowest priority first, while more than
    /// `floor` blocks remain (or until `needed` floats are reclaimed when
    /// called from the eviction path).
    fn release_free_blocks_above(&mut self, floor: u32) {
        let mut candidates: Vec<(u32, u8)> = self
            .live_blocks()
            .filter(|(_, b)| b.is_unused())
            .map(|(i, b)| (i, b.priority()))
            .collect();
        candidates.sort_by_key(|&(_, p)| p);

        let mut remaining = self.live_blocks().count() as u32;
        for (idx, _) in candidates {
            if remaining <= floor {
                break;
            }
            self.drop_block(idx);
            remaining -= 1;
        }
    }

    fn evict_unused_blocks(&mut self, needed_floats: u64) {
        let used_blocks = self.live_blocks().filter(|(_, b)| !b.is_unused()).count() as u32;
        let floor = (used_blocks * 2).max(5);

        let mut candidates: Vec<(u32, u8, u32)> = self
            .live_blocks()
            .filter(|(_, b)| b.is_unused())
            .map(|(i, b)| (i, b.priority(), b.capacity()))
            .collect();
        candidates.sort_by_key(|&(_, p, _)| p);

        let mut remaining = self.live_blocks().count() as u32;
        let mut reclaimed = 0u64;
        for (idx, _, capacity) in candidates {
            if remaining <= floor || reclaimed >= needed_floats {
                break;
            }
            debug!("evicting narrow-band block {}", idx);
            self.drop_block(idx);
            remaining -= 1;
            reclaimed += capacity as u64;
        }
    }

    fn drop_block(&mut self, idx: u32) {
        if let Some(block) = self.blocks[idx as usize].take() {
            if let Some(pool) = self.pools.get_mut(&block.material) {
                pool.retain(|&i| i != idx);
            }
        }
    }
}
