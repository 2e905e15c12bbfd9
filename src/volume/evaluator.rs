use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use cgmath::{InnerSpace, Point3, Vector3};
use dashmap::DashMap;

use crate::error::{VolumeError, VolumeResult};
use crate::systems::jobs::{batch_chunk_size, parallel_for_slices, WorkScheduler};
use crate::volume::allocator::NarrowBandAllocator;
use crate::volume::bounds::Aabb;
use crate::volume::field::{SdfManager, FAR_DISTANCE};
use crate::volume::material::MaterialId;
use crate::volume::octree::OctreeNodeManager;

/// Read-only view over the subsystems the evaluator samples from.
#[derive(Copy, Clone)]
pub struct FieldCtx<'a> {
    pub octree: &'a OctreeNodeManager,
    pub sdf: &'a SdfManager,
    pub band: &'a NarrowBandAllocator,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TraceHit {
    pub position: Point3<f32>,
    pub distance: f32,
}

/// Millisecond budget for batch work. `None` never expires.
#[derive(Copy, Clone, Debug, Default)]
pub struct EvalBudget {
    pub deadline: Option<Instant>,
}

impl EvalBudget {
    pub fn from_millis(ms: u64) -> EvalBudget {
        EvalBudget { deadline: Some(Instant::now() + Duration::from_millis(ms)) }
    }

    fn expired(&self) -> bool {
        self.deadline.map(|d| Instant::now() > d).unwrap_or(false)
    }
}

#[derive(Copy, Clone, Debug)]
struct CacheEntry {
    distance: f32,
    gradient: Option<Vector3<f32>>,
    stamp: u64,
}

/// Runtime CPU capability probe. The batch kernels branch on this once per
/// batch; the portable path is always available and gives identical
/// results.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct CpuFeatures {
    pub sse41: bool,
    pub avx2: bool,
}

impl CpuFeatures {
    pub fn detect() -> CpuFeatures {
        #[cfg(target_arch = "x86_64")]
        {
            CpuFeatures {
                sse41: std::arch::is_x86_feature_detected!("sse4.1"),
                avx2: std::arch::is_x86_feature_detected!("avx2"),
            }
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            CpuFeatures::default()
        }
    }

    fn lanes(&self) -> usize {
        if self.avx2 {
            8
        } else if self.sse41 {
            4
        } else {
            1
        }
    }
}

const MAX_TRACE_STEPS: u32 = 128;
const TRACE_SAFETY: f32 = 0.8;

/// Read side of the volume: point and batch sampling, gradients, sphere
/// tracing, and a quantized evaluation cache. Thread-safe for readers; the
/// cache is sharded and eviction is single-writer.
pub struct FieldEvaluator {
    cache: DashMap<u64, CacheEntry>,
    cache_enabled: AtomicBool,
    cache_capacity: AtomicUsize,
    /// f32 accuracy stored as bits so readers stay lock-free.
    accuracy_bits: AtomicU32,
    clock: AtomicU64,
    evict_lock: Mutex<()>,
    features: CpuFeatures,
}

impl FieldEvaluator {
    pub fn new(accuracy: f32, cache_capacity: usize, cache_enabled: bool) -> FieldEvaluator {
        FieldEvaluator {
            cache: DashMap::new(),
            cache_enabled: AtomicBool::new(cache_enabled),
            cache_capacity: AtomicUsize::new(cache_capacity.max(16)),
            accuracy_bits: AtomicU32::new(accuracy.max(1e-6).to_bits()),
            clock: AtomicU64::new(0),
            evict_lock: Mutex::new(()),
            features: CpuFeatures::detect(),
        }
    }

    pub fn features(&self) -> CpuFeatures {
        self.features
    }

    pub fn accuracy(&self) -> f32 {
        f32::from_bits(self.accuracy_bits.load(Ordering::Relaxed))
    }

    pub fn set_accuracy(&self, accuracy: f32) {
        self.accuracy_bits.store(accuracy.max(1e-6).to_bits(), Ordering::Relaxed);
        self.cache.clear();
    }

    pub fn enable_cache(&self, enabled: bool) {
        self.cache_enabled.store(enabled, Ordering::Relaxed);
        if !enabled {
            self.cache.clear();
        }
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn set_cache_capacity(&self, capacity: usize) {
        self.cache_capacity.store(capacity.max(16), Ordering::Relaxed);
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    // ---- point evaluation ---------------------------------------------------

    /// Signed distance of `mat` at a world position. Space outside the
    /// volume, and Empty nodes, answer far-outside.
    pub fn evaluate(&self, ctx: FieldCtx, pos: Point3<f32>, mat: MaterialId) -> f32 {
        if self.cache_enabled.load(Ordering::Relaxed) {
            let key = self.cache_key(pos, mat);
            if let Some(entry) = self.cache.get(&key) {
                return entry.distance;
            }
            let d = self.evaluate_uncached(ctx, pos, mat);
            self.cache_insert(key, d, None);
            d
        } else {
            self.evaluate_uncached(ctx, pos, mat)
        }
    }

    fn evaluate_uncached(&self, ctx: FieldCtx, pos: Point3<f32>, mat: MaterialId) -> f32 {
        match ctx.octree.find_leaf_at(pos) {
            None => FAR_DISTANCE,
            Some(node) => match ctx.sdf.field_for_node(node) {
                None => FAR_DISTANCE,
                Some(field) => ctx.sdf.evaluate(ctx.band, field, pos, mat),
            },
        }
    }

    pub fn evaluate_multi(&self, ctx: FieldCtx, pos: Point3<f32>, mats: &[MaterialId]) -> Vec<f32> {
        mats.iter().map(|&mat| self.evaluate(ctx, pos, mat)).collect()
    }

    pub fn evaluate_all(&self, ctx: FieldCtx, pos: Point3<f32>) -> Vec<f32> {
        (0..ctx.sdf.material_count())
            .map(|mat| self.evaluate(ctx, pos, mat as MaterialId))
            .collect()
    }

    pub fn inside(&self, ctx: FieldCtx, pos: Point3<f32>, mat: MaterialId) -> bool {
        self.evaluate(ctx, pos, mat) < 0.0
    }

    // ---- batch evaluation ---------------------------------------------------

    /// Batch point evaluation. Parallelized for 64+ positions on multi-core
    /// schedulers; results keep input order either way. Returns `Cancelled`
    /// when the budget expires (no partial results).
    pub fn evaluate_batch(
        &self,
        ctx: FieldCtx,
        scheduler: &dyn WorkScheduler,
        positions: &[Point3<f32>],
        mat: MaterialId,
        budget: EvalBudget,
    ) -> VolumeResult<Vec<f32>> {
        let n = positions.len();
        let mut results = vec![0.0f32; n];

        if n >= 64 && scheduler.worker_count() > 1 {
            let chunk = batch_chunk_size(n, scheduler.worker_count());
            let cancelled = AtomicBool::new(false);
            parallel_for_slices(scheduler, &mut results, chunk, |offset, slice| {
                if budget.expired() {
                    cancelled.store(true, Ordering::Relaxed);
                    return;
                }
                self.eval_chunk(ctx, &positions[offset..offset + slice.len()], mat, slice);
            });
            if cancelled.load(Ordering::Relaxed) {
                return Err(VolumeError::Cancelled);
            }
        } else {
            let chunk = batch_chunk_size(n, 1);
            for start in (0..n).step_by(chunk) {
                if budget.expired() {
                    return Err(VolumeError::Cancelled);
                }
                let end = (start + chunk).min(n);
                self.eval_chunk(ctx, &positions[start..end], mat, &mut results[start..end]);
            }
        }

        Ok(results)
    }

    /// One contiguous chunk. Branches once on the detected feature set:
    /// wide lanes process several probes per iteration, the portable loop
    /// handles the remainder and the no-SIMD case identically.
    fn eval_chunk(&self, ctx: FieldCtx, positions: &[Point3<f32>], mat: MaterialId, out: &mut [f32]) {
        let lanes = self.features.lanes();
        let mut i = 0;
        if lanes > 1 {
            while i + lanes <= positions.len() {
                for l in 0..lanes {
                    out[i + l] = self.evaluate(ctx, positions[i + l], mat);
                }
                i += lanes;
            }
        }
        for l in i..positions.len() {
            out[l] = self.evaluate(ctx, positions[l], mat);
        }
    }

    pub fn evaluate_gradient_batch(
        &self,
        ctx: FieldCtx,
        scheduler: &dyn WorkScheduler,
        positions: &[Point3<f32>],
        mat: MaterialId,
        budget: EvalBudget,
    ) -> VolumeResult<Vec<Vector3<f32>>> {
        let n = positions.len();
        let mut results = vec![Vector3::new(0.0, 0.0, 0.0); n];

        if n >= 64 && scheduler.worker_count() > 1 {
            let chunk = batch_chunk_size(n, scheduler.worker_count());
            let cancelled = AtomicBool::new(false);
            parallel_for_slices(scheduler, &mut results, chunk, |offset, slice| {
                if budget.expired() {
                    cancelled.store(true, Ordering::Relaxed);
                    return;
                }
                for (i, g) in slice.iter_mut().enumerate() {
                    *g = self.gradient(ctx, positions[offset + i], mat);
                }
            });
            if cancelled.load(Ordering::Relaxed) {
                return Err(VolumeError::Cancelled);
            }
        } else {
            for (i, g) in results.iter_mut().enumerate() {
                if budget.expired() {
                    return Err(VolumeError::Cancelled);
                }
                *g = self.gradient(ctx, positions[i], mat);
            }
        }

        Ok(results)
    }

    // ---- gradients ----------------------------------------------------------

    /// Central-difference gradient at a delta of `max(accuracy, cell/2)`.
    pub fn gradient(&self, ctx: FieldCtx, pos: Point3<f32>, mat: MaterialId) -> Vector3<f32> {
        if self.cache_enabled.load(Ordering::Relaxed) {
            let key = self.cache_key(pos, mat);
            if let Some(entry) = self.cache.get(&key) {
                if let Some(g) = entry.gradient {
                    return g;
                }
            }
            let g = self.gradient_uncached(ctx, pos, mat);
            let d = self.evaluate_uncached(ctx, pos, mat);
            self.cache_insert(key, d, Some(g));
            g
        } else {
            self.gradient_uncached(ctx, pos, mat)
        }
    }

    fn gradient_uncached(&self, ctx: FieldCtx, pos: Point3<f32>, mat: MaterialId) -> Vector3<f32> {
        let cell = ctx
            .octree
            .find_leaf_at(pos)
            .and_then(|node| ctx.sdf.field_for_node(node))
            .map(|field| ctx.sdf.cell_size(field))
            .unwrap_or(1.0);
        let h = self.accuracy().max(cell * 0.5);

        let dx = self.evaluate_uncached(ctx, pos + Vector3::new(h, 0.0, 0.0), mat)
            - self.evaluate_uncached(ctx, pos - Vector3::new(h, 0.0, 0.0), mat);
        let dy = self.evaluate_uncached(ctx, pos + Vector3::new(0.0, h, 0.0), mat)
            - self.evaluate_uncached(ctx, pos - Vector3::new(0.0, h, 0.0), mat);
        let dz = self.evaluate_uncached(ctx, pos + Vector3::new(0.0, 0.0, h), mat)
            - self.evaluate_uncached(ctx, pos - Vector3::new(0.0, 0.0, h), mat);

        Vector3::new(dx, dy, dz) / (2.0 * h)
    }

    /// Normalized gradient; degenerate gradients fall back to +z.
    pub fn normal(&self, ctx: FieldCtx, pos: Point3<f32>, mat: MaterialId) -> Vector3<f32> {
        let g = self.gradient(ctx, pos, mat);
        if g.magnitude2() < self.accuracy() * self.accuracy() {
            Vector3::new(0.0, 0.0, 1.0)
        } else {
            g.normalize()
        }
    }

    // ---- queries ------------------------------------------------------------

    /// Cheap overlap probe: center plus the 8 corners, short-circuiting on
    /// the first sample at or below `threshold`.
    pub fn box_intersects_field(
        &self,
        ctx: FieldCtx,
        region: &Aabb,
        mat: MaterialId,
        threshold: f32,
    ) -> bool {
        if self.evaluate(ctx, region.center(), mat) <= threshold {
            return true;
        }
        let (min, max) = (region.min, region.max);
        for i in 0..8u8 {
            let corner = Point3::new(
                if i & 1 != 0 { max.x } else { min.x },
                if i & 2 != 0 { max.y } else { min.y },
                if i & 4 != 0 { max.z } else { min.z },
            );
            if self.evaluate(ctx, corner, mat) <= threshold {
                return true;
            }
        }
        false
    }

    /// Sphere trace from `start` toward `end`: steps by
    /// `max(0.8 * d - radius, accuracy)` and reports a hit when
    /// `d - radius <= accuracy`, giving up after 128 steps or at the
    /// segment's end.
    pub fn sphere_trace(
        &self,
        ctx: FieldCtx,
        start: Point3<f32>,
        end: Point3<f32>,
        radius: f32,
        mat: MaterialId,
        budget: EvalBudget,
    ) -> VolumeResult<Option<TraceHit>> {
        let segment = end - start;
        let length = segment.magnitude();
        if length < f32::EPSILON {
            return Ok(None);
        }
        let dir = segment / length;
        let eps = self.accuracy();

        let mut t = 0.0f32;
        for _ in 0..MAX_TRACE_STEPS {
            if budget.expired() {
                return Err(VolumeError::Cancelled);
            }
            let p = start + dir * t;
            let d = self.evaluate(ctx, p, mat);
            if d - radius <= eps {
                return Ok(Some(TraceHit { position: p, distance: t }));
            }
            t += (TRACE_SAFETY * d - radius).max(eps);
            if t > length {
                return Ok(None);
            }
        }
        Ok(None)
    }

    /// Warms the cache over a regular grid inside `region`.
    pub fn pre_cache(&self, ctx: FieldCtx, region: &Aabb, spacing: f32, mat: MaterialId) {
        if !self.cache_enabled.load(Ordering::Relaxed) || spacing <= 0.0 {
            return;
        }
        let size = region.size();
        let steps = |extent: f32| ((extent / spacing).floor() as u32).min(256);
        for zi in 0..=steps(size.z) {
            for yi in 0..=steps(size.y) {
                for xi in 0..=steps(size.x) {
                    let p = region.min
                        + Vector3::new(xi as f32, yi as f32, zi as f32) * spacing;
                    self.evaluate(ctx, p, mat);
                }
            }
        }
    }

    // ---- cache internals ----------------------------------------------------

    /// 20 bits per quantized coordinate, 4 bits of material, packed to 64.
    fn cache_key(&self, pos: Point3<f32>, mat: MaterialId) -> u64 {
        let q = self.accuracy();
        let quant = |v: f32| ((v / q).round() as i64 & 0xF_FFFF) as u64;
        quant(pos.x) | (quant(pos.y) << 20) | (quant(pos.z) << 40) | ((mat as u64 & 0xF) << 60)
    }

    fn cache_insert(&self, key: u64, distance: f32, gradient: Option<Vector3<f32>>) {
        let stamp = self.clock.fetch_add(1, Ordering::Relaxed);
        self.cache.insert(key, CacheEntry { distance, gradient, stamp });

        let capacity = self.cache_capacity.load(Ordering::Relaxed);
        if self.cache.len() > capacity {
            // single evictor; concurrent readers keep going
            if let Ok(_guard) = self.evict_lock.try_lock() {
                self.evict_to(capacity * 9 / 10);
            }
        }
    }

    /// Evicts oldest-stamp entries until occupancy is at most `target`.
    fn evict_to(&self, target: usize) {
        let mut stamps: Vec<(u64, u64)> =
            self.cache.iter().map(|e| (e.stamp, *e.key())).collect();
        stamps.sort_unstable();
        let excess = stamps.len().saturating_sub(target);
        for &(_, key) in stamps.iter().take(excess) {
            self.cache.remove(&key);
        }
    }
}
