use std::collections::VecDeque;
use std::time::Instant;

use cgmath::Point3;
use log::{debug, warn};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{VolumeError, VolumeResult};
use crate::volume::bounds::Aabb;
use crate::volume::material::MaterialId;
use crate::volume::morton;

pub type TxId = u64;
pub type ZoneId = u32;
pub type ClientId = u64;

/// Completed transactions kept for diagnostics.
const COMPLETED_RING: usize = 64;

/// Sculpt operation descriptor, carried by transactions and replicated to
/// peers so they can attribute deltas.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum OpDesc {
    Union { center: Point3<f32>, radius: f32, material: MaterialId, strength: f32 },
    Subtract { center: Point3<f32>, radius: f32, material: MaterialId, strength: f32 },
    Blend { center: Point3<f32>, radius: f32, src: MaterialId, dst: MaterialId, factor: f32 },
    Fill { material: MaterialId },
    Clear { material: MaterialId },
    /// Delta application or maintenance not describable as one sculpt.
    Opaque,
}

impl OpDesc {
    pub fn material(&self) -> MaterialId {
        match *self {
            OpDesc::Union { material, .. }
            | OpDesc::Subtract { material, .. }
            | OpDesc::Fill { material }
            | OpDesc::Clear { material } => material,
            OpDesc::Blend { src, .. } => src,
            OpDesc::Opaque => 0,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct NetContext {
    pub networked: bool,
    pub client_id: ClientId,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committing,
    Committed,
    Aborted,
    Failed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ZoneMode {
    Read,
    Write,
    ReadWrite,
}

/// Fixed grid of zones over the volume: the unit of versioning, conflict
/// detection and replication. A zone is a depth-`depth` octree cell,
/// identified by the Morton code of its grid coordinates.
#[derive(Copy, Clone, Debug)]
pub struct ZoneGrid {
    bounds: Aabb,
    cells_per_axis: u32,
}

impl ZoneGrid {
    pub fn new(bounds: Aabb, depth: u8) -> ZoneGrid {
        ZoneGrid { bounds, cells_per_axis: 1 << depth.min(8) }
    }

    pub fn zone_count(&self) -> u32 {
        self.cells_per_axis.pow(3)
    }

    pub fn zone_at(&self, pos: Point3<f32>) -> Option<ZoneId> {
        if !self.bounds.contains(pos) {
            return None;
        }
        let size = self.bounds.size();
        let n = self.cells_per_axis as f32;
        let cell = |p: f32, lo: f32, extent: f32| {
            (((p - lo) / extent * n) as u32).min(self.cells_per_axis - 1)
        };
        Some(morton::encode(
            cell(pos.x, self.bounds.min.x, size.x),
            cell(pos.y, self.bounds.min.y, size.y),
            cell(pos.z, self.bounds.min.z, size.z),
        ))
    }

    /// Zones overlapping the box, ascending.
    pub fn zones_for_box(&self, region: &Aabb) -> Vec<ZoneId> {
        let clipped_min = Point3::new(
            region.min.x.max(self.bounds.min.x),
            region.min.y.max(self.bounds.min.y),
            region.min.z.max(self.bounds.min.z),
        );
        let clipped_max = Point3::new(
            region.max.x.min(self.bounds.max.x),
            region.max.y.min(self.bounds.max.y),
            region.max.z.min(self.bounds.max.z),
        );
        if clipped_min.x >= clipped_max.x
            || clipped_min.y >= clipped_max.y
            || clipped_min.z >= clipped_max.z
        {
            return Vec::new();
        }

        let size = self.bounds.size();
        let n = self.cells_per_axis as f32;
        let lo = |p: f32, min: f32, extent: f32| {
            ((p - min) / extent * n).floor().max(0.0) as u32
        };
        let hi = |p: f32, min: f32, extent: f32| {
            (((p - min) / extent * n).ceil() as u32).saturating_sub(1).min(self.cells_per_axis - 1)
        };

        morton::indices_in_box(
            (
                lo(clipped_min.x, self.bounds.min.x, size.x),
                lo(clipped_min.y, self.bounds.min.y, size.y),
                lo(clipped_min.z, self.bounds.min.z, size.z),
            ),
            (
                hi(clipped_max.x, self.bounds.min.x, size.x),
                hi(clipped_max.y, self.bounds.min.y, size.y),
                hi(clipped_max.z, self.bounds.min.z, size.z),
            ),
        )
    }

    pub fn zone_bounds(&self, zone: ZoneId) -> Aabb {
        let (x, y, z) = morton::decode(zone);
        let size = self.bounds.size() / self.cells_per_axis as f32;
        let min = self.bounds.min
            + cgmath::Vector3::new(x as f32 * size.x, y as f32 * size.y, z as f32 * size.z);
        Aabb::new(min, min + size)
    }
}

pub type VolumeId = u64;

#[derive(Clone, Debug)]
pub struct Transaction {
    pub id: TxId,
    pub op: OpDesc,
    pub state: TxState,
    pub affected_volumes: Vec<VolumeId>,
    pub read_set: FxHashSet<ZoneId>,
    pub write_set: FxHashSet<ZoneId>,
    pub base_versions: FxHashMap<ZoneId, u64>,
    pub new_versions: FxHashMap<ZoneId, u64>,
    pub net: NetContext,
    pub commit_ticket: Option<u64>,
    pub started_at: Instant,
    pub ended_at: Option<Instant>,
}

/// Update published on commit of a networked transaction, drained by the
/// network coordinator for replication.
#[derive(Clone, Debug, PartialEq)]
pub struct ZoneUpdate {
    pub zone: ZoneId,
    pub version: u64,
    pub op: OpDesc,
    pub client: ClientId,
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct TxStats {
    pub active: u32,
    pub committed: u64,
    pub failed: u64,
    pub aborted: u64,
}

/// Optimistic transaction coordinator. Transactions declare read/write
/// zones, capture the versions they observed, mutate without global locks,
/// and validate non-interference at commit: any write zone whose current
/// version moved past the recorded base fails the commit. Commits are
/// ratified in ticket order, which totally orders them per volume.
pub struct TransactionCoordinator {
    zones: ZoneGrid,
    zone_versions: FxHashMap<ZoneId, u64>,
    active: FxHashMap<TxId, Transaction>,
    completed: VecDeque<Transaction>,
    pending_network: VecDeque<ZoneUpdate>,
    next_id: TxId,
    next_ticket: u64,
    stats: TxStats,
}

impl TransactionCoordinator {
    pub fn new(zones: ZoneGrid) -> TransactionCoordinator {
        TransactionCoordinator {
            zones,
            zone_versions: FxHashMap::default(),
            active: FxHashMap::default(),
            completed: VecDeque::new(),
            pending_network: VecDeque::new(),
            next_id: 1,
            next_ticket: 1,
            stats: TxStats::default(),
        }
    }

    pub fn zone_grid(&self) -> &ZoneGrid {
        &self.zones
    }

    pub fn zone_version(&self, zone: ZoneId) -> u64 {
        self.zone_versions.get(&zone).copied().unwrap_or(0)
    }

    /// Overwrites a zone version after a sync or applied delta.
    pub fn publish_zone_version(&mut self, zone: ZoneId, version: u64) {
        self.zone_versions.insert(zone, version);
    }

    pub fn begin(&mut self, op: OpDesc, net: NetContext) -> TxId {
        let id = self.next_id;
        self.next_id += 1;
        self.active.insert(
            id,
            Transaction {
                id,
                op,
                state: TxState::Active,
                affected_volumes: Vec::new(),
                read_set: FxHashSet::default(),
                write_set: FxHashSet::default(),
                base_versions: FxHashMap::default(),
                new_versions: FxHashMap::default(),
                net,
                commit_ticket: None,
                started_at: Instant::now(),
                ended_at: None,
            },
        );
        debug!("transaction {} started ({:?})", id, op);
        id
    }

    /// Declares a volume whose counter advances when this transaction
    /// commits. Coordination stays per-volume; the set exists so the owner
    /// knows which counters to bump.
    pub fn add_volume(&mut self, tx: TxId, volume: VolumeId) -> VolumeResult<()> {
        let t = self
            .active
            .get_mut(&tx)
            .ok_or_else(|| VolumeError::invalid(format!("unknown transaction {}", tx)))?;
        if t.state != TxState::Active {
            return Err(VolumeError::TransactionAborted(tx));
        }
        if !t.affected_volumes.contains(&volume) {
            t.affected_volumes.push(volume);
        }
        Ok(())
    }

    /// Declares a zone with its access mode, capturing the version the
    /// transaction bases itself on.
    pub fn add_zone(&mut self, tx: TxId, zone: ZoneId, mode: ZoneMode) -> VolumeResult<()> {
        let version = self.zone_version(zone);
        let t = self
            .active
            .get_mut(&tx)
            .ok_or_else(|| VolumeError::invalid(format!("unknown transaction {}", tx)))?;
        if t.state != TxState::Active {
            return Err(VolumeError::TransactionAborted(tx));
        }
        match mode {
            ZoneMode::Read => {
                t.read_set.insert(zone);
            }
            ZoneMode::Write => {
                t.write_set.insert(zone);
            }
            ZoneMode::ReadWrite => {
                t.read_set.insert(zone);
                t.write_set.insert(zone);
            }
        }
        t.base_versions.entry(zone).or_insert(version);
        Ok(())
    }

    /// Declares every zone overlapping `region`.
    pub fn add_region(&mut self, tx: TxId, region: &Aabb, mode: ZoneMode) -> VolumeResult<()> {
        for zone in self.zones.zones_for_box(region) {
            self.add_zone(tx, zone, mode)?;
        }
        Ok(())
    }

    /// Validates and publishes the transaction. On success returns the new
    /// zone versions (each exactly base + 1). On a stale base the
    /// transaction is marked Failed and the caller must roll back its
    /// journal.
    pub fn commit(
        &mut self,
        tx: TxId,
        authority: Option<&dyn Fn(ZoneId, ClientId) -> bool>,
    ) -> VolumeResult<Vec<(ZoneId, u64)>> {
        {
            let t = self
                .active
                .get_mut(&tx)
                .ok_or_else(|| VolumeError::invalid(format!("unknown transaction {}", tx)))?;
            if t.state != TxState::Active {
                return Err(VolumeError::TransactionAborted(tx));
            }
            t.state = TxState::Committing;
        }

        // authority gate for networked writers
        let denial = {
            let t = &self.active[&tx];
            if t.net.networked {
                authority.and_then(|has_authority| {
                    t.write_set
                        .iter()
                        .find(|&&zone| !has_authority(zone, t.net.client_id))
                        .map(|&zone| (zone, t.net.client_id))
                })
            } else {
                None
            }
        };
        if let Some((zone, client)) = denial {
            self.finish(tx, TxState::Failed);
            return Err(VolumeError::AuthorityDenied { client, zone });
        }

        // optimistic validation: every write zone must still be at its base
        let conflict = {
            let t = &self.active[&tx];
            t.write_set.iter().find_map(|&zone| {
                let base = t.base_versions.get(&zone).copied().unwrap_or(0);
                let current = self.zone_versions.get(&zone).copied().unwrap_or(0);
                (current != base).then_some((zone, base, current))
            })
        };
        if let Some((zone, expected, found)) = conflict {
            warn!("transaction {} conflict on zone {}: base {} current {}", tx, zone, expected, found);
            self.finish(tx, TxState::Failed);
            return Err(VolumeError::VersionConflict { zone, expected, found });
        }

        let ticket = self.next_ticket;
        self.next_ticket += 1;

        let (published, updates) = {
            let t = self.active.get_mut(&tx).expect("checked above");
            t.commit_ticket = Some(ticket);

            let mut published: Vec<(ZoneId, u64)> = t
                .write_set
                .iter()
                .map(|&zone| (zone, t.base_versions.get(&zone).copied().unwrap_or(0) + 1))
                .collect();
            published.sort_unstable();
            for &(zone, version) in &published {
                t.new_versions.insert(zone, version);
            }

            let updates: Vec<ZoneUpdate> = if t.net.networked {
                published
                    .iter()
                    .map(|&(zone, version)| ZoneUpdate {
                        zone,
                        version,
                        op: t.op,
                        client: t.net.client_id,
                    })
                    .collect()
            } else {
                Vec::new()
            };
            (published, updates)
        };

        for &(zone, version) in &published {
            self.zone_versions.insert(zone, version);
        }
        self.pending_network.extend(updates);

        self.finish(tx, TxState::Committed);
        debug!("transaction {} committed with ticket {}", tx, ticket);
        Ok(published)
    }

    /// Marks the transaction Aborted. The owning volume replays its undo
    /// journal; zone versions are untouched.
    pub fn abort(&mut self, tx: TxId) {
        if self.active.contains_key(&tx) {
            self.finish(tx, TxState::Aborted);
        }
    }

    fn finish(&mut self, tx: TxId, state: TxState) {
        let Some(mut t) = self.active.remove(&tx) else {
            return;
        };
        t.state = state;
        t.ended_at = Some(Instant::now());
        match state {
            TxState::Committed => self.stats.committed += 1,
            TxState::Failed => self.stats.failed += 1,
            TxState::Aborted => self.stats.aborted += 1,
            _ => {}
        }
        self.completed.push_back(t);
        while self.completed.len() > COMPLETED_RING {
            self.completed.pop_front();
        }
    }

    pub fn state_of(&self, tx: TxId) -> Option<TxState> {
        self.active
            .get(&tx)
            .map(|t| t.state)
            .or_else(|| self.completed.iter().rev().find(|t| t.id == tx).map(|t| t.state))
    }

    pub fn transaction(&self, tx: TxId) -> Option<&Transaction> {
        self.active.get(&tx).or_else(|| self.completed.iter().rev().find(|t| t.id == tx))
    }

    /// Pops up to `max` pending replication updates, oldest first.
    pub fn drain_pending_network(&mut self, max: usize) -> Vec<ZoneUpdate> {
        let take = max.min(self.pending_network.len());
        self.pending_network.drain(..take).collect()
    }

    pub fn pending_network_len(&self) -> usize {
        self.pending_network.len()
    }

    pub fn stats(&self) -> TxStats {
        TxStats { active: self.active.len() as u32, ..self.stats }
    }
}

#[cfg(test)]
mod tests {
    use cgmath::Point3;

    use super::*;

    fn grid() -> ZoneGrid {
        ZoneGrid::new(
            Aabb::new(Point3::new(-8.0, -8.0, -8.0), Point3::new(8.0, 8.0, 8.0)),
            2,
        )
    }

    fn small_box(x: f32) -> Aabb {
        Aabb::new(Point3::new(x, 0.5, 0.5), Point3::new(x + 1.0, 1.5, 1.5))
    }

    #[test]
    fn zone_grid_maps_boxes_to_zones() {
        let zones = grid();
        assert_eq!(zones.zone_count(), 64);

        // a box inside one 4x4x4 cell touches exactly one zone
        let one = zones.zones_for_box(&small_box(0.5));
        assert_eq!(one.len(), 1);

        // a box spanning the center plane touches zones on both sides
        let straddling = Aabb::new(Point3::new(-1.0, -1.0, -1.0), Point3::new(1.0, 1.0, 1.0));
        assert_eq!(zones.zones_for_box(&straddling).len(), 8);

        // boxes outside the volume map to nothing
        let outside = Aabb::new(Point3::new(20.0, 0.0, 0.0), Point3::new(21.0, 1.0, 1.0));
        assert!(zones.zones_for_box(&outside).is_empty());

        // zone bounds invert zone_at
        let zone = zones.zone_at(Point3::new(1.0, 1.0, 1.0)).unwrap();
        assert!(zones.zone_bounds(zone).contains(Point3::new(1.0, 1.0, 1.0)));
    }

    #[test]
    fn commit_bumps_write_zones_by_one() {
        let mut txc = TransactionCoordinator::new(grid());

        let tx = txc.begin(OpDesc::Opaque, NetContext::default());
        txc.add_region(tx, &small_box(0.5), ZoneMode::ReadWrite).unwrap();

        let published = txc.commit(tx, None).unwrap();
        assert_eq!(published.len(), 1);
        let (zone, version) = published[0];
        assert_eq!(version, 1);
        assert_eq!(txc.zone_version(zone), 1);
        assert_eq!(txc.state_of(tx), Some(TxState::Committed));
        assert_eq!(txc.stats().committed, 1);

        // versions are gap-free across repeated commits
        let tx2 = txc.begin(OpDesc::Opaque, NetContext::default());
        txc.add_zone(tx2, zone, ZoneMode::Write).unwrap();
        let published = txc.commit(tx2, None).unwrap();
        assert_eq!(published[0].1, 2);
    }

    #[test]
    fn stale_base_fails_then_rebased_retry_succeeds() {
        let mut txc = TransactionCoordinator::new(grid());
        let region = small_box(0.5);

        // two transactions observe the same base
        let t1 = txc.begin(OpDesc::Opaque, NetContext::default());
        txc.add_region(t1, &region, ZoneMode::ReadWrite).unwrap();
        let t2 = txc.begin(OpDesc::Opaque, NetContext::default());
        txc.add_region(t2, &region, ZoneMode::ReadWrite).unwrap();

        let zone = txc.commit(t1, None).unwrap()[0].0;

        let err = txc.commit(t2, None).unwrap_err();
        assert_eq!(err, VolumeError::VersionConflict { zone, expected: 0, found: 1 });
        assert_eq!(txc.state_of(t2), Some(TxState::Failed));
        assert_eq!(txc.stats().failed, 1);

        // rebase and retry
        let t3 = txc.begin(OpDesc::Opaque, NetContext::default());
        txc.add_region(t3, &region, ZoneMode::ReadWrite).unwrap();
        let published = txc.commit(t3, None).unwrap();
        assert_eq!(published[0], (zone, 2));
    }

    #[test]
    fn abort_leaves_versions_untouched() {
        let mut txc = TransactionCoordinator::new(grid());

        let tx = txc.begin(OpDesc::Opaque, NetContext::default());
        txc.add_region(tx, &small_box(0.5), ZoneMode::Write).unwrap();
        let zone = *txc.transaction(tx).unwrap().write_set.iter().next().unwrap();

        txc.abort(tx);
        assert_eq!(txc.zone_version(zone), 0);
        assert_eq!(txc.state_of(tx), Some(TxState::Aborted));

        // an aborted transaction cannot commit
        assert!(txc.commit(tx, None).is_err());
    }

    #[test]
    fn networked_commit_enqueues_replication_updates() {
        let mut txc = TransactionCoordinator::new(grid());
        let net = NetContext { networked: true, client_id: 42 };

        let op = OpDesc::Union {
            center: Point3::new(1.0, 1.0, 1.0),
            radius: 0.4,
            material: 2,
            strength: 1.0,
        };
        let tx = txc.begin(op, net);
        txc.add_region(tx, &small_box(0.7), ZoneMode::ReadWrite).unwrap();
        txc.commit(tx, None).unwrap();

        assert_eq!(txc.pending_network_len(), 1);
        let updates = txc.drain_pending_network(10);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].client, 42);
        assert_eq!(updates[0].version, 1);
        assert_eq!(updates[0].op, op);
        assert_eq!(txc.pending_network_len(), 0);
    }

    #[test]
    fn authority_gate_rejects_unauthorized_writers() {
        let mut txc = TransactionCoordinator::new(grid());
        let net = NetContext { networked: true, client_id: 7 };

        let tx = txc.begin(OpDesc::Opaque, net);
        txc.add_region(tx, &small_box(0.5), ZoneMode::Write).unwrap();

        let deny = |_zone: ZoneId, _client: ClientId| false;
        let err = txc.commit(tx, Some(&deny)).unwrap_err();
        assert!(matches!(err, VolumeError::AuthorityDenied { client: 7, .. }));
        assert_eq!(txc.state_of(tx), Some(TxState::Failed));

        // local transactions skip the gate entirely
        let tx = txc.begin(OpDesc::Opaque, NetContext::default());
        txc.add_region(tx, &small_box(0.5), ZoneMode::Write).unwrap();
        assert!(txc.commit(tx, Some(&deny)).is_ok());
    }

    #[test]
    fn commit_tickets_are_totally_ordered() {
        let mut txc = TransactionCoordinator::new(grid());

        let mut tickets = Vec::new();
        for i in 0..4 {
            let tx = txc.begin(OpDesc::Opaque, NetContext::default());
            txc.add_region(tx, &small_box(i as f32), ZoneMode::Write).unwrap();
            txc.commit(tx, None).unwrap();
            tickets.push(txc.transaction(tx).unwrap().commit_ticket.unwrap());
        }
        assert!(tickets.windows(2).all(|w| w[0] < w[1]));
    }
}
