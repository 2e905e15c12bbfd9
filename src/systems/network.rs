use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{debug, warn};
use rustc_hash::FxHashMap;

#[cfg(test)]
use mockall::automock;

use crate::error::{VolumeError, VolumeResult};
use crate::systems::transaction::{ClientId, NetContext, OpDesc, ZoneGrid, ZoneId, ZoneUpdate};
use crate::volume::bounds::Aabb;
use crate::volume::material::MaterialId;

/// The authoritative server participates with this client id and holds
/// implicit authority over every zone.
pub const SERVER_CLIENT: ClientId = 0;

/// Coarse update batch per cooperative drain.
const UPDATE_BATCH: usize = 10;
/// Delta batch per cooperative drain.
const DELTA_BATCH: usize = 5;
/// Authority expiration sweeps run at most this often.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
/// Active modification locks expire after this long.
const REGION_LOCK_TTL: Duration = Duration::from_secs(5);
/// Out-of-order deltas buffered per zone before forcing a resync.
const MAX_BUFFERED_DELTAS: usize = 8;

/// Byte-encoded zone delta on the wire. The base version is implicit
/// (`target_version - 1`) except for full-resync messages which carry an
/// explicit zero base.
#[derive(Clone, Debug, PartialEq)]
pub struct WireDelta {
    pub zone: ZoneId,
    pub target_version: u64,
    pub op: OpDesc,
    pub client: ClientId,
    pub timestamp_ms: u64,
    /// Explicit base; `None` means `target_version - 1`.
    pub explicit_base: Option<u64>,
    pub bytes: Vec<u8>,
}

impl WireDelta {
    pub fn base_version(&self) -> u64 {
        self.explicit_base.unwrap_or_else(|| self.target_version.saturating_sub(1))
    }
}

/// Transport seam. The coordinator owns every buffer it passes in; the
/// references are valid only for the duration of the call, so backends
/// copy what they keep.
#[cfg_attr(test, automock)]
pub trait ReplicationBackend: Send {
    fn replicate_update(&mut self, update: &ZoneUpdate);
    fn replicate_delta(&mut self, delta: &WireDelta);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConflictStrategy {
    /// Authoritative side keeps its state; conflicting client ops rejected.
    ServerWins,
    /// Reject when any overlapping zone already has an active writer.
    FirstWriterWins,
    /// Higher client authority level wins; equal levels resolve to the
    /// lower client id.
    PriorityBased,
    /// Defer to the registered handler.
    Custom,
}

impl ConflictStrategy {
    pub fn from_index(index: u8) -> ConflictStrategy {
        match index {
            1 => ConflictStrategy::FirstWriterWins,
            2 => ConflictStrategy::PriorityBased,
            3 => ConflictStrategy::Custom,
            _ => ConflictStrategy::ServerWins,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ModRequest {
    Success,
    Conflict,
    Denied,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeltaDisposition {
    /// In order; caller applies it now.
    Apply,
    /// Ahead of the zone's version; buffered until the gap closes.
    Buffered,
    /// At or behind the zone's version; dropped.
    Duplicate,
    /// Too far ahead to buffer; caller requests a partial resync.
    NeedResync,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SyncRequest {
    Full,
    Partial { region: Aabb, materials: Vec<MaterialId> },
}

#[derive(Copy, Clone, Debug)]
struct Lease {
    zone: ZoneId,
    expires_at: Instant,
}

#[derive(Copy, Clone, Debug)]
struct RegionLock {
    client: ClientId,
    expires_at: Instant,
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct NetworkStats {
    pub updates_replicated: u64,
    pub deltas_replicated: u64,
    pub ops_accepted: u64,
    pub ops_rejected: u64,
    pub leases_expired: u64,
}

type ConflictResolver = Box<dyn Fn(&Aabb, MaterialId, ClientId) -> bool + Send + Sync>;

/// Per-volume replication coordinator: client authority leases with
/// expiry, version-gated application of networked operations, and two
/// bounded outbound queues (coarse updates, byte deltas) drained on a
/// cooperative schedule.
pub struct NetworkCoordinator {
    authoritative: bool,
    strategy: ConflictStrategy,
    custom_resolver: Option<ConflictResolver>,
    zones: ZoneGrid,

    leases: FxHashMap<ClientId, Vec<Lease>>,
    client_levels: FxHashMap<ClientId, u8>,
    zone_versions: FxHashMap<ZoneId, u64>,
    region_locks: FxHashMap<ZoneId, RegionLock>,

    pending_updates: VecDeque<ZoneUpdate>,
    pending_deltas: VecDeque<WireDelta>,
    buffered_deltas: FxHashMap<ZoneId, Vec<WireDelta>>,
    sync_requests: Vec<SyncRequest>,

    region_priorities: Vec<(Aabb, u8)>,
    material_priorities: FxHashMap<MaterialId, u8>,
    bandwidth_budget: Option<u64>,

    backend: Option<Box<dyn ReplicationBackend>>,
    last_sweep: Instant,
    stats: NetworkStats,
}

impl NetworkCoordinator {
    pub fn new(zones: ZoneGrid, authoritative: bool, strategy: ConflictStrategy) -> NetworkCoordinator {
        NetworkCoordinator {
            authoritative,
            strategy,
            custom_resolver: None,
            zones,
            leases: FxHashMap::default(),
            client_levels: FxHashMap::default(),
            zone_versions: FxHashMap::default(),
            region_locks: FxHashMap::default(),
            pending_updates: VecDeque::new(),
            pending_deltas: VecDeque::new(),
            buffered_deltas: FxHashMap::default(),
            sync_requests: Vec::new(),
            region_priorities: Vec::new(),
            material_priorities: FxHashMap::default(),
            bandwidth_budget: None,
            backend: None,
            last_sweep: Instant::now(),
            stats: NetworkStats::default(),
        }
    }

    pub fn set_replication(&mut self, backend: Box<dyn ReplicationBackend>) {
        self.backend = Some(backend);
    }

    pub fn set_authoritative(&mut self, authoritative: bool) {
        self.authoritative = authoritative;
    }

    pub fn is_authoritative(&self) -> bool {
        self.authoritative
    }

    pub fn set_conflict_strategy(&mut self, strategy: ConflictStrategy) {
        self.strategy = strategy;
    }

    pub fn set_custom_resolver(
        &mut self,
        resolver: impl Fn(&Aabb, MaterialId, ClientId) -> bool + Send + Sync + 'static,
    ) {
        self.custom_resolver = Some(Box::new(resolver));
    }

    /// Authority level used by the priority strategy.
    pub fn set_client_level(&mut self, client: ClientId, level: u8) {
        self.client_levels.insert(client, level);
    }

    pub fn stats(&self) -> NetworkStats {
        self.stats
    }

    // ---- authority ----------------------------------------------------------

    /// Grants `client` a lease over each zone for `duration`. A zone
    /// already leased to a different live client is skipped; the granted
    /// subset is returned.
    pub fn grant_authority(
        &mut self,
        client: ClientId,
        zones: &[ZoneId],
        duration: Duration,
        now: Instant,
    ) -> Vec<ZoneId> {
        self.maybe_sweep(now);
        let mut granted = Vec::new();
        for &zone in zones {
            let holder = self.zone_holder(zone, now);
            if holder.map(|h| h != client).unwrap_or(false) {
                debug!("zone {} lease denied to {}: held by {:?}", zone, client, holder);
                continue;
            }
            let leases = self.leases.entry(client).or_default();
            leases.retain(|l| l.zone != zone);
            leases.push(Lease { zone, expires_at: now + duration });
            granted.push(zone);
        }
        granted
    }

    pub fn revoke_authority(&mut self, client: ClientId, zones: &[ZoneId]) {
        if let Some(leases) = self.leases.get_mut(&client) {
            leases.retain(|l| !zones.contains(&l.zone));
        }
    }

    /// The server holds implicit authority; clients need a live lease.
    pub fn has_authority(&self, client: ClientId, zone: ZoneId, now: Instant) -> bool {
        if client == SERVER_CLIENT {
            return true;
        }
        self.leases
            .get(&client)
            .map(|leases| leases.iter().any(|l| l.zone == zone && l.expires_at > now))
            .unwrap_or(false)
    }

    fn zone_holder(&self, zone: ZoneId, now: Instant) -> Option<ClientId> {
        self.leases.iter().find_map(|(&client, leases)| {
            leases
                .iter()
                .any(|l| l.zone == zone && l.expires_at > now)
                .then_some(client)
        })
    }

    /// Drops expired leases and stale region locks. Runs at most once per
    /// second; the `process_*` entry points call it on their schedule.
    pub fn maybe_sweep(&mut self, now: Instant) {
        if now.duration_since(self.last_sweep) < SWEEP_INTERVAL {
            return;
        }
        self.sweep(now);
    }

    pub fn sweep(&mut self, now: Instant) {
        self.last_sweep = now;
        let mut expired = 0u64;
        for leases in self.leases.values_mut() {
            let before = leases.len();
            leases.retain(|l| l.expires_at > now);
            expired += (before - leases.len()) as u64;
        }
        self.leases.retain(|_, leases| !leases.is_empty());
        self.region_locks.retain(|_, lock| lock.expires_at > now);
        if expired > 0 {
            debug!("expired {} authority leases", expired);
            self.stats.leases_expired += expired;
        }
    }

    // ---- client modification path -------------------------------------------

    /// Client-side gate before mutating: checks locks and authority, and on
    /// success takes a short-lived modification lock on the touched zones.
    pub fn request_modification(
        &mut self,
        region: &Aabb,
        mat: MaterialId,
        client: ClientId,
        now: Instant,
    ) -> ModRequest {
        self.maybe_sweep(now);
        let zones = self.zones.zones_for_box(region);
        if zones.is_empty() {
            return ModRequest::Denied;
        }

        for &zone in &zones {
            // stale locks are released lazily at query time
            if let Some(lock) = self.region_locks.get(&zone).copied() {
                if lock.expires_at > now && lock.client != client {
                    if !self.incoming_wins(region, mat, client, lock.client) {
                        return ModRequest::Conflict;
                    }
                } else if lock.expires_at <= now {
                    self.region_locks.remove(&zone);
                }
            }
        }

        if client != SERVER_CLIENT {
            for &zone in &zones {
                if !self.has_authority(client, zone, now) {
                    return ModRequest::Denied;
                }
            }
        }

        for &zone in &zones {
            self.region_locks
                .insert(zone, RegionLock { client, expires_at: now + REGION_LOCK_TTL });
        }
        ModRequest::Success
    }

    /// Client-side delivery of an encoded mutation after a consistency
    /// check against the zone versions this peer has seen.
    pub fn submit_modification(
        &mut self,
        region: &Aabb,
        op: OpDesc,
        delta: Vec<u8>,
        base_version: u64,
        client: ClientId,
        now: Instant,
    ) -> VolumeResult<()> {
        let zones = self.zones.zones_for_box(region);
        let Some(&zone) = zones.first() else {
            return Err(VolumeError::invalid("region outside the volume"));
        };
        let current = self.zone_version(zone);
        if base_version != current {
            return Err(VolumeError::OutOfSync { zone, base: base_version, current });
        }
        for &zone in &zones {
            if client != SERVER_CLIENT && !self.has_authority(client, zone, now) {
                return Err(VolumeError::AuthorityDenied { client, zone });
            }
        }

        self.enqueue_delta(WireDelta {
            zone,
            target_version: current + 1,
            op,
            client,
            timestamp_ms: 0,
            explicit_base: None,
            bytes: delta,
        });
        Ok(())
    }

    // ---- server application path --------------------------------------------

    /// Server-side validation for a networked operation, without touching
    /// any state. Every zone version must advance past the current one
    /// (stale and duplicate submissions are rejected); authority and the
    /// conflict strategy gate client submissions.
    pub fn validate_networked_op(
        &mut self,
        net: NetContext,
        op: OpDesc,
        zone_versions: &[(ZoneId, u64)],
        region: &Aabb,
        now: Instant,
    ) -> VolumeResult<()> {
        self.maybe_sweep(now);

        for &(zone, version) in zone_versions {
            let current = self.zone_version(zone);
            if version <= current {
                self.stats.ops_rejected += 1;
                return Err(VolumeError::OutOfSync { zone, base: version, current });
            }
        }

        if net.client_id != SERVER_CLIENT {
            for &(zone, _) in zone_versions {
                if !self.has_authority(net.client_id, zone, now) {
                    self.stats.ops_rejected += 1;
                    return Err(VolumeError::AuthorityDenied { client: net.client_id, zone });
                }
                if let Some(lock) = self.region_locks.get(&zone).copied() {
                    if lock.expires_at > now
                        && lock.client != net.client_id
                        && !self.incoming_wins(region, op.material(), net.client_id, lock.client)
                    {
                        self.stats.ops_rejected += 1;
                        return Err(VolumeError::AuthorityDenied { client: net.client_id, zone });
                    }
                }
            }
        }
        Ok(())
    }

    /// Records an accepted operation: advances zone versions and queues the
    /// update for the other participants.
    pub fn record_networked_op(&mut self, net: NetContext, op: OpDesc, zone_versions: &[(ZoneId, u64)]) {
        for &(zone, version) in zone_versions {
            self.zone_versions.insert(zone, version);
            self.pending_updates.push_back(ZoneUpdate {
                zone,
                version,
                op,
                client: net.client_id,
            });
        }
        self.stats.ops_accepted += 1;
    }

    /// Validation and bookkeeping in one step, for callers that run the
    /// operation themselves after this returns.
    pub fn apply_networked_op(
        &mut self,
        net: NetContext,
        op: OpDesc,
        zone_versions: &[(ZoneId, u64)],
        region: &Aabb,
        now: Instant,
    ) -> VolumeResult<()> {
        self.validate_networked_op(net, op, zone_versions, region, now)?;
        self.record_networked_op(net, op, zone_versions);
        Ok(())
    }

    /// Conflict resolution between an incoming writer and the client
    /// currently holding the contested zone.
    fn incoming_wins(
        &self,
        region: &Aabb,
        mat: MaterialId,
        incoming: ClientId,
        holder: ClientId,
    ) -> bool {
        match self.strategy {
            ConflictStrategy::ServerWins => incoming == SERVER_CLIENT,
            ConflictStrategy::FirstWriterWins => false,
            ConflictStrategy::PriorityBased => {
                let il = self.client_levels.get(&incoming).copied().unwrap_or(0);
                let hl = self.client_levels.get(&holder).copied().unwrap_or(0);
                // equal authority resolves to the lower client id
                il > hl || (il == hl && incoming < holder)
            }
            ConflictStrategy::Custom => self
                .custom_resolver
                .as_ref()
                .map(|f| f(region, mat, incoming))
                .unwrap_or(false),
        }
    }

    // ---- versions & deltas --------------------------------------------------

    pub fn zone_version(&self, zone: ZoneId) -> u64 {
        self.zone_versions.get(&zone).copied().unwrap_or(0)
    }

    pub fn record_zone_version(&mut self, zone: ZoneId, version: u64) {
        self.zone_versions.insert(zone, version);
    }

    /// Classifies an inbound delta against the zone's version. `Apply`
    /// also advances the version; buffered deltas that become ready are
    /// returned by [`take_ready_deltas`](Self::take_ready_deltas).
    pub fn receive_delta(&mut self, delta: WireDelta) -> DeltaDisposition {
        let current = self.zone_version(delta.zone);
        let base = delta.base_version();

        if delta.target_version <= current {
            warn!("duplicate delta for zone {} at version {}", delta.zone, delta.target_version);
            return DeltaDisposition::Duplicate;
        }
        if base == current {
            self.zone_versions.insert(delta.zone, delta.target_version);
            return DeltaDisposition::Apply;
        }

        let buffer = self.buffered_deltas.entry(delta.zone).or_default();
        if buffer.len() >= MAX_BUFFERED_DELTAS {
            buffer.clear();
            self.sync_requests.push(SyncRequest::Partial {
                region: self.zones.zone_bounds(delta.zone),
                materials: Vec::new(),
            });
            return DeltaDisposition::NeedResync;
        }
        buffer.push(delta);
        DeltaDisposition::Buffered
    }

    /// Buffered deltas whose base now matches the zone version, in target
    /// order. Advances versions as it hands them out.
    pub fn take_ready_deltas(&mut self, zone: ZoneId) -> Vec<WireDelta> {
        let mut ready = Vec::new();
        let Some(buffer) = self.buffered_deltas.get_mut(&zone) else {
            return ready;
        };
        buffer.sort_by_key(|d| d.target_version);

        let mut current = self.zone_versions.get(&zone).copied().unwrap_or(0);
        while let Some(pos) = buffer.iter().position(|d| d.base_version() == current) {
            let delta = buffer.remove(pos);
            current = delta.target_version;
            ready.push(delta);
        }
        if !ready.is_empty() {
            self.zone_versions.insert(zone, current);
        }
        ready
    }

    pub fn request_full_sync(&mut self) {
        self.sync_requests.push(SyncRequest::Full);
    }

    pub fn request_partial_sync(&mut self, region: Aabb, materials: Vec<MaterialId>) {
        self.sync_requests.push(SyncRequest::Partial { region, materials });
    }

    pub fn drain_sync_requests(&mut self) -> Vec<SyncRequest> {
        std::mem::take(&mut self.sync_requests)
    }

    // ---- outbound queues ----------------------------------------------------

    pub fn enqueue_update(&mut self, update: ZoneUpdate) {
        self.pending_updates.push_back(update);
    }

    pub fn enqueue_delta(&mut self, delta: WireDelta) {
        self.pending_deltas.push_back(delta);
    }

    pub fn pending_update_len(&self) -> usize {
        self.pending_updates.len()
    }

    pub fn pending_delta_len(&self) -> usize {
        self.pending_deltas.len()
    }

    /// Region/material replication priorities; the delta queue drains
    /// higher priorities first after [`optimize_bandwidth`](Self::optimize_bandwidth).
    pub fn set_region_priority(&mut self, region: Aabb, priority: u8) {
        self.region_priorities.retain(|(r, _)| *r != region);
        self.region_priorities.push((region, priority));
    }

    pub fn set_material_priority(&mut self, mat: MaterialId, priority: u8) {
        self.material_priorities.insert(mat, priority);
    }

    /// Reorders the delta queue so higher-priority regions and materials
    /// drain first, and caps each delta drain at roughly the available
    /// bytes per second.
    pub fn optimize_bandwidth(&mut self, available_bps: u64) {
        self.bandwidth_budget = Some(available_bps.max(1024));

        let zones = self.zones;
        let region_priorities = std::mem::take(&mut self.region_priorities);
        let material_priorities = std::mem::take(&mut self.material_priorities);

        let priority_of = |delta: &WireDelta| -> u8 {
            let zone_bounds = zones.zone_bounds(delta.zone);
            let region = region_priorities
                .iter()
                .filter(|(r, _)| r.intersects(&zone_bounds))
                .map(|&(_, p)| p)
                .max()
                .unwrap_or(0);
            let material = material_priorities.get(&delta.op.material()).copied().unwrap_or(0);
            region.max(material)
        };

        let mut deltas: Vec<WireDelta> = self.pending_deltas.drain(..).collect();
        // stable sort keeps per-zone target order within a priority class
        deltas.sort_by_key(|d| std::cmp::Reverse(priority_of(d)));
        self.pending_deltas = deltas.into();

        self.region_priorities = region_priorities;
        self.material_priorities = material_priorities;
    }

    /// Drains up to 10 coarse updates to the backend. Returns how many
    /// were replicated.
    pub fn process_pending_network_replications(&mut self, now: Instant) -> usize {
        self.maybe_sweep(now);
        let Some(backend) = self.backend.as_mut() else {
            return 0;
        };
        let mut sent = 0;
        while sent < UPDATE_BATCH {
            let Some(update) = self.pending_updates.pop_front() else {
                break;
            };
            backend.replicate_update(&update);
            sent += 1;
        }
        self.stats.updates_replicated += sent as u64;
        sent
    }

    /// Drains up to 5 byte deltas to the backend, stopping early when the
    /// bandwidth budget set by `optimize_bandwidth` is spent. The delta
    /// buffer stays owned by this coordinator; it is dropped only after
    /// `replicate_delta` returns.
    pub fn process_network_delta_replications(&mut self, now: Instant) -> usize {
        self.maybe_sweep(now);
        let Some(backend) = self.backend.as_mut() else {
            return 0;
        };
        let mut sent = 0;
        let mut bytes = 0u64;
        while sent < DELTA_BATCH {
            if let Some(budget) = self.bandwidth_budget {
                if bytes > 0 && bytes >= budget {
                    break;
                }
            }
            let Some(delta) = self.pending_deltas.pop_front() else {
                break;
            };
            bytes += delta.bytes.len() as u64;
            backend.replicate_delta(&delta);
            sent += 1;
        }
        self.stats.deltas_replicated += sent as u64;
        sent
    }
}
