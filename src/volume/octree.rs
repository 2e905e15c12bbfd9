use std::sync::atomic::{AtomicU64, Ordering};

use cgmath::{InnerSpace, Point3, Vector3};
use log::debug;

use crate::volume::bounds::Aabb;
use crate::volume::field::FieldIndex;
use crate::volume::material::MaterialId;

pub type NodeIndex = u32;

/// Reserved sentinel for serialized node links. In-memory code uses
/// `Option<NodeIndex>`; the sentinel only ever appears on the wire.
pub const INDEX_NONE: NodeIndex = u32::MAX;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    /// Contains no material.
    Empty,
    /// Entirely filled with one material.
    Homogeneous(MaterialId),
    /// More than one material, or a surface crossing.
    Interface,
    /// Host-defined payload, carried through serialization verbatim.
    Custom(u8),
}

impl NodeKind {
    pub fn primary_material(&self) -> MaterialId {
        match self {
            NodeKind::Homogeneous(m) => *m,
            _ => 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    parent: Option<NodeIndex>,
    children: Option<[NodeIndex; 8]>,
    depth: u8,
    priority: u8,
    live: bool,
    kind: NodeKind,
    bounds: Aabb,
    field: Option<FieldIndex>,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RayHit {
    pub node: NodeIndex,
    pub distance: f32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct OctreeStats {
    pub live_nodes: u32,
    pub empty: u32,
    pub homogeneous: u32,
    pub interface: u32,
    pub custom: u32,
    pub max_live_depth: u8,
}

/// Sparse octree over the volume. Nodes live in a flat arena indexed by
/// [`NodeIndex`] with a free list for reuse; child links are indices, never
/// pointers. Writers hold `&mut self`; readers run optimistic versioned
/// descents and retry when a concurrent structural change is observed.
pub struct OctreeNodeManager {
    nodes: Vec<Node>,
    free_list: Vec<NodeIndex>,
    root: NodeIndex,
    max_depth: u8,
    version: AtomicU64,
}

impl OctreeNodeManager {
    pub fn new(bounds: Aabb, max_depth: u8) -> OctreeNodeManager {
        let root = Node {
            parent: None,
            children: None,
            depth: 0,
            priority: 0,
            live: true,
            kind: NodeKind::Empty,
            bounds,
            field: None,
        };
        OctreeNodeManager {
            nodes: vec![root],
            free_list: Vec::new(),
            root: 0,
            max_depth,
            version: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> NodeIndex {
        self.root
    }

    pub fn max_depth(&self) -> u8 {
        self.max_depth
    }

    pub fn world_bounds(&self) -> Aabb {
        self.nodes[self.root as usize].bounds
    }

    /// Structure version; bumped on every allocate/release/subdivide/collapse.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::Release);
    }

    /// Allocates an unattached node, reusing a free slot when one exists.
    /// Used directly by delta application; sculpting goes through
    /// [`subdivide`](Self::subdivide).
    pub fn allocate(&mut self, kind: NodeKind, depth: u8) -> NodeIndex {
        let node = Node {
            parent: None,
            children: None,
            depth,
            priority: 0,
            live: true,
            kind,
            bounds: Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(0.0, 0.0, 0.0)),
            field: None,
        };
        let idx = self.insert(node);
        self.bump_version();
        idx
    }

    fn insert(&mut self, node: Node) -> NodeIndex {
        if let Some(idx) = self.free_list.pop() {
            self.nodes[idx as usize] = node;
            idx
        } else {
            self.nodes.push(node);
            (self.nodes.len() - 1) as NodeIndex
        }
    }

    /// Releases a node and its whole subtree, detaching it from its parent.
    /// Returns the field indices that were attached so the caller can free
    /// their storage. Releasing the root resets it to an Empty leaf.
    pub fn release(&mut self, node: NodeIndex) -> Vec<FieldIndex> {
        if !self.is_live(node) {
            return Vec::new();
        }

        let mut fields = Vec::new();
        if node == self.root {
            if let Some(children) = self.nodes[node as usize].children.take() {
                for child in children {
                    self.release_subtree(child, &mut fields);
                }
            }
            let root = &mut self.nodes[node as usize];
            root.kind = NodeKind::Empty;
            if let Some(f) = root.field.take() {
                fields.push(f);
            }
        } else {
            if let Some(parent) = self.nodes[node as usize].parent {
                // a parent never keeps a partial child set; the siblings go too
                if let Some(children) = self.nodes[parent as usize].children.take() {
                    for child in children {
                        self.release_subtree(child, &mut fields);
                    }
                }
            } else {
                self.release_subtree(node, &mut fields);
            }
        }

        self.bump_version();
        fields
    }

    fn release_subtree(&mut self, node: NodeIndex, fields: &mut Vec<FieldIndex>) {
        if let Some(children) = self.nodes[node as usize].children.take() {
            for child in children {
                self.release_subtree(child, fields);
            }
        }
        let n = &mut self.nodes[node as usize];
        if let Some(f) = n.field.take() {
            fields.push(f);
        }
        n.live = false;
        n.parent = None;
        self.free_list.push(node);
    }

    /// Splits a leaf into 8 children that partition its bounds. Children
    /// inherit the parent's kind (Interface parents spawn Empty children;
    /// the field owner re-samples into them). No-op past the depth limit or
    /// on interior nodes.
    pub fn subdivide(&mut self, node: NodeIndex) -> Option<[NodeIndex; 8]> {
        if !self.is_live(node) || !self.is_leaf(node) || self.depth(node) >= self.max_depth {
            return None;
        }

        let parent_bounds = self.nodes[node as usize].bounds;
        let child_depth = self.nodes[node as usize].depth + 1;
        let child_kind = match self.nodes[node as usize].kind {
            NodeKind::Interface => NodeKind::Empty,
            kind => kind,
        };
        let priority = self.nodes[node as usize].priority;

        let mut children = [0 as NodeIndex; 8];
        for (i, child) in children.iter_mut().enumerate() {
            *child = self.insert(Node {
                parent: Some(node),
                children: None,
                depth: child_depth,
                priority,
                live: true,
                kind: child_kind,
                bounds: parent_bounds.octant(i as u8),
                field: None,
            });
        }

        self.nodes[node as usize].children = Some(children);
        self.bump_version();
        Some(children)
    }

    /// Merges a node's children back into it when all 8 are leaves of the
    /// same non-Interface kind with identical primary material. Returns the
    /// children's released fields, or `None` when the node is not eligible.
    pub fn collapse(&mut self, node: NodeIndex) -> Option<Vec<FieldIndex>> {
        if !self.is_live(node) {
            return None;
        }
        let children = self.nodes[node as usize].children?;

        let first_kind = self.nodes[children[0] as usize].kind;
        if matches!(first_kind, NodeKind::Interface) {
            return None;
        }
        for &child in &children {
            let c = &self.nodes[child as usize];
            if c.children.is_some() || c.kind != first_kind {
                return None;
            }
        }

        let mut fields = Vec::new();
        self.nodes[node as usize].children = None;
        for child in children {
            self.release_subtree(child, &mut fields);
        }
        self.nodes[node as usize].kind = first_kind;

        debug!("collapsed node {} into {:?}", node, first_kind);
        self.bump_version();
        Some(fields)
    }

    /// Leaf containing the world position, resolved by recursive descent.
    /// Points on shared faces land on the low-coordinate side. Runs an
    /// optimistic versioned read, retrying if the structure changed.
    pub fn find_leaf_at(&self, pos: Point3<f32>) -> Option<NodeIndex> {
        loop {
            let v = self.version();
            let result = self.descend(pos);
            if v == self.version() {
                return result;
            }
        }
    }

    fn descend(&self, pos: Point3<f32>) -> Option<NodeIndex> {
        if !self.nodes[self.root as usize].bounds.contains(pos) {
            return None;
        }
        let mut it = self.root;
        while let Some(children) = self.nodes[it as usize].children {
            // strict comparison sends points on a shared face to the
            // low-coordinate child, deterministically
            let c = self.nodes[it as usize].bounds.center();
            let idx = (pos.x > c.x) as usize | ((pos.y > c.y) as usize) << 1 | ((pos.z > c.z) as usize) << 2;
            it = children[idx];
        }
        Some(it)
    }

    /// All nodes whose bounds intersect the box, pre-order. With
    /// `leaves_only` interior nodes are filtered out.
    pub fn find_nodes_in_box(&self, region: &Aabb, leaves_only: bool) -> Vec<NodeIndex> {
        loop {
            let v = self.version();
            let mut out = Vec::new();
            self.collect_in_box(self.root, region, leaves_only, &mut out);
            if v == self.version() {
                return out;
            }
        }
    }

    fn collect_in_box(&self, node: NodeIndex, region: &Aabb, leaves_only: bool, out: &mut Vec<NodeIndex>) {
        let n = &self.nodes[node as usize];
        if !n.bounds.intersects(region) {
            return;
        }
        match n.children {
            Some(children) => {
                if !leaves_only {
                    out.push(node);
                }
                for child in children {
                    self.collect_in_box(child, region, leaves_only, out);
                }
            }
            None => out.push(node),
        }
    }

    /// First non-Empty leaf hit by the ray, by ordered child descent along
    /// the ray direction. Distance is to the leaf's slab entry point; the
    /// evaluator refines inside the leaf.
    pub fn trace_ray(&self, start: Point3<f32>, dir: Vector3<f32>, max_dist: f32) -> Option<RayHit> {
        if dir.magnitude2() < f32::EPSILON {
            return None;
        }
        let dir = dir.normalize();
        loop {
            let v = self.version();
            let result = self.trace_node(self.root, start, dir, max_dist);
            if v == self.version() {
                return result;
            }
        }
    }

    fn trace_node(
        &self,
        node: NodeIndex,
        start: Point3<f32>,
        dir: Vector3<f32>,
        max_dist: f32,
    ) -> Option<RayHit> {
        let n = &self.nodes[node as usize];
        let (t_enter, _) = n.bounds.intersect_ray(start, dir, max_dist)?;

        match n.children {
            None => match n.kind {
                NodeKind::Empty => None,
                _ => Some(RayHit { node, distance: t_enter }),
            },
            Some(children) => {
                // visit octants nearest-first: flip child index bits by ray sign
                let flip = (dir.x < 0.0) as usize | ((dir.y < 0.0) as usize) << 1 | ((dir.z < 0.0) as usize) << 2;
                let mut order: Vec<(f32, usize)> = (0..8)
                    .map(|i| {
                        let child = children[i ^ flip];
                        let t = self.nodes[child as usize]
                            .bounds
                            .intersect_ray(start, dir, max_dist)
                            .map(|(t, _)| t)
                            .unwrap_or(f32::INFINITY);
                        (t, i ^ flip)
                    })
                    .collect();
                order.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());

                for (t, idx) in order {
                    if !t.is_finite() {
                        break;
                    }
                    if let Some(hit) = self.trace_node(children[idx], start, dir, max_dist) {
                        return Some(hit);
                    }
                }
                None
            }
        }
    }

    // ---- per-node accessors -------------------------------------------------

    pub fn is_live(&self, node: NodeIndex) -> bool {
        self.nodes.get(node as usize).map(|n| n.live).unwrap_or(false)
    }

    pub fn is_leaf(&self, node: NodeIndex) -> bool {
        self.nodes[node as usize].children.is_none()
    }

    pub fn kind(&self, node: NodeIndex) -> NodeKind {
        self.nodes[node as usize].kind
    }

    pub fn set_kind(&mut self, node: NodeIndex, kind: NodeKind) {
        self.nodes[node as usize].kind = kind;
    }

    pub fn bounds(&self, node: NodeIndex) -> Aabb {
        self.nodes[node as usize].bounds
    }

    pub fn set_bounds(&mut self, node: NodeIndex, bounds: Aabb) {
        self.nodes[node as usize].bounds = bounds;
    }

    pub fn depth(&self, node: NodeIndex) -> u8 {
        self.nodes[node as usize].depth
    }

    pub fn center(&self, node: NodeIndex) -> Point3<f32> {
        self.nodes[node as usize].bounds.center()
    }

    pub fn size(&self, node: NodeIndex) -> f32 {
        self.nodes[node as usize].bounds.size().x
    }

    pub fn parent(&self, node: NodeIndex) -> Option<NodeIndex> {
        self.nodes[node as usize].parent
    }

    pub fn set_parent(&mut self, node: NodeIndex, parent: Option<NodeIndex>) {
        self.nodes[node as usize].parent = parent;
    }

    pub fn children(&self, node: NodeIndex) -> Option<[NodeIndex; 8]> {
        self.nodes[node as usize].children
    }

    pub fn set_children(&mut self, node: NodeIndex, children: Option<[NodeIndex; 8]>) {
        self.nodes[node as usize].children = children;
        self.bump_version();
    }

    pub fn field(&self, node: NodeIndex) -> Option<FieldIndex> {
        self.nodes[node as usize].field
    }

    pub fn set_field(&mut self, node: NodeIndex, field: Option<FieldIndex>) {
        self.nodes[node as usize].field = field;
    }

    pub fn node_priority(&self, node: NodeIndex) -> u8 {
        self.nodes[node as usize].priority
    }

    /// Tags every node intersecting the region. Memory reclamation degrades
    /// low-priority interface nodes first.
    pub fn set_priority(&mut self, region: &Aabb, priority: u8) {
        for idx in self.find_nodes_in_box(region, false) {
            self.nodes[idx as usize].priority = priority;
        }
    }

    // ---- locational codes ---------------------------------------------------

    /// Path code identifying a node's position and depth: the root is 1,
    /// each level shifts in the 3-bit child slot. Serialized trees address
    /// nodes by this code, which survives arena reshuffling.
    pub fn locational_code(&self, node: NodeIndex) -> u32 {
        let mut code = 0u32;
        let mut shift = 0;
        let mut it = node;
        while let Some(parent) = self.nodes[it as usize].parent {
            let children = self.nodes[parent as usize].children.expect("parent without children");
            let slot = children.iter().position(|&c| c == it).expect("child not in parent") as u32;
            code |= slot << shift;
            shift += 3;
            it = parent;
        }
        code | (1 << shift)
    }

    /// Walks a locational code down from the root, subdividing leaves along
    /// the way until the addressed node exists. Returns `None` when the
    /// code is deeper than the depth limit.
    pub fn materialize_code(&mut self, code: u32) -> Option<NodeIndex> {
        if code == 0 {
            return None;
        }
        let depth = (31 - code.leading_zeros()) / 3;
        if depth as u8 > self.max_depth {
            return None;
        }

        let mut it = self.root;
        for level in (0..depth).rev() {
            let slot = ((code >> (level * 3)) & 0b111) as usize;
            let children = match self.nodes[it as usize].children {
                Some(children) => children,
                None => self.subdivide(it)?,
            };
            it = children[slot];
        }
        Some(it)
    }

    // ---- maintenance --------------------------------------------------------

    /// Collapses every eligible interior node bottom-up. Returns released
    /// fields for the caller to free.
    pub fn optimize_memory(&mut self) -> Vec<FieldIndex> {
        let mut fields = Vec::new();
        self.collapse_recursive(self.root, &mut fields);
        fields
    }

    fn collapse_recursive(&mut self, node: NodeIndex, fields: &mut Vec<FieldIndex>) {
        if let Some(children) = self.nodes[node as usize].children {
            for child in children {
                self.collapse_recursive(child, fields);
            }
            if let Some(mut released) = self.collapse(node) {
                fields.append(&mut released);
            }
        }
    }

    pub fn memory_usage(&self) -> u64 {
        (self.nodes.len() * std::mem::size_of::<Node>()) as u64
    }

    pub fn node_count(&self) -> u32 {
        (self.nodes.len() - self.free_list.len()) as u32
    }

    pub fn stats(&self) -> OctreeStats {
        let mut stats = OctreeStats::default();
        for node in self.nodes.iter().filter(|n| n.live) {
            stats.live_nodes += 1;
            stats.max_live_depth = stats.max_live_depth.max(node.depth);
            match node.kind {
                NodeKind::Empty => stats.empty += 1,
                NodeKind::Homogeneous(_) => stats.homogeneous += 1,
                NodeKind::Interface => stats.interface += 1,
                NodeKind::Custom(_) => stats.custom += 1,
            }
        }
        stats
    }

    pub fn iter_live(&self) -> impl Iterator<Item = (NodeIndex, &Node)> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.live)
            .map(|(i, n)| (i as NodeIndex, n))
    }
}

impl Node {
    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn bounds(&self) -> Aabb {
        self.bounds
    }

    pub fn parent(&self) -> Option<NodeIndex> {
        self.parent
    }

    pub fn field(&self) -> Option<FieldIndex> {
        self.field
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }
}
