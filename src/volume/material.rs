use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rustc_hash::FxHashMap;

use crate::error::{VolumeError, VolumeResult};

pub type MaterialId = u8;

/// How a pair of materials behaves where their fields overlap.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RelationKind {
    /// Blend normally through the pair's blend function.
    Compatible,
    /// No smoothing; the boundary is a hard step.
    Incompatible,
    /// The lower-indexed material of the pair replaces the other.
    Dominates,
    /// The lower-indexed material of the pair is never written over the other.
    Submits,
    /// Defer to a handler registered for the pair.
    Custom,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlendKind {
    Linear,
    Smoothstep,
    Exponential,
    Sinusoidal,
    Step,
    CubicEase,
    SmoothUnion,
    /// Index into the named registry.
    Custom(u8),
}

impl BlendKind {
    fn to_wire(self) -> u8 {
        match self {
            BlendKind::Linear => 0,
            BlendKind::Smoothstep => 1,
            BlendKind::Exponential => 2,
            BlendKind::Sinusoidal => 3,
            BlendKind::Step => 4,
            BlendKind::CubicEase => 5,
            BlendKind::SmoothUnion => 6,
            BlendKind::Custom(slot) => 7u8.saturating_add(slot),
        }
    }

    fn from_wire(tag: u8) -> BlendKind {
        match tag {
            0 => BlendKind::Linear,
            1 => BlendKind::Smoothstep,
            2 => BlendKind::Exponential,
            3 => BlendKind::Sinusoidal,
            4 => BlendKind::Step,
            5 => BlendKind::CubicEase,
            6 => BlendKind::SmoothUnion,
            n => BlendKind::Custom(n - 7),
        }
    }

    pub fn from_name(name: &str) -> Option<BlendKind> {
        match name {
            "linear" => Some(BlendKind::Linear),
            "smoothstep" => Some(BlendKind::Smoothstep),
            "exponential" => Some(BlendKind::Exponential),
            "sinusoidal" => Some(BlendKind::Sinusoidal),
            "step" => Some(BlendKind::Step),
            "cubic" => Some(BlendKind::CubicEase),
            "smooth_union" => Some(BlendKind::SmoothUnion),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BooleanOp {
    Union,
    Subtraction,
    Intersection,
    SmoothUnion,
    SmoothSubtraction,
    SmoothIntersection,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PairRule {
    pub kind: RelationKind,
    pub transition_width: f32,
    pub blend: BlendKind,
    pub priority: u8,
}

impl Default for PairRule {
    fn default() -> PairRule {
        PairRule {
            kind: RelationKind::Compatible,
            transition_width: 1.0,
            blend: BlendKind::Linear,
            priority: 0,
        }
    }
}

type BlendFn = Box<dyn Fn(f32, f32, f32) -> f32 + Send + Sync>;
type PairFn = Box<dyn Fn(f32, f32) -> f32 + Send + Sync>;

/// Pair rules, priorities and combinators deciding how materials mix at
/// their interfaces. Keys are unordered pairs `(min, max)`.
pub struct MaterialModel {
    rules: FxHashMap<(MaterialId, MaterialId), PairRule>,
    default_rule: PairRule,
    priorities: FxHashMap<MaterialId, u8>,
    default_priority: u8,
    custom_blends: Vec<(String, BlendFn)>,
    pair_handlers: FxHashMap<(MaterialId, MaterialId), PairFn>,
    version: u64,
}

fn pair_key(a: MaterialId, b: MaterialId) -> (MaterialId, MaterialId) {
    (a.min(b), a.max(b))
}

impl MaterialModel {
    pub fn new(default_blend: BlendKind, default_priority: u8) -> MaterialModel {
        MaterialModel {
            rules: FxHashMap::default(),
            default_rule: PairRule { blend: default_blend, ..PairRule::default() },
            priorities: FxHashMap::default(),
            default_priority,
            custom_blends: Vec::new(),
            pair_handlers: FxHashMap::default(),
            version: 0,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    // ---- relationships ------------------------------------------------------

    pub fn set_pair(&mut self, a: MaterialId, b: MaterialId, rule: PairRule) {
        self.rules.insert(pair_key(a, b), rule);
        self.version += 1;
    }

    pub fn get_pair(&self, a: MaterialId, b: MaterialId) -> PairRule {
        self.rules.get(&pair_key(a, b)).copied().unwrap_or(self.default_rule)
    }

    pub fn set_default_rule(&mut self, rule: PairRule) {
        self.default_rule = rule;
        self.version += 1;
    }

    pub fn compatible(&self, a: MaterialId, b: MaterialId) -> bool {
        self.get_pair(a, b).kind == RelationKind::Compatible
    }

    pub fn boundary_width(&self, a: MaterialId, b: MaterialId) -> f32 {
        let rule = self.get_pair(a, b);
        match rule.kind {
            RelationKind::Incompatible => 0.0,
            _ => rule.transition_width,
        }
    }

    pub fn compatible_with(&self, mat: MaterialId, material_count: u32) -> Vec<MaterialId> {
        (0..material_count as u16)
            .map(|m| m as MaterialId)
            .filter(|&m| m != mat && self.compatible(mat, m))
            .collect()
    }

    /// Registers a handler for a `Custom` pair; invoked by `resolve_overlap`.
    pub fn register_pair_handler(
        &mut self,
        a: MaterialId,
        b: MaterialId,
        handler: impl Fn(f32, f32) -> f32 + Send + Sync + 'static,
    ) {
        self.pair_handlers.insert(pair_key(a, b), Box::new(handler));
        self.version += 1;
    }

    // ---- priorities ---------------------------------------------------------

    pub fn set_priority(&mut self, mat: MaterialId, priority: u8) {
        self.priorities.insert(mat, priority);
        self.version += 1;
    }

    pub fn get_priority(&self, mat: MaterialId) -> u8 {
        self.priorities.get(&mat).copied().unwrap_or(self.default_priority)
    }

    /// Highest-priority material of the set; ties go to the lower index.
    pub fn dominant(&self, materials: &[MaterialId]) -> Option<MaterialId> {
        materials
            .iter()
            .copied()
            .max_by(|&a, &b| {
                self.get_priority(a)
                    .cmp(&self.get_priority(b))
                    .then(b.cmp(&a))
            })
    }

    // ---- combinators --------------------------------------------------------

    /// Standard SDF boolean identities; the smooth variants use the
    /// polynomial smooth-minimum.
    pub fn combine(&self, d_a: f32, d_b: f32, op: BooleanOp, smoothing: f32) -> f32 {
        match op {
            BooleanOp::Union => d_a.min(d_b),
            BooleanOp::Subtraction => d_a.max(-d_b),
            BooleanOp::Intersection => d_a.max(d_b),
            BooleanOp::SmoothUnion => smooth_min(d_a, d_b, smoothing),
            BooleanOp::SmoothSubtraction => -smooth_min(-d_a, d_b, smoothing),
            BooleanOp::SmoothIntersection => -smooth_min(-d_a, -d_b, smoothing),
        }
    }

    /// Crossfades two values by the blend shape evaluated at `alpha`.
    pub fn blend(&self, v_a: f32, v_b: f32, blend: BlendKind, alpha: f32) -> f32 {
        let alpha = alpha.clamp(0.0, 1.0);
        match blend {
            BlendKind::SmoothUnion => smooth_min(v_a, v_b, alpha.max(f32::EPSILON)),
            BlendKind::Custom(slot) => match self.custom_blends.get(slot as usize) {
                Some((_, f)) => f(v_a, v_b, alpha),
                None => v_a + (v_b - v_a) * alpha,
            },
            shape => {
                let w = match shape {
                    BlendKind::Linear => alpha,
                    BlendKind::Smoothstep => alpha * alpha * (3.0 - 2.0 * alpha),
                    BlendKind::Exponential => alpha * alpha,
                    BlendKind::Sinusoidal => (((alpha - 0.5) * std::f32::consts::PI).sin() + 1.0) * 0.5,
                    BlendKind::Step => {
                        if alpha >= 0.5 {
                            1.0
                        } else {
                            0.0
                        }
                    }
                    BlendKind::CubicEase => {
                        if alpha < 0.5 {
                            4.0 * alpha * alpha * alpha
                        } else {
                            1.0 - (-2.0 * alpha + 2.0).powi(3) / 2.0
                        }
                    }
                    _ => unreachable!(),
                };
                v_a + (v_b - v_a) * w
            }
        }
    }

    /// Registers a custom blend function under a name; returns the slot
    /// usable as `BlendKind::Custom`.
    pub fn register_blend(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(f32, f32, f32) -> f32 + Send + Sync + 'static,
    ) -> BlendKind {
        let name = name.into();
        self.custom_blends.push((name, Box::new(f)));
        self.version += 1;
        BlendKind::Custom((self.custom_blends.len() - 1) as u8)
    }

    pub fn blend_by_name(&self, name: &str) -> Option<BlendKind> {
        if let Some(builtin) = BlendKind::from_name(name) {
            return Some(builtin);
        }
        self.custom_blends
            .iter()
            .position(|(n, _)| n == name)
            .map(|slot| BlendKind::Custom(slot as u8))
    }

    /// Combines the two channel values where materials `a` and `b` overlap,
    /// honoring the pair's relationship. Returns the new values for the
    /// `a` and `b` channels.
    pub fn resolve_overlap(
        &self,
        a: MaterialId,
        d_a: f32,
        b: MaterialId,
        d_b: f32,
        alpha: f32,
    ) -> (f32, f32) {
        let rule = self.get_pair(a, b);
        let (lo, _) = pair_key(a, b);
        match rule.kind {
            RelationKind::Compatible => {
                let blended = self.blend(d_a, d_b, rule.blend, alpha);
                (blended, self.blend(d_b, d_a, rule.blend, alpha))
            }
            RelationKind::Incompatible => {
                let blended = self.blend(d_a, d_b, BlendKind::Step, alpha);
                (blended, self.blend(d_b, d_a, BlendKind::Step, alpha))
            }
            RelationKind::Dominates => {
                // the lower-indexed material replaces the other on overlap
                if a == lo {
                    (d_a, d_b.max(-d_a))
                } else {
                    (d_a.max(-d_b), d_b)
                }
            }
            RelationKind::Submits => {
                if a == lo {
                    (d_a.max(-d_b), d_b)
                } else {
                    (d_a, d_b.max(-d_a))
                }
            }
            RelationKind::Custom => match self.pair_handlers.get(&pair_key(a, b)) {
                Some(f) => (f(d_a, d_b), f(d_b, d_a)),
                None => (d_a, d_b),
            },
        }
    }

    // ---- serialization ------------------------------------------------------

    pub fn serialize(&self, w: &mut impl Write) -> VolumeResult<()> {
        let io = |e: std::io::Error| VolumeError::corrupted(e.to_string());

        w.write_u32::<LittleEndian>(self.rules.len() as u32).map_err(io)?;
        let mut rules: Vec<_> = self.rules.iter().collect();
        rules.sort_by_key(|(&k, _)| k);
        for (&(a, b), rule) in rules {
            w.write_u8(a).map_err(io)?;
            w.write_u8(b).map_err(io)?;
            w.write_u8(relation_to_wire(rule.kind)).map_err(io)?;
            w.write_f32::<LittleEndian>(rule.transition_width).map_err(io)?;
            w.write_u8(rule.blend.to_wire()).map_err(io)?;
            w.write_u8(rule.priority).map_err(io)?;
        }

        w.write_u32::<LittleEndian>(self.priorities.len() as u32).map_err(io)?;
        let mut priorities: Vec<_> = self.priorities.iter().collect();
        priorities.sort();
        for (&mat, &priority) in priorities {
            w.write_u8(mat).map_err(io)?;
            w.write_u8(priority).map_err(io)?;
        }
        Ok(())
    }

    /// Replaces rules and priorities from serialized form. Custom handlers
    /// and blend closures are not transported; pairs referencing them fall
    /// back to defaults until re-registered.
    pub fn deserialize(&mut self, r: &mut impl Read) -> VolumeResult<()> {
        let io = |e: std::io::Error| VolumeError::corrupted(e.to_string());

        self.rules.clear();
        let rule_count = r.read_u32::<LittleEndian>().map_err(io)?;
        for _ in 0..rule_count {
            let a = r.read_u8().map_err(io)?;
            let b = r.read_u8().map_err(io)?;
            let kind = relation_from_wire(r.read_u8().map_err(io)?)?;
            let transition_width = r.read_f32::<LittleEndian>().map_err(io)?;
            let blend = BlendKind::from_wire(r.read_u8().map_err(io)?);
            let priority = r.read_u8().map_err(io)?;
            self.rules
                .insert(pair_key(a, b), PairRule { kind, transition_width, blend, priority });
        }

        self.priorities.clear();
        let priority_count = r.read_u32::<LittleEndian>().map_err(io)?;
        for _ in 0..priority_count {
            let mat = r.read_u8().map_err(io)?;
            let priority = r.read_u8().map_err(io)?;
            self.priorities.insert(mat, priority);
        }

        self.version += 1;
        Ok(())
    }
}

fn relation_to_wire(kind: RelationKind) -> u8 {
    match kind {
        RelationKind::Compatible => 0,
        RelationKind::Incompatible => 1,
        RelationKind::Dominates => 2,
        RelationKind::Submits => 3,
        RelationKind::Custom => 4,
    }
}

fn relation_from_wire(tag: u8) -> VolumeResult<RelationKind> {
    match tag {
        0 => Ok(RelationKind::Compatible),
        1 => Ok(RelationKind::Incompatible),
        2 => Ok(RelationKind::Dominates),
        3 => Ok(RelationKind::Submits),
        4 => Ok(RelationKind::Custom),
        n => Err(VolumeError::corrupted(format!("unknown relationship kind {}", n))),
    }
}

/// Polynomial smooth minimum: `min(a,b) - h^3 * k / 6` with
/// `h = max(k - |a-b|, 0) / k`.
pub fn smooth_min(a: f32, b: f32, k: f32) -> f32 {
    if k <= 0.0 {
        return a.min(b);
    }
    let h = (k - (a - b).abs()).max(0.0) / k;
    a.min(b) - h * h * h * k / 6.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boolean_identities() {
        let model = MaterialModel::new(BlendKind::Linear, 0);
        let d = -2.5f32;

        assert_eq!(model.combine(d, f32::INFINITY, BooleanOp::Union, 0.0), d);
        assert_eq!(model.combine(d, f32::INFINITY, BooleanOp::Subtraction, 0.0), d);
        assert_eq!(model.combine(d, d, BooleanOp::Union, 0.0), d);
        assert_eq!(model.combine(d, d, BooleanOp::Intersection, 0.0), d);
        assert_eq!(model.combine(1.0, -1.0, BooleanOp::Union, 0.0), -1.0);
        assert_eq!(model.combine(1.0, -1.0, BooleanOp::Intersection, 0.0), 1.0);
        // subtraction carves b out of a
        assert_eq!(model.combine(-1.0, -0.5, BooleanOp::Subtraction, 0.0), 0.5);
    }

    #[test]
    fn smooth_union_approaches_hard_union() {
        let model = MaterialModel::new(BlendKind::Linear, 0);

        let hard = model.combine(0.4, -0.6, BooleanOp::Union, 0.0);
        let smooth = model.combine(0.4, -0.6, BooleanOp::SmoothUnion, 0.01);
        assert!((hard - smooth).abs() < 1e-3);

        // smoothing only deepens the union
        let wide = model.combine(0.4, 0.5, BooleanOp::SmoothUnion, 2.0);
        assert!(wide < 0.4);
    }

    #[test]
    fn blend_shapes_hit_endpoints() {
        let model = MaterialModel::new(BlendKind::Linear, 0);
        let shapes = [
            BlendKind::Linear,
            BlendKind::Smoothstep,
            BlendKind::Exponential,
            BlendKind::Sinusoidal,
            BlendKind::Step,
            BlendKind::CubicEase,
        ];

        for shape in shapes {
            assert_eq!(model.blend(2.0, 6.0, shape, 0.0), 2.0, "{:?}", shape);
            assert_eq!(model.blend(2.0, 6.0, shape, 1.0), 6.0, "{:?}", shape);
        }

        assert_eq!(model.blend(2.0, 6.0, BlendKind::Linear, 0.5), 4.0);
        assert_eq!(model.blend(2.0, 6.0, BlendKind::Smoothstep, 0.5), 4.0);
        assert_eq!(model.blend(2.0, 6.0, BlendKind::Step, 0.49), 2.0);
        assert_eq!(model.blend(2.0, 6.0, BlendKind::Step, 0.5), 6.0);
    }

    #[test]
    fn dominant_breaks_ties_by_lower_index() {
        let mut model = MaterialModel::new(BlendKind::Linear, 0);
        model.set_priority(3, 10);
        model.set_priority(5, 10);
        model.set_priority(1, 2);

        assert_eq!(model.dominant(&[1, 3, 5]), Some(3));
        assert_eq!(model.dominant(&[5, 3]), Some(3));
        assert_eq!(model.dominant(&[1]), Some(1));
        assert_eq!(model.dominant(&[]), None);

        // all defaults: lowest index wins
        let plain = MaterialModel::new(BlendKind::Linear, 0);
        assert_eq!(plain.dominant(&[4, 2, 6]), Some(2));
    }

    #[test]
    fn pair_rules_are_unordered() {
        let mut model = MaterialModel::new(BlendKind::Linear, 0);
        model.set_pair(
            2,
            1,
            PairRule { kind: RelationKind::Incompatible, transition_width: 3.0, ..PairRule::default() },
        );

        assert_eq!(model.get_pair(1, 2).kind, RelationKind::Incompatible);
        assert_eq!(model.get_pair(2, 1).kind, RelationKind::Incompatible);
        assert_eq!(model.boundary_width(1, 2), 0.0);
        assert!(!model.compatible(1, 2));
        assert!(model.compatible(0, 3));
    }

    #[test]
    fn overlap_honors_relationship_kinds() {
        let mut model = MaterialModel::new(BlendKind::Linear, 0);

        // material 1 dominates material 2: 2's channel is carved back
        model.set_pair(1, 2, PairRule { kind: RelationKind::Dominates, ..PairRule::default() });
        let (a, b) = model.resolve_overlap(1, -2.0, 2, -1.0, 0.5);
        assert_eq!(a, -2.0);
        assert_eq!(b, 2.0);
        // argument order does not matter for the unordered pair
        let (b2, a2) = model.resolve_overlap(2, -1.0, 1, -2.0, 0.5);
        assert_eq!((a2, b2), (a, b));

        // material 0 submits to material 3: 0 is never written over 3
        model.set_pair(0, 3, PairRule { kind: RelationKind::Submits, ..PairRule::default() });
        let (s, d) = model.resolve_overlap(0, -2.0, 3, -1.5, 0.5);
        assert_eq!(s, 1.5);
        assert_eq!(d, -1.5);

        // custom pairs defer to the registered handler
        model.set_pair(4, 5, PairRule { kind: RelationKind::Custom, ..PairRule::default() });
        model.register_pair_handler(4, 5, |a, b| a.min(b) - 1.0);
        let (ca, cb) = model.resolve_overlap(4, 0.5, 5, 0.25, 0.0);
        assert_eq!(ca, -0.75);
        assert_eq!(cb, -0.75);
    }

    #[test]
    fn custom_blend_registration() {
        let mut model = MaterialModel::new(BlendKind::Linear, 0);
        let slot = model.register_blend("pick_first", |a, _, _| a);

        assert_eq!(model.blend(3.0, 9.0, slot, 0.8), 3.0);
        assert_eq!(model.blend_by_name("pick_first"), Some(slot));
        assert_eq!(model.blend_by_name("linear"), Some(BlendKind::Linear));
        assert_eq!(model.blend_by_name("nope"), None);
    }

    #[test]
    fn serialize_roundtrip() {
        let mut model = MaterialModel::new(BlendKind::Linear, 0);
        model.set_pair(
            0,
            1,
            PairRule {
                kind: RelationKind::Dominates,
                transition_width: 2.5,
                blend: BlendKind::Smoothstep,
                priority: 3,
            },
        );
        model.set_pair(
            1,
            2,
            PairRule { kind: RelationKind::Incompatible, ..PairRule::default() },
        );
        model.set_priority(0, 9);
        model.set_priority(2, 4);

        let mut bytes = Vec::new();
        model.serialize(&mut bytes).unwrap();

        let mut restored = MaterialModel::new(BlendKind::Linear, 0);
        restored.deserialize(&mut bytes.as_slice()).unwrap();

        assert_eq!(restored.get_pair(0, 1), model.get_pair(0, 1));
        assert_eq!(restored.get_pair(1, 2), model.get_pair(1, 2));
        assert_eq!(restored.get_priority(0), 9);
        assert_eq!(restored.get_priority(2), 4);
        assert_eq!(restored.get_priority(1), 0);
    }

    #[test]
    fn deserialize_rejects_unknown_relation() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&[0, 1, 200]); // bogus relation tag
        bytes.extend_from_slice(&1.0f32.to_le_bytes());
        bytes.extend_from_slice(&[0, 0]);
        bytes.extend_from_slice(&0u32.to_le_bytes());

        let mut model = MaterialModel::new(BlendKind::Linear, 0);
        assert!(model.deserialize(&mut bytes.as_slice()).is_err());
    }
}
