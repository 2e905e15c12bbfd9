use cgmath::{Point3, Vector3};

/// Axis-aligned box in world space. Min-inclusive, max-exclusive on shared
/// faces so that adjacent boxes partition space without overlap.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Aabb {
    pub min: Point3<f32>,
    pub max: Point3<f32>,
}

impl Aabb {
    pub fn new(min: Point3<f32>, max: Point3<f32>) -> Aabb {
        Aabb { min, max }
    }

    pub fn from_center_extent(center: Point3<f32>, half_extent: f32) -> Aabb {
        let h = Vector3::new(half_extent, half_extent, half_extent);
        Aabb { min: center - h, max: center + h }
    }

    /// Bounding box of a sphere.
    pub fn around_sphere(center: Point3<f32>, radius: f32) -> Aabb {
        Aabb::from_center_extent(center, radius)
    }

    pub fn center(&self) -> Point3<f32> {
        Point3::new(
            (self.min.x + self.max.x) * 0.5,
            (self.min.y + self.max.y) * 0.5,
            (self.min.z + self.max.z) * 0.5,
        )
    }

    pub fn size(&self) -> Vector3<f32> {
        self.max - self.min
    }

    pub fn is_valid(&self) -> bool {
        self.min.x <= self.max.x && self.min.y <= self.max.y && self.min.z <= self.max.z
    }

    /// Point containment. Low faces are inclusive, high faces exclusive, so
    /// a point on a face shared by two boxes belongs to the low-coordinate
    /// side only.
    pub fn contains(&self, p: Point3<f32>) -> bool {
        p.x >= self.min.x
            && p.x < self.max.x
            && p.y >= self.min.y
            && p.y < self.max.y
            && p.z >= self.min.z
            && p.z < self.max.z
    }

    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.x < other.max.x
            && self.max.x > other.min.x
            && self.min.y < other.max.y
            && self.max.y > other.min.y
            && self.min.z < other.max.z
            && self.max.z > other.min.z
    }

    pub fn contains_box(&self, other: &Aabb) -> bool {
        other.min.x >= self.min.x
            && other.max.x <= self.max.x
            && other.min.y >= self.min.y
            && other.max.y <= self.max.y
            && other.min.z >= self.min.z
            && other.max.z <= self.max.z
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: Point3::new(
                self.min.x.min(other.min.x),
                self.min.y.min(other.min.y),
                self.min.z.min(other.min.z),
            ),
            max: Point3::new(
                self.max.x.max(other.max.x),
                self.max.y.max(other.max.y),
                self.max.z.max(other.max.z),
            ),
        }
    }

    /// Expands every face outward by `margin`.
    pub fn dilated(&self, margin: f32) -> Aabb {
        let m = Vector3::new(margin, margin, margin);
        Aabb { min: self.min - m, max: self.max + m }
    }

    /// Octant sub-box by child index (bit 0 = +x, bit 1 = +y, bit 2 = +z,
    /// matching the Morton child order).
    pub fn octant(&self, idx: u8) -> Aabb {
        let c = self.center();
        let pick = |bit: bool, lo: f32, mid: f32, hi: f32| -> (f32, f32) {
            if bit {
                (mid, hi)
            } else {
                (lo, mid)
            }
        };
        let (x0, x1) = pick(idx & 1 != 0, self.min.x, c.x, self.max.x);
        let (y0, y1) = pick(idx & 2 != 0, self.min.y, c.y, self.max.y);
        let (z0, z1) = pick(idx & 4 != 0, self.min.z, c.z, self.max.z);
        Aabb::new(Point3::new(x0, y0, z0), Point3::new(x1, y1, z1))
    }

    /// Slab test against a ray. Returns the entry/exit parameters when the
    /// ray hits the box within `[0, max_t]`.
    pub fn intersect_ray(
        &self,
        origin: Point3<f32>,
        dir: Vector3<f32>,
        max_t: f32,
    ) -> Option<(f32, f32)> {
        let mut t_min = 0.0f32;
        let mut t_max = max_t;

        for axis in 0..3 {
            let (o, d, lo, hi) = match axis {
                0 => (origin.x, dir.x, self.min.x, self.max.x),
                1 => (origin.y, dir.y, self.min.y, self.max.y),
                _ => (origin.z, dir.z, self.min.z, self.max.z),
            };
            if d.abs() < f32::EPSILON {
                if o < lo || o > hi {
                    return None;
                }
                continue;
            }
            let inv = 1.0 / d;
            let (t0, t1) = if inv >= 0.0 {
                ((lo - o) * inv, (hi - o) * inv)
            } else {
                ((hi - o) * inv, (lo - o) * inv)
            };
            t_min = t_min.max(t0);
            t_max = t_max.min(t1);
            if t_min > t_max {
                return None;
            }
        }

        Some((t_min, t_max))
    }
}

#[cfg(test)]
mod tests {
    use cgmath::{Point3, Vector3};

    use super::Aabb;

    #[test]
    fn contains_resolves_shared_faces_to_low_side() {
        let left = Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 1.0, 1.0));
        let right = Aabb::new(Point3::new(1.0, 0.0, 0.0), Point3::new(2.0, 1.0, 1.0));

        let on_face = Point3::new(1.0, 0.5, 0.5);
        assert!(!left.contains(on_face));
        assert!(right.contains(on_face));
    }

    #[test]
    fn octants_partition_parent() {
        let parent = Aabb::new(Point3::new(-2.0, -2.0, -2.0), Point3::new(2.0, 2.0, 2.0));

        for i in 0..8u8 {
            for j in 0..8u8 {
                if i != j {
                    assert!(!parent.octant(i).intersects(&parent.octant(j)), "{} vs {}", i, j);
                }
            }
        }

        let mut union = parent.octant(0);
        for i in 1..8u8 {
            union = union.union(&parent.octant(i));
        }
        assert_eq!(union, parent);
    }

    #[test]
    fn ray_slab_test() {
        let aabb = Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 1.0, 1.0));

        let hit = aabb.intersect_ray(
            Point3::new(-1.0, 0.5, 0.5),
            Vector3::new(1.0, 0.0, 0.0),
            10.0,
        );
        assert_eq!(hit, Some((1.0, 2.0)));

        let miss = aabb.intersect_ray(
            Point3::new(-1.0, 2.0, 0.5),
            Vector3::new(1.0, 0.0, 0.0),
            10.0,
        );
        assert_eq!(miss, None);

        let inside = aabb.intersect_ray(
            Point3::new(0.5, 0.5, 0.5),
            Vector3::new(0.0, 0.0, 1.0),
            10.0,
        );
        assert_eq!(inside, Some((0.0, 0.5)));
    }
}
