use once_cell::sync::Lazy;

/// Bits kept per axis. Codes address at most a 1024^3 grid.
pub const BITS_PER_AXIS: u32 = 10;
pub const MAX_COORD: u32 = (1 << BITS_PER_AXIS) - 1;

/// Spread table: maps a 10-bit value to its bits spaced three apart, so a
/// full encode is three lookups and two shifts.
static SPREAD_LUT: Lazy<[u32; 1024]> = Lazy::new(|| {
    let mut lut = [0u32; 1024];
    for (v, slot) in lut.iter_mut().enumerate() {
        let mut spread = 0u32;
        for bit in 0..BITS_PER_AXIS {
            if v & (1 << bit) != 0 {
                spread |= 1 << (3 * bit);
            }
        }
        *slot = spread;
    }
    lut
});

/// Interleaves the low 10 bits of each coordinate into a Morton code.
/// Coordinates above the representable range are clamped.
pub fn encode(x: u32, y: u32, z: u32) -> u32 {
    let lut = &*SPREAD_LUT;
    lut[x.min(MAX_COORD) as usize]
        | (lut[y.min(MAX_COORD) as usize] << 1)
        | (lut[z.min(MAX_COORD) as usize] << 2)
}

/// Inverse of [`encode`].
pub fn decode(code: u32) -> (u32, u32, u32) {
    (compact(code), compact(code >> 1), compact(code >> 2))
}

fn compact(mut v: u32) -> u32 {
    v &= 0x0924_9249;
    v = (v | (v >> 2)) & 0x0c30_c30c;
    v = (v | (v >> 4)) & 0x0300_f00f;
    v = (v | (v >> 8)) & 0xff00_00ff;
    v = (v | (v >> 16)) & 0x0000_03ff;
    v
}

/// Code of the ancestor cell `levels` levels up.
pub fn parent(code: u32, levels: u8) -> u32 {
    code >> (3 * levels as u32)
}

/// Codes of the 8 children one level down, in Morton child order.
pub fn children(code: u32) -> [u32; 8] {
    let base = code << 3;
    [
        base,
        base | 1,
        base | 2,
        base | 3,
        base | 4,
        base | 5,
        base | 6,
        base | 7,
    ]
}

/// Child slot (0..8) of a code within its parent.
pub fn child_index(code: u32) -> u8 {
    (code & 0b111) as u8
}

/// Codes of the up-to-26 neighbors of `code` within the `dims` grid.
/// Neighbors falling outside the grid are clamped away, so corner cells
/// return fewer entries.
pub fn neighbors(code: u32, dims: (u32, u32, u32)) -> Vec<u32> {
    let (x, y, z) = decode(code);
    let mut out = Vec::with_capacity(26);

    for dz in -1i64..=1 {
        for dy in -1i64..=1 {
            for dx in -1i64..=1 {
                if dx == 0 && dy == 0 && dz == 0 {
                    continue;
                }
                let nx = x as i64 + dx;
                let ny = y as i64 + dy;
                let nz = z as i64 + dz;
                if nx < 0 || ny < 0 || nz < 0 {
                    continue;
                }
                let (nx, ny, nz) = (nx as u32, ny as u32, nz as u32);
                if nx >= dims.0 || ny >= dims.1 || nz >= dims.2 {
                    continue;
                }
                out.push(encode(nx, ny, nz));
            }
        }
    }

    out
}

/// All codes whose coordinates lie in the inclusive box `[min, max]`, in
/// ascending code order.
pub fn indices_in_box(min: (u32, u32, u32), max: (u32, u32, u32)) -> Vec<u32> {
    let mut out = Vec::new();
    for z in min.2..=max.2.min(MAX_COORD) {
        for y in min.1..=max.1.min(MAX_COORD) {
            for x in min.0..=max.0.min(MAX_COORD) {
                out.push(encode(x, y, z));
            }
        }
    }
    out.sort_unstable();
    out
}

/// True iff the two codes decode to cells that touch (face, edge or corner)
/// without being the same cell.
pub fn adjacent(a: u32, b: u32) -> bool {
    if a == b {
        return false;
    }
    let (ax, ay, az) = decode(a);
    let (bx, by, bz) = decode(b);
    ax.abs_diff(bx) <= 1 && ay.abs_diff(by) <= 1 && az.abs_diff(bz) <= 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        assert_eq!(encode(0, 0, 0), 0);
        assert_eq!(encode(1, 0, 0), 1);
        assert_eq!(encode(0, 1, 0), 2);
        assert_eq!(encode(0, 0, 1), 4);
        assert_eq!(encode(1, 1, 1), 7);

        for &(x, y, z) in &[(3, 5, 7), (1023, 0, 512), (1023, 1023, 1023), (600, 321, 99)] {
            assert_eq!(decode(encode(x, y, z)), (x, y, z));
        }
    }

    #[test]
    fn encode_clamps_out_of_range() {
        assert_eq!(encode(5000, 0, 0), encode(1023, 0, 0));
    }

    #[test]
    fn parent_child_walks() {
        let code = encode(6, 7, 5);
        let up = parent(code, 1);
        assert_eq!(up, encode(3, 3, 2));
        assert_eq!(parent(code, 2), encode(1, 1, 1));

        let kids = children(up);
        assert!(kids.contains(&code));
        for (i, &kid) in kids.iter().enumerate() {
            assert_eq!(parent(kid, 1), up);
            assert_eq!(child_index(kid), i as u8);
        }
    }

    #[test]
    fn neighbor_walk_clamps_at_boundaries() {
        let interior = neighbors(encode(5, 5, 5), (16, 16, 16));
        assert_eq!(interior.len(), 26);
        assert!(interior.contains(&encode(4, 4, 4)));
        assert!(interior.contains(&encode(6, 6, 6)));
        assert!(!interior.contains(&encode(5, 5, 5)));

        let corner = neighbors(encode(0, 0, 0), (16, 16, 16));
        assert_eq!(corner.len(), 7);

        let far_corner = neighbors(encode(15, 15, 15), (16, 16, 16));
        assert_eq!(far_corner.len(), 7);
    }

    #[test]
    fn box_enumeration_is_sorted_and_complete() {
        let codes = indices_in_box((1, 1, 1), (2, 2, 2));
        assert_eq!(codes.len(), 8);
        assert!(codes.windows(2).all(|w| w[0] < w[1]));
        assert!(codes.contains(&encode(2, 1, 2)));
    }

    #[test]
    fn random_roundtrip() {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let (x, y, z) = (
                rng.gen_range(0..=MAX_COORD),
                rng.gen_range(0..=MAX_COORD),
                rng.gen_range(0..=MAX_COORD),
            );
            let code = encode(x, y, z);
            assert_eq!(decode(code), (x, y, z));
            if x > 1 || y > 1 || z > 1 {
                assert_eq!(parent(code, 1), encode(x / 2, y / 2, z / 2));
            }
        }
    }

    #[test]
    fn adjacency() {
        assert!(adjacent(encode(4, 4, 4), encode(5, 5, 5)));
        assert!(adjacent(encode(4, 4, 4), encode(4, 5, 4)));
        assert!(!adjacent(encode(4, 4, 4), encode(4, 4, 4)));
        assert!(!adjacent(encode(4, 4, 4), encode(6, 4, 4)));
    }
}
