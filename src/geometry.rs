//! Axis-aligned cell extents and the Z-order child/octant indexing the
//! gravity tree builds on (§4.4.2), generalized to an arbitrary
//! `NUM_DIMENSIONS` via bitwise axis comparisons.

use crate::config::component;
use crate::config::from_fn;
use crate::config::set_component;
use crate::config::Vector;
use crate::config::NUM_DIMENSIONS;
use crate::config::NUM_SUBDIVISIONS;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extent {
    pub min: Vector,
    pub max: Vector,
    pub center: Vector,
}

impl Extent {
    pub fn new(min: Vector, max: Vector) -> Self {
        debug_assert!((0..NUM_DIMENSIONS).all(|k| component(&min, k) <= component(&max, k)));
        Self {
            min,
            max,
            center: (min + max) * 0.5,
        }
    }

    /// The smallest cube/square extent containing all given points, padded
    /// slightly so boundary particles land strictly inside.
    pub fn cubic_from_positions<'a>(positions: impl Iterator<Item = &'a Vector>) -> Option<Self> {
        let mut min = None::<Vector>;
        let mut max = None::<Vector>;
        for pos in positions {
            min = Some(match min {
                None => *pos,
                Some(m) => from_fn(|k| component(&m, k).min(component(pos, k))),
            });
            max = Some(match max {
                None => *pos,
                Some(m) => from_fn(|k| component(&m, k).max(component(pos, k))),
            });
        }
        let (min, max) = (min?, max?);
        let side = (0..NUM_DIMENSIONS)
            .map(|k| component(&max, k) - component(&min, k))
            .fold(0.0_f64, f64::max);
        if side <= 0.0 {
            return None;
        }
        let center = (min + max) * 0.5;
        let half = side * 0.5 * 1.01;
        Some(Self::new(
            from_fn(|k| component(&center, k) - half),
            from_fn(|k| component(&center, k) + half),
        ))
    }

    pub fn width(&self) -> f64 {
        component(&self.max, 0) - component(&self.min, 0)
    }

    pub fn contains(&self, pos: &Vector) -> bool {
        (0..NUM_DIMENSIONS).all(|k| {
            component(&self.min, k) <= component(pos, k) && component(pos, k) < component(&self.max, k)
        })
    }

    /// Z-order child index: bit `k` is set iff `pos` lies above the center
    /// on axis `k`.
    pub fn octant_index(&self, pos: &Vector) -> usize {
        let mut idx = 0;
        for k in 0..NUM_DIMENSIONS {
            if component(pos, k) > component(&self.center, k) {
                idx |= 1 << k;
            }
        }
        idx
    }

    pub fn child_extent(&self, octant: usize) -> Self {
        let half_width = self.width() * 0.5;
        let mut min = self.min;
        for k in 0..NUM_DIMENSIONS {
            if (octant >> k) & 1 == 1 {
                set_component(&mut min, k, component(&self.center, k));
            }
        }
        let max = from_fn(|k| component(&min, k) + half_width);
        Self::new(min, max)
    }

    pub fn children(&self) -> [Self; NUM_SUBDIVISIONS] {
        std::array::from_fn(|i| self.child_extent(i))
    }
}
