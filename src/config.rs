//! Dimensionality constants, selected at compile time by the `2d`/`3d` features.
//!
//! Exactly one of the two features is enabled per build; the rest of the
//! crate reads `NUM_DIMENSIONS` / `Vector` rather than hardcoding a
//! dimension anywhere.

#[cfg(all(feature = "2d", feature = "3d"))]
compile_error!("features \"2d\" and \"3d\" are mutually exclusive");
#[cfg(not(any(feature = "2d", feature = "3d")))]
compile_error!("exactly one of features \"2d\" or \"3d\" must be enabled");

#[cfg(feature = "2d")]
pub const NUM_DIMENSIONS: usize = 2;
#[cfg(feature = "3d")]
pub const NUM_DIMENSIONS: usize = 3;

pub const NUM_SUBDIVISIONS: usize = 1 << NUM_DIMENSIONS;

#[cfg(feature = "2d")]
pub type Vector = glam::DVec2;
#[cfg(feature = "3d")]
pub type Vector = glam::DVec3;

/// Recommended sibling-collision depth cap for insertion (§4.4.2 edge case).
pub const MAX_INSERTION_DEPTH: usize = 64;

/// Sentinel value for an absent child/thread pointer.
pub const NOT_EXIST: i64 = -1;

/// Sentinel `next_sibling` of the root node.
pub const ROOT_SIBLING: i64 = -1;

pub const ROOT: usize = 0;

pub fn vector_zero() -> Vector {
    Vector::ZERO
}

pub fn component(v: &Vector, axis: usize) -> f64 {
    match axis {
        0 => v.x,
        1 => v.y,
        #[cfg(feature = "3d")]
        2 => v.z,
        _ => unreachable!("axis out of range for NUM_DIMENSIONS"),
    }
}

pub fn set_component(v: &mut Vector, axis: usize, value: f64) {
    match axis {
        0 => v.x = value,
        1 => v.y = value,
        #[cfg(feature = "3d")]
        2 => v.z = value,
        _ => unreachable!("axis out of range for NUM_DIMENSIONS"),
    }
}

pub fn from_fn(mut f: impl FnMut(usize) -> f64) -> Vector {
    #[cfg(feature = "2d")]
    {
        Vector::new(f(0), f(1))
    }
    #[cfg(feature = "3d")]
    {
        Vector::new(f(0), f(1), f(2))
    }
}
