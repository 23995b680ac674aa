// SPDX-License-Identifier: GPL-3.0-only

//! Screen-space rectangles and the math needed to figure out where a CRTC
//! ends up once rotation and a RandR transform are applied to its mode.

use crate::backend::Rotation;

/// 16.16 fixed point, as used by the RENDER extension.
pub type Fixed = i32;

const FIXED_ONE: f64 = 65536.0;

pub fn double_to_fixed(value: f64) -> Fixed {
    (value * FIXED_ONE).round() as Fixed
}

pub fn fixed_to_double(value: Fixed) -> f64 {
    value as f64 / FIXED_ONE
}

/// An axis-aligned rectangle in screen coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Rectangle {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rectangle {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Rectangle {
        Rectangle {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> i32 {
        self.x + self.width as i32
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.height as i32
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn same_size(&self, other: &Rectangle) -> bool {
        self.size() == other.size()
    }

    pub fn contains_rect(&self, other: &Rectangle) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    /// Width and height of the area spanned from the origin to the far
    /// edges of this rectangle. Parts left of or above the origin don't count.
    pub fn extent(&self) -> (u32, u32) {
        (self.right().max(0) as u32, self.bottom().max(0) as u32)
    }
}

impl std::fmt::Display for Rectangle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}{:+}{:+}", self.width, self.height, self.x, self.y)
    }
}

/// A projective 3x3 matrix in 16.16 fixed point, row major.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Transform {
    pub matrix: [[Fixed; 3]; 3],
}

impl Default for Transform {
    fn default() -> Transform {
        Transform::identity()
    }
}

impl Transform {
    pub const fn identity() -> Transform {
        Transform {
            matrix: [[1 << 16, 0, 0], [0, 1 << 16, 0], [0, 0, 1 << 16]],
        }
    }

    /// Keeps everything but the diagonal, which is replaced by the given factors.
    pub fn with_scale(mut self, x: f64, y: f64) -> Transform {
        self.matrix[0][0] = double_to_fixed(x);
        self.matrix[1][1] = double_to_fixed(y);
        self.matrix[2][2] = double_to_fixed(1.0);
        self
    }

    pub fn scale(&self) -> (f64, f64) {
        (
            fixed_to_double(self.matrix[0][0]),
            fixed_to_double(self.matrix[1][1]),
        )
    }

    pub fn is_identity(&self) -> bool {
        *self == Transform::identity()
    }

    fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let m = |r: usize, c: usize| fixed_to_double(self.matrix[r][c]);
        let tx = m(0, 0) * x + m(0, 1) * y + m(0, 2);
        let ty = m(1, 0) * x + m(1, 1) * y + m(1, 2);
        let w = m(2, 0) * x + m(2, 1) * y + m(2, 2);
        if w == 0.0 {
            (tx, ty)
        } else {
            (tx / w, ty / w)
        }
    }
}

/// Bounds `(x1, y1, x2, y2)` of a `width`x`height` mode once rotated and
/// pushed through `transform`, relative to the CRTC origin.
pub fn calc_bound(
    transform: &Transform,
    rotation: Rotation,
    width: u32,
    height: u32,
) -> (i32, i32, i32, i32) {
    let (w, h) = if rotation.swaps_axes() {
        (height as f64, width as f64)
    } else {
        (width as f64, height as f64)
    };

    let corners = [(0.0, 0.0), (w, 0.0), (0.0, h), (w, h)].map(|(x, y)| transform.apply(x, y));
    let (mut x1, mut y1) = (f64::MAX, f64::MAX);
    let (mut x2, mut y2) = (f64::MIN, f64::MIN);
    for (x, y) in corners {
        x1 = x1.min(x);
        y1 = y1.min(y);
        x2 = x2.max(x);
        y2 = y2.max(y);
    }

    // absorb float noise before snapping outwards
    let snap = |v: f64| (v * 1024.0).round() / 1024.0;
    (
        snap(x1).floor() as i32,
        snap(y1).floor() as i32,
        snap(x2).ceil() as i32,
        snap(y2).ceil() as i32,
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fixed_point_conversion() {
        assert_eq!(double_to_fixed(1.0), 65536);
        assert_eq!(double_to_fixed(1.5), 98304);
        assert_eq!(fixed_to_double(double_to_fixed(0.75)), 0.75);
    }

    #[test]
    fn identity_bound_is_mode_size() {
        let bound = calc_bound(&Transform::identity(), Rotation::ROTATE_0, 1920, 1080);
        assert_eq!(bound, (0, 0, 1920, 1080));
    }

    #[test]
    fn rotation_swaps_bound() {
        let bound = calc_bound(&Transform::identity(), Rotation::ROTATE_90, 1920, 1080);
        assert_eq!(bound, (0, 0, 1080, 1920));
        let bound = calc_bound(
            &Transform::identity(),
            Rotation::ROTATE_180 | Rotation::REFLECT_X,
            1920,
            1080,
        );
        assert_eq!(bound, (0, 0, 1920, 1080));
    }

    #[test]
    fn scale_grows_bound() {
        let transform = Transform::identity().with_scale(1.5, 1.5);
        assert_eq!(transform.scale(), (1.5, 1.5));
        let bound = calc_bound(&transform, Rotation::ROTATE_0, 1280, 1024);
        assert_eq!(bound, (0, 0, 1920, 1536));
        let bound = calc_bound(&transform, Rotation::ROTATE_270, 1280, 1024);
        assert_eq!(bound, (0, 0, 1536, 1920));
    }

    #[test]
    fn rectangle_helpers() {
        let screen = Rectangle::new(0, 0, 3840, 1080);
        let right = Rectangle::new(1920, 0, 1920, 1080);
        assert!(screen.contains_rect(&right));
        assert!(!right.contains_rect(&screen));
        assert_eq!(right.extent(), (3840, 1080));
        assert_eq!(Rectangle::new(-10, -10, 5, 5).extent(), (0, 0));
        assert!(screen.same_size(&Rectangle::new(5, 5, 3840, 1080)));
        assert_eq!(right.to_string(), "1920x1080+1920+0");
    }
}
