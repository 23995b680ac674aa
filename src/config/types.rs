// SPDX-License-Identifier: GPL-3.0-only

use crate::backend::Rotation;
use cosmic_xrandr_config::TransformDef;

impl From<TransformDef> for Rotation {
    fn from(transform: TransformDef) -> Rotation {
        match transform {
            TransformDef::Normal => Rotation::ROTATE_0,
            TransformDef::_90 => Rotation::ROTATE_90,
            TransformDef::_180 => Rotation::ROTATE_180,
            TransformDef::_270 => Rotation::ROTATE_270,
            TransformDef::Flipped => Rotation::ROTATE_0 | Rotation::REFLECT_X,
            TransformDef::Flipped90 => Rotation::ROTATE_90 | Rotation::REFLECT_X,
            TransformDef::Flipped180 => Rotation::ROTATE_180 | Rotation::REFLECT_X,
            TransformDef::Flipped270 => Rotation::ROTATE_270 | Rotation::REFLECT_X,
        }
    }
}

impl From<Rotation> for TransformDef {
    fn from(rotation: Rotation) -> TransformDef {
        let mut quarter = if rotation.contains(Rotation::ROTATE_90) {
            1
        } else if rotation.contains(Rotation::ROTATE_180) {
            2
        } else if rotation.contains(Rotation::ROTATE_270) {
            3
        } else {
            0
        };
        let mut flipped = rotation.contains(Rotation::REFLECT_X);
        // a vertical flip is a horizontal one turned upside down
        if rotation.contains(Rotation::REFLECT_Y) {
            quarter = (quarter + 2) % 4;
            flipped = !flipped;
        }

        match (flipped, quarter) {
            (false, 0) => TransformDef::Normal,
            (false, 1) => TransformDef::_90,
            (false, 2) => TransformDef::_180,
            (false, _) => TransformDef::_270,
            (true, 0) => TransformDef::Flipped,
            (true, 1) => TransformDef::Flipped90,
            (true, 2) => TransformDef::Flipped180,
            (true, _) => TransformDef::Flipped270,
        }
    }
}
