// SPDX-License-Identifier: GPL-3.0-only

use crate::backend::GammaRamp;

pub const MIN_BRIGHTNESS: f64 = 0.01;
pub const MAX_BRIGHTNESS: f64 = 1.0;

pub fn clamp_brightness(brightness: f64) -> f64 {
    if brightness.is_nan() {
        MAX_BRIGHTNESS
    } else {
        brightness.clamp(MIN_BRIGHTNESS, MAX_BRIGHTNESS)
    }
}

/// Linear ramp of `size` entries scaled down by `brightness`.
pub fn brightness_ramp(size: usize, brightness: f64) -> GammaRamp {
    let brightness = clamp_brightness(brightness);
    let channel = (0..size)
        .map(|i| {
            let normalized = if size > 1 {
                i as f64 / (size - 1) as f64
            } else {
                1.0
            };
            (normalized * brightness * 65535.0) as u16
        })
        .collect::<Vec<_>>();

    GammaRamp {
        red: channel.clone(),
        green: channel.clone(),
        blue: channel,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn full_brightness_is_linear() {
        let ramp = brightness_ramp(256, 1.0);
        assert_eq!(ramp.len(), 256);
        assert_eq!(ramp.red[0], 0);
        assert_eq!(ramp.red[255], 65535);
        assert_eq!(ramp.red, ramp.blue);
        assert!(ramp.green.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn dimmed_ramp_is_scaled() {
        let ramp = brightness_ramp(3, 0.5);
        assert_eq!(ramp.red, vec![0, 16383, 32767]);
    }

    #[test]
    fn brightness_is_clamped() {
        assert_eq!(clamp_brightness(0.0), MIN_BRIGHTNESS);
        assert_eq!(clamp_brightness(3.0), MAX_BRIGHTNESS);
        assert_eq!(clamp_brightness(f64::NAN), MAX_BRIGHTNESS);
        assert_eq!(brightness_ramp(2, 7.0).red[1], 65535);
    }
}
