// SPDX-License-Identifier: GPL-3.0-only

use super::{gamma, Output};
use crate::{
    backend::{
        CrtcConfig, CrtcId, CrtcTransform, GammaRamp, ModeId, ModeInfo, OutputId, RandrBackend,
        Rotation, Timestamp,
    },
    error::{Invariant, ReconcileError, Result, WriteGroup},
    utils::geometry::{calc_bound, Fixed, Rectangle, Transform},
};
use std::{collections::HashMap, fmt};
use tracing::{debug, warn};

pub const FILTER_NEAREST: &str = "nearest";
pub const FILTER_BILINEAR: &str = "bilinear";

pub type ModeTable = HashMap<ModeId, ModeInfo>;

bitflags::bitflags! {
    /// Groups of a [`PendingConfig`] that differ from what the crtc currently shows.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DirtyMask: u8 {
        const MODE      = 0b0_0001;
        const POSITION  = 0b0_0010;
        const ROTATION  = 0b0_0100;
        const TRANSFORM = 0b0_1000;
        const GAMMA     = 0b1_0000;

        /// Everything that goes out in the combined crtc write.
        const GEOMETRY = Self::MODE.bits() | Self::POSITION.bits() | Self::ROTATION.bits();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnsureSizeHint {
    #[default]
    Auto,
    Panning,
    Scale,
}

/// Display-wide facts a crtc configuration is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct CrtcContext<'a> {
    pub modes: &'a ModeTable,
    pub mirror_mode: bool,
    pub config_timestamp: Timestamp,
}

impl CrtcContext<'_> {
    pub fn mode(&self, id: ModeId) -> Result<&ModeInfo> {
        self.modes
            .get(&id)
            .filter(|mode| mode.width != 0 && mode.height != 0)
            .ok_or(ReconcileError::InvariantViolation(Invariant::MissingMode(id)))
    }
}

/// The crtc reported a different rectangle than the one we asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    pub output: OutputId,
    pub expected: Rectangle,
    pub actual: Rectangle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingConfig {
    crtc: CrtcId,
    output: OutputId,
    dirty: DirtyMask,

    mode: ModeId,
    pos_x: i32,
    pos_y: i32,
    rotation: Rotation,

    transform: CrtcTransform,

    border_compensation_x: u32,
    border_compensation_y: u32,

    // doesn't influence the allocation
    gamma: GammaRamp,
}

fn clamp_i16(value: i32) -> i16 {
    value.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

impl PendingConfig {
    /// Mirrors what `output` currently shows. Nothing is marked dirty, so
    /// committing the result untouched doesn't write anything.
    pub fn from_hardware(
        output: &Output,
        backend: &impl RandrBackend,
        ctx: &CrtcContext<'_>,
    ) -> Result<PendingConfig> {
        let saved = output.saved_config();
        let crtc = if output.crtc() != 0 {
            output.crtc()
        } else {
            saved.map_or(0, |c| c.config().crtc)
        };
        let mut mode = if output.current_mode() != 0 {
            output.current_mode()
        } else {
            saved.map_or(0, |c| c.config().mode)
        };
        if !output.modes().contains(&mode) {
            mode = output.best_mode();
        }

        let info = backend
            .crtc_info(crtc, ctx.config_timestamp)
            .map_err(ReconcileError::query(format!(
                "crtc {} of output {} (opened: {})",
                crtc,
                output.name(),
                output.is_opened()
            )))?;
        if !info.rotation.is_valid() {
            return Err(Invariant::ZeroRotation(info.rotation).into());
        }

        let mut transform = backend
            .crtc_transform(crtc)
            .map_err(ReconcileError::query(format!("transform of crtc {}", crtc)))?;
        if transform.filter.is_empty() {
            transform.filter = FILTER_NEAREST.into();
        }

        let (pos_x, pos_y, border_compensation_x, border_compensation_y) = if ctx.mirror_mode {
            (
                0,
                0,
                (-(info.x as i32)).max(0) as u32,
                (-(info.y as i32)).max(0) as u32,
            )
        } else {
            (info.x as i32, info.y as i32, 0, 0)
        };

        Ok(PendingConfig {
            crtc,
            output: output.id(),
            dirty: DirtyMask::empty(),
            mode,
            pos_x,
            pos_y,
            rotation: info.rotation,
            transform,
            border_compensation_x,
            border_compensation_y,
            gamma: GammaRamp::default(),
        })
    }

    pub fn crtc(&self) -> CrtcId {
        self.crtc
    }

    pub fn output(&self) -> OutputId {
        self.output
    }

    pub fn dirty(&self) -> DirtyMask {
        self.dirty
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn mode(&self) -> ModeId {
        self.mode
    }

    pub fn position(&self) -> (i32, i32) {
        (self.pos_x, self.pos_y)
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    pub fn transform(&self) -> &Transform {
        &self.transform.transform
    }

    pub fn filter(&self) -> &str {
        &self.transform.filter
    }

    pub fn border_compensation(&self) -> (u32, u32) {
        (self.border_compensation_x, self.border_compensation_y)
    }

    pub fn gamma(&self) -> &GammaRamp {
        &self.gamma
    }

    pub(crate) fn mark_dirty(&mut self, mask: DirtyMask) {
        self.dirty |= mask;
    }

    pub fn set_mode(&mut self, mode: ModeId) -> &mut Self {
        if self.mode != mode {
            self.dirty |= DirtyMask::MODE;
            self.mode = mode;
        }
        self
    }

    pub fn set_pos(&mut self, x: i32, y: i32) -> &mut Self {
        if self.pos_x != x || self.pos_y != y {
            self.dirty |= DirtyMask::POSITION;
            self.pos_x = x;
            self.pos_y = y;
        }
        self
    }

    /// Fails without touching anything if `rotation` lacks a rotation bit.
    pub fn set_rotation(&mut self, rotation: Rotation) -> Result<&mut Self> {
        if !rotation.is_valid() {
            return Err(Invariant::ZeroRotation(rotation).into());
        }
        if self.rotation != rotation {
            self.dirty |= DirtyMask::ROTATION;
            self.rotation = rotation;
        }
        Ok(self)
    }

    /// Filter params don't take part in the comparison.
    pub fn set_transform(
        &mut self,
        transform: Transform,
        filter: &str,
        params: Vec<Fixed>,
    ) -> &mut Self {
        if self.transform.transform != transform || self.transform.filter != filter {
            self.dirty |= DirtyMask::TRANSFORM;
            self.transform = CrtcTransform {
                transform,
                filter: filter.to_string(),
                params,
            };
        }
        self
    }

    pub fn set_scale(&mut self, x: f64, y: f64) -> &mut Self {
        let transform = self.transform.transform.with_scale(x, y);
        let filter = if x != 1.0 || y != 1.0 {
            FILTER_BILINEAR
        } else {
            FILTER_NEAREST
        };
        self.set_transform(transform, filter, Vec::new())
    }

    /// The compensation moves the crtc origin in mirror mode, so it counts as position.
    pub(crate) fn set_compensation(&mut self, x: u32, y: u32) -> &mut Self {
        if self.border_compensation_x != x || self.border_compensation_y != y {
            self.dirty |= DirtyMask::POSITION;
            self.border_compensation_x = x;
            self.border_compensation_y = y;
        }
        self
    }

    pub fn set_gamma(&mut self, ramp: GammaRamp) -> &mut Self {
        if self.gamma != ramp {
            self.dirty |= DirtyMask::GAMMA;
            self.gamma = ramp;
        }
        self
    }

    pub fn set_brightness(
        &mut self,
        backend: &impl RandrBackend,
        brightness: f64,
    ) -> Result<&mut Self> {
        let size = backend
            .crtc_gamma_size(self.crtc)
            .map_err(ReconcileError::query(format!("gamma size of crtc {}", self.crtc)))?;
        Ok(self.set_gamma(gamma::brightness_ramp(size as usize, brightness)))
    }

    /// Where the crtc itself gets placed. In mirror mode the visible part
    /// starts at the origin and the cropped border hangs off the screen.
    fn crtc_origin(&self, mirror_mode: bool) -> (i32, i32) {
        if mirror_mode {
            (
                -(self.border_compensation_x as i32),
                -(self.border_compensation_y as i32),
            )
        } else {
            (self.pos_x, self.pos_y)
        }
    }

    /// The rectangle this configuration shows once committed.
    pub fn applied_allocation(&self, ctx: &CrtcContext<'_>) -> Result<Rectangle> {
        let mode = ctx.mode(self.mode)?;
        let (x1, y1, x2, y2) = calc_bound(
            &self.transform.transform,
            self.rotation,
            mode.width as u32,
            mode.height as u32,
        );
        let (origin_x, origin_y) = self.crtc_origin(ctx.mirror_mode);
        let (comp_x, comp_y) = self.border_compensation();

        Ok(Rectangle {
            x: origin_x + x1 + comp_x as i32,
            y: origin_y + y1 + comp_y as i32,
            width: ((x2 - x1).max(0) as u32).saturating_sub(2 * comp_x),
            height: ((y2 - y1).max(0) as u32).saturating_sub(2 * comp_y),
        })
    }

    /// Scales and crops the selected mode so it fills exactly `width`x`height`,
    /// keeping the aspect ratio and cutting off what sticks out.
    pub fn ensure_size(
        &mut self,
        ctx: &CrtcContext<'_>,
        width: u32,
        height: u32,
        _hint: EnsureSizeHint,
    ) -> Result<&mut Self> {
        let mode = *ctx.mode(self.mode)?;
        let (native_w, native_h) = (mode.width as u32, mode.height as u32);

        if (native_w, native_h) == (width, height) {
            self.set_scale(1.0, 1.0).set_compensation(0, 0);
            if ctx.mirror_mode {
                self.set_pos(0, 0);
                self.dirty |= DirtyMask::POSITION;
            }
            return Ok(self);
        }

        let ow = native_w as i64 - width as i64;
        let oh = native_h as i64 - height as i64;
        let (nw, nh) = (native_w as f64, native_h as f64);
        let (w, h) = (width as f64, height as f64);

        if ow >= 0 && oh >= 0 {
            self.set_scale(1.0, 1.0);
            self.set_compensation((ow / 2) as u32, (oh / 2) as u32);
        } else if ow < 0 && oh <= 0 {
            if native_w as u64 * height as u64 == width as u64 * native_h as u64 {
                let scale = 1.0 + (w - nw) / nw;
                self.set_scale(scale, scale).set_compensation(0, 0);
            } else if w / nw >= h / nh {
                self.fill_width(nw, nh, w, h);
            } else {
                self.fill_height(nw, nh, w, h);
            }
        } else if ow >= 0 {
            self.fill_height(nw, nh, w, h);
        } else {
            self.fill_width(nw, nh, w, h);
        }

        let allocation = self.applied_allocation(ctx)?;
        if allocation.size() != (width, height) {
            warn!(
                ow,
                oh,
                %allocation,
                "Failed to ensure size {}x{} for output {}",
                width,
                height,
                self.output,
            );
        }
        Ok(self)
    }

    // scale to the target width, crop top and bottom
    fn fill_width(&mut self, nw: f64, nh: f64, w: f64, h: f64) {
        let scale = w / nw;
        let margin = (nh * scale - h).max(0.0) as u32;
        self.set_compensation(0, margin / 2).set_scale(scale, scale);
    }

    // scale to the target height, crop left and right
    fn fill_height(&mut self, nw: f64, nh: f64, w: f64, h: f64) {
        let scale = h / nh;
        let margin = ((scale * nw - w) / 2.0).ceil().max(0.0) as u32;
        self.set_compensation(margin, 0).set_scale(scale, scale);
    }

    /// Writes the dirty groups: gamma, then transform, then mode, position and
    /// rotation in one request. Mode 0 just switches the crtc off.
    pub fn apply(
        &self,
        backend: &impl RandrBackend,
        ctx: &CrtcContext<'_>,
    ) -> Result<Option<Mismatch>> {
        if self.mode == 0 {
            backend
                .set_crtc_config(
                    self.crtc,
                    ctx.config_timestamp,
                    &CrtcConfig {
                        x: 0,
                        y: 0,
                        mode: 0,
                        rotation: self.rotation,
                        outputs: Vec::new(),
                    },
                )
                .map_err(ReconcileError::hardware(WriteGroup::Geometry, self.crtc))?;
            return Ok(None);
        }

        if self.dirty.contains(DirtyMask::GAMMA) {
            backend
                .set_crtc_gamma(self.crtc, &self.gamma)
                .map_err(ReconcileError::hardware(WriteGroup::Gamma, self.crtc))?;
        }
        if self.dirty.contains(DirtyMask::TRANSFORM) {
            backend
                .set_crtc_transform(self.crtc, &self.transform)
                .map_err(ReconcileError::hardware(WriteGroup::Transform, self.crtc))?;
        }

        // a new transform only takes effect with the next crtc config
        if !self.dirty.intersects(DirtyMask::GEOMETRY | DirtyMask::TRANSFORM) {
            return Ok(None);
        }

        let (x, y) = self.crtc_origin(ctx.mirror_mode);
        backend
            .set_crtc_config(
                self.crtc,
                ctx.config_timestamp,
                &CrtcConfig {
                    x: clamp_i16(x),
                    y: clamp_i16(y),
                    mode: self.mode,
                    rotation: self.rotation,
                    outputs: vec![self.output],
                },
            )
            .map_err(ReconcileError::hardware(WriteGroup::Geometry, self.crtc))?;

        let expected = self.applied_allocation(ctx)?;
        let info = match backend.crtc_info(self.crtc, ctx.config_timestamp) {
            Ok(info) => info,
            Err(err) => {
                warn!(?err, crtc = self.crtc, "Failed to read back crtc after commit");
                return Ok(None);
            }
        };
        let (comp_x, comp_y) = self.border_compensation();
        let actual = Rectangle {
            x: info.x as i32 + comp_x as i32,
            y: info.y as i32 + comp_y as i32,
            width: (info.width as u32).saturating_sub(2 * comp_x),
            height: (info.height as u32).saturating_sub(2 * comp_y),
        };
        if actual != expected {
            warn!(
                %expected,
                %actual,
                "Crtc {} of output {} ended up with a different geometry",
                self.crtc,
                self.output,
            );
            return Ok(Some(Mismatch {
                output: self.output,
                expected,
                actual,
            }));
        }

        debug!(config = %self, %actual, "Committed crtc configuration");
        Ok(None)
    }
}

impl fmt::Display for PendingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (scale_x, scale_y) = self.transform.transform.scale();
        write!(
            f,
            "crtc: {}, output: {}, mode: {}, pos: ({}, {}), rotation: {:?}, scale: ({}, {}), border: ({}, {}), dirty: {:?}",
            self.crtc,
            self.output,
            self.mode,
            self.pos_x,
            self.pos_y,
            self.rotation,
            scale_x,
            scale_y,
            self.border_compensation_x,
            self.border_compensation_y,
            self.dirty,
        )
    }
}
