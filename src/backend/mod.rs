// SPDX-License-Identifier: GPL-3.0-only

//! The display server as seen by the reconciler.
//!
//! Everything that talks to the X server goes through [`RandrBackend`]. The
//! reconciler never encodes requests itself, which keeps it testable against
//! the in-memory [`headless::HeadlessBackend`].

use crate::utils::geometry::{Fixed, Rectangle, Transform};

pub mod headless;
#[cfg(feature = "x11")]
pub mod x11;

pub type CrtcId = u32;
pub type OutputId = u32;
pub type ModeId = u32;
pub type Timestamp = u32;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Rotation: u16 {
        const ROTATE_0   = 0b00_0001;
        const ROTATE_90  = 0b00_0010;
        const ROTATE_180 = 0b00_0100;
        const ROTATE_270 = 0b00_1000;
        const REFLECT_X  = 0b01_0000;
        const REFLECT_Y  = 0b10_0000;

        const ROTATIONS = Self::ROTATE_0.bits()
            | Self::ROTATE_90.bits()
            | Self::ROTATE_180.bits()
            | Self::ROTATE_270.bits();
        const REFLECTIONS = Self::REFLECT_X.bits() | Self::REFLECT_Y.bits();
    }
}

impl Rotation {
    pub fn rotation(self) -> Rotation {
        self & Rotation::ROTATIONS
    }

    pub fn reflection(self) -> Rotation {
        self & Rotation::REFLECTIONS
    }

    /// A mask is only meaningful with a rotation bit set.
    pub fn is_valid(self) -> bool {
        !self.rotation().is_empty()
    }

    pub fn swaps_axes(self) -> bool {
        self.intersects(Rotation::ROTATE_90 | Rotation::ROTATE_270)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModeInfo {
    pub id: ModeId,
    pub width: u16,
    pub height: u16,
    /// Refresh rate in mHz, 0 if unknown.
    pub refresh: u32,
}

impl ModeInfo {
    pub fn pixels(&self) -> u32 {
        self.width as u32 * self.height as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputInfo {
    pub id: OutputId,
    pub name: String,
    /// Crtc currently driving this output, 0 if none.
    pub crtc: CrtcId,
    pub crtcs: Vec<CrtcId>,
    /// Supported modes, preferred ones first.
    pub modes: Vec<ModeId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenResources {
    pub config_timestamp: Timestamp,
    pub width: u16,
    pub height: u16,
    pub modes: Vec<ModeInfo>,
    /// Connected outputs only.
    pub outputs: Vec<OutputInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrtcInfo {
    pub x: i16,
    pub y: i16,
    pub width: u16,
    pub height: u16,
    /// 0 if the crtc is disabled.
    pub mode: ModeId,
    /// Raw mask as reported, not validated.
    pub rotation: Rotation,
    pub outputs: Vec<OutputId>,
}

impl CrtcInfo {
    pub fn rect(&self) -> Rectangle {
        Rectangle::new(
            self.x as i32,
            self.y as i32,
            self.width as u32,
            self.height as u32,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrtcTransform {
    pub transform: Transform,
    pub filter: String,
    pub params: Vec<Fixed>,
}

impl Default for CrtcTransform {
    fn default() -> CrtcTransform {
        CrtcTransform {
            transform: Transform::identity(),
            filter: String::new(),
            params: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GammaRamp {
    pub red: Vec<u16>,
    pub green: Vec<u16>,
    pub blue: Vec<u16>,
}

impl GammaRamp {
    pub fn len(&self) -> usize {
        self.red.len()
    }

    pub fn is_empty(&self) -> bool {
        self.red.is_empty()
    }
}

/// Parameters of the combined mode/position/rotation write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrtcConfig {
    pub x: i16,
    pub y: i16,
    pub mode: ModeId,
    pub rotation: Rotation,
    pub outputs: Vec<OutputId>,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("request rejected by the display server: {0}")]
    Rejected(String),
    #[error("display server connection failed: {0}")]
    Connection(String),
    #[error("no {kind} with id {id}")]
    NotFound { kind: &'static str, id: u32 },
}

pub trait RandrBackend {
    fn screen_resources(&self) -> Result<ScreenResources, BackendError>;

    fn crtc_info(&self, crtc: CrtcId, timestamp: Timestamp) -> Result<CrtcInfo, BackendError>;
    fn crtc_transform(&self, crtc: CrtcId) -> Result<CrtcTransform, BackendError>;
    fn crtc_gamma_size(&self, crtc: CrtcId) -> Result<u16, BackendError>;
    /// Crtcs able to drive `output`.
    fn output_crtcs(
        &self,
        output: OutputId,
        timestamp: Timestamp,
    ) -> Result<Vec<CrtcId>, BackendError>;

    /// One atomic reconfiguration of mode, position, rotation and bound outputs.
    fn set_crtc_config(
        &self,
        crtc: CrtcId,
        timestamp: Timestamp,
        config: &CrtcConfig,
    ) -> Result<(), BackendError>;
    fn set_crtc_transform(
        &self,
        crtc: CrtcId,
        transform: &CrtcTransform,
    ) -> Result<(), BackendError>;
    fn set_crtc_gamma(&self, crtc: CrtcId, ramp: &GammaRamp) -> Result<(), BackendError>;

    fn set_screen_size(&self, width: u16, height: u16) -> Result<(), BackendError>;
    fn set_output_primary(&self, output: Option<OutputId>) -> Result<(), BackendError>;

    /// Block every other client until [`RandrBackend::ungrab_server`].
    fn grab_server(&self) -> Result<(), BackendError>;
    fn ungrab_server(&self) -> Result<(), BackendError>;

    /// Stop delivering RandR notifications to this client.
    fn pause_events(&self) -> Result<(), BackendError>;
    fn resume_events(&self) -> Result<(), BackendError>;
}

impl<B: RandrBackend + ?Sized> RandrBackend for &B {
    fn screen_resources(&self) -> Result<ScreenResources, BackendError> {
        (**self).screen_resources()
    }
    fn crtc_info(&self, crtc: CrtcId, timestamp: Timestamp) -> Result<CrtcInfo, BackendError> {
        (**self).crtc_info(crtc, timestamp)
    }
    fn crtc_transform(&self, crtc: CrtcId) -> Result<CrtcTransform, BackendError> {
        (**self).crtc_transform(crtc)
    }
    fn crtc_gamma_size(&self, crtc: CrtcId) -> Result<u16, BackendError> {
        (**self).crtc_gamma_size(crtc)
    }
    fn output_crtcs(
        &self,
        output: OutputId,
        timestamp: Timestamp,
    ) -> Result<Vec<CrtcId>, BackendError> {
        (**self).output_crtcs(output, timestamp)
    }
    fn set_crtc_config(
        &self,
        crtc: CrtcId,
        timestamp: Timestamp,
        config: &CrtcConfig,
    ) -> Result<(), BackendError> {
        (**self).set_crtc_config(crtc, timestamp, config)
    }
    fn set_crtc_transform(
        &self,
        crtc: CrtcId,
        transform: &CrtcTransform,
    ) -> Result<(), BackendError> {
        (**self).set_crtc_transform(crtc, transform)
    }
    fn set_crtc_gamma(&self, crtc: CrtcId, ramp: &GammaRamp) -> Result<(), BackendError> {
        (**self).set_crtc_gamma(crtc, ramp)
    }
    fn set_screen_size(&self, width: u16, height: u16) -> Result<(), BackendError> {
        (**self).set_screen_size(width, height)
    }
    fn set_output_primary(&self, output: Option<OutputId>) -> Result<(), BackendError> {
        (**self).set_output_primary(output)
    }
    fn grab_server(&self) -> Result<(), BackendError> {
        (**self).grab_server()
    }
    fn ungrab_server(&self) -> Result<(), BackendError> {
        (**self).ungrab_server()
    }
    fn pause_events(&self) -> Result<(), BackendError> {
        (**self).pause_events()
    }
    fn resume_events(&self) -> Result<(), BackendError> {
        (**self).resume_events()
    }
}
