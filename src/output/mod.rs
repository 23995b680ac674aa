// SPDX-License-Identifier: GPL-3.0-only

use crate::{
    backend::{CrtcId, CrtcInfo, ModeId, ModeInfo, OutputId, OutputInfo, RandrBackend, Rotation},
    error::Result,
    utils::geometry::Rectangle,
};

pub mod gamma;
mod pending;

pub use self::pending::{
    CrtcContext, DirtyMask, EnsureSizeHint, Mismatch, ModeTable, PendingConfig, FILTER_BILINEAR,
    FILTER_NEAREST,
};

/// Frozen configuration of a closed output, restored when it gets opened again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedConfig(PendingConfig);

impl SavedConfig {
    pub fn config(&self) -> &PendingConfig {
        &self.0
    }

    /// A draft that rewrites the whole geometry, since the crtc was switched
    /// off in the meantime.
    pub fn thaw(self) -> PendingConfig {
        let mut config = self.0;
        config.mark_dirty(DirtyMask::GEOMETRY | DirtyMask::TRANSFORM);
        config
    }
}

/// One connected connector and what we know about its crtc.
#[derive(Debug)]
pub struct Output {
    id: OutputId,
    name: String,

    crtc: CrtcId,
    modes: Vec<ModeId>,
    best_mode: ModeId,
    current_mode: ModeId,

    allocation: Rectangle,
    rotation: Rotation,
    opened: bool,

    pending: Option<PendingConfig>,
    saved: Option<SavedConfig>,
}

impl Output {
    pub fn new(info: &OutputInfo, crtc: Option<&CrtcInfo>, modes: &ModeTable) -> Output {
        // highest resolution wins, ties go to the mode the output prefers
        let best_mode = info
            .modes
            .iter()
            .filter_map(|id| modes.get(id))
            .fold(None, |best: Option<&ModeInfo>, mode| match best {
                Some(best) if best.pixels() >= mode.pixels() => Some(best),
                _ => Some(mode),
            })
            .map_or(0, |mode| mode.id);

        let mut output = Output {
            id: info.id,
            name: info.name.clone(),
            crtc: 0,
            modes: info.modes.clone(),
            best_mode,
            current_mode: 0,
            allocation: Rectangle::default(),
            rotation: Rotation::ROTATE_0,
            opened: false,
            pending: None,
            saved: None,
        };
        output.sync(info.crtc, crtc, None);
        output
    }

    pub fn id(&self) -> OutputId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn crtc(&self) -> CrtcId {
        self.crtc
    }

    pub fn modes(&self) -> &[ModeId] {
        &self.modes
    }

    /// 0 if the output doesn't advertise any mode.
    pub fn best_mode(&self) -> ModeId {
        self.best_mode
    }

    pub fn current_mode(&self) -> ModeId {
        self.current_mode
    }

    /// The rectangle the output showed after the last commit.
    pub fn allocation(&self) -> Rectangle {
        self.allocation
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    pub fn is_opened(&self) -> bool {
        self.opened
    }

    pub fn pending(&self) -> Option<&PendingConfig> {
        self.pending.as_ref()
    }

    pub fn saved_config(&self) -> Option<&SavedConfig> {
        self.saved.as_ref()
    }

    pub fn has_changes(&self) -> bool {
        self.pending.as_ref().is_some_and(PendingConfig::is_dirty)
    }

    /// The draft of this output, synthesised from the hardware on first use.
    pub fn pending_config(
        &mut self,
        backend: &impl RandrBackend,
        ctx: &CrtcContext<'_>,
    ) -> Result<&mut PendingConfig> {
        let config = match self.pending.take() {
            Some(config) => config,
            None => PendingConfig::from_hardware(self, backend, ctx)?,
        };
        Ok(self.pending.insert(config))
    }

    /// Where the output will end up once its draft is committed. Closed
    /// outputs occupy nothing.
    pub fn pending_allocation(
        &self,
        backend: &impl RandrBackend,
        ctx: &CrtcContext<'_>,
    ) -> Result<Rectangle> {
        if !self.opened {
            return Ok(Rectangle::default());
        }
        match &self.pending {
            Some(config) if config.mode() == 0 => Ok(Rectangle::default()),
            Some(config) => config.applied_allocation(ctx),
            None => PendingConfig::from_hardware(self, backend, ctx)?.applied_allocation(ctx),
        }
    }

    pub(crate) fn take_pending(&mut self) -> Option<PendingConfig> {
        self.pending.take()
    }

    pub(crate) fn discard_pending(&mut self) {
        self.pending = None;
    }

    pub(crate) fn save(&mut self, config: PendingConfig) {
        self.saved = Some(SavedConfig(config));
    }

    pub(crate) fn take_saved(&mut self) -> Option<SavedConfig> {
        self.saved.take()
    }

    /// Records what the crtc reports now. `visible` overrides the allocation
    /// with the cropped rectangle of a config that was just committed.
    pub(crate) fn sync(
        &mut self,
        crtc: CrtcId,
        info: Option<&CrtcInfo>,
        visible: Option<Rectangle>,
    ) {
        let Some(info) = info.filter(|info| crtc != 0 && info.mode != 0) else {
            self.crtc = 0;
            self.current_mode = 0;
            self.opened = false;
            return;
        };

        self.crtc = crtc;
        self.current_mode = info.mode;
        self.opened = true;
        if info.rotation.is_valid() {
            self.rotation = info.rotation;
        }
        self.allocation = visible.unwrap_or_else(|| info.rect());
    }
}
