// SPDX-License-Identifier: GPL-3.0-only

//! All outputs of one X screen and the knobs that span more than one of them.
//!
//! Settings are staged through [`Display::configure`] and only reach the
//! hardware once [`Display::apply_changed`] runs.

use crate::{
    backend::{ModeId, ModeInfo, OutputId, RandrBackend, Rotation, Timestamp},
    error::{Invariant, ReconcileError, Result},
    output::{CrtcContext, EnsureSizeHint, ModeTable, Output, PendingConfig},
    utils::geometry::{Fixed, Rectangle, Transform},
};
use indexmap::IndexMap;
use tracing::{debug, info};

mod apply;

pub use self::apply::ApplyReport;

#[derive(Debug)]
pub struct Display<B> {
    backend: B,
    outputs: IndexMap<OutputId, Output>,
    modes: ModeTable,

    mirror_mode: bool,
    /// Looked up on use, the output itself is owned by `outputs`.
    mirror_output: Option<OutputId>,
    primary_output: Option<OutputId>,

    width: u32,
    height: u32,
    config_timestamp: Timestamp,
}

impl<B: RandrBackend> Display<B> {
    /// Enumerates the connected outputs once. They stay around for the
    /// lifetime of the display and only get opened or closed.
    pub fn new(backend: B) -> Result<Display<B>> {
        let resources = backend
            .screen_resources()
            .map_err(ReconcileError::query("screen resources"))?;
        let modes = resources
            .modes
            .iter()
            .map(|mode| (mode.id, *mode))
            .collect::<ModeTable>();

        let mut outputs = IndexMap::with_capacity(resources.outputs.len());
        for info in &resources.outputs {
            let crtc = if info.crtc != 0 {
                Some(
                    backend
                        .crtc_info(info.crtc, resources.config_timestamp)
                        .map_err(ReconcileError::query(format!(
                            "crtc {} of output {}",
                            info.crtc, info.name
                        )))?,
                )
            } else {
                None
            };
            let output = Output::new(info, crtc.as_ref(), &modes);
            info!(
                name = output.name(),
                opened = output.is_opened(),
                allocation = %output.allocation(),
                "Found output {}",
                output.id(),
            );
            outputs.insert(info.id, output);
        }

        Ok(Display {
            backend,
            outputs,
            modes,
            mirror_mode: false,
            mirror_output: None,
            primary_output: None,
            width: resources.width as u32,
            height: resources.height as u32,
            config_timestamp: resources.config_timestamp,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn outputs(&self) -> impl Iterator<Item = &Output> {
        self.outputs.values()
    }

    pub fn output(&self, id: OutputId) -> Result<&Output> {
        self.outputs
            .get(&id)
            .ok_or(ReconcileError::InvariantViolation(Invariant::UnknownOutput(id)))
    }

    pub fn output_by_name(&self, name: &str) -> Option<&Output> {
        self.outputs.values().find(|output| output.name() == name)
    }

    pub fn mode(&self, id: ModeId) -> Option<&ModeInfo> {
        self.modes.get(&id)
    }

    pub fn modes(&self, output: OutputId) -> Result<Vec<&ModeInfo>> {
        Ok(self
            .output(output)?
            .modes()
            .iter()
            .filter_map(|id| self.modes.get(id))
            .collect())
    }

    pub fn best_mode(&self, output: OutputId) -> Result<Option<&ModeInfo>> {
        Ok(self.modes.get(&self.output(output)?.best_mode()))
    }

    pub fn allocation(&self, output: OutputId) -> Result<Rectangle> {
        Ok(self.output(output)?.allocation())
    }

    pub fn is_opened(&self, output: OutputId) -> Result<bool> {
        Ok(self.output(output)?.is_opened())
    }

    /// Where `output` ends up if everything staged right now gets applied.
    pub fn pending_allocation(&self, output: OutputId) -> Result<Rectangle> {
        self.output(output)?
            .pending_allocation(&self.backend, &self.context())
    }

    /// What `output` shows right now, or what it restores once opened again.
    pub fn current_config(&self, output: OutputId) -> Result<Option<PendingConfig>> {
        let output = self.output(output)?;
        if output.is_opened() {
            return PendingConfig::from_hardware(output, &self.backend, &self.context()).map(Some);
        }
        Ok(output.saved_config().map(|saved| saved.config().clone()))
    }

    pub fn screen_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn config_timestamp(&self) -> Timestamp {
        self.config_timestamp
    }

    pub fn mirror_mode(&self) -> bool {
        self.mirror_mode
    }

    pub fn mirror_output(&self) -> Option<OutputId> {
        self.mirror_output
    }

    pub fn primary_output(&self) -> Option<OutputId> {
        self.primary_output
    }

    pub fn has_changes(&self) -> bool {
        self.outputs.values().any(Output::has_changes)
    }

    fn context(&self) -> CrtcContext<'_> {
        CrtcContext {
            modes: &self.modes,
            mirror_mode: self.mirror_mode,
            config_timestamp: self.config_timestamp,
        }
    }

    /// Stages changes for `output`. The draft is created from the live crtc
    /// on first use and survives until the next [`Display::apply_changed`].
    pub fn configure(&mut self, output: OutputId) -> Result<Configurator<'_, B>> {
        let ctx = CrtcContext {
            modes: &self.modes,
            mirror_mode: self.mirror_mode,
            config_timestamp: self.config_timestamp,
        };
        let config = self
            .outputs
            .get_mut(&output)
            .ok_or(Invariant::UnknownOutput(output))?
            .pending_config(&self.backend, &ctx)?;
        Ok(Configurator {
            config,
            ctx,
            backend: &self.backend,
        })
    }

    pub fn discard_changes(&mut self, output: OutputId) -> Result<()> {
        self.outputs
            .get_mut(&output)
            .ok_or(Invariant::UnknownOutput(output))?
            .discard_pending();
        Ok(())
    }

    pub(crate) fn discard_all_changes(&mut self) {
        for output in self.outputs.values_mut() {
            output.discard_pending();
        }
    }

    /// Switching modes changes how drafts map to crtc origins, so staged
    /// changes are dropped.
    pub fn set_mirror_mode(&mut self, enabled: bool) {
        if self.mirror_mode != enabled {
            debug!(enabled, "Switching mirror mode");
            self.mirror_mode = enabled;
            self.discard_all_changes();
        }
    }

    pub fn set_mirror_output(&mut self, output: Option<OutputId>) -> Result<()> {
        if let Some(id) = output {
            self.output(id)?;
        }
        self.mirror_output = output;
        Ok(())
    }

    /// Written at the end of the next [`Display::apply_changed`].
    pub fn set_primary_output(&mut self, output: Option<OutputId>) -> Result<()> {
        if let Some(id) = output {
            self.output(id)?;
        }
        self.primary_output = output;
        Ok(())
    }
}

/// Fluent access to the draft of one output.
///
/// ```no_run
/// # use cosmic_xrandr::{backend::{headless::HeadlessBackend, Rotation}, display::Display};
/// # fn run(display: &mut Display<HeadlessBackend>, id: u32) -> cosmic_xrandr::error::Result<()> {
/// display
///     .configure(id)?
///     .set_pos(1920, 0)
///     .set_rotation(Rotation::ROTATE_90)?
///     .set_brightness(0.8)?;
/// display.apply_changed()?;
/// # Ok(())
/// # }
/// ```
pub struct Configurator<'a, B> {
    config: &'a mut PendingConfig,
    ctx: CrtcContext<'a>,
    backend: &'a B,
}

impl<B: RandrBackend> Configurator<'_, B> {
    pub fn config(&self) -> &PendingConfig {
        self.config
    }

    pub fn set_mode(&mut self, mode: ModeId) -> &mut Self {
        self.config.set_mode(mode);
        self
    }

    pub fn set_pos(&mut self, x: i32, y: i32) -> &mut Self {
        self.config.set_pos(x, y);
        self
    }

    pub fn set_rotation(&mut self, rotation: Rotation) -> Result<&mut Self> {
        self.config.set_rotation(rotation)?;
        Ok(self)
    }

    pub fn set_transform(
        &mut self,
        transform: Transform,
        filter: &str,
        params: Vec<Fixed>,
    ) -> &mut Self {
        self.config.set_transform(transform, filter, params);
        self
    }

    pub fn set_scale(&mut self, x: f64, y: f64) -> &mut Self {
        self.config.set_scale(x, y);
        self
    }

    pub fn set_brightness(&mut self, brightness: f64) -> Result<&mut Self> {
        self.config.set_brightness(self.backend, brightness)?;
        Ok(self)
    }

    pub fn ensure_size(
        &mut self,
        width: u32,
        height: u32,
        hint: EnsureSizeHint,
    ) -> Result<&mut Self> {
        self.config.ensure_size(&self.ctx, width, height, hint)?;
        Ok(self)
    }

    pub fn applied_allocation(&self) -> Result<Rectangle> {
        self.config.applied_allocation(&self.ctx)
    }
}
