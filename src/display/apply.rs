// SPDX-License-Identifier: GPL-3.0-only

use super::Display;
use crate::{
    backend::{CrtcConfig, CrtcId, OutputId, RandrBackend},
    error::{Invariant, ReconcileError, Result, WriteGroup},
    output::{CrtcContext, EnsureSizeHint, Mismatch, Output, PendingConfig},
    utils::geometry::Rectangle,
};
use parking_lot::Mutex;
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
};
use tracing::{debug, error, info, warn};

/// Serializes reconfiguration passes of every display in this process.
static CHANGE_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// Screen size changes smaller than this are treated as rounding noise.
const RESIZE_THRESHOLD: u32 = 4;

/// What a call to [`Display::apply_changed`] did.
#[derive(Debug, Default)]
pub struct ApplyReport {
    /// Nothing was staged, the hardware wasn't touched.
    pub skipped: bool,
    pub committed: Vec<OutputId>,
    /// Outputs switched off to let the screen shrink and switched on again.
    pub reopened: Vec<OutputId>,
    pub mismatches: Vec<Mismatch>,
    /// Writes that failed without failing the whole pass.
    pub failures: Vec<(OutputId, ReconcileError)>,
    pub screen_size: (u32, u32),
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        String::from("<unknown>")
    }
}

/// Re-reads the crtc of `output` after a commit.
fn resync(
    output: &mut Output,
    backend: &impl RandrBackend,
    ctx: &CrtcContext<'_>,
    crtc: CrtcId,
    visible: Option<Rectangle>,
) {
    match backend.crtc_info(crtc, ctx.config_timestamp) {
        Ok(info) => output.sync(crtc, Some(&info), visible),
        Err(err) => warn!(?err, output = output.name(), "Failed to re-read crtc {}", crtc),
    }
}

impl<B: RandrBackend> Display<B> {
    /// Runs `f` with the server grabbed and the process wide change lock held.
    /// Both are released on every way out, including a panic inside `f`.
    fn with_change_window<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let _guard = CHANGE_LOCK.lock();
        self.backend
            .grab_server()
            .map_err(ReconcileError::query("exclusive server grab"))?;

        let result = panic::catch_unwind(AssertUnwindSafe(|| f(self)));

        if let Err(err) = self.backend.ungrab_server() {
            error!(?err, "Failed to release the server grab");
        }

        match result {
            Ok(result) => result,
            Err(payload) => {
                let msg = panic_message(&*payload);
                error!(msg = %msg, "Output reconfiguration panicked");
                if let Err(err) = self.backend.resume_events() {
                    warn!(?err, "Failed to resume RandR events");
                }
                self.discard_all_changes();
                Err(ReconcileError::Panicked(msg))
            }
        }
    }

    /// Commits every staged change.
    ///
    /// In mirror mode all open outputs are first fitted to the mirror source,
    /// then the screen is resized to hold every output, the drafts are written
    /// and the primary output is set. Drafts never survive a pass.
    pub fn apply_changed(&mut self) -> Result<ApplyReport> {
        self.with_change_window(Self::apply_pass)
    }

    fn apply_pass(&mut self) -> Result<ApplyReport> {
        let mut report = ApplyReport {
            screen_size: self.screen_size(),
            ..Default::default()
        };
        if !self.has_changes() {
            debug!("No output has pending changes");
            self.discard_all_changes();
            report.skipped = true;
            return Ok(report);
        }

        if let Err(err) = self.refresh_config_timestamp() {
            self.discard_all_changes();
            return Err(err);
        }

        if let Err(err) = self.backend.pause_events() {
            warn!(?err, "Failed to pause RandR events");
        }
        let result = self.commit_all(&mut report);
        if let Err(err) = self.backend.resume_events() {
            warn!(?err, "Failed to resume RandR events");
        }
        let fatal = result?;

        if let Err(source) = self.backend.set_output_primary(self.primary_output) {
            warn!(err = ?source, "Failed to set the primary output");
            report.failures.push((
                self.primary_output.unwrap_or(0),
                ReconcileError::Hardware {
                    group: WriteGroup::Primary,
                    crtc: 0,
                    source,
                },
            ));
        }

        report.screen_size = self.screen_size();
        match fatal {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Picks up the config timestamp of changes made by other clients, so
    /// our writes don't get refused as stale.
    fn refresh_config_timestamp(&mut self) -> Result<()> {
        let resources = self
            .backend
            .screen_resources()
            .map_err(ReconcileError::query("screen resources"))?;
        self.config_timestamp = self.config_timestamp.max(resources.config_timestamp);
        Ok(())
    }

    /// Returns the error of the first rejected geometry write, after every
    /// other output was still committed.
    fn commit_all(&mut self, report: &mut ApplyReport) -> Result<Option<ReconcileError>> {
        let closed = match self.fan_out_mirror().and_then(|_| self.adjust_screen_size()) {
            Ok(closed) => closed,
            Err(err) => {
                error!(?err, "Aborting output reconfiguration");
                self.discard_all_changes();
                return Err(err);
            }
        };

        let mut fatal = None;
        let ctx = CrtcContext {
            modes: &self.modes,
            mirror_mode: self.mirror_mode,
            config_timestamp: self.config_timestamp,
        };
        for (id, output) in self.outputs.iter_mut() {
            let Some(config) = output.take_pending() else {
                continue;
            };
            if !config.is_dirty() {
                continue;
            }

            match config.apply(&self.backend, &ctx) {
                Ok(mismatch) => {
                    report.committed.push(*id);
                    let visible = match mismatch {
                        Some(mismatch) => {
                            report.mismatches.push(mismatch);
                            Some(mismatch.actual)
                        }
                        None if config.mode() != 0 => config.applied_allocation(&ctx).ok(),
                        None => None,
                    };
                    resync(output, &self.backend, &ctx, config.crtc(), visible);
                }
                Err(err) => {
                    warn!(?err, output = output.name(), "Failed to apply output configuration");
                    resync(output, &self.backend, &ctx, config.crtc(), None);
                    if fatal.is_none() && err.write_group() == Some(WriteGroup::Geometry) {
                        fatal = Some(err);
                    } else {
                        report.failures.push((*id, err));
                    }
                }
            }
        }

        for id in closed {
            match self.set_opened(id, true) {
                Ok(()) => report.reopened.push(id),
                Err(err) => {
                    warn!(?err, "Failed to reopen output {}", id);
                    report.failures.push((id, err));
                }
            }
        }

        Ok(fatal)
    }

    /// Clones the mirror source onto every other open output.
    fn fan_out_mirror(&mut self) -> Result<()> {
        if !self.mirror_mode {
            return Ok(());
        }
        let Some(source_id) = self.mirror_output else {
            return Ok(());
        };
        let ctx = CrtcContext {
            modes: &self.modes,
            mirror_mode: self.mirror_mode,
            config_timestamp: self.config_timestamp,
        };
        let Some(source) = self.outputs.get(&source_id).filter(|o| o.is_opened()) else {
            return Ok(());
        };

        let target = source.pending_allocation(&self.backend, &ctx)?;
        let rotation = source
            .pending()
            .map_or(source.rotation(), PendingConfig::rotation);
        debug!(source = source.name(), %target, "Mirroring output");

        for (id, output) in self.outputs.iter_mut() {
            if *id == source_id || !output.is_opened() {
                continue;
            }
            output
                .pending_config(&self.backend, &ctx)?
                .set_pos(0, 0)
                .set_rotation(rotation)?
                .set_scale(1.0, 1.0)
                .ensure_size(&ctx, target.width, target.height, EnsureSizeHint::Auto)?;
        }
        Ok(())
    }

    /// Grows or shrinks the screen to the union of all pending allocations.
    ///
    /// Outputs that can't stay lit while the screen shrinks are closed and
    /// returned, so they can be reopened once the resize went through.
    pub(crate) fn adjust_screen_size(&mut self) -> Result<Vec<OutputId>> {
        let ctx = self.context();
        let (mut width, mut height) = (0, 0);
        for output in self.outputs.values() {
            let (right, bottom) = output.pending_allocation(&self.backend, &ctx)?.extent();
            width = width.max(right);
            height = height.max(bottom);
        }
        if width == 0 || height == 0 {
            debug!("No open output, keeping screen size");
            return Ok(Vec::new());
        }

        let dw = width.abs_diff(self.width);
        let dh = height.abs_diff(self.height);
        if dw < RESIZE_THRESHOLD && dh < RESIZE_THRESHOLD {
            let (snap_w, snap_h) = (width + dw, height + dh);
            if (snap_w, snap_h) != self.screen_size() {
                self.set_screen_size(snap_w, snap_h)?;
            }
            return Ok(Vec::new());
        }

        let (fit_w, fit_h) = (width.min(self.width), height.min(self.height));
        let mut blocking = Vec::new();
        for (id, output) in &self.outputs {
            if !output.is_opened() || Some(*id) == self.mirror_output {
                continue;
            }
            let live = self
                .backend
                .crtc_info(output.crtc(), ctx.config_timestamp)
                .map_err(ReconcileError::query(format!("crtc {}", output.crtc())))?
                .rect();
            let (right, bottom) = output.allocation().extent();
            let (live_right, live_bottom) = live.extent();
            if right.max(live_right) > fit_w || bottom.max(live_bottom) > fit_h {
                blocking.push(*id);
            }
        }

        let mut closed = Vec::with_capacity(blocking.len());
        for id in blocking {
            debug!("Closing output {} for the screen resize", id);
            self.set_opened(id, false)?;
            closed.push(id);
        }

        if let Err(err) = self.set_screen_size(width, height) {
            for id in closed {
                if let Err(err) = self.set_opened(id, true) {
                    warn!(?err, "Failed to reopen output {}", id);
                }
            }
            return Err(err);
        }
        Ok(closed)
    }

    fn set_screen_size(&mut self, width: u32, height: u32) -> Result<()> {
        let clamp = |v: u32| v.min(u16::MAX as u32) as u16;
        self.backend
            .set_screen_size(clamp(width), clamp(height))
            .map_err(ReconcileError::hardware(WriteGroup::Screen, 0))?;
        info!(
            "Screen resized from {}x{} to {}x{}",
            self.width, self.height, width, height
        );
        self.width = width;
        self.height = height;
        Ok(())
    }

    /// Switches an output on or off right away.
    pub fn set_output_opened(&mut self, output: OutputId, opened: bool) -> Result<()> {
        self.with_change_window(|display| {
            display.refresh_config_timestamp()?;
            if let Err(err) = display.backend.pause_events() {
                warn!(?err, "Failed to pause RandR events");
            }
            let result = display.set_opened(output, opened);
            if let Err(err) = display.backend.resume_events() {
                warn!(?err, "Failed to resume RandR events");
            }
            result
        })
    }

    /// Closing remembers the current draft (or live state) to restore on the
    /// next open. Opening without a remembered state lights the output up in
    /// its best mode on the first idle crtc.
    fn set_opened(&mut self, id: OutputId, opened: bool) -> Result<()> {
        let ctx = CrtcContext {
            modes: &self.modes,
            mirror_mode: self.mirror_mode,
            config_timestamp: self.config_timestamp,
        };
        let output = self
            .outputs
            .get_mut(&id)
            .ok_or(Invariant::UnknownOutput(id))?;
        if output.is_opened() == opened {
            return Ok(());
        }

        if !opened {
            let config = match output.take_pending() {
                Some(config) => config,
                None => PendingConfig::from_hardware(output, &self.backend, &ctx)?,
            };
            let crtc = config.crtc();
            output.save(config.clone());

            let mut disable = config;
            disable.set_mode(0);
            let result = disable.apply(&self.backend, &ctx);
            resync(output, &self.backend, &ctx, crtc, None);
            info!(output = output.name(), "Output closed");
            return result.map(|_| ());
        }

        if let Some(saved) = output.take_saved() {
            let config = saved.thaw();
            let result = config.apply(&self.backend, &ctx);
            let visible = match &result {
                Ok(Some(mismatch)) => Some(mismatch.actual),
                Ok(None) => config.applied_allocation(&ctx).ok(),
                Err(_) => None,
            };
            resync(output, &self.backend, &ctx, config.crtc(), visible);
            info!(output = output.name(), "Output reopened");
            return result.map(|_| ());
        }

        let mode = output.best_mode();
        if mode == 0 {
            return Err(Invariant::MissingMode(mode).into());
        }
        let crtcs = self
            .backend
            .output_crtcs(id, ctx.config_timestamp)
            .map_err(ReconcileError::query(format!("crtcs of output {}", output.name())))?;
        for crtc in crtcs {
            let info = self
                .backend
                .crtc_info(crtc, ctx.config_timestamp)
                .map_err(ReconcileError::query(format!("crtc {}", crtc)))?;
            if info.mode != 0 {
                continue;
            }

            self.backend
                .set_crtc_config(
                    crtc,
                    ctx.config_timestamp,
                    &CrtcConfig {
                        x: 0,
                        y: 0,
                        mode,
                        rotation: output.rotation(),
                        outputs: vec![id],
                    },
                )
                .map_err(ReconcileError::hardware(WriteGroup::Geometry, crtc))?;
            resync(output, &self.backend, &ctx, crtc, None);
            info!(output = output.name(), crtc, "Output opened");
            return Ok(());
        }

        Err(Invariant::CrtcPoolExhausted(id).into())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::{
        headless::{HeadlessBackend, Request, RequestKind},
        CrtcInfo, CrtcTransform, GammaRamp, Rotation, ScreenResources, Timestamp,
    };
    use crate::backend::{BackendError, ModeId};

    struct Setup {
        backend: HeadlessBackend,
        outputs: Vec<(OutputId, CrtcId, ModeId)>,
    }

    /// One crtc per output, every output lit at the given position.
    fn setup(width: u16, height: u16, outputs: &[(&str, (u16, u16), (i16, i16))]) -> Setup {
        let backend = HeadlessBackend::new(width, height);
        let outputs = outputs
            .iter()
            .map(|(name, (w, h), (x, y))| {
                let mode = backend.add_mode(*w, *h);
                let crtc = backend.add_crtc();
                let id = backend.add_output(name, &[mode], &[crtc]);
                backend.connect(id, crtc, mode, *x, *y);
                (id, crtc, mode)
            })
            .collect();
        Setup { backend, outputs }
    }

    fn kinds(display: &Display<HeadlessBackend>) -> Vec<RequestKind> {
        display
            .backend()
            .requests()
            .iter()
            .map(Request::kind)
            .collect()
    }

    fn assert_released(display: &Display<HeadlessBackend>) {
        assert!(!display.backend().is_grabbed());
        assert!(!display.backend().events_paused());
        assert!(!display.has_changes());
    }

    #[test]
    fn nothing_staged_touches_nothing() {
        let Setup { backend, outputs } = setup(1920, 1080, &[("eDP-1", (1920, 1080), (0, 0))]);
        let mut display = Display::new(backend).unwrap();
        // a draft without changes doesn't count
        display.configure(outputs[0].0).unwrap().set_pos(0, 0);

        let report = display.apply_changed().unwrap();
        assert!(report.skipped);
        assert!(display.backend().requests().is_empty());
        assert!(!display.backend().is_grabbed());
        assert!(display.output(outputs[0].0).unwrap().pending().is_none());
    }

    #[test]
    fn skipped_pass_drops_stale_snapshot() {
        let Setup { backend, outputs } = setup(3840, 1080, &[("eDP-1", (1920, 1080), (0, 0))]);
        let (id, crtc, mode) = outputs[0];
        let mut display = Display::new(backend).unwrap();
        display.configure(id).unwrap().set_pos(0, 0);
        assert!(display.apply_changed().unwrap().skipped);

        // moved by someone else in between
        display.backend().connect(id, crtc, mode, 1920, 0);
        display
            .configure(id)
            .unwrap()
            .set_rotation(Rotation::ROTATE_180)
            .unwrap();
        let report = display.apply_changed().unwrap();
        assert!(!report.skipped);

        let info = display.backend().crtc(crtc).unwrap();
        assert_eq!((info.x, info.y), (1920, 0));
        assert_eq!(info.rotation, Rotation::ROTATE_180);
        assert_released(&display);
    }

    #[test]
    fn commit_clears_draft_and_records_allocation() {
        let Setup { backend, outputs } = setup(3840, 1080, &[("eDP-1", (1920, 1080), (0, 0))]);
        let (id, crtc, _) = outputs[0];
        let mut display = Display::new(backend).unwrap();
        display.configure(id).unwrap().set_pos(1920, 0);

        let report = display.apply_changed().unwrap();
        assert!(!report.skipped);
        assert_eq!(report.committed, vec![id]);
        assert!(report.mismatches.is_empty());
        assert_released(&display);
        assert!(display.output(id).unwrap().pending().is_none());
        assert_eq!(
            display.allocation(id).unwrap(),
            Rectangle::new(1920, 0, 1920, 1080)
        );
        assert_eq!(display.backend().crtc(crtc).unwrap().x, 1920);
    }

    #[test]
    fn screen_grows_before_outputs_move() {
        let Setup { backend, outputs } = setup(
            1920,
            1080,
            &[
                ("eDP-1", (1920, 1080), (0, 0)),
                ("HDMI-1", (1920, 1080), (0, 0)),
            ],
        );
        let mut display = Display::new(backend).unwrap();
        display.configure(outputs[1].0).unwrap().set_pos(1920, 0);
        display.set_primary_output(Some(outputs[0].0)).unwrap();

        let report = display.apply_changed().unwrap();
        assert_eq!(report.screen_size, (3840, 1080));
        assert_eq!(display.backend().screen_size(), (3840, 1080));
        assert_eq!(
            kinds(&display),
            vec![
                RequestKind::ScreenSize,
                RequestKind::CrtcConfig,
                RequestKind::OutputPrimary
            ]
        );
        assert_eq!(display.backend().primary(), Some(outputs[0].0));
    }

    #[test]
    fn four_pixels_trigger_a_resize() {
        let Setup { backend, outputs } = setup(2560, 1436, &[("DP-1", (2560, 1440), (0, 0))]);
        let id = outputs[0].0;
        let mut display = Display::new(backend).unwrap();
        display.configure(id).unwrap().set_brightness(0.9).unwrap();

        let report = display.apply_changed().unwrap();
        assert_eq!(report.screen_size, (2560, 1440));
        assert!(display
            .backend()
            .requests()
            .contains(&Request::ScreenSize {
                width: 2560,
                height: 1440
            }));
        // the crtc didn't fit the old screen, so it was cycled
        assert_eq!(report.reopened, vec![id]);
        assert!(display.is_opened(id).unwrap());
        assert!(display.output(id).unwrap().saved_config().is_none());
        assert_eq!(display.backend().gamma(outputs[0].1).unwrap().len(), 256);
        assert_released(&display);
    }

    #[test]
    fn small_deltas_snap() {
        let Setup { backend, outputs } = setup(1922, 1080, &[("DP-1", (1920, 1080), (0, 0))]);
        let mut display = Display::new(backend).unwrap();
        display
            .configure(outputs[0].0)
            .unwrap()
            .set_brightness(0.5)
            .unwrap();
        let report = display.apply_changed().unwrap();
        assert_eq!(report.screen_size, (1922, 1080));
        assert!(!kinds(&display).contains(&RequestKind::ScreenSize));

        let Setup { backend, outputs } = setup(1918, 1080, &[("DP-1", (1920, 1080), (0, 0))]);
        let mut display = Display::new(backend).unwrap();
        display
            .configure(outputs[0].0)
            .unwrap()
            .set_brightness(0.5)
            .unwrap();
        let report = display.apply_changed().unwrap();
        assert_eq!(report.screen_size, (1922, 1080));
        assert!(report.reopened.is_empty());
    }

    #[test]
    fn mirror_fits_every_output_to_the_source() {
        let Setup { backend, outputs } = setup(
            1920,
            1080,
            &[
                ("eDP-1", (1920, 1080), (0, 0)),
                ("VGA-1", (1280, 1024), (0, 0)),
            ],
        );
        let (source, _, _) = outputs[0];
        let (target, target_crtc, _) = outputs[1];
        backend.force_rotation(target_crtc, Rotation::ROTATE_180);

        let mut display = Display::new(backend).unwrap();
        display.set_mirror_mode(true);
        display.set_mirror_output(Some(source)).unwrap();
        display.configure(source).unwrap().set_brightness(1.0).unwrap();

        let report = display.apply_changed().unwrap();
        assert!(report.mismatches.is_empty());
        assert_eq!(report.committed, vec![source, target]);
        assert_eq!(report.screen_size, (1920, 1080));

        let output = display.output(target).unwrap();
        assert_eq!(output.rotation(), display.output(source).unwrap().rotation());
        assert_eq!(output.allocation(), Rectangle::new(0, 0, 1920, 1080));
        let crtc = display.backend().crtc(target_crtc).unwrap();
        assert_eq!((crtc.x, crtc.y), (0, -228));
        assert_eq!(
            display.backend().transform(target_crtc).unwrap().transform.scale(),
            (1.5, 1.5)
        );
    }

    #[test]
    fn close_and_reopen_restores_configuration() {
        let Setup { backend, outputs } = setup(
            3840,
            1080,
            &[
                ("eDP-1", (1920, 1080), (0, 0)),
                ("DP-1", (1920, 1080), (1920, 0)),
            ],
        );
        let (id, crtc, mode) = outputs[1];
        let mut display = Display::new(backend).unwrap();
        let before = display.backend().crtc(crtc).unwrap();

        display.set_output_opened(id, false).unwrap();
        assert!(!display.is_opened(id).unwrap());
        assert_eq!(display.backend().crtc(crtc).unwrap().mode, 0);
        let saved = display.output(id).unwrap().saved_config().unwrap();
        assert_eq!(saved.config().mode(), mode);
        assert_eq!(saved.config().position(), (1920, 0));
        assert!(saved.config().dirty().is_empty());

        display.set_output_opened(id, true).unwrap();
        assert!(display.is_opened(id).unwrap());
        assert!(display.output(id).unwrap().saved_config().is_none());
        assert_eq!(display.backend().crtc(crtc).unwrap(), before);
        assert_eq!(
            display.allocation(id).unwrap(),
            Rectangle::new(1920, 0, 1920, 1080)
        );
        assert_released(&display);
    }

    #[test]
    fn opening_picks_an_idle_crtc() {
        let backend = HeadlessBackend::new(1920, 1080);
        let small = backend.add_mode(1280, 720);
        let big = backend.add_mode(1920, 1080);
        let busy = backend.add_crtc();
        let idle = backend.add_crtc();
        let lit = backend.add_output("eDP-1", &[big], &[busy]);
        backend.connect(lit, busy, big, 0, 0);
        let dark = backend.add_output("HDMI-1", &[small, big], &[busy, idle]);

        let mut display = Display::new(backend).unwrap();
        assert!(!display.is_opened(dark).unwrap());
        display.set_output_opened(dark, true).unwrap();

        let crtc = display.backend().crtc(idle).unwrap();
        assert_eq!(crtc.mode, big);
        assert_eq!(crtc.outputs, vec![dark]);
        assert_eq!(display.output(dark).unwrap().crtc(), idle);
        assert_eq!(display.backend().crtc(busy).unwrap().outputs, vec![lit]);
    }

    #[test]
    fn exhausted_crtc_pool_is_an_invariant_violation() {
        let backend = HeadlessBackend::new(1920, 1080);
        let mode = backend.add_mode(1920, 1080);
        let crtc = backend.add_crtc();
        let lit = backend.add_output("eDP-1", &[mode], &[crtc]);
        backend.connect(lit, crtc, mode, 0, 0);
        let dark = backend.add_output("HDMI-1", &[mode], &[crtc]);

        let mut display = Display::new(backend).unwrap();
        let err = display.set_output_opened(dark, true).unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::InvariantViolation(Invariant::CrtcPoolExhausted(id)) if id == dark
        ));
        assert!(!display.backend().is_grabbed());
    }

    #[test]
    fn rejected_geometry_fails_the_pass_after_committing_the_rest() {
        let Setup { backend, outputs } = setup(
            3840,
            1080,
            &[
                ("eDP-1", (1920, 1080), (0, 0)),
                ("DP-1", (1920, 1080), (1920, 0)),
            ],
        );
        let mut display = Display::new(backend).unwrap();
        display.configure(outputs[0].0).unwrap().set_pos(1920, 0);
        display.configure(outputs[1].0).unwrap().set_pos(0, 0);
        display.backend().fail_next(RequestKind::CrtcConfig);

        let err = display.apply_changed().unwrap_err();
        assert_eq!(err.write_group(), Some(WriteGroup::Geometry));
        assert_eq!(display.backend().crtc(outputs[0].1).unwrap().x, 0);
        assert_eq!(display.backend().crtc(outputs[1].1).unwrap().x, 0);
        assert!(kinds(&display).contains(&RequestKind::OutputPrimary));
        assert_released(&display);
    }

    #[test]
    fn rejected_gamma_is_reported() {
        let Setup { backend, outputs } = setup(1920, 1080, &[("eDP-1", (1920, 1080), (0, 0))]);
        let mut display = Display::new(backend).unwrap();
        display
            .configure(outputs[0].0)
            .unwrap()
            .set_brightness(0.4)
            .unwrap();
        display.backend().fail_next(RequestKind::CrtcGamma);

        let report = display.apply_changed().unwrap();
        assert!(report.committed.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, outputs[0].0);
        assert_eq!(report.failures[0].1.write_group(), Some(WriteGroup::Gamma));
    }

    #[test]
    fn invariant_violation_aborts_before_writing() {
        let Setup { backend, outputs } = setup(1920, 1080, &[("eDP-1", (1920, 1080), (0, 0))]);
        let mut display = Display::new(backend).unwrap();
        display.configure(outputs[0].0).unwrap().set_mode(0xdead);

        let err = display.apply_changed().unwrap_err();
        assert!(err.is_invariant_violation());
        assert!(!kinds(&display).contains(&RequestKind::CrtcConfig));
        assert_released(&display);
    }

    #[test]
    fn stale_timestamp_is_refreshed() {
        let Setup { backend, outputs } = setup(3840, 1080, &[("eDP-1", (1920, 1080), (0, 0))]);
        let mut display = Display::new(backend).unwrap();
        display.configure(outputs[0].0).unwrap().set_pos(100, 0);
        display.backend().bump_config_timestamp();

        let report = display.apply_changed().unwrap();
        assert_eq!(report.committed, vec![outputs[0].0]);
        assert_eq!(display.config_timestamp(), 2);
        assert_eq!(display.backend().crtc(outputs[0].1).unwrap().x, 100);
    }

    #[test]
    fn unknown_outputs_are_rejected() {
        let Setup { backend, .. } = setup(1920, 1080, &[("eDP-1", (1920, 1080), (0, 0))]);
        let mut display = Display::new(backend).unwrap();
        assert!(display
            .configure(0xbeef)
            .err()
            .unwrap()
            .is_invariant_violation());
        assert!(display.set_primary_output(Some(0xbeef)).is_err());
        assert!(display.output_by_name("eDP-1").is_some());
    }

    /// Headless server that blows up on gamma writes.
    struct PanickingBackend(HeadlessBackend);

    impl RandrBackend for PanickingBackend {
        fn screen_resources(&self) -> Result<ScreenResources, BackendError> {
            self.0.screen_resources()
        }
        fn crtc_info(&self, crtc: CrtcId, timestamp: Timestamp) -> Result<CrtcInfo, BackendError> {
            self.0.crtc_info(crtc, timestamp)
        }
        fn crtc_transform(&self, crtc: CrtcId) -> Result<CrtcTransform, BackendError> {
            self.0.crtc_transform(crtc)
        }
        fn crtc_gamma_size(&self, crtc: CrtcId) -> Result<u16, BackendError> {
            self.0.crtc_gamma_size(crtc)
        }
        fn output_crtcs(
            &self,
            output: OutputId,
            timestamp: Timestamp,
        ) -> Result<Vec<CrtcId>, BackendError> {
            self.0.output_crtcs(output, timestamp)
        }
        fn set_crtc_config(
            &self,
            crtc: CrtcId,
            timestamp: Timestamp,
            config: &CrtcConfig,
        ) -> Result<(), BackendError> {
            self.0.set_crtc_config(crtc, timestamp, config)
        }
        fn set_crtc_transform(
            &self,
            crtc: CrtcId,
            transform: &CrtcTransform,
        ) -> Result<(), BackendError> {
            self.0.set_crtc_transform(crtc, transform)
        }
        fn set_crtc_gamma(&self, _crtc: CrtcId, _ramp: &GammaRamp) -> Result<(), BackendError> {
            panic!("gamma hook exploded")
        }
        fn set_screen_size(&self, width: u16, height: u16) -> Result<(), BackendError> {
            self.0.set_screen_size(width, height)
        }
        fn set_output_primary(&self, output: Option<OutputId>) -> Result<(), BackendError> {
            self.0.set_output_primary(output)
        }
        fn grab_server(&self) -> Result<(), BackendError> {
            self.0.grab_server()
        }
        fn ungrab_server(&self) -> Result<(), BackendError> {
            self.0.ungrab_server()
        }
        fn pause_events(&self) -> Result<(), BackendError> {
            self.0.pause_events()
        }
        fn resume_events(&self) -> Result<(), BackendError> {
            self.0.resume_events()
        }
    }

    #[test]
    fn panics_release_the_change_window() {
        let Setup { backend, outputs } = setup(1920, 1080, &[("eDP-1", (1920, 1080), (0, 0))]);
        let mut display = Display::new(PanickingBackend(backend)).unwrap();
        display
            .configure(outputs[0].0)
            .unwrap()
            .set_brightness(0.5)
            .unwrap();

        let err = display.apply_changed().unwrap_err();
        assert!(matches!(err, ReconcileError::Panicked(ref msg) if msg == "gamma hook exploded"));
        assert!(!display.backend().0.is_grabbed());
        assert!(!display.backend().0.events_paused());
        assert!(!display.has_changes());

        // the lock isn't poisoned
        display.configure(outputs[0].0).unwrap().set_pos(0, 0);
        assert!(display.apply_changed().unwrap().skipped);
    }
}
