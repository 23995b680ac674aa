// SPDX-License-Identifier: GPL-3.0-only

//! An in-memory RandR server.
//!
//! Keeps just enough crtc bookkeeping to behave like the real thing for the
//! reconciler: crtc sizes follow mode, rotation and transform, shrinking the
//! screen below an active crtc is refused, stale config timestamps are refused,
//! and every write is recorded.

use super::{
    BackendError, CrtcConfig, CrtcId, CrtcInfo, CrtcTransform, GammaRamp, ModeId, ModeInfo,
    OutputId, OutputInfo, RandrBackend, Rotation, ScreenResources, Timestamp,
};
use crate::utils::geometry::calc_bound;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    CrtcConfig,
    CrtcTransform,
    CrtcGamma,
    ScreenSize,
    OutputPrimary,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    CrtcConfig { crtc: CrtcId, config: CrtcConfig },
    CrtcTransform { crtc: CrtcId, transform: CrtcTransform },
    CrtcGamma { crtc: CrtcId, size: usize },
    ScreenSize { width: u16, height: u16 },
    OutputPrimary(Option<OutputId>),
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::CrtcConfig { .. } => RequestKind::CrtcConfig,
            Request::CrtcTransform { .. } => RequestKind::CrtcTransform,
            Request::CrtcGamma { .. } => RequestKind::CrtcGamma,
            Request::ScreenSize { .. } => RequestKind::ScreenSize,
            Request::OutputPrimary(_) => RequestKind::OutputPrimary,
        }
    }
}

#[derive(Debug)]
struct Crtc {
    info: CrtcInfo,
    transform: CrtcTransform,
    gamma: GammaRamp,
}

#[derive(Debug)]
struct State {
    config_timestamp: Timestamp,
    next_id: u32,
    width: u16,
    height: u16,
    gamma_size: u16,
    modes: Vec<ModeInfo>,
    outputs: Vec<OutputInfo>,
    crtcs: BTreeMap<CrtcId, Crtc>,
    primary: Option<OutputId>,
    grabbed: bool,
    events_paused: bool,
    failures: HashSet<RequestKind>,
    requests: Vec<Request>,
}

impl State {
    fn alloc_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn mode(&self, id: ModeId) -> Option<&ModeInfo> {
        self.modes.iter().find(|mode| mode.id == id)
    }

    fn crtc_mut(&mut self, crtc: CrtcId) -> Result<&mut Crtc, BackendError> {
        self.crtcs.get_mut(&crtc).ok_or(BackendError::NotFound {
            kind: "crtc",
            id: crtc,
        })
    }

    fn record(&mut self, request: Request) -> Result<(), BackendError> {
        let kind = request.kind();
        self.requests.push(request);
        if self.failures.remove(&kind) {
            return Err(BackendError::Rejected(format!("injected {:?} failure", kind)));
        }
        Ok(())
    }

    fn crtc_size(&self, crtc: &Crtc, mode: ModeId, rotation: Rotation) -> (u16, u16) {
        match self.mode(mode) {
            Some(info) => {
                let (x1, y1, x2, y2) = calc_bound(
                    &crtc.transform.transform,
                    rotation,
                    info.width as u32,
                    info.height as u32,
                );
                ((x2 - x1) as u16, (y2 - y1) as u16)
            }
            None => (0, 0),
        }
    }
}

#[derive(Debug)]
pub struct HeadlessBackend {
    state: Mutex<State>,
}

impl HeadlessBackend {
    pub fn new(width: u16, height: u16) -> HeadlessBackend {
        HeadlessBackend {
            state: Mutex::new(State {
                config_timestamp: 1,
                next_id: 0x40,
                width,
                height,
                gamma_size: 256,
                modes: Vec::new(),
                outputs: Vec::new(),
                crtcs: BTreeMap::new(),
                primary: None,
                grabbed: false,
                events_paused: false,
                failures: HashSet::new(),
                requests: Vec::new(),
            }),
        }
    }

    pub fn add_mode(&self, width: u16, height: u16) -> ModeId {
        let mut state = self.state.lock();
        let id = state.alloc_id();
        state.modes.push(ModeInfo {
            id,
            width,
            height,
            refresh: 60_000,
        });
        id
    }

    pub fn add_crtc(&self) -> CrtcId {
        let mut state = self.state.lock();
        let id = state.alloc_id();
        state.crtcs.insert(
            id,
            Crtc {
                info: CrtcInfo {
                    x: 0,
                    y: 0,
                    width: 0,
                    height: 0,
                    mode: 0,
                    rotation: Rotation::ROTATE_0,
                    outputs: Vec::new(),
                },
                transform: CrtcTransform::default(),
                gamma: GammaRamp::default(),
            },
        );
        id
    }

    pub fn add_output(&self, name: &str, modes: &[ModeId], crtcs: &[CrtcId]) -> OutputId {
        let mut state = self.state.lock();
        let id = state.alloc_id();
        state.outputs.push(OutputInfo {
            id,
            name: name.to_string(),
            crtc: 0,
            crtcs: crtcs.to_vec(),
            modes: modes.to_vec(),
        });
        id
    }

    /// Lights up `output` on `crtc` without going through the request log,
    /// like a previous client would have left things. Unknown crtcs are ignored.
    pub fn connect(&self, output: OutputId, crtc: CrtcId, mode: ModeId, x: i16, y: i16) {
        let mut state = self.state.lock();
        let Some((width, height)) = state
            .crtcs
            .get(&crtc)
            .map(|current| state.crtc_size(current, mode, current.info.rotation))
        else {
            return;
        };
        if let Some(info) = state.outputs.iter_mut().find(|o| o.id == output) {
            info.crtc = crtc;
        }
        let Some(crtc) = state.crtcs.get_mut(&crtc) else {
            return;
        };
        crtc.info = CrtcInfo {
            x,
            y,
            width,
            height,
            mode,
            rotation: crtc.info.rotation,
            outputs: vec![output],
        };
    }

    /// Overwrites the rotation reported for `crtc`, valid or not.
    pub fn force_rotation(&self, crtc: CrtcId, rotation: Rotation) {
        let mut state = self.state.lock();
        if let Some(crtc) = state.crtcs.get_mut(&crtc) {
            crtc.info.rotation = rotation;
        }
    }

    pub fn set_gamma_size(&self, size: u16) {
        self.state.lock().gamma_size = size;
    }

    /// Simulates a hotplug elsewhere: previously read timestamps become stale.
    pub fn bump_config_timestamp(&self) {
        self.state.lock().config_timestamp += 1;
    }

    /// The next request of this kind is recorded and then rejected.
    pub fn fail_next(&self, kind: RequestKind) {
        self.state.lock().failures.insert(kind);
    }

    pub fn requests(&self) -> Vec<Request> {
        self.state.lock().requests.clone()
    }

    pub fn crtc(&self, crtc: CrtcId) -> Option<CrtcInfo> {
        self.state.lock().crtcs.get(&crtc).map(|c| c.info.clone())
    }

    pub fn transform(&self, crtc: CrtcId) -> Option<CrtcTransform> {
        self.state.lock().crtcs.get(&crtc).map(|c| c.transform.clone())
    }

    pub fn gamma(&self, crtc: CrtcId) -> Option<GammaRamp> {
        self.state.lock().crtcs.get(&crtc).map(|c| c.gamma.clone())
    }

    pub fn screen_size(&self) -> (u16, u16) {
        let state = self.state.lock();
        (state.width, state.height)
    }

    pub fn primary(&self) -> Option<OutputId> {
        self.state.lock().primary
    }

    pub fn is_grabbed(&self) -> bool {
        self.state.lock().grabbed
    }

    pub fn events_paused(&self) -> bool {
        self.state.lock().events_paused
    }
}

impl RandrBackend for HeadlessBackend {
    fn screen_resources(&self) -> Result<ScreenResources, BackendError> {
        let state = self.state.lock();
        Ok(ScreenResources {
            config_timestamp: state.config_timestamp,
            width: state.width,
            height: state.height,
            modes: state.modes.clone(),
            outputs: state.outputs.clone(),
        })
    }

    fn crtc_info(&self, crtc: CrtcId, _timestamp: Timestamp) -> Result<CrtcInfo, BackendError> {
        let mut state = self.state.lock();
        Ok(state.crtc_mut(crtc)?.info.clone())
    }

    fn crtc_transform(&self, crtc: CrtcId) -> Result<CrtcTransform, BackendError> {
        let mut state = self.state.lock();
        Ok(state.crtc_mut(crtc)?.transform.clone())
    }

    fn crtc_gamma_size(&self, crtc: CrtcId) -> Result<u16, BackendError> {
        let mut state = self.state.lock();
        state.crtc_mut(crtc)?;
        Ok(state.gamma_size)
    }

    fn output_crtcs(
        &self,
        output: OutputId,
        _timestamp: Timestamp,
    ) -> Result<Vec<CrtcId>, BackendError> {
        let state = self.state.lock();
        state
            .outputs
            .iter()
            .find(|o| o.id == output)
            .map(|o| o.crtcs.clone())
            .ok_or(BackendError::NotFound {
                kind: "output",
                id: output,
            })
    }

    fn set_crtc_config(
        &self,
        crtc: CrtcId,
        timestamp: Timestamp,
        config: &CrtcConfig,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.record(Request::CrtcConfig {
            crtc,
            config: config.clone(),
        })?;
        if timestamp != state.config_timestamp {
            return Err(BackendError::Rejected("invalid config time".into()));
        }
        if !config.rotation.is_valid() {
            return Err(BackendError::Rejected(format!(
                "invalid rotation {:?}",
                config.rotation
            )));
        }
        if config.mode != 0 && state.mode(config.mode).is_none() {
            return Err(BackendError::NotFound {
                kind: "mode",
                id: config.mode,
            });
        }
        for output in &config.outputs {
            let usable = state
                .outputs
                .iter()
                .find(|o| o.id == *output)
                .is_some_and(|o| o.crtcs.contains(&crtc));
            if !usable {
                return Err(BackendError::Rejected(format!(
                    "output {} can't be driven by crtc {}",
                    output, crtc
                )));
            }
        }

        let (width, height) = {
            let current = state.crtcs.get(&crtc).ok_or(BackendError::NotFound {
                kind: "crtc",
                id: crtc,
            })?;
            state.crtc_size(current, config.mode, config.rotation)
        };
        let previous = std::mem::take(&mut state.crtc_mut(crtc)?.info.outputs);
        for output in state.outputs.iter_mut() {
            if previous.contains(&output.id) {
                output.crtc = 0;
            }
            if config.mode != 0 && config.outputs.contains(&output.id) {
                output.crtc = crtc;
            }
        }

        let current = state.crtc_mut(crtc)?;
        current.info = CrtcInfo {
            x: config.x,
            y: config.y,
            width,
            height,
            mode: config.mode,
            rotation: config.rotation,
            outputs: if config.mode == 0 {
                Vec::new()
            } else {
                config.outputs.clone()
            },
        };
        Ok(())
    }

    fn set_crtc_transform(
        &self,
        crtc: CrtcId,
        transform: &CrtcTransform,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.record(Request::CrtcTransform {
            crtc,
            transform: transform.clone(),
        })?;
        state.crtc_mut(crtc)?.transform = transform.clone();
        Ok(())
    }

    fn set_crtc_gamma(&self, crtc: CrtcId, ramp: &GammaRamp) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.record(Request::CrtcGamma {
            crtc,
            size: ramp.len(),
        })?;
        if ramp.len() != state.gamma_size as usize {
            return Err(BackendError::Rejected(format!(
                "gamma ramp of size {} for crtc with {} entries",
                ramp.len(),
                state.gamma_size
            )));
        }
        state.crtc_mut(crtc)?.gamma = ramp.clone();
        Ok(())
    }

    fn set_screen_size(&self, width: u16, height: u16) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.record(Request::ScreenSize { width, height })?;
        let blocking = state.crtcs.values().find(|crtc| {
            crtc.info.mode != 0
                && (crtc.info.rect().right() > width as i32
                    || crtc.info.rect().bottom() > height as i32)
        });
        if let Some(crtc) = blocking {
            return Err(BackendError::Rejected(format!(
                "screen of {}x{} can't hold crtc at {}",
                width,
                height,
                crtc.info.rect()
            )));
        }
        state.width = width;
        state.height = height;
        Ok(())
    }

    fn set_output_primary(&self, output: Option<OutputId>) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.record(Request::OutputPrimary(output))?;
        state.primary = output;
        Ok(())
    }

    fn grab_server(&self) -> Result<(), BackendError> {
        self.state.lock().grabbed = true;
        Ok(())
    }

    fn ungrab_server(&self) -> Result<(), BackendError> {
        self.state.lock().grabbed = false;
        Ok(())
    }

    fn pause_events(&self) -> Result<(), BackendError> {
        self.state.lock().events_paused = true;
        Ok(())
    }

    fn resume_events(&self) -> Result<(), BackendError> {
        self.state.lock().events_paused = false;
        Ok(())
    }
}
