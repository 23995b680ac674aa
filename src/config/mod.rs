// SPDX-License-Identifier: GPL-3.0-only

//! Remembered output setups.
//!
//! A setup is stored per set of connected connectors, so plugging in the same
//! monitors again brings back the same arrangement.

use crate::{
    backend::{OutputId, RandrBackend, Rotation},
    display::Display,
    error::Result,
    output::Output,
};
pub use cosmic_xrandr_config::{OutputConfig, OutputInfo, OutputState, OutputsConfig};
use serde::Serialize;
use std::{fs::OpenOptions, path::PathBuf};
use tracing::{debug, info, warn};

mod types;

#[derive(Debug)]
pub struct Config {
    outputs: (Option<PathBuf>, OutputsConfig),
}

/// `$XDG_STATE_HOME/cosmic-xrandr/outputs.ron`, created on demand.
pub fn default_path() -> Option<PathBuf> {
    xdg::BaseDirectories::new()
        .ok()
        .and_then(|base| base.place_state_file("cosmic-xrandr/outputs.ron").ok())
}

impl Config {
    /// Falls back to an empty configuration if nothing usable is stored.
    pub fn load(path: Option<PathBuf>) -> Config {
        let path = path.or_else(default_path);
        let outputs = cosmic_xrandr_config::load_outputs(path.as_ref());
        debug!(path = ?path, setups = outputs.config.len(), "Loaded output configuration");
        Config {
            outputs: (path, outputs),
        }
    }

    pub fn outputs(&self) -> &OutputsConfig {
        &self.outputs.1
    }

    pub fn outputs_mut(&mut self) -> PersistenceGuard<'_, OutputsConfig> {
        PersistenceGuard(self.outputs.0.clone(), &mut self.outputs.1)
    }

    /// Stages the stored setup for the connected outputs on `display`.
    ///
    /// Opening and closing outputs happens right away, everything else is
    /// left for [`Display::apply_changed`]. Returns `false` if no setup is
    /// known for this set of connectors.
    pub fn read_outputs<B: RandrBackend>(&self, display: &mut Display<B>) -> Result<bool> {
        let connectors = display
            .outputs()
            .map(|output| output.name().to_string())
            .collect::<Vec<_>>();
        let Some(configs) = self.outputs().get(&connectors) else {
            info!(?connectors, "No stored setup for connected outputs");
            return Ok(false);
        };

        let mirror_source = configs.iter().find_map(|(_, config)| match &config.enabled {
            OutputState::Mirroring(source) => display.output_by_name(source).map(Output::id),
            _ => None,
        });
        display.set_mirror_mode(mirror_source.is_some());
        display.set_mirror_output(mirror_source)?;

        let mut primary = None;
        for (info, config) in &configs {
            let Some(id) = display.output_by_name(&info.connector).map(Output::id) else {
                continue;
            };
            if config.primary {
                primary = Some(id);
            }
            if config.enabled == OutputState::Disabled {
                display.set_output_opened(id, false)?;
                continue;
            }
            display.set_output_opened(id, true)?;
            self.stage_output(display, id, config)?;
        }
        display.set_primary_output(primary)?;
        Ok(true)
    }

    fn stage_output<B: RandrBackend>(
        &self,
        display: &mut Display<B>,
        id: OutputId,
        config: &OutputConfig,
    ) -> Result<()> {
        let ((width, height), refresh) = config.mode;
        let mode = display
            .modes(id)?
            .into_iter()
            .filter(|mode| (mode.width as i32, mode.height as i32) == (width, height))
            .min_by_key(|mode| match refresh {
                Some(refresh) => mode.refresh.abs_diff(refresh),
                // highest rate wins
                None => u32::MAX - mode.refresh,
            })
            .map(|mode| mode.id);

        let mut output = display.configure(id)?;
        match mode {
            Some(mode) => {
                output.set_mode(mode);
            }
            None => warn!(
                "Stored mode {}x{} is not available on output {}",
                width, height, id
            ),
        }
        output
            .set_pos(config.position.0, config.position.1)
            .set_rotation(Rotation::from(config.transform))?
            .set_scale(config.scale, config.scale)
            .set_brightness(config.brightness)?;
        Ok(())
    }

    /// Remembers what `display` currently shows for this set of connectors.
    pub fn write_outputs<B: RandrBackend>(&mut self, display: &Display<B>) -> Result<()> {
        let connectors = display
            .outputs()
            .map(|output| output.name().to_string())
            .collect::<Vec<_>>();
        let previous = self.outputs().get(&connectors).unwrap_or_default();

        let mut infos = Vec::with_capacity(connectors.len());
        for output in display.outputs() {
            let brightness = previous
                .iter()
                .find(|(info, _)| info.connector == output.name())
                .map_or(1.0, |(_, config)| config.brightness);
            infos.push((
                OutputInfo {
                    connector: output.name().to_string(),
                },
                snapshot(display, output, brightness)?,
            ));
        }
        self.outputs_mut().insert(infos);
        Ok(())
    }
}

fn snapshot<B: RandrBackend>(
    display: &Display<B>,
    output: &Output,
    brightness: f64,
) -> Result<OutputConfig> {
    let mirror_source = display
        .mirror_mode()
        .then(|| display.mirror_output())
        .flatten()
        .filter(|source| *source != output.id())
        .and_then(|source| display.output(source).ok());
    let enabled = match mirror_source {
        _ if !output.is_opened() => OutputState::Disabled,
        Some(source) => OutputState::Mirroring(source.name().to_string()),
        None => OutputState::Enabled,
    };

    let mut config = OutputConfig {
        enabled,
        brightness,
        primary: display.primary_output() == Some(output.id()),
        ..Default::default()
    };
    if let Some(current) = display.current_config(output.id())? {
        if let Some(mode) = display.mode(current.mode()) {
            config.mode = (
                (mode.width as i32, mode.height as i32),
                (mode.refresh != 0).then_some(mode.refresh),
            );
        }
        config.position = current.position();
        config.transform = current.rotation().into();
        config.scale = current.transform().scale().0;
    }
    Ok(config)
}

/// Writes the guarded value back to disk once it goes out of scope.
pub struct PersistenceGuard<'a, T: Serialize>(Option<PathBuf>, &'a mut T);

impl<T: Serialize> std::ops::Deref for PersistenceGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.1
    }
}

impl<T: Serialize> std::ops::DerefMut for PersistenceGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.1
    }
}

impl<T: Serialize> Drop for PersistenceGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(path) = self.0.as_ref() {
            let writer = match OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(path)
            {
                Ok(writer) => writer,
                Err(err) => {
                    warn!(?err, "Failed to persist {}.", path.display());
                    return;
                }
            };
            match ron::ser::to_string_pretty(&*self.1, Default::default()) {
                Ok(content) => {
                    let mut writer = writer;
                    if let Err(err) = std::io::Write::write_all(&mut writer, content.as_bytes()) {
                        warn!(?err, "Failed to persist {}", path.display());
                    }
                }
                Err(err) => {
                    warn!(?err, "Failed to persist {}", path.display());
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{backend::headless::HeadlessBackend, utils::geometry::Rectangle};
    use cosmic_xrandr_config::TransformDef;

    fn display() -> Display<HeadlessBackend> {
        let backend = HeadlessBackend::new(3840, 1080);
        let mode = backend.add_mode(1920, 1080);
        let small = backend.add_mode(1280, 720);
        let left = backend.add_crtc();
        let right = backend.add_crtc();
        let edp = backend.add_output("eDP-1", &[mode, small], &[left, right]);
        let hdmi = backend.add_output("HDMI-1", &[mode, small], &[left, right]);
        backend.connect(edp, left, mode, 0, 0);
        backend.connect(hdmi, right, mode, 1920, 0);
        Display::new(backend).unwrap()
    }

    fn config(dir: &tempfile::TempDir) -> Config {
        Config::load(Some(dir.path().join("outputs.ron")))
    }

    #[test]
    fn snapshot_restores_the_same_setup() {
        let dir = tempfile::tempdir().unwrap();
        let mut display = display();
        let hdmi = display.output_by_name("HDMI-1").unwrap().id();
        display.set_primary_output(Some(hdmi)).unwrap();

        let mut config = config(&dir);
        config.write_outputs(&display).unwrap();
        let stored = config
            .outputs()
            .get(&["eDP-1".to_string(), "HDMI-1".to_string()])
            .unwrap();
        // connectors are stored sorted
        assert_eq!(stored[0].0.connector, "HDMI-1");
        assert_eq!(stored[0].1.position, (1920, 0));
        assert_eq!(stored[0].1.mode, ((1920, 1080), Some(60_000)));
        assert!(stored[0].1.primary);
        assert!(!stored[1].1.primary);

        // reloading from disk gives the same answer
        let reloaded = Config::load(Some(dir.path().join("outputs.ron")));
        assert_eq!(
            reloaded
                .outputs()
                .get(&["HDMI-1".to_string(), "eDP-1".to_string()]),
            Some(stored)
        );
    }

    #[test]
    fn stored_setup_is_staged() {
        let dir = tempfile::tempdir().unwrap();
        let mut display = display();
        let mut config = config(&dir);
        config.outputs_mut().insert(vec![
            (
                OutputInfo {
                    connector: "eDP-1".into(),
                },
                OutputConfig {
                    mode: ((1280, 720), None),
                    position: (0, 0),
                    ..Default::default()
                },
            ),
            (
                OutputInfo {
                    connector: "HDMI-1".into(),
                },
                OutputConfig {
                    mode: ((1920, 1080), Some(60_000)),
                    position: (1280, 0),
                    transform: TransformDef::_90,
                    brightness: 0.5,
                    primary: true,
                    ..Default::default()
                },
            ),
        ]);

        assert!(config.read_outputs(&mut display).unwrap());
        let hdmi = display.output_by_name("HDMI-1").unwrap().id();
        assert_eq!(display.primary_output(), Some(hdmi));
        assert_eq!(
            display.pending_allocation(hdmi).unwrap(),
            Rectangle::new(1280, 0, 1080, 1920)
        );

        let edp = display.output_by_name("eDP-1").unwrap().id();
        let report = display.apply_changed().unwrap();
        // HDMI-1 sits outside the shrinking screen and gets cycled
        assert_eq!(report.committed, vec![edp]);
        assert_eq!(report.reopened, vec![hdmi]);
        assert_eq!(report.screen_size, (2360, 1920));
        assert_eq!(display.backend().primary(), Some(hdmi));
        assert_eq!(
            display.allocation(hdmi).unwrap(),
            Rectangle::new(1280, 0, 1080, 1920)
        );
    }

    #[test]
    fn disabled_outputs_are_closed() {
        let dir = tempfile::tempdir().unwrap();
        let mut display = display();
        let mut config = config(&dir);
        config.outputs_mut().insert(vec![
            (
                OutputInfo {
                    connector: "eDP-1".into(),
                },
                OutputConfig {
                    mode: ((1920, 1080), None),
                    ..Default::default()
                },
            ),
            (
                OutputInfo {
                    connector: "HDMI-1".into(),
                },
                OutputConfig {
                    enabled: OutputState::Disabled,
                    ..Default::default()
                },
            ),
        ]);

        assert!(config.read_outputs(&mut display).unwrap());
        let hdmi = display.output_by_name("HDMI-1").unwrap().id();
        assert!(!display.is_opened(hdmi).unwrap());

        config.write_outputs(&display).unwrap();
        let stored = config
            .outputs()
            .get(&["eDP-1".to_string(), "HDMI-1".to_string()])
            .unwrap();
        assert_eq!(stored[0].1.enabled, OutputState::Disabled);
        // the closed output keeps what it showed before
        assert_eq!(stored[0].1.position, (1920, 0));
        assert_eq!(stored[1].1.enabled, OutputState::Enabled);
    }

    #[test]
    fn mirroring_is_restored() {
        let dir = tempfile::tempdir().unwrap();
        let mut display = display();
        let mut config = config(&dir);
        config.outputs_mut().insert(vec![
            (
                OutputInfo {
                    connector: "eDP-1".into(),
                },
                OutputConfig {
                    mode: ((1920, 1080), None),
                    ..Default::default()
                },
            ),
            (
                OutputInfo {
                    connector: "HDMI-1".into(),
                },
                OutputConfig {
                    mode: ((1280, 720), None),
                    enabled: OutputState::Mirroring("eDP-1".into()),
                    ..Default::default()
                },
            ),
        ]);

        assert!(config.read_outputs(&mut display).unwrap());
        let edp = display.output_by_name("eDP-1").unwrap().id();
        let hdmi = display.output_by_name("HDMI-1").unwrap().id();
        assert!(display.mirror_mode());
        assert_eq!(display.mirror_output(), Some(edp));

        display.apply_changed().unwrap();
        assert_eq!(
            display.allocation(hdmi).unwrap(),
            Rectangle::new(0, 0, 1920, 1080)
        );
        assert_eq!(display.screen_size(), (1920, 1080));
    }

    #[test]
    fn unknown_connector_sets_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut display = display();
        let config = config(&dir);
        assert!(!config.read_outputs(&mut display).unwrap());
        assert!(!display.has_changes());
    }
}
