// SPDX-License-Identifier: GPL-3.0-only

//! RandR 1.3+ over a plain X11 connection.

use super::{
    BackendError, CrtcConfig, CrtcId, CrtcInfo, CrtcTransform, GammaRamp, ModeInfo, OutputId,
    OutputInfo, RandrBackend, Rotation, ScreenResources, Timestamp,
};
use crate::utils::geometry::Transform;
use tracing::{debug, info};
use x11rb::{
    connection::Connection,
    errors::{ConnectError, ConnectionError, ReplyError},
    protocol::{
        randr::{self, ConnectionExt as _},
        render,
        xproto::{ConnectionExt as _, Window},
    },
    rust_connection::RustConnection,
};

impl From<ConnectError> for BackendError {
    fn from(err: ConnectError) -> BackendError {
        BackendError::Connection(err.to_string())
    }
}

impl From<ConnectionError> for BackendError {
    fn from(err: ConnectionError) -> BackendError {
        BackendError::Connection(err.to_string())
    }
}

impl From<ReplyError> for BackendError {
    fn from(err: ReplyError) -> BackendError {
        match err {
            ReplyError::X11Error(err) => BackendError::Rejected(format!("{:?}", err.error_kind)),
            ReplyError::ConnectionError(err) => err.into(),
        }
    }
}

fn event_mask() -> randr::NotifyMask {
    randr::NotifyMask::SCREEN_CHANGE
        | randr::NotifyMask::CRTC_CHANGE
        | randr::NotifyMask::OUTPUT_CHANGE
        | randr::NotifyMask::OUTPUT_PROPERTY
}

#[derive(Debug)]
pub struct X11Backend {
    conn: RustConnection,
    root: Window,
    /// Physical size of one pixel, kept constant across screen resizes.
    mm_per_pixel: (f64, f64),
}

impl X11Backend {
    /// Connects to `display`, or `$DISPLAY` if `None`.
    pub fn connect(display: Option<&str>) -> Result<X11Backend, BackendError> {
        let (conn, screen_num) = RustConnection::connect(display)?;
        let version = conn.randr_query_version(1, 3)?.reply()?;
        if (version.major_version, version.minor_version) < (1, 3) {
            return Err(BackendError::Connection(format!(
                "RandR {}.{} is too old",
                version.major_version, version.minor_version
            )));
        }

        let screen = conn
            .setup()
            .roots
            .get(screen_num)
            .ok_or(BackendError::NotFound {
                kind: "screen",
                id: screen_num as u32,
            })?;
        let root = screen.root;
        let mm_per_pixel = (
            screen.width_in_millimeters as f64 / screen.width_in_pixels.max(1) as f64,
            screen.height_in_millimeters as f64 / screen.height_in_pixels.max(1) as f64,
        );
        info!(
            "Connected to screen {} with RandR {}.{}",
            screen_num, version.major_version, version.minor_version
        );

        let backend = X11Backend {
            conn,
            root,
            mm_per_pixel,
        };
        backend.resume_events()?;
        Ok(backend)
    }

    fn output_info(
        &self,
        output: OutputId,
        timestamp: Timestamp,
    ) -> Result<randr::GetOutputInfoReply, BackendError> {
        Ok(self.conn.randr_get_output_info(output, timestamp)?.reply()?)
    }
}

/// Refresh rate in mHz, 0 if the timings don't allow computing one.
fn refresh(mode: &randr::ModeInfo) -> u32 {
    let flags = u32::from(mode.mode_flags);
    let mut clock = mode.dot_clock as u64 * 1000;
    let mut vtotal = mode.vtotal as u64;
    if flags & u32::from(randr::ModeFlag::DOUBLE_SCAN) != 0 {
        vtotal *= 2;
    }
    // two fields per frame, vtotal may be odd
    if flags & u32::from(randr::ModeFlag::INTERLACE) != 0 {
        clock *= 2;
    }
    let total = mode.htotal as u64 * vtotal;
    if total == 0 {
        return 0;
    }
    (clock / total) as u32
}

fn to_render(transform: &Transform) -> render::Transform {
    let [[m11, m12, m13], [m21, m22, m23], [m31, m32, m33]] = transform.matrix;
    render::Transform {
        matrix11: m11,
        matrix12: m12,
        matrix13: m13,
        matrix21: m21,
        matrix22: m22,
        matrix23: m23,
        matrix31: m31,
        matrix32: m32,
        matrix33: m33,
    }
}

fn from_render(transform: &render::Transform) -> Transform {
    Transform {
        matrix: [
            [transform.matrix11, transform.matrix12, transform.matrix13],
            [transform.matrix21, transform.matrix22, transform.matrix23],
            [transform.matrix31, transform.matrix32, transform.matrix33],
        ],
    }
}

impl RandrBackend for X11Backend {
    fn screen_resources(&self) -> Result<ScreenResources, BackendError> {
        let resources = self
            .conn
            .randr_get_screen_resources_current(self.root)?
            .reply()?;
        let geometry = self.conn.get_geometry(self.root)?.reply()?;

        let modes = resources
            .modes
            .iter()
            .map(|mode| ModeInfo {
                id: mode.id,
                width: mode.width,
                height: mode.height,
                refresh: refresh(mode),
            })
            .collect();

        let mut outputs = Vec::with_capacity(resources.outputs.len());
        for &id in &resources.outputs {
            let info = self.output_info(id, resources.config_timestamp)?;
            if info.connection != randr::Connection::CONNECTED {
                continue;
            }
            outputs.push(OutputInfo {
                id,
                name: String::from_utf8_lossy(&info.name).into_owned(),
                crtc: info.crtc,
                crtcs: info.crtcs,
                modes: info.modes,
            });
        }

        Ok(ScreenResources {
            config_timestamp: resources.config_timestamp,
            width: geometry.width,
            height: geometry.height,
            modes,
            outputs,
        })
    }

    fn crtc_info(&self, crtc: CrtcId, timestamp: Timestamp) -> Result<CrtcInfo, BackendError> {
        let info = self.conn.randr_get_crtc_info(crtc, timestamp)?.reply()?;
        Ok(CrtcInfo {
            x: info.x,
            y: info.y,
            width: info.width,
            height: info.height,
            mode: info.mode,
            rotation: Rotation::from_bits_truncate(u16::from(info.rotation)),
            outputs: info.outputs,
        })
    }

    fn crtc_transform(&self, crtc: CrtcId) -> Result<CrtcTransform, BackendError> {
        let reply = self.conn.randr_get_crtc_transform(crtc)?.reply()?;
        Ok(CrtcTransform {
            transform: from_render(&reply.current_transform),
            filter: String::from_utf8_lossy(&reply.current_filter_name).into_owned(),
            params: reply.current_params,
        })
    }

    fn crtc_gamma_size(&self, crtc: CrtcId) -> Result<u16, BackendError> {
        Ok(self.conn.randr_get_crtc_gamma_size(crtc)?.reply()?.size)
    }

    fn output_crtcs(
        &self,
        output: OutputId,
        timestamp: Timestamp,
    ) -> Result<Vec<CrtcId>, BackendError> {
        Ok(self.output_info(output, timestamp)?.crtcs)
    }

    fn set_crtc_config(
        &self,
        crtc: CrtcId,
        timestamp: Timestamp,
        config: &CrtcConfig,
    ) -> Result<(), BackendError> {
        let reply = self
            .conn
            .randr_set_crtc_config(
                crtc,
                x11rb::CURRENT_TIME,
                timestamp,
                config.x,
                config.y,
                config.mode,
                randr::Rotation::from(config.rotation.bits()),
                &config.outputs,
            )?
            .reply()?;
        if reply.status != randr::SetConfig::SUCCESS {
            return Err(BackendError::Rejected(format!(
                "crtc {} config refused with {:?}",
                crtc, reply.status
            )));
        }
        Ok(())
    }

    fn set_crtc_transform(
        &self,
        crtc: CrtcId,
        transform: &CrtcTransform,
    ) -> Result<(), BackendError> {
        self.conn
            .randr_set_crtc_transform(
                crtc,
                to_render(&transform.transform),
                transform.filter.as_bytes(),
                &transform.params,
            )?
            .check()?;
        Ok(())
    }

    fn set_crtc_gamma(&self, crtc: CrtcId, ramp: &GammaRamp) -> Result<(), BackendError> {
        self.conn
            .randr_set_crtc_gamma(crtc, &ramp.red, &ramp.green, &ramp.blue)?
            .check()?;
        Ok(())
    }

    fn set_screen_size(&self, width: u16, height: u16) -> Result<(), BackendError> {
        let mm_width = (width as f64 * self.mm_per_pixel.0).round() as u32;
        let mm_height = (height as f64 * self.mm_per_pixel.1).round() as u32;
        debug!(width, height, mm_width, mm_height, "Setting screen size");
        self.conn
            .randr_set_screen_size(self.root, width, height, mm_width, mm_height)?
            .check()?;
        Ok(())
    }

    fn set_output_primary(&self, output: Option<OutputId>) -> Result<(), BackendError> {
        self.conn
            .randr_set_output_primary(self.root, output.unwrap_or(x11rb::NONE))?
            .check()?;
        Ok(())
    }

    fn grab_server(&self) -> Result<(), BackendError> {
        self.conn.grab_server()?.check()?;
        Ok(())
    }

    fn ungrab_server(&self) -> Result<(), BackendError> {
        self.conn.ungrab_server()?;
        self.conn.flush()?;
        Ok(())
    }

    fn pause_events(&self) -> Result<(), BackendError> {
        self.conn
            .randr_select_input(self.root, randr::NotifyMask::from(0u16))?
            .check()?;
        Ok(())
    }

    fn resume_events(&self) -> Result<(), BackendError> {
        self.conn
            .randr_select_input(self.root, event_mask())?
            .check()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn mode(dot_clock: u32, htotal: u16, vtotal: u16, flags: randr::ModeFlag) -> randr::ModeInfo {
        randr::ModeInfo {
            id: 1,
            width: 1920,
            height: 1080,
            dot_clock,
            hsync_start: 0,
            hsync_end: 0,
            htotal,
            hskew: 0,
            vsync_start: 0,
            vsync_end: 0,
            vtotal,
            name_len: 0,
            mode_flags: flags.into(),
        }
    }

    #[test]
    fn refresh_from_timings() {
        let plain = mode(148_500_000, 2200, 1125, randr::ModeFlag::from(0u32));
        assert_eq!(refresh(&plain), 60_000);
        let interlaced = mode(74_250_000, 2200, 1125, randr::ModeFlag::INTERLACE);
        assert_eq!(refresh(&interlaced), 60_000);
        // 480i, 525 lines
        let ntsc = mode(13_500_000, 858, 525, randr::ModeFlag::INTERLACE);
        assert_eq!(refresh(&ntsc), 59_940);
        let doubled = mode(25_175_000, 800, 262, randr::ModeFlag::DOUBLE_SCAN);
        assert_eq!(refresh(&doubled), 60_054);
        assert_eq!(refresh(&mode(1, 0, 0, randr::ModeFlag::from(0u32))), 0);
    }

    #[test]
    fn render_transform_is_row_major() {
        let transform = Transform::identity().with_scale(1.5, 2.0);
        let render = to_render(&transform);
        assert_eq!(render.matrix11, 3 << 15);
        assert_eq!(render.matrix22, 2 << 16);
        assert_eq!(render.matrix13, 0);
        assert_eq!(from_render(&render), transform);
    }
}
