//! X11 capture sources
//!
//! Full-display capture grabs the root window; the fallback grabs the
//! focused window's rectangle. Both use the XGetImage path at a bounded
//! frame rate, downsample to the constraint resolution, and publish RGB
//! frames for the external encoder.

use super::frame::{Frame, FrameStats};
use super::{CaptureConstraints, CaptureError, CaptureSource, LocalStream, LocalTrack};
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use x11rb::connection::Connection;
use x11rb::errors::ReplyError;
use x11rb::protocol::xproto::{ConnectionExt, ImageFormat, Window};
use x11rb::protocol::ErrorKind;
use x11rb::rust_connection::RustConnection;

/// Capture region inside the root window
#[derive(Debug, Clone, Copy)]
struct GrabRect {
    x: i16,
    y: i16,
    width: u16,
    height: u16,
}

/// Full-display capture source (preferred strategy)
pub struct X11DisplaySource {
    display: Option<String>,
}

impl X11DisplaySource {
    pub fn new(display: Option<String>) -> Self {
        Self { display }
    }
}

#[async_trait]
impl CaptureSource for X11DisplaySource {
    fn label(&self) -> &'static str {
        "display"
    }

    async fn open(&self, constraints: &CaptureConstraints) -> Result<LocalStream, CaptureError> {
        let (conn, screen_num) = x11rb::connect(self.display.as_deref())
            .map_err(|e| CaptureError::Unavailable(format!("X11 connect: {}", e)))?;

        let screen = &conn.setup().roots[screen_num];
        let rect = GrabRect {
            x: 0,
            y: 0,
            width: screen.width_in_pixels,
            height: screen.height_in_pixels,
        };
        let root = screen.root;
        let msb_first = u8::from(conn.setup().image_byte_order) != 0;

        Ok(build_stream(
            conn,
            root,
            rect,
            msb_first,
            constraints,
            self.label(),
        ))
    }
}

/// Focused-window capture source (fallback strategy)
pub struct X11WindowSource {
    display: Option<String>,
}

impl X11WindowSource {
    pub fn new(display: Option<String>) -> Self {
        Self { display }
    }
}

#[async_trait]
impl CaptureSource for X11WindowSource {
    fn label(&self) -> &'static str {
        "window"
    }

    async fn open(&self, constraints: &CaptureConstraints) -> Result<LocalStream, CaptureError> {
        let (conn, screen_num) = x11rb::connect(self.display.as_deref())
            .map_err(|e| CaptureError::Unavailable(format!("X11 connect: {}", e)))?;

        let screen = &conn.setup().roots[screen_num];
        let root = screen.root;
        let msb_first = u8::from(conn.setup().image_byte_order) != 0;

        let focus = conn
            .get_input_focus()
            .map_err(|e| CaptureError::Unavailable(format!("GetInputFocus: {}", e)))?
            .reply()
            .map_err(|e| CaptureError::Unavailable(format!("GetInputFocus: {}", e)))?
            .focus;

        // 0 = None, 1 = PointerRoot; neither is a grabbable window.
        if focus <= 1 || focus == root {
            return Err(CaptureError::Unavailable(
                "no focused window to capture".to_string(),
            ));
        }

        let geometry = conn
            .get_geometry(focus)
            .map_err(|e| CaptureError::Unavailable(format!("GetGeometry: {}", e)))?
            .reply()
            .map_err(|e| CaptureError::Unavailable(format!("GetGeometry: {}", e)))?;

        let translated = conn
            .translate_coordinates(focus, root, 0, 0)
            .map_err(|e| CaptureError::Unavailable(format!("TranslateCoordinates: {}", e)))?
            .reply()
            .map_err(|e| CaptureError::Unavailable(format!("TranslateCoordinates: {}", e)))?;

        let rect = GrabRect {
            x: translated.dst_x,
            y: translated.dst_y,
            width: geometry.width,
            height: geometry.height,
        };

        // Grab the window's rectangle out of the root so reparenting window
        // managers do not skew the pixel origin.
        Ok(build_stream(
            conn,
            root,
            rect,
            msb_first,
            constraints,
            self.label(),
        ))
    }
}

/// Assemble the stream: one video track plus the pump task grabbing frames.
fn build_stream(
    conn: RustConnection,
    drawable: Window,
    rect: GrabRect,
    msb_first: bool,
    constraints: &CaptureConstraints,
    label: &'static str,
) -> LocalStream {
    let (frames_tx, _) = broadcast::channel(4);
    let track = LocalTrack::new(super::video_track("video"));

    let ended = track.ended_handle();
    let frames = frames_tx.clone();
    let fps = constraints.fps.max(1);
    let (out_width, out_height) = fit_dims(rect.width, rect.height, constraints);

    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(1000 / fps as u64));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut sequence = 0u64;
        let mut stats = FrameStats::default();
        let mut conn = conn;

        loop {
            interval.tick().await;
            if ended.load(Ordering::SeqCst) {
                break;
            }

            let started = Instant::now();
            // GetImage is a blocking multi-megabyte round trip; keep it off
            // the runtime workers.
            let joined = tokio::task::spawn_blocking(move || {
                let grabbed = grab_rgb(&conn, drawable, rect, msb_first, out_width, out_height);
                (conn, grabbed)
            })
            .await;
            let grabbed = match joined {
                Ok((returned, grabbed)) => {
                    conn = returned;
                    grabbed
                }
                Err(e) => {
                    warn!("X11 grab task failed ({}): {}", label, e);
                    break;
                }
            };

            match grabbed {
                Ok(data) => {
                    stats.record_capture(data.len(), started.elapsed().as_micros() as u64);
                    sequence += 1;
                    let _ = frames.send(Frame {
                        width: out_width,
                        height: out_height,
                        data,
                        timestamp: Instant::now(),
                        sequence,
                    });
                }
                Err(e) => {
                    warn!("X11 grab failed ({}): {}", label, e);
                    break;
                }
            }
        }

        debug!(
            "Capture pump ({}) stopped after {} frames",
            label, stats.total_frames
        );
    });

    track.attach_pump(handle);
    LocalStream::new(label, vec![track], frames_tx)
}

/// Largest output size that fits the constraint, aspect preserved.
/// Captures smaller than the constraint pass through, never upscaled.
fn fit_dims(width: u16, height: u16, constraints: &CaptureConstraints) -> (u32, u32) {
    let (w, h) = (width as u32, height as u32);
    if w <= constraints.width && h <= constraints.height {
        return (w.max(1), h.max(1));
    }
    let scale = (constraints.width as f64 / w as f64).min(constraints.height as f64 / h as f64);
    (
        ((w as f64 * scale).round() as u32).max(1),
        ((h as f64 * scale).round() as u32).max(1),
    )
}

/// Grab one rectangle as RGB bytes at the output resolution
fn grab_rgb(
    conn: &RustConnection,
    drawable: Window,
    rect: GrabRect,
    msb_first: bool,
    out_width: u32,
    out_height: u32,
) -> Result<Vec<u8>, CaptureError> {
    let image = conn
        .get_image(
            ImageFormat::Z_PIXMAP,
            drawable,
            rect.x,
            rect.y,
            rect.width,
            rect.height,
            !0,
        )
        .map_err(|e| CaptureError::Failed(format!("GetImage request: {}", e)))?
        .reply()
        .map_err(map_reply_error)?;

    Ok(xrgb_to_rgb_scaled(
        &image.data,
        rect.width as u32,
        rect.height as u32,
        out_width,
        out_height,
        msb_first,
    ))
}

fn map_reply_error(e: ReplyError) -> CaptureError {
    match e {
        ReplyError::X11Error(ref err) if err.error_kind == ErrorKind::Access => {
            CaptureError::PermissionDenied(format!("{:?}", e))
        }
        other => CaptureError::Failed(format!("GetImage reply: {:?}", other)),
    }
}

/// Convert 32bpp X pixel data to packed RGB, nearest-neighbor sampled down to
/// the output size. Equal sizes degrade to a plain conversion.
fn xrgb_to_rgb_scaled(
    data: &[u8],
    src_width: u32,
    src_height: u32,
    out_width: u32,
    out_height: u32,
    msb_first: bool,
) -> Vec<u8> {
    let mut rgb = Vec::with_capacity((out_width * out_height * 3) as usize);
    for dy in 0..out_height {
        let sy = (dy as u64 * src_height as u64 / out_height as u64) as usize;
        let row = sy * src_width as usize * 4;
        for dx in 0..out_width {
            let sx = (dx as u64 * src_width as u64 / out_width as u64) as usize;
            let px = &data[row + sx * 4..row + sx * 4 + 4];
            if msb_first {
                // xRGB
                rgb.extend_from_slice(&[px[1], px[2], px[3]]);
            } else {
                // BGRx
                rgb.extend_from_slice(&[px[2], px[1], px[0]]);
            }
        }
    }
    rgb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xrgb_conversion_lsb() {
        // One blue pixel in BGRx layout
        let data = [0xFF, 0x00, 0x00, 0x00];
        assert_eq!(
            xrgb_to_rgb_scaled(&data, 1, 1, 1, 1, false),
            vec![0x00, 0x00, 0xFF]
        );
    }

    #[test]
    fn test_xrgb_conversion_msb() {
        // One blue pixel in xRGB layout
        let data = [0x00, 0x00, 0x00, 0xFF];
        assert_eq!(
            xrgb_to_rgb_scaled(&data, 1, 1, 1, 1, true),
            vec![0x00, 0x00, 0xFF]
        );
    }

    #[test]
    fn test_scaled_conversion_picks_nearest() {
        // 2x2 BGRx: blue, red / green, white. Downsampled to 1x1 the origin
        // pixel wins.
        let data = [
            0xFF, 0x00, 0x00, 0x00, 0x00, 0x00, 0xFF, 0x00, //
            0x00, 0xFF, 0x00, 0x00, 0xFF, 0xFF, 0xFF, 0x00,
        ];
        assert_eq!(
            xrgb_to_rgb_scaled(&data, 2, 2, 1, 1, false),
            vec![0x00, 0x00, 0xFF]
        );
    }

    #[test]
    fn test_fit_dims_downscales_preserving_aspect() {
        let constraints = CaptureConstraints {
            fps: 15,
            width: 1280,
            height: 720,
        };
        assert_eq!(fit_dims(2560, 1440, &constraints), (1280, 720));
        // 1920x1200 is taller than 16:9; height binds.
        assert_eq!(fit_dims(1920, 1200, &constraints), (1152, 720));
    }

    #[test]
    fn test_fit_dims_never_upscales() {
        let constraints = CaptureConstraints {
            fps: 15,
            width: 1280,
            height: 720,
        };
        assert_eq!(fit_dims(640, 480, &constraints), (640, 480));
        assert_eq!(fit_dims(1280, 720, &constraints), (1280, 720));
    }

    #[tokio::test]
    async fn test_display_source_unavailable_without_server() {
        let source = X11DisplaySource::new(Some(":12345".to_string()));
        let result = source.open(&CaptureConstraints::default()).await;
        assert!(matches!(result, Err(CaptureError::Unavailable(_))));
    }
}
