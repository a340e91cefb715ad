//! Conversion of arbitrary inputs into the stream the display decodes.
//!
//! The firmware expects 480×480 baseline-profile H.264 at constant bit
//! rate, as a raw Annex B elementary stream. Decoding, scaling and encoding
//! run in process through libav:
//!
//! ```text
//! demux ─> decode ─> scale to fit ─> pad to 480×480 ─> retime ─> libx264 ─> .h264
//! ```

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling;
use ffmpeg_next::{Dictionary, Packet, Rational, codec, frame, media};

use splashstream::CancelToken;

pub const FRAME_SIZE: u32 = 480;
/// Target and ceiling bit rate, bits per second.
pub const BIT_RATE: usize = 4_000_000;
const GOP: u32 = 30;
const ENCODER: &str = "libx264";
/// VBV sizes are in kbit/s and must match `BIT_RATE` for CBR output.
const X264_PARAMS: &str = "keyint=30:min-keyint=30:nal-hrd=cbr:vbv-maxrate=4000:vbv-bufsize=4000";

/// Frame rate assumed for GIFs that do not report one.
pub const GIF_DEFAULT_FPS: f64 = 24.0;
/// Frame rate assumed for other inputs that do not report one.
pub const VIDEO_DEFAULT_FPS: f64 = 30.0;

/// Register libav components and keep its own logging to errors.
pub fn init() -> Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow!("ffmpeg init: {e}"))?;
    ffmpeg_next::util::log::set_level(ffmpeg_next::util::log::Level::Error);
    Ok(())
}

pub fn is_gif(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gif"))
}

pub fn default_frame_rate(path: &Path) -> f64 {
    if is_gif(path) {
        GIF_DEFAULT_FPS
    } else {
        VIDEO_DEFAULT_FPS
    }
}

/// Frames per second of a libav rate. Zero and undefined rates (`0/0`)
/// yield `None`.
pub fn rate_to_fps(rate: Rational) -> Option<f64> {
    if rate.denominator() == 0 {
        return None;
    }
    let fps = f64::from(rate.numerator()) / f64::from(rate.denominator());
    (fps.is_finite() && fps > 0.0).then_some(fps)
}

/// Rational form of a positive frame rate, to a millihertz.
fn fps_to_rational(fps: f64) -> Rational {
    const SCALE: i32 = 1000;
    let num = ((fps * f64::from(SCALE)).round() as i32).max(1);
    let divisor = gcd(num, SCALE);
    Rational::new(num / divisor, SCALE / divisor)
}

fn gcd(mut a: i32, mut b: i32) -> i32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a.abs().max(1)
}

/// Average frame rate of the best video stream.
pub fn probe_frame_rate(input: &Path) -> Result<Option<f64>> {
    let ictx = ffmpeg_next::format::input(&input)
        .with_context(|| format!("opening {}", input.display()))?;
    let stream = ictx
        .streams()
        .best(media::Type::Video)
        .ok_or_else(|| anyhow!("{} has no video stream", input.display()))?;

    let reported = stream.avg_frame_rate();
    let rate = rate_to_fps(reported);
    tracing::debug!(
        input = %input.display(),
        reported = %format_args!("{}/{}", reported.numerator(), reported.denominator()),
        ?rate,
        "probed frame rate"
    );
    Ok(rate)
}

/// Where a picture lands inside the square output frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Placement {
    width: u32,
    height: u32,
    x: u32,
    y: u32,
}

/// Scale `width`×`height` to fit inside a `size` square, keeping the aspect
/// ratio, and center it. Sizes and offsets are even so the 4:2:0 chroma
/// planes stay aligned.
fn fit_within(width: u32, height: u32, size: u32) -> Placement {
    let (w, h) = (u64::from(width.max(1)), u64::from(height.max(1)));
    let side = u64::from(size);
    let (fit_w, fit_h) = if w >= h {
        (side, (h * side + w / 2) / w)
    } else {
        ((w * side + h / 2) / h, side)
    };
    let even = |v: u64| (v.clamp(2, side) as u32) & !1;
    let (width, height) = (even(fit_w), even(fit_h));
    Placement {
        width,
        height,
        x: ((size - width) / 2) & !1,
        y: ((size - height) / 2) & !1,
    }
}

/// Copy a `width`×`height` block of one plane into another at (`x`, `y`).
#[allow(clippy::too_many_arguments)]
fn blit(
    dst: &mut [u8],
    dst_stride: usize,
    src: &[u8],
    src_stride: usize,
    width: usize,
    height: usize,
    x: usize,
    y: usize,
) {
    for row in 0..height {
        let from = row * src_stride;
        let to = (y + row) * dst_stride + x;
        dst[to..to + width].copy_from_slice(&src[from..from + width]);
    }
}

/// Maps variable input timestamps onto constant-rate output slots.
///
/// Slot `n` shows at `n / fps` and carries the latest picture at or before
/// that time, so pictures are repeated or dropped as needed.
#[derive(Debug)]
struct Retimer {
    fps: f64,
    next: i64,
}

impl Retimer {
    fn new(fps: f64) -> Self {
        Self { fps, next: 0 }
    }

    /// Claim the unclaimed slots that show before `time` seconds.
    fn slots_before(&mut self, time: f64) -> Range<i64> {
        let end = (time * self.fps - 1e-6).ceil().max(0.0) as i64;
        let start = self.next;
        self.next = self.next.max(end);
        start..self.next
    }

    /// Slots for the final picture, ending at `end`; never empty.
    fn finish(&mut self, end: f64) -> Range<i64> {
        let slots = self.slots_before(end);
        if slots.is_empty() {
            self.next += 1;
            return slots.start..self.next;
        }
        slots
    }
}

/// Limited-range black in every plane.
fn black_frame() -> frame::Video {
    let mut canvas = frame::Video::new(Pixel::YUV420P, FRAME_SIZE, FRAME_SIZE);
    canvas.data_mut(0).fill(16);
    canvas.data_mut(1).fill(128);
    canvas.data_mut(2).fill(128);
    canvas
}

fn open_encoder(fps: f64) -> Result<ffmpeg_next::encoder::Video> {
    let codec = ffmpeg_next::encoder::find_by_name(ENCODER)
        .ok_or_else(|| anyhow!("{ENCODER} encoder not available in this libav build"))?;
    let mut video = codec::Context::new_with_codec(codec).encoder().video()?;

    let rate = fps_to_rational(fps);
    video.set_width(FRAME_SIZE);
    video.set_height(FRAME_SIZE);
    video.set_format(Pixel::YUV420P);
    video.set_frame_rate(Some(rate));
    video.set_time_base(Rational::new(rate.denominator(), rate.numerator()));
    video.set_gop(GOP);
    video.set_bit_rate(BIT_RATE);
    video.set_max_bit_rate(BIT_RATE);

    let mut options = Dictionary::new();
    options.set("preset", "veryfast");
    options.set("profile", "baseline");
    options.set("x264-params", X264_PARAMS);
    Ok(video.open_with(options)?)
}

/// Decoded pictures in, Annex B bytes out.
struct Pipeline<W: Write> {
    encoder: ffmpeg_next::encoder::Video,
    out: W,
    scaler: Option<(scaling::Context, Placement)>,
    background: frame::Video,
    retimer: Retimer,
    held: Option<(frame::Video, f64)>,
    origin: Option<f64>,
    last_step: f64,
    pictures: u64,
    encoded: u64,
}

impl<W: Write> Pipeline<W> {
    fn new(encoder: ffmpeg_next::encoder::Video, out: W, fps: f64) -> Self {
        Self {
            encoder,
            out,
            scaler: None,
            background: black_frame(),
            retimer: Retimer::new(fps),
            held: None,
            origin: None,
            last_step: 1.0 / fps,
            pictures: 0,
            encoded: 0,
        }
    }

    /// Accept one decoded picture shown at `time` seconds, if known.
    fn push(&mut self, decoded: &frame::Video, time: Option<f64>) -> Result<()> {
        let time = time.unwrap_or(self.pictures as f64 / self.retimer.fps);
        let time = time - *self.origin.get_or_insert(time);
        let picture = self.compose(decoded)?;
        self.pictures += 1;

        if let Some((held, held_time)) = self.held.take() {
            if time > held_time {
                self.last_step = time - held_time;
            }
            let slots = self.retimer.slots_before(time);
            self.emit(&held, slots)?;
        }
        self.held = Some((picture, time));
        Ok(())
    }

    /// Scale the picture into place on a black 480×480 canvas.
    fn compose(&mut self, decoded: &frame::Video) -> Result<frame::Video> {
        let (mut scaler, place) = match self.scaler.take() {
            Some(entry) => entry,
            None => {
                let place = fit_within(decoded.width(), decoded.height(), FRAME_SIZE);
                let scaler = scaling::Context::get(
                    decoded.format(),
                    decoded.width(),
                    decoded.height(),
                    Pixel::YUV420P,
                    place.width,
                    place.height,
                    scaling::flag::Flags::BILINEAR,
                )?;
                tracing::debug!(
                    source = %format_args!("{}x{}", decoded.width(), decoded.height()),
                    scaled = %format_args!("{}x{}", place.width, place.height),
                    "scaler created"
                );
                (scaler, place)
            }
        };

        let mut scaled = frame::Video::empty();
        scaler.run(decoded, &mut scaled)?;

        let mut canvas = self.background.clone();
        for plane in 0..3 {
            let shift = if plane == 0 { 0 } else { 1 };
            let dst_stride = canvas.stride(plane);
            blit(
                canvas.data_mut(plane),
                dst_stride,
                scaled.data(plane),
                scaled.stride(plane),
                (place.width >> shift) as usize,
                (place.height >> shift) as usize,
                (place.x >> shift) as usize,
                (place.y >> shift) as usize,
            );
        }

        self.scaler = Some((scaler, place));
        Ok(canvas)
    }

    fn emit(&mut self, picture: &frame::Video, slots: Range<i64>) -> Result<()> {
        for slot in slots {
            let mut timed = picture.clone();
            timed.set_pts(Some(slot));
            self.encoder.send_frame(&timed)?;
            self.encoded += 1;
            self.drain()?;
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        let mut packet = Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            if let Some(data) = packet.data() {
                self.out.write_all(data)?;
            }
        }
        Ok(())
    }

    /// Emit the last picture, flush the encoder and return the frame count.
    fn finish(mut self) -> Result<u64> {
        if let Some((held, time)) = self.held.take() {
            let slots = self.retimer.finish(time + self.last_step);
            self.emit(&held, slots)?;
        }
        self.encoder.send_eof()?;
        self.drain()?;
        self.out.flush()?;
        Ok(self.encoded)
    }
}

fn receive_pictures<W: Write>(
    decoder: &mut ffmpeg_next::decoder::Video,
    pipeline: &mut Pipeline<W>,
    time_base: f64,
) -> Result<()> {
    let mut decoded = frame::Video::empty();
    while decoder.receive_frame(&mut decoded).is_ok() {
        let time = decoded.timestamp().map(|ts| ts as f64 * time_base);
        pipeline.push(&decoded, time)?;
    }
    Ok(())
}

/// Transcode `input` into an Annex B stream at `output`.
///
/// Stops early, leaving a partial output, once `cancel` fires.
pub fn transcode(input: &Path, output: &Path, fps: f64, cancel: &CancelToken) -> Result<()> {
    tracing::info!(input = %input.display(), output = %output.display(), fps, "converting");

    let mut ictx = ffmpeg_next::format::input(&input)
        .with_context(|| format!("opening {}", input.display()))?;
    let (stream_index, time_base, parameters) = {
        let stream = ictx
            .streams()
            .best(media::Type::Video)
            .ok_or_else(|| anyhow!("{} has no video stream", input.display()))?;
        let tb = stream.time_base();
        let time_base = if tb.denominator() == 0 {
            0.0
        } else {
            f64::from(tb.numerator()) / f64::from(tb.denominator())
        };
        (stream.index(), time_base, stream.parameters())
    };

    let mut decoder = codec::context::Context::from_parameters(parameters)?
        .decoder()
        .video()
        .with_context(|| format!("no decoder for {}", input.display()))?;
    let file = File::create(output).with_context(|| format!("creating {}", output.display()))?;
    let mut pipeline = Pipeline::new(open_encoder(fps)?, BufWriter::new(file), fps);

    for (stream, packet) in ictx.packets() {
        if cancel.is_cancelled() {
            tracing::info!("conversion cancelled");
            return Ok(());
        }
        if stream.index() != stream_index {
            continue;
        }
        decoder.send_packet(&packet)?;
        receive_pictures(&mut decoder, &mut pipeline, time_base)?;
    }
    decoder.send_eof()?;
    receive_pictures(&mut decoder, &mut pipeline, time_base)?;

    let frames = pipeline.finish()?;
    tracing::info!(frames, "conversion complete");
    Ok(())
}

/// Derived file removed when dropped, whichever way streaming ends.
#[derive(Debug)]
pub struct TempStream {
    path: PathBuf,
}

impl TempStream {
    /// Reserve a per-process path in the system temp directory.
    pub fn new() -> Self {
        let path = std::env::temp_dir().join(format!("splashstream-{}.h264", std::process::id()));
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempStream {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "removed temporary stream"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "cannot remove temporary stream"
            ),
        }
    }
}
