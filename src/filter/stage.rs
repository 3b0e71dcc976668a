//! Transform stages applied between a source and an output.
//!
//! A stage opens lazily against the first unit it sees, because the
//! source's real format is only known once media flows. Stages rebuild
//! themselves when the input format changes mid-stream.

use crate::config::OverlayOptions;
use crate::error::{RelayError, Result};
use crate::media::picture;
use crate::media::unit::{MediaUnit, StreamKind};
use ac_ffmpeg::codec::audio::frame::get_sample_format;
use ac_ffmpeg::codec::audio::{AudioFrameMut, AudioResampler, ChannelLayout};
use ac_ffmpeg::codec::video::frame::get_pixel_format;
use ac_ffmpeg::codec::video::{VideoFrameMut, VideoFrameScaler};
use bytes::Bytes;

/// One element of a filter chain. `process` may merge or split units;
/// returning an empty vector swallows the input.
pub trait FilterStage: Send {
    fn name(&self) -> &'static str;

    /// Open against the concrete format of the first unit.
    fn connect(&mut self, unit: &MediaUnit) -> Result<()>;

    fn process(&mut self, unit: MediaUnit) -> Result<Vec<MediaUnit>>;
}

/// Resizes decoded video to a fixed target geometry.
pub struct ScaleStage {
    target_width: u32,
    target_height: u32,
    scaler: Option<VideoFrameScaler>,
    connected: Option<(u32, u32)>,
    packed: Vec<u8>,
}

// The scaler lives on the filter worker thread only.
unsafe impl Send for ScaleStage {}

impl ScaleStage {
    pub fn new(target_width: u32, target_height: u32) -> Self {
        Self {
            target_width,
            target_height,
            scaler: None,
            connected: None,
            packed: Vec::new(),
        }
    }
}

impl FilterStage for ScaleStage {
    fn name(&self) -> &'static str {
        "scale"
    }

    fn connect(&mut self, unit: &MediaUnit) -> Result<()> {
        let (Some(width), Some(height)) = (unit.width, unit.height) else {
            return Err(RelayError::Precondition(
                "scale stage needs decoded video".into(),
            ));
        };
        let format = get_pixel_format("yuv420p");
        let scaler = VideoFrameScaler::builder()
            .source_pixel_format(format)
            .source_width(width as usize)
            .source_height(height as usize)
            .target_pixel_format(format)
            .target_width(self.target_width as usize)
            .target_height(self.target_height as usize)
            .build()?;
        self.scaler = Some(scaler);
        self.connected = Some((width, height));
        Ok(())
    }

    fn process(&mut self, unit: MediaUnit) -> Result<Vec<MediaUnit>> {
        if unit.kind != StreamKind::Video || !unit.is_frame() {
            return Ok(vec![unit]);
        }
        let (Some(width), Some(height)) = (unit.width, unit.height) else {
            return Ok(vec![unit]);
        };
        if width == self.target_width && height == self.target_height {
            return Ok(vec![unit]);
        }
        if self.connected != Some((width, height)) {
            // Source geometry changed, reopen against the new one.
            self.connect(&unit)?;
        }
        let Some(scaler) = self.scaler.as_mut() else {
            return Ok(vec![unit]);
        };

        let mut frame = VideoFrameMut::black(
            get_pixel_format("yuv420p"),
            width as usize,
            height as usize,
        );
        picture::fill_from_packed(&mut frame, &unit.data, width as usize, height as usize);
        let scaled = scaler.scale(&frame.freeze())?;

        if !picture::pack_into(&mut self.packed, &scaled) {
            return Ok(Vec::new());
        }
        let mut out = MediaUnit::video_frame(
            Bytes::from(self.packed.clone()),
            unit.pts,
            self.target_width,
            self.target_height,
        )
        .with_sequence(unit.sequence)
        .with_keyframe(unit.is_keyframe);
        out.dts = unit.dts;
        out.duration = unit.duration;
        Ok(vec![out])
    }
}

/// Converts PCM to a different sample rate and/or channel count.
pub struct ResampleStage {
    target_rate: u32,
    target_channels: u16,
    resampler: Option<AudioResampler>,
    connected: Option<(u32, u16)>,
}

unsafe impl Send for ResampleStage {}

impl ResampleStage {
    pub fn new(target_rate: u32, target_channels: u16) -> Self {
        Self {
            target_rate,
            target_channels,
            resampler: None,
            connected: None,
        }
    }

    fn layout(count: u16) -> Result<ChannelLayout> {
        ChannelLayout::from_channels(count as u32)
            .ok_or_else(|| RelayError::Codec(format!("unsupported channel count {count}")))
    }
}

impl FilterStage for ResampleStage {
    fn name(&self) -> &'static str {
        "resample"
    }

    fn connect(&mut self, unit: &MediaUnit) -> Result<()> {
        let (Some(rate), Some(channels)) = (unit.sample_rate, unit.channels) else {
            return Err(RelayError::Precondition(
                "resample stage needs decoded audio".into(),
            ));
        };
        let resampler = AudioResampler::builder()
            .source_channel_layout(Self::layout(channels)?)
            .source_sample_format(get_sample_format("s16"))
            .source_sample_rate(rate)
            .target_channel_layout(Self::layout(self.target_channels)?)
            .target_sample_format(get_sample_format("s16"))
            .target_sample_rate(self.target_rate)
            .build()?;
        self.resampler = Some(resampler);
        self.connected = Some((rate, channels));
        Ok(())
    }

    fn process(&mut self, unit: MediaUnit) -> Result<Vec<MediaUnit>> {
        if unit.kind != StreamKind::Audio || !unit.is_frame() {
            return Ok(vec![unit]);
        }
        let (Some(rate), Some(channels)) = (unit.sample_rate, unit.channels) else {
            return Ok(vec![unit]);
        };
        if rate == self.target_rate && channels == self.target_channels {
            return Ok(vec![unit]);
        }
        if self.connected != Some((rate, channels)) {
            self.connect(&unit)?;
        }
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(vec![unit]);
        };

        let bytes_per_sample = channels as usize * 2;
        if bytes_per_sample == 0 || unit.data.len() % bytes_per_sample != 0 {
            return Ok(Vec::new());
        }
        let samples = unit.data.len() / bytes_per_sample;

        let mut frame = AudioFrameMut::silence(
            &Self::layout(channels)?,
            get_sample_format("s16"),
            rate,
            samples,
        );
        {
            let mut planes = frame.planes_mut();
            let dst = planes[0].data_mut();
            let len = unit.data.len().min(dst.len());
            dst[..len].copy_from_slice(&unit.data[..len]);
        }
        resampler.push(frame.freeze())?;

        let mut out = Vec::new();
        while let Some(converted) = resampler.take()? {
            let out_samples = converted.samples();
            let data = Bytes::copy_from_slice(converted.planes()[0].data());
            let mut produced =
                MediaUnit::audio_frame(data, unit.pts, self.target_rate, self.target_channels)
                    .with_sequence(unit.sequence);
            if self.target_rate > 0 {
                produced = produced.with_duration(std::time::Duration::from_micros(
                    (out_samples as u64 * 1_000_000) / self.target_rate as u64,
                ));
            }
            out.push(produced);
        }
        Ok(out)
    }
}

/// Burns a text label into the luma plane of decoded video.
///
/// `%T` expands to the wall-clock time and `%D` to the date at render
/// time, so recordings carry a visible clock without an encoder filter
/// graph.
pub struct OverlayStage {
    options: OverlayOptions,
}

impl OverlayStage {
    pub fn new(options: OverlayOptions) -> Self {
        Self { options }
    }

    fn expanded_text(&self) -> String {
        let now = chrono::Local::now();
        self.options
            .text
            .replace("%T", &now.format("%H:%M:%S").to_string())
            .replace("%D", &now.format("%Y-%m-%d").to_string())
    }
}

impl FilterStage for OverlayStage {
    fn name(&self) -> &'static str {
        "overlay"
    }

    fn connect(&mut self, _unit: &MediaUnit) -> Result<()> {
        Ok(())
    }

    fn process(&mut self, unit: MediaUnit) -> Result<Vec<MediaUnit>> {
        if unit.kind != StreamKind::Video || !unit.is_frame() {
            return Ok(vec![unit]);
        }
        let (Some(width), Some(height)) = (unit.width, unit.height) else {
            return Ok(vec![unit]);
        };

        let mut data = unit.data.to_vec();
        draw_label(
            &mut data[..(width as usize * height as usize).min(unit.data.len())],
            width as usize,
            &self.expanded_text(),
            &self.options,
        );

        let mut out = unit.clone();
        out.data = Bytes::from(data);
        Ok(vec![out])
    }
}

/// 5x7 bitmap glyphs, one row per byte, bit 4 is the leftmost column.
const GLYPH_WIDTH: usize = 5;
const GLYPH_HEIGHT: usize = 7;

fn glyph(c: char) -> Option<[u8; 7]> {
    let rows = match c.to_ascii_uppercase() {
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        'A' => [0x0E, 0x11, 0x11, 0x11, 0x1F, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1C, 0x12, 0x11, 0x11, 0x11, 0x12, 0x1C],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'J' => [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'Q' => [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'V' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
        'X' => [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
        'Y' => [0x11, 0x11, 0x11, 0x0A, 0x04, 0x04, 0x04],
        'Z' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        '-' => [0x00, 0x00, 0x00, 0x0E, 0x00, 0x00, 0x00],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        '/' => [0x01, 0x01, 0x02, 0x04, 0x08, 0x10, 0x10],
        '_' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1F],
        ' ' => [0x00; 7],
        _ => return None,
    };
    Some(rows)
}

/// Render `text` into a luma plane at the configured position. Pixel
/// blocks are scaled from the 7-row glyph grid to the requested font
/// size and alpha-blended toward white.
fn draw_label(luma: &mut [u8], width: usize, text: &str, options: &OverlayOptions) {
    if width == 0 || luma.is_empty() {
        return;
    }
    let height = luma.len() / width;
    let scale = ((options.font_size as usize) / GLYPH_HEIGHT).max(1);
    let opacity = options.opacity.clamp(0.0, 1.0);
    let cell = (GLYPH_WIDTH + 1) * scale;

    let mut pen_x = options.x as usize;
    let pen_y = options.y as usize;

    for c in text.chars() {
        let Some(rows) = glyph(c) else {
            pen_x += cell;
            continue;
        };
        for (row, bits) in rows.iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if bits & (1 << (GLYPH_WIDTH - 1 - col)) == 0 {
                    continue;
                }
                // One glyph dot covers a scale x scale block.
                for dy in 0..scale {
                    let y = pen_y + row * scale + dy;
                    if y >= height {
                        continue;
                    }
                    for dx in 0..scale {
                        let x = pen_x + col * scale + dx;
                        if x >= width {
                            continue;
                        }
                        let idx = y * width + x;
                        let old = luma[idx] as f32;
                        luma[idx] = (old + (255.0 - old) * opacity) as u8;
                    }
                }
            }
        }
        pen_x += cell;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::unit::Timestamp;

    fn black_frame(width: u32, height: u32) -> MediaUnit {
        let size = picture::packed_size(width as usize, height as usize);
        MediaUnit::video_frame(
            Bytes::from(vec![0u8; size]),
            Timestamp::from_millis(40),
            width,
            height,
        )
    }

    #[test]
    fn overlay_touches_only_the_luma_plane() {
        let mut stage = OverlayStage::new(OverlayOptions {
            text: "REC".into(),
            x: 2,
            y: 2,
            font_size: 7,
            opacity: 1.0,
        });
        let unit = black_frame(64, 32);
        let out = stage.process(unit.clone()).unwrap().remove(0);

        let luma_len = 64 * 32;
        assert_ne!(out.data[..luma_len], unit.data[..luma_len]);
        assert_eq!(out.data[luma_len..], unit.data[luma_len..]);
        assert!(out.data[..luma_len].iter().any(|&v| v == 255));
    }

    #[test]
    fn overlay_clips_at_frame_edges() {
        let mut stage = OverlayStage::new(OverlayOptions {
            text: "WWWWWWWWWWWW".into(),
            x: 50,
            y: 28,
            font_size: 14,
            opacity: 1.0,
        });
        // Must not panic on out-of-frame glyph cells.
        let out = stage.process(black_frame(64, 32)).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn overlay_passes_audio_through_untouched() {
        let mut stage = OverlayStage::new(OverlayOptions::default());
        let unit = MediaUnit::audio_frame(
            Bytes::from_static(&[1, 2, 3, 4]),
            Timestamp::ZERO,
            48_000,
            2,
        );
        let out = stage.process(unit.clone()).unwrap().remove(0);
        assert_eq!(out.data, unit.data);
    }

    #[test]
    fn scale_resizes_packed_frames() {
        let mut stage = ScaleStage::new(32, 16);
        let unit = black_frame(64, 32);
        stage.connect(&unit).unwrap();
        let out = stage.process(unit).unwrap().remove(0);
        assert_eq!(out.width, Some(32));
        assert_eq!(out.height, Some(16));
        assert_eq!(out.data.len(), picture::packed_size(32, 16));
        assert_eq!(out.pts.as_millis(), 40);
    }

    #[test]
    fn scale_passes_matching_geometry_through() {
        let mut stage = ScaleStage::new(64, 32);
        let unit = black_frame(64, 32);
        let out = stage.process(unit.clone()).unwrap().remove(0);
        // No scaler is ever built for a match.
        assert_eq!(out.data, unit.data);
    }

    #[test]
    fn resample_halves_the_sample_rate() {
        let mut stage = ResampleStage::new(24_000, 2);
        // 480 samples of stereo s16 silence at 48 kHz: 10 ms.
        let unit = MediaUnit::audio_frame(
            Bytes::from(vec![0u8; 480 * 2 * 2]),
            Timestamp::ZERO,
            48_000,
            2,
        );
        let out = stage.process(unit).unwrap();
        let samples: usize = out.iter().map(|u| u.data.len() / 4).sum();
        // Resamplers may withhold a few samples of priming latency.
        assert!(samples <= 240 && samples >= 180, "got {samples}");
        for unit in &out {
            assert_eq!(unit.sample_rate, Some(24_000));
        }
    }
}
