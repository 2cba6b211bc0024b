use std::io::Cursor;

use chrono::{DateTime, Utc};
use image::{imageops, ImageFormat, Rgba, RgbaImage};

use crate::{
    audio::SharedSampler,
    clock::SharedClock,
    config::BackgroundFill,
    scene::{Point, Scene, Shape},
    Result,
};

/// Everything the render step may read besides the scene.
#[derive(Clone)]
pub struct FrameContext {
    pub clock: SharedClock,
    pub sampler: SharedSampler,
    /// Virtual frame index while capturing, `None` during live playback.
    pub frame: Option<u64>,
}

impl FrameContext {
    pub fn new(clock: SharedClock, sampler: SharedSampler) -> Self {
        Self {
            clock,
            sampler,
            frame: None,
        }
    }
}

impl std::fmt::Debug for FrameContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameContext")
            .field("time_ms", &self.clock.now_ms())
            .field("sampler", &self.sampler.mode())
            .field("frame", &self.frame)
            .finish()
    }
}

/// Paints exactly one frame of scene `S`.
pub trait FrameRenderer<S> {
    fn render(&mut self, scene: &mut S, ctx: &FrameContext) -> Result<RgbaImage>;
}

impl<S, F> FrameRenderer<S> for F
where
    F: FnMut(&mut S, &FrameContext) -> Result<RgbaImage>,
{
    fn render(&mut self, scene: &mut S, ctx: &FrameContext) -> Result<RgbaImage> {
        self(scene, ctx)
    }
}

/// Encodes a frame as PNG.
pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}

/// `sketch_{ISO-8601 time}.png` with the colons swapped for dashes.
pub fn still_filename(at: DateTime<Utc>) -> String {
    format!("sketch_{}.png", at.format("%Y-%m-%dT%H-%M-%S%.3fZ"))
}

/// Paints `fill` behind `frame`, blending by the frame's alpha.
pub fn composite_background(frame: &RgbaImage, fill: &BackgroundFill) -> RgbaImage {
    let (width, height) = frame.dimensions();
    let mut out = RgbaImage::from_fn(width, height, |_, y| Rgba(fill.color_at(y, height)));
    imageops::overlay(&mut out, frame, 0, 0);
    out
}

/// Outline renderer for [`Scene`]: every visible element becomes a rotated
/// polygon outline, with an optional waveform trace along the bottom edge
/// and optional spectrum bars along the top.
#[derive(Debug, Clone)]
pub struct PreviewRenderer {
    width: u32,
    height: u32,
    transparent: bool,
    waveform_bins: Option<usize>,
    spectrum_bins: Option<usize>,
}

impl PreviewRenderer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            transparent: false,
            waveform_bins: None,
            spectrum_bins: None,
        }
    }

    /// Leaves the background transparent so a fill can be composited later.
    pub fn transparent(mut self, transparent: bool) -> Self {
        self.transparent = transparent;
        self
    }

    pub fn with_waveform(mut self, bins: usize) -> Self {
        self.waveform_bins = (bins > 0).then_some(bins);
        self
    }

    pub fn with_spectrum(mut self, bins: usize) -> Self {
        self.spectrum_bins = (bins > 0).then_some(bins);
        self
    }

    fn draw_shape(&self, canvas: &mut RgbaImage, shape: &Shape) {
        let visible = shape.visible_elements();
        let vertices = shape.kind.vertices();
        for element in &shape.elements[..visible.min(shape.elements.len())] {
            let radius = (shape.size() + element.size_step as f32) / 2.0;
            if radius <= 0.0 {
                continue;
            }
            let center = Point {
                x: shape.position.x,
                y: shape.position.y + 20.0,
            };
            let corners: Vec<Point> = (0..vertices)
                .map(|i| {
                    let angle = element.rotation
                        + i as f32 / vertices as f32 * std::f32::consts::TAU;
                    Point {
                        x: center.x + angle.cos() * radius,
                        y: center.y + angle.sin() * radius,
                    }
                })
                .collect();
            for i in 0..corners.len() {
                let next = corners[(i + 1) % corners.len()];
                draw_line(canvas, corners[i], next, Rgba(element.color));
            }
        }
    }

    fn draw_waveform(&self, canvas: &mut RgbaImage, samples: &[f32]) {
        if samples.len() < 2 {
            return;
        }
        let baseline = self.height as f32 * 0.9;
        let amplitude = self.height as f32 * 0.08;
        let step = self.width as f32 / (samples.len() - 1) as f32;
        let color = Rgba([255, 255, 255, 160]);
        for (i, pair) in samples.windows(2).enumerate() {
            let a = Point {
                x: i as f32 * step,
                y: baseline - pair[0].clamp(-1.0, 1.0) * amplitude,
            };
            let b = Point {
                x: (i + 1) as f32 * step,
                y: baseline - pair[1].clamp(-1.0, 1.0) * amplitude,
            };
            draw_line(canvas, a, b, color);
        }
    }

    /// One bar per bin hanging from the top edge, scaled to the loudest bin.
    fn draw_spectrum(&self, canvas: &mut RgbaImage, magnitudes: &[f32]) {
        let peak = magnitudes.iter().copied().fold(0.0_f32, f32::max);
        if magnitudes.is_empty() || peak <= 0.0 {
            return;
        }
        let depth = self.height as f32 * 0.15;
        let step = self.width as f32 / magnitudes.len() as f32;
        let color = Rgba([255, 255, 255, 96]);
        for (i, magnitude) in magnitudes.iter().enumerate() {
            let x = (i as f32 + 0.5) * step;
            let bottom = Point {
                x,
                y: magnitude / peak * depth,
            };
            draw_line(canvas, Point { x, y: 0.0 }, bottom, color);
        }
    }
}

impl FrameRenderer<Scene> for PreviewRenderer {
    fn render(&mut self, scene: &mut Scene, ctx: &FrameContext) -> Result<RgbaImage> {
        scene.update();

        let background = if self.transparent {
            Rgba([0, 0, 0, 0])
        } else {
            Rgba([0, 0, 0, 255])
        };
        let mut canvas = RgbaImage::from_pixel(self.width, self.height, background);

        for shape in scene.main_shapes() {
            self.draw_shape(&mut canvas, shape);
        }
        if scene.main_shapes().len() > 1 {
            dim(&mut canvas, 0.7);
        }
        for shape in scene.sub_shapes() {
            self.draw_shape(&mut canvas, shape);
        }

        if let Some(bins) = self.waveform_bins {
            let samples = ctx.sampler.waveform(bins);
            self.draw_waveform(&mut canvas, &samples);
        }
        if let Some(bins) = self.spectrum_bins {
            let magnitudes = ctx.sampler.spectrum(bins)?;
            self.draw_spectrum(&mut canvas, &magnitudes);
        }
        Ok(canvas)
    }
}

/// Fades the canvas towards black by `amount`.
fn dim(canvas: &mut RgbaImage, amount: f32) {
    let keep = 1.0 - amount.clamp(0.0, 1.0);
    for pixel in canvas.pixels_mut() {
        for channel in &mut pixel.0[..3] {
            *channel = (*channel as f32 * keep).round() as u8;
        }
        if pixel.0[3] > 0 {
            pixel.0[3] = pixel.0[3].max((255.0 * amount) as u8);
        }
    }
}

fn draw_line(canvas: &mut RgbaImage, from: Point, to: Point, color: Rgba<u8>) {
    let steps = (to.x - from.x).abs().max((to.y - from.y).abs()).ceil().max(1.0) as usize;
    for step in 0..=steps {
        let t = step as f32 / steps as f32;
        let x = from.x + (to.x - from.x) * t;
        let y = from.y + (to.y - from.y) * t;
        if x < 0.0 || y < 0.0 {
            continue;
        }
        let (x, y) = (x as u32, y as u32);
        if x < canvas.width() && y < canvas.height() {
            canvas.put_pixel(x, y, color);
        }
    }
}
