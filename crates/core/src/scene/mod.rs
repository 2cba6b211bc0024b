//! Scene state driven by cue handlers.
//!
//! [`Scene`] owns every live shape and is only changed through its
//! transition functions ([`Scene::on_main_cue`], [`Scene::on_sub_cue`],
//! [`Scene::reset`], [`Scene::show_static`]). Renderers read it.

use std::f32::consts::{PI, TAU};
use std::fmt;

use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{
    clock::SharedClock,
    config::{SceneConfig, ScoreConfig},
    progress::{ProgressSample, ProgressTracker},
    timeline::{Cue, HandlerRegistry},
};

/// Handler name for the cue set that spawns the large shapes.
pub const MAIN_HANDLER: &str = "main";
/// Handler name for the cue set that spawns the small shapes.
pub const SUB_HANDLER: &str = "sub";

const LOOP_COUNT: usize = 6;
const CUES_PER_LOOP: u32 = 12;
const SUB_SHAPES_PER_LOOP: usize = 20;
const PALETTE_SIZE: usize = 8;
/// Mixed into the scene seed for the static still's random stream.
const STATIC_STREAM: u64 = 0x5354_4154_4943;

/// Scene types that can be put back into their initial state before a
/// replay.
pub trait Resettable {
    fn reset(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Canvas {
    pub width: f32,
    pub height: f32,
}

impl Canvas {
    pub fn is_portrait(&self) -> bool {
        self.height > self.width
    }

    pub fn center(&self) -> Point {
        Point {
            x: self.width / 2.0,
            y: self.height / 2.0,
        }
    }

    fn min_side(&self) -> f32 {
        self.width.min(self.height)
    }

    fn max_side(&self) -> f32 {
        self.width.max(self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pattern {
    Circle,
    Infinity,
    Grid,
    Spiral,
    Diamond,
    Pentagram,
    Flower,
}

impl Pattern {
    pub const ALL: [Pattern; 7] = [
        Pattern::Circle,
        Pattern::Infinity,
        Pattern::Grid,
        Pattern::Spiral,
        Pattern::Diamond,
        Pattern::Pentagram,
        Pattern::Flower,
    ];
}

/// Places the `index`-th small shape of a pattern.
pub trait SceneLayout: Send {
    fn position(&self, pattern: Pattern, index: usize, canvas: Canvas) -> Point;
}

/// Geometric layouts for the built-in patterns.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternLayout;

impl SceneLayout for PatternLayout {
    fn position(&self, pattern: Pattern, index: usize, canvas: Canvas) -> Point {
        let c = canvas.center();
        let on_circle = |angle: f32, rx: f32, ry: f32| Point {
            x: c.x + angle.cos() * rx,
            y: c.y + angle.sin() * ry,
        };
        let i = index as f32;

        match pattern {
            Pattern::Circle => {
                let radius = canvas.min_side() / 2.0;
                on_circle(i / 20.0 * TAU, radius, radius)
            }
            Pattern::Infinity => {
                let t = i / 20.0 * TAU;
                let r = canvas.min_side() / 1.5;
                let denom = 1.0 + t.sin() * t.sin();
                if canvas.is_portrait() {
                    Point {
                        x: c.x + r * t.sin() * t.cos() / denom,
                        y: c.y - r * t.cos() / denom,
                    }
                } else {
                    Point {
                        x: c.x + r * t.cos() / denom,
                        y: c.y + r * t.sin() * t.cos() / denom,
                    }
                }
            }
            Pattern::Grid => grid_position(index, canvas),
            Pattern::Spiral => {
                let radius = 50.0 + i.powf(1.2) * 12.0;
                on_circle(i * 0.5, radius, radius)
            }
            Pattern::Diamond => {
                let radius = canvas.min_side() / 1.5;
                on_circle(i / 20.0 * TAU, radius, radius * 0.6)
            }
            Pattern::Pentagram => {
                if index < 5 {
                    let radius = canvas.min_side() * 0.25;
                    on_circle(i / 5.0 * TAU - PI / 2.0, radius, radius)
                } else {
                    let radius = canvas.min_side() * 0.45;
                    on_circle((i - 5.0) / 15.0 * TAU, radius, radius)
                }
            }
            Pattern::Flower => {
                let radius = canvas.min_side() * 0.15;
                match index {
                    0 => c,
                    1..=6 => on_circle((i - 1.0) / 6.0 * TAU, radius, radius),
                    _ => on_circle((i - 7.0) / 13.0 * TAU, radius * 2.5, radius * 2.5),
                }
            }
        }
    }
}

/// Staggered 5/6/5/4 grid, laid out in rows (landscape) or columns
/// (portrait).
fn grid_position(index: usize, canvas: Canvas) -> Point {
    const LINES: [usize; 4] = [5, 6, 5, 4];
    let mut line = LINES.len() - 1;
    let mut slot = 0;
    let mut start = 0;
    for (candidate, count) in LINES.iter().enumerate() {
        if index < start + count {
            line = candidate;
            slot = index - start;
            break;
        }
        start += count;
    }

    let widest = 6.0;
    let stagger = |cell: f32| if line == 1 || line == 3 { -cell / 32.0 } else { 0.0 };
    if canvas.is_portrait() {
        let cell_w = canvas.width / LINES.len() as f32;
        let cell_h = canvas.height / widest;
        let start_y = (canvas.height - LINES[line] as f32 * cell_h) / 2.0;
        Point {
            x: line as f32 * cell_w + cell_w / 2.0,
            y: start_y + slot as f32 * cell_h + cell_h / 2.0 + stagger(cell_h),
        }
    } else {
        let cell_h = canvas.height / LINES.len() as f32;
        let cell_w = canvas.width / widest;
        let start_x = (canvas.width - LINES[line] as f32 * cell_w) / 2.0;
        Point {
            x: start_x + slot as f32 * cell_w + cell_w / 2.0 + stagger(cell_w),
            y: line as f32 * cell_h + cell_h / 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShapeKind {
    Ellipse,
    Triangle,
    Rect,
    Pentagon,
    Hexagon,
    Octagon,
}

impl ShapeKind {
    const ALL: [ShapeKind; 6] = [
        ShapeKind::Ellipse,
        ShapeKind::Triangle,
        ShapeKind::Rect,
        ShapeKind::Pentagon,
        ShapeKind::Hexagon,
        ShapeKind::Octagon,
    ];

    /// Vertex count used when outlining the shape.
    pub fn vertices(&self) -> usize {
        match self {
            ShapeKind::Ellipse => 32,
            ShapeKind::Triangle => 3,
            ShapeKind::Rect => 4,
            ShapeKind::Pentagon => 5,
            ShapeKind::Hexagon => 6,
            ShapeKind::Octagon => 8,
        }
    }
}

/// One outline stroke of a shape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawElement {
    /// Added to the shape size, 0..=4.
    pub size_step: u8,
    pub rotation: f32,
    pub color: [u8; 4],
}

/// A growing, progressively drawn shape.
#[derive(Debug, Clone)]
pub struct Shape {
    pub kind: ShapeKind,
    pub position: Point,
    pub min_size: f32,
    pub max_size: f32,
    pub stroke_weight: f32,
    pub elements: Vec<DrawElement>,
    size: f32,
    progress: ProgressTracker,
}

impl Shape {
    fn new<R: Rng>(
        rng: &mut R,
        palette: &[[u8; 4]],
        clock: SharedClock,
        position: Point,
        min_size: f32,
        max_size: f32,
        stroke_weight: f32,
    ) -> Self {
        let kind = ShapeKind::ALL[rng.random_range(0..ShapeKind::ALL.len())];
        let rotations = rng.random_range(6.0_f32..36.0) as usize;
        let pick = |rng: &mut R| palette[rng.random_range(0..palette.len())];
        let fixed = rng.random_bool(0.8).then(|| pick(rng));

        let mut elements = Vec::with_capacity(rotations * 2 * 5);
        for _ in 0..rotations * 2 {
            for size_step in 0..=4u8 {
                elements.push(DrawElement {
                    size_step,
                    rotation: rng.random_range(-PI..PI),
                    color: fixed.unwrap_or_else(|| pick(rng)),
                });
            }
        }
        elements.shuffle(rng);

        Self {
            kind,
            position,
            min_size,
            max_size,
            stroke_weight,
            elements,
            size: min_size,
            progress: ProgressTracker::new(clock),
        }
    }

    /// Starts the growth and draw channels.
    pub fn start(&mut self, growth_seconds: f64, draw_seconds: f64) {
        self.progress.start_growth(growth_seconds);
        self.progress.start_draw(draw_seconds);
    }

    /// Samples progress and recomputes the size.
    pub fn update(&mut self) -> ProgressSample {
        let sample = self.progress.sample();
        self.size = lerp(self.min_size, self.max_size, sample.growth as f32);
        sample
    }

    pub fn size(&self) -> f32 {
        self.size
    }

    pub fn progress(&self) -> ProgressSample {
        self.progress.current()
    }

    /// Number of elements visible at the current draw progress.
    pub fn visible_elements(&self) -> usize {
        (self.elements.len() as f64 * self.progress.current().draw).floor() as usize
    }

    fn finish(&mut self, size: f32) {
        self.min_size = size;
        self.max_size = size;
        self.size = size;
        self.progress.complete_growth();
        self.progress.complete_draw();
    }
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Small-shape slot of a loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Slot {
    pub position: Point,
    pub size: f32,
}

/// Pre-computed layout for one 12-cue loop.
#[derive(Debug, Clone)]
pub struct LoopPlan {
    pub pattern: Pattern,
    pub slots: Vec<Slot>,
    pub regular_min: f32,
    pub regular_max: f32,
    pub regular_positions: Vec<Point>,
    pub large_max_sizes: Vec<f32>,
    pub large_positions: Vec<Point>,
}

/// Scene state for the two-track shape piece.
pub struct Scene {
    canvas: Canvas,
    timing: ScoreConfig,
    seed: u64,
    rng: StdRng,
    layout: Box<dyn SceneLayout>,
    palette: Vec<[u8; 4]>,
    loops: Vec<LoopPlan>,
    main_shapes: Vec<Shape>,
    sub_shapes: Vec<Shape>,
    sub_pattern: Pattern,
    sub_slots: Vec<Slot>,
}

impl Scene {
    pub fn new(config: &SceneConfig, timing: ScoreConfig) -> Self {
        Self::with_layout(config, timing, Box::new(PatternLayout))
    }

    pub fn with_layout(
        config: &SceneConfig,
        timing: ScoreConfig,
        layout: Box<dyn SceneLayout>,
    ) -> Self {
        let seed = match (config.seed, config.seed_phrase.as_deref()) {
            (Some(seed), _) => seed,
            (None, Some(phrase)) => hash_to_seed(phrase),
            (None, None) => rand::random(),
        };
        tracing::info!(seed, "scene seed");
        let mut scene = Self {
            canvas: Canvas {
                width: config.width as f32,
                height: config.height as f32,
            },
            timing,
            seed,
            rng: StdRng::seed_from_u64(seed),
            layout,
            palette: Vec::new(),
            loops: Vec::new(),
            main_shapes: Vec::new(),
            sub_shapes: Vec::new(),
            sub_pattern: Pattern::Circle,
            sub_slots: Vec::new(),
        };
        scene.setup();
        scene
    }

    /// Binds [`MAIN_HANDLER`] and [`SUB_HANDLER`] to the scene transitions.
    pub fn bind_handlers(registry: &mut HandlerRegistry<Scene>) {
        registry.bind(MAIN_HANDLER, |scene: &mut Scene, cue: &Cue, clock: &SharedClock| {
            scene.on_main_cue(cue, clock)
        });
        registry.bind(SUB_HANDLER, |scene: &mut Scene, cue: &Cue, clock: &SharedClock| {
            scene.on_sub_cue(cue, clock)
        });
    }

    fn setup(&mut self) {
        self.rng = StdRng::seed_from_u64(self.seed);
        self.palette = rainbow_palette(self.rng.random_range(0.0..360.0), PALETTE_SIZE);
        self.loops = self.plan_loops();
        self.main_shapes.clear();
        self.sub_shapes.clear();
        self.sub_slots.clear();
        self.sub_pattern = self.loops.first().map(|plan| plan.pattern).unwrap_or(Pattern::Circle);
    }

    fn plan_loops(&mut self) -> Vec<LoopPlan> {
        let mut patterns = Pattern::ALL.to_vec();
        patterns.shuffle(&mut self.rng);
        let canvas = self.canvas;

        patterns
            .into_iter()
            .take(LOOP_COUNT)
            .map(|pattern| {
                let mut size = canvas.min_side() * 0.08 * self.rng.random_range(0.85..1.15);
                if pattern == Pattern::Spiral {
                    size *= 0.5;
                }
                let mut slots: Vec<Slot> = (0..SUB_SHAPES_PER_LOOP)
                    .map(|index| Slot {
                        position: self.layout.position(pattern, index, canvas),
                        size,
                    })
                    .collect();
                if pattern != Pattern::Spiral {
                    slots.shuffle(&mut self.rng);
                }

                let regular_positions = (1..=8)
                    .map(|cue| {
                        let first_half = cue % 2 == 1;
                        if canvas.is_portrait() {
                            Point {
                                x: canvas.width / 2.0,
                                y: canvas.height * if first_half { 0.25 } else { 0.75 },
                            }
                        } else {
                            Point {
                                x: canvas.width * if first_half { 0.25 } else { 0.75 },
                                y: canvas.height / 2.0,
                            }
                        }
                    })
                    .collect();
                let large_max_sizes = (8..=11)
                    .map(|cue| canvas.max_side() * (2.0 - 0.1 * (cue - 1) as f32))
                    .collect();

                LoopPlan {
                    pattern,
                    slots,
                    regular_min: canvas.min_side() / 3.0 * 2.0 / 3.0,
                    regular_max: canvas.min_side() / 3.0 * 2.0,
                    regular_positions,
                    large_max_sizes,
                    large_positions: vec![canvas.center(); 4],
                }
            })
            .collect()
    }

    fn loop_for(&self, sequence_index: u32) -> &LoopPlan {
        let index = ((sequence_index.saturating_sub(1) / CUES_PER_LOOP) as usize) % self.loops.len();
        &self.loops[index]
    }

    /// Large-shape transition. Each loop spans 12 cues: the first eight
    /// replace the current shape with a regular one, the last four stack
    /// increasingly large shapes in the center.
    pub fn on_main_cue(&mut self, cue: &Cue, clock: &SharedClock) {
        let sequence = cue.sequence_index;
        let duration = self.timing.ticks_to_seconds(cue.event.payload.duration_ticks);

        if sequence % CUES_PER_LOOP == 1 {
            let (pattern, slots) = {
                let plan = self.loop_for(sequence);
                (plan.pattern, plan.slots.clone())
            };
            self.sub_pattern = pattern;
            self.sub_slots = slots;
            self.sub_shapes.clear();
        }

        let step = (sequence.saturating_sub(1) % CUES_PER_LOOP) as usize;
        let plan = self.loop_for(sequence);
        let (min_size, max_size, position) = if step >= 8 {
            (0.0, plan.large_max_sizes[step - 8], plan.large_positions[step - 8])
        } else {
            (plan.regular_min, plan.regular_max, plan.regular_positions[step])
        };
        if step <= 8 {
            self.main_shapes.clear();
        }

        let mut shape = Shape::new(
            &mut self.rng,
            &self.palette,
            clock.clone(),
            position,
            min_size,
            max_size,
            0.5,
        );
        shape.start(duration * self.timing.growth_share, duration);
        self.main_shapes.push(shape);
    }

    /// Small-shape transition: fills the next slot of the current loop.
    pub fn on_sub_cue(&mut self, cue: &Cue, clock: &SharedClock) {
        let duration = self.timing.ticks_to_seconds(cue.event.payload.duration_ticks);
        let index = self.sub_shapes.len();
        let position = if self.sub_slots.is_empty() {
            self.layout.position(self.sub_pattern, index, self.canvas)
        } else {
            self.sub_slots[index % self.sub_slots.len()].position
        };

        let size = self.rng.random_range(20.0..60.0);
        let mut shape = Shape::new(
            &mut self.rng,
            &self.palette,
            clock.clone(),
            position,
            size,
            size,
            0.1,
        );
        shape.start(duration * self.timing.growth_share, duration);
        self.sub_shapes.push(shape);
    }

    /// Replaces the shapes with a finished still of the final loop, shown
    /// before playback starts. Draws from its own random stream, so the
    /// shapes a later cue creates do not depend on whether the still was
    /// shown.
    pub fn show_static(&mut self, clock: &SharedClock) {
        let Some(plan) = self.loops.last().cloned() else {
            return;
        };
        self.main_shapes.clear();
        self.sub_shapes.clear();
        let mut rng = StdRng::seed_from_u64(self.seed ^ STATIC_STREAM);

        for (max_size, position) in plan.large_max_sizes.iter().zip(&plan.large_positions) {
            let mut shape = Shape::new(
                &mut rng,
                &self.palette,
                clock.clone(),
                *position,
                0.0,
                *max_size,
                0.5,
            );
            shape.finish(max_size * 0.8);
            self.main_shapes.push(shape);
        }
        for slot in &plan.slots {
            let mut shape = Shape::new(
                &mut rng,
                &self.palette,
                clock.clone(),
                slot.position,
                slot.size,
                slot.size,
                0.1,
            );
            shape.finish(slot.size);
            self.sub_shapes.push(shape);
        }
    }

    /// Samples every shape against its clock.
    pub fn update(&mut self) {
        for shape in self.main_shapes.iter_mut().chain(self.sub_shapes.iter_mut()) {
            shape.update();
        }
    }

    pub fn main_shapes(&self) -> &[Shape] {
        &self.main_shapes
    }

    pub fn sub_shapes(&self) -> &[Shape] {
        &self.sub_shapes
    }

    pub fn loops(&self) -> &[LoopPlan] {
        &self.loops
    }

    pub fn canvas(&self) -> Canvas {
        self.canvas
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl Resettable for Scene {
    /// Restores the state right after construction, including the random
    /// stream, so a replay draws the same shapes.
    fn reset(&mut self) {
        self.setup();
    }
}

impl fmt::Debug for Scene {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scene")
            .field("canvas", &self.canvas)
            .field("seed", &self.seed)
            .field("main_shapes", &self.main_shapes.len())
            .field("sub_shapes", &self.sub_shapes.len())
            .finish()
    }
}

/// Folds a seed phrase (an edition hash plus token id, say) into a seed.
///
/// 31-based string hash over UTF-16 code units with 32-bit wrapping, then the
/// absolute value. The same phrase always yields the same scene.
pub fn hash_to_seed(phrase: &str) -> u64 {
    let hash = phrase
        .encode_utf16()
        .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(unit as i32));
    u64::from(hash.unsigned_abs())
}

fn rainbow_palette(base_hue: f32, count: usize) -> Vec<[u8; 4]> {
    (0..count)
        .map(|i| hsv_to_rgba(base_hue + 360.0 / count as f32 * i as f32, 1.0, 1.0))
        .collect()
}

fn hsv_to_rgba(hue: f32, saturation: f32, value: f32) -> [u8; 4] {
    let h = hue.rem_euclid(360.0) / 60.0;
    let c = value * saturation;
    let x = c * (1.0 - (h % 2.0 - 1.0).abs());
    let (r, g, b) = match h as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    let m = value - c;
    let channel = |v: f32| ((v + m) * 255.0).round() as u8;
    [channel(r), channel(g), channel(b), 255]
}
