//! Cue scheduling.
//!
//! Raw score events are turned into [`Cue`]s by [`CueScheduler::schedule_cue_set`]
//! and fired against a [`ClockSource`](crate::clock::ClockSource). Handlers are
//! looked up by name when a cue fires, so they can be bound after scheduling.

use std::{collections::HashMap, fmt, path::Path};

use serde::Serialize;
use serde_json::Value;

use crate::{clock::SharedClock, CueSyncError, Result};

/// Attributes carried by a score note besides its timing.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotePayload {
    pub duration_ticks: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub midi: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub velocity: Option<f32>,
}

/// A single timed event from the score.
///
/// Serializes in the score note format. Reading goes through
/// [`Event::from_value`] only, so every parsed event is validated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// Onset in seconds.
    pub time: f64,
    /// Integer timing unit used to detect simultaneous notes.
    #[serde(rename = "ticks")]
    pub quantized_tick: u64,
    #[serde(flatten)]
    pub payload: NotePayload,
}

impl Event {
    pub fn new(time: f64, quantized_tick: u64) -> Self {
        Self {
            time,
            quantized_tick,
            payload: NotePayload::default(),
        }
    }

    pub fn with_duration_ticks(mut self, duration_ticks: u64) -> Self {
        self.payload.duration_ticks = duration_ticks;
        self
    }

    /// Parses one event out of a loosely typed JSON object. Only the fields
    /// the scheduler depends on are strict.
    pub fn from_value(index: usize, value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| CueSyncError::malformed(index, "event is not an object"))?;

        let time = match object.get("time") {
            Some(Value::Number(number)) => number
                .as_f64()
                .ok_or_else(|| CueSyncError::malformed(index, "`time` is not representable"))?,
            Some(other) => {
                return Err(CueSyncError::malformed(
                    index,
                    format!("`time` must be numeric, got {other}"),
                ))
            }
            None => return Err(CueSyncError::malformed(index, "missing `time`")),
        };

        let tick = object
            .get("ticks")
            .or_else(|| object.get("quantizedTick"))
            .ok_or_else(|| CueSyncError::malformed(index, "missing `ticks`"))?;
        let quantized_tick = tick.as_u64().ok_or_else(|| {
            CueSyncError::malformed(
                index,
                format!("`ticks` must be a non-negative integer, got {tick}"),
            )
        })?;

        let duration_ticks = match object.get("durationTicks") {
            None | Some(Value::Null) => 0,
            Some(value) => value.as_u64().ok_or_else(|| {
                CueSyncError::malformed(index, format!("`durationTicks` is invalid: {value}"))
            })?,
        };

        let event = Self {
            time,
            quantized_tick,
            payload: NotePayload {
                duration_ticks,
                midi: object
                    .get("midi")
                    .and_then(Value::as_u64)
                    .and_then(|midi| u8::try_from(midi).ok()),
                velocity: object
                    .get("velocity")
                    .and_then(Value::as_f64)
                    .map(|velocity| velocity as f32),
            },
        };
        event.validate(index)?;
        Ok(event)
    }

    fn validate(&self, index: usize) -> Result<()> {
        if !self.time.is_finite() {
            return Err(CueSyncError::malformed(index, "`time` is not finite"));
        }
        if self.time < 0.0 {
            return Err(CueSyncError::malformed(
                index,
                format!("`time` must be >= 0, got {}", self.time),
            ));
        }
        Ok(())
    }
}

/// A deduplicated trigger derived from an [`Event`].
#[derive(Debug, Clone, PartialEq)]
pub struct Cue {
    /// Fire time in seconds.
    pub fire_time: f64,
    /// 1-based position within its cue set, gap-free.
    pub sequence_index: u32,
    /// Name of the handler resolved when the cue fires.
    pub handler: String,
    pub event: Event,
}

type Handler<S> = Box<dyn FnMut(&mut S, &Cue, &SharedClock) + Send>;

/// Named cue handlers operating on a scene of type `S`.
pub struct HandlerRegistry<S> {
    handlers: HashMap<String, Handler<S>>,
}

impl<S> HandlerRegistry<S> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Binds `name` to `handler`, replacing any previous binding.
    pub fn bind<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: FnMut(&mut S, &Cue, &SharedClock) + Send + 'static,
    {
        self.handlers.insert(name.into(), Box::new(handler));
    }

    pub fn unbind(&mut self, name: &str) -> bool {
        self.handlers.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Runs the handler bound to `cue.handler`.
    pub fn fire(&mut self, cue: &Cue, scene: &mut S, clock: &SharedClock) -> Result<()> {
        let handler =
            self.handlers
                .get_mut(&cue.handler)
                .ok_or_else(|| CueSyncError::MissingHandler {
                    name: cue.handler.clone(),
                    sequence_index: cue.sequence_index,
                })?;
        handler(scene, cue, clock);
        Ok(())
    }

    /// Fires every cue in order. Cues without a handler are logged and
    /// skipped. Returns how many handlers ran.
    pub fn fire_all(&mut self, cues: &[Cue], scene: &mut S, clock: &SharedClock) -> usize {
        let mut fired = 0;
        for cue in cues {
            match self.fire(cue, scene, clock) {
                Ok(()) => {
                    tracing::debug!(
                        handler = %cue.handler,
                        sequence = cue.sequence_index,
                        time = cue.fire_time,
                        "cue fired"
                    );
                    fired += 1;
                }
                Err(err) => tracing::warn!(%err, "skipping cue"),
            }
        }
        fired
    }
}

impl<S> Default for HandlerRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> fmt::Debug for HandlerRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &names)
            .finish()
    }
}

/// Ordered cues plus the position of the next one to fire.
#[derive(Debug, Clone, Default)]
pub struct CueCursor {
    cues: Vec<Cue>,
    next: usize,
}

impl CueCursor {
    /// Builds a cursor over `cues`, sorting them by fire time. Equal times
    /// keep their relative order.
    pub fn new(mut cues: Vec<Cue>) -> Self {
        cues.sort_by(|a, b| a.fire_time.total_cmp(&b.fire_time));
        Self { cues, next: 0 }
    }

    /// Returns every not-yet-consumed cue with `fire_time <= now_seconds` and
    /// marks them consumed.
    pub fn take_due(&mut self, now_seconds: f64) -> &[Cue] {
        let start = self.next;
        let end = start
            + self.cues[start..].partition_point(|cue| cue.fire_time <= now_seconds);
        self.next = end;
        &self.cues[start..end]
    }

    pub fn pending(&self) -> usize {
        self.cues.len() - self.next
    }

    pub fn len(&self) -> usize {
        self.cues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cues.is_empty()
    }

    pub fn rewind(&mut self) {
        self.next = 0;
    }

    pub fn cues(&self) -> &[Cue] {
        &self.cues
    }

    fn insert(&mut self, cue: Cue) {
        let index = self
            .cues
            .partition_point(|existing| existing.fire_time <= cue.fire_time);
        // A cue landing behind the play head waits for the next rewind.
        if index < self.next {
            self.next += 1;
        }
        self.cues.insert(index, cue);
    }
}

/// Converts score events into cues and fires them as the clock advances.
pub struct CueScheduler {
    clock: SharedClock,
    cursor: CueCursor,
}

impl CueScheduler {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            cursor: CueCursor::default(),
        }
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Registers one cue per distinct consecutive tick (or per event in
    /// `poly_mode`). The whole set is validated before anything is
    /// registered. Returns the number of cues added.
    pub fn schedule_cue_set(
        &mut self,
        events: &[Event],
        handler: &str,
        poly_mode: bool,
    ) -> Result<usize> {
        for (index, event) in events.iter().enumerate() {
            event.validate(index)?;
        }

        let cues = build_cues(events, handler, poly_mode);
        let added = cues.len();
        for cue in cues {
            self.cursor.insert(cue);
        }

        tracing::debug!(
            handler,
            poly_mode,
            events = events.len(),
            cues = added,
            "scheduled cue set"
        );
        Ok(added)
    }

    /// Parses loosely typed events and schedules them.
    pub fn schedule_values(
        &mut self,
        values: &[Value],
        handler: &str,
        poly_mode: bool,
    ) -> Result<usize> {
        let events = values
            .iter()
            .enumerate()
            .map(|(index, value)| Event::from_value(index, value))
            .collect::<Result<Vec<_>>>()?;
        self.schedule_cue_set(&events, handler, poly_mode)
    }

    /// Fires every cue the running clock has reached.
    pub fn dispatch<S>(&mut self, registry: &mut HandlerRegistry<S>, scene: &mut S) -> usize {
        if !self.clock.is_running() {
            return 0;
        }
        let now = self.clock.now_seconds();
        let due = self.cursor.take_due(now);
        registry.fire_all(due, scene, &self.clock)
    }

    /// All cues sorted by fire time, for offline replay.
    pub fn snapshot(&self) -> Vec<Cue> {
        self.cursor.cues().to_vec()
    }

    pub fn cues(&self) -> &[Cue] {
        self.cursor.cues()
    }

    pub fn pending(&self) -> usize {
        self.cursor.pending()
    }

    /// Makes every cue pending again.
    pub fn rewind(&mut self) {
        self.cursor.rewind();
    }
}

impl fmt::Debug for CueScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CueScheduler")
            .field("cues", &self.cursor.len())
            .field("pending", &self.cursor.pending())
            .finish()
    }
}

fn build_cues(events: &[Event], handler: &str, poly_mode: bool) -> Vec<Cue> {
    let mut last_tick: Option<u64> = None;
    let mut sequence_index = 1;
    let mut cues = Vec::new();

    for event in events {
        if poly_mode || last_tick != Some(event.quantized_tick) {
            cues.push(Cue {
                fire_time: event.time,
                sequence_index,
                handler: handler.to_string(),
                event: event.clone(),
            });
            last_tick = Some(event.quantized_tick);
            sequence_index += 1;
        }
    }

    cues
}

/// One named stream of events routed to a handler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreTrack {
    pub name: String,
    pub handler: String,
    pub poly: bool,
    #[serde(rename = "notes")]
    pub events: Vec<Event>,
}

/// A full score: several tracks, each scheduled as its own cue set.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Score {
    pub tracks: Vec<ScoreTrack>,
}

impl Score {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Parses a score of the form
    /// `{"tracks": [{"name", "handler", "poly", "notes": [...]}]}`.
    pub fn from_json(text: &str) -> Result<Self> {
        let root: Value = serde_json::from_str(text)?;
        let tracks = root
            .get("tracks")
            .and_then(Value::as_array)
            .ok_or_else(|| CueSyncError::Config("score has no `tracks` array".into()))?;

        let mut score = Score::default();
        for (track_index, track) in tracks.iter().enumerate() {
            let name = track
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("track{}", track_index + 1));
            let handler = track
                .get("handler")
                .and_then(Value::as_str)
                .ok_or_else(|| CueSyncError::Config(format!("track `{name}` has no handler")))?
                .to_string();
            let poly = track.get("poly").and_then(Value::as_bool).unwrap_or(false);
            let notes = track
                .get("notes")
                .and_then(Value::as_array)
                .ok_or_else(|| CueSyncError::Config(format!("track `{name}` has no notes")))?;

            let events = notes
                .iter()
                .enumerate()
                .map(|(index, note)| {
                    Event::from_value(index, note).map_err(|err| match err {
                        CueSyncError::MalformedEvent { index, reason } => {
                            CueSyncError::MalformedEvent {
                                index,
                                reason: format!("{reason} (track `{name}`)"),
                            }
                        }
                        other => other,
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            score.tracks.push(ScoreTrack {
                name,
                handler,
                poly,
                events,
            });
        }
        Ok(score)
    }

    /// Writes the score in the format [`Score::from_json`] reads.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Schedules every track. Returns the cue count per track in score order.
    pub fn schedule(&self, scheduler: &mut CueScheduler) -> Result<Vec<usize>> {
        self.tracks
            .iter()
            .map(|track| scheduler.schedule_cue_set(&track.events, &track.handler, track.poly))
            .collect()
    }

    /// Time of the last event across all tracks.
    pub fn end_time(&self) -> f64 {
        self.tracks
            .iter()
            .flat_map(|track| track.events.iter())
            .map(|event| event.time)
            .fold(0.0, f64::max)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;
    use crate::clock::VirtualClock;

    fn events(spec: &[(f64, u64)]) -> Vec<Event> {
        spec.iter()
            .map(|&(time, tick)| Event::new(time, tick))
            .collect()
    }

    fn scheduler() -> (Arc<VirtualClock>, CueScheduler) {
        let clock = Arc::new(VirtualClock::new());
        let scheduler = CueScheduler::new(clock.clone());
        (clock, scheduler)
    }

    #[derive(Default)]
    struct Log {
        fired: Vec<(String, u32, f64)>,
    }

    fn recording_registry(names: &[&str]) -> HandlerRegistry<Log> {
        let mut registry = HandlerRegistry::new();
        for name in names {
            let label = name.to_string();
            registry.bind(*name, move |log: &mut Log, cue: &Cue, _clock: &SharedClock| {
                log.fired
                    .push((label.clone(), cue.sequence_index, cue.fire_time));
            });
        }
        registry
    }

    #[test]
    fn drops_repeated_ticks() {
        let (_, mut scheduler) = scheduler();
        let added = scheduler
            .schedule_cue_set(&events(&[(0.0, 10), (0.1, 10), (0.2, 20)]), "main", false)
            .unwrap();

        assert_eq!(added, 2);
        let cues = scheduler.cues();
        assert_eq!(cues[0].fire_time, 0.0);
        assert_eq!(cues[0].sequence_index, 1);
        assert_eq!(cues[1].fire_time, 0.2);
        assert_eq!(cues[1].sequence_index, 2);
    }

    #[test]
    fn counts_consecutive_tick_runs() {
        let (_, mut scheduler) = scheduler();
        let input = events(&[
            (0.0, 0),
            (0.0, 0),
            (0.5, 480),
            (1.0, 960),
            (1.0, 960),
            (1.0, 960),
            (1.5, 0),
            (2.0, 1920),
        ]);
        scheduler.schedule_cue_set(&input, "main", false).unwrap();

        let indices: Vec<u32> = scheduler.cues().iter().map(|c| c.sequence_index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn poly_mode_keeps_every_event() {
        let (_, mut scheduler) = scheduler();
        let input = events(&[(0.0, 10), (0.0, 10), (0.3, 10)]);
        scheduler.schedule_cue_set(&input, "chord", true).unwrap();

        let cues = scheduler.cues();
        assert_eq!(cues.len(), 3);
        for (position, cue) in cues.iter().enumerate() {
            assert_eq!(cue.sequence_index, position as u32 + 1);
            assert_eq!(cue.event, input[position]);
        }
    }

    #[test]
    fn sequence_restarts_per_cue_set() {
        let (_, mut scheduler) = scheduler();
        scheduler
            .schedule_cue_set(&events(&[(0.0, 1), (1.0, 2)]), "a", false)
            .unwrap();
        scheduler
            .schedule_cue_set(&events(&[(0.5, 1), (1.5, 2)]), "b", false)
            .unwrap();

        let merged: Vec<(&str, u32)> = scheduler
            .cues()
            .iter()
            .map(|c| (c.handler.as_str(), c.sequence_index))
            .collect();
        assert_eq!(merged, vec![("a", 1), ("b", 1), ("a", 2), ("b", 2)]);
    }

    #[test]
    fn rejects_malformed_set_without_registering() {
        let (_, mut scheduler) = scheduler();
        let input = vec![Event::new(0.0, 0), Event::new(f64::NAN, 1)];
        let err = scheduler.schedule_cue_set(&input, "main", false).unwrap_err();

        assert!(matches!(err, CueSyncError::MalformedEvent { index: 1, .. }));
        assert!(scheduler.cues().is_empty());
    }

    #[test]
    fn rejects_non_numeric_fields() {
        let (_, mut scheduler) = scheduler();
        let values: Vec<Value> = serde_json::from_str(
            r#"[{"time": 0.0, "ticks": 0}, {"time": "soon", "ticks": 1}]"#,
        )
        .unwrap();
        let err = scheduler.schedule_values(&values, "main", false).unwrap_err();
        assert!(matches!(err, CueSyncError::MalformedEvent { index: 1, .. }));

        let values: Vec<Value> =
            serde_json::from_str(r#"[{"time": 0.0, "ticks": 1.5}]"#).unwrap();
        let err = scheduler.schedule_values(&values, "main", false).unwrap_err();
        assert!(matches!(err, CueSyncError::MalformedEvent { index: 0, .. }));
        assert!(scheduler.cues().is_empty());
    }

    #[test]
    fn fires_once_when_clock_passes() {
        let (clock, mut scheduler) = scheduler();
        scheduler
            .schedule_cue_set(&events(&[(0.0, 0), (0.25, 1), (0.5, 2)]), "main", false)
            .unwrap();
        let mut registry = recording_registry(&["main"]);
        let mut log = Log::default();

        assert_eq!(scheduler.dispatch(&mut registry, &mut log), 0, "clock stopped");

        clock.start();
        assert_eq!(scheduler.dispatch(&mut registry, &mut log), 1);
        assert_eq!(scheduler.dispatch(&mut registry, &mut log), 0);

        clock.set_seconds(0.6);
        assert_eq!(scheduler.dispatch(&mut registry, &mut log), 2);
        let times: Vec<f64> = log.fired.iter().map(|(_, _, time)| *time).collect();
        assert_eq!(times, vec![0.0, 0.25, 0.5]);
        assert_eq!(scheduler.pending(), 0);

        scheduler.rewind();
        assert_eq!(scheduler.pending(), 3);
    }

    #[test]
    fn missing_handler_skips_only_that_cue() {
        let (clock, mut scheduler) = scheduler();
        scheduler
            .schedule_cue_set(&events(&[(0.0, 0)]), "ghost", false)
            .unwrap();
        scheduler
            .schedule_cue_set(&events(&[(0.0, 0)]), "main", false)
            .unwrap();
        let mut registry = recording_registry(&["main"]);
        let mut log = Log::default();

        clock.start();
        assert_eq!(scheduler.dispatch(&mut registry, &mut log), 1);
        assert_eq!(log.fired.len(), 1);
        assert_eq!(log.fired[0].0, "main");
    }

    #[test]
    fn handlers_resolve_at_fire_time() {
        let (clock, mut scheduler) = scheduler();
        scheduler
            .schedule_cue_set(&events(&[(0.0, 0)]), "late", false)
            .unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let mut registry: HandlerRegistry<()> = HandlerRegistry::new();
        let counter = hits.clone();
        registry.bind("late", move |_: &mut (), _: &Cue, _: &SharedClock| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        clock.start();
        scheduler.dispatch(&mut registry, &mut ());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cursor_defers_cues_behind_play_head() {
        let (clock, mut scheduler) = scheduler();
        scheduler
            .schedule_cue_set(&events(&[(1.0, 0)]), "main", false)
            .unwrap();
        let mut registry = recording_registry(&["main"]);
        let mut log = Log::default();

        clock.start();
        clock.set_seconds(2.0);
        scheduler.dispatch(&mut registry, &mut log);
        scheduler
            .schedule_cue_set(&events(&[(0.5, 0)]), "main", false)
            .unwrap();
        assert_eq!(scheduler.dispatch(&mut registry, &mut log), 0);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn parses_score_tracks() {
        let score = Score::from_json(
            r#"{"tracks": [
                {"name": "lead", "handler": "main", "notes": [
                    {"time": 0.0, "ticks": 0, "durationTicks": 3840, "midi": 60},
                    {"time": 0.5, "ticks": 3840, "durationTicks": 3840, "velocity": 0.8}
                ]},
                {"handler": "sub", "poly": true, "notes": [
                    {"time": 0.25, "quantizedTick": 1920}
                ]}
            ]}"#,
        )
        .unwrap();

        assert_eq!(score.tracks.len(), 2);
        assert_eq!(score.tracks[0].events[0].payload.midi, Some(60));
        assert_eq!(score.tracks[0].events[1].payload.duration_ticks, 3840);
        assert_eq!(score.tracks[1].name, "track2");
        assert!(score.tracks[1].poly);
        assert_eq!(score.end_time(), 0.5);

        let (_, mut scheduler) = scheduler();
        assert_eq!(score.schedule(&mut scheduler).unwrap(), vec![2, 1]);
    }

    #[test]
    fn score_reports_malformed_note() {
        let err = Score::from_json(
            r#"{"tracks": [{"name": "lead", "handler": "main", "notes": [
                {"time": 0.0, "ticks": 0}, {"time": -1.0, "ticks": 1}
            ]}]}"#,
        )
        .unwrap_err();

        match err {
            CueSyncError::MalformedEvent { index, reason } => {
                assert_eq!(index, 1);
                assert!(reason.contains("lead"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn written_scores_read_back_through_the_validating_parser() {
        let score = Score {
            tracks: vec![ScoreTrack {
                name: "lead".into(),
                handler: "main".into(),
                poly: true,
                events: vec![
                    Event::new(0.0, 0).with_duration_ticks(3840),
                    Event::new(0.5, 3840),
                ],
            }],
        };
        let text = score.to_json().unwrap();
        assert!(text.contains("\"notes\""));
        assert!(text.contains("\"durationTicks\": 3840"));
        assert_eq!(Score::from_json(&text).unwrap(), score);

        let tampered = text.replace("\"time\": 0.5", "\"time\": -0.5");
        assert!(matches!(
            Score::from_json(&tampered),
            Err(CueSyncError::MalformedEvent { index: 1, .. })
        ));
    }
}
