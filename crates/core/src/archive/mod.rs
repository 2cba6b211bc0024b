//! Frame buffering and archive parts.
//!
//! Captured frames accumulate in a [`FrameBuffer`] until the chunk size is
//! reached, then go out as one zip part through a [`PartSink`]. The first
//! part of a run also carries `ffmpeg_command.txt`.

use std::{
    fmt,
    io::{Cursor, Write},
    path::{Path, PathBuf},
};

use zip::{write::FileOptions, CompressionMethod, ZipWriter};

use crate::{config::DEFAULT_CHUNK_SIZE, CueSyncError, Result};

/// Name of the encoding recipe stored in the first part.
pub const RECIPE_FILE: &str = "ffmpeg_command.txt";

/// One encoded frame waiting to be archived.
#[derive(Clone, PartialEq, Eq)]
pub struct FrameRecord {
    pub frame_number: u64,
    pub image_data: Vec<u8>,
    pub filename: String,
}

impl FrameRecord {
    pub fn new(prefix: &str, frame_number: u64, image_data: Vec<u8>) -> Self {
        Self {
            frame_number,
            image_data,
            filename: frame_filename(prefix, frame_number),
        }
    }
}

impl fmt::Debug for FrameRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameRecord")
            .field("frame_number", &self.frame_number)
            .field("filename", &self.filename)
            .field("bytes", &self.image_data.len())
            .finish()
    }
}

/// `{prefix}_{frame:05}.png`
pub fn frame_filename(prefix: &str, frame_number: u64) -> String {
    format!("{prefix}_{frame_number:05}.png")
}

/// `{prefix}_frames_part{part}_{timestamp}.zip`
pub fn archive_filename(prefix: &str, part_number: u32, timestamp: i64) -> String {
    format!("{prefix}_frames_part{part_number}_{timestamp}.zip")
}

/// Command lines that turn the frame sequence into ProRes movies.
pub fn encoding_recipe(prefix: &str, frame_rate: u32) -> String {
    [
        "# ProRes 422 HQ (10-bit, Resolve-friendly)".to_string(),
        format!(
            "ffmpeg -framerate {frame_rate} -i {prefix}_%05d.png -c:v prores_ks -profile:v 3 -pix_fmt yuv422p10le {prefix}_prores422hq.mov"
        ),
        String::new(),
        "# ProRes 4444 (10-bit + alpha)".to_string(),
        format!(
            "ffmpeg -framerate {frame_rate} -i {prefix}_%05d.png -c:v prores_ks -profile:v 4 -pix_fmt yuva444p10le {prefix}_prores4444.mov"
        ),
    ]
    .join("\n")
}

/// Metadata of an archive part that has been handed to the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivePart {
    pub part_number: u32,
    pub file_name: String,
    /// Frame numbers in archive order.
    pub frames: Vec<u64>,
    pub timestamp: i64,
    pub has_recipe: bool,
}

/// Destination for finished archive parts.
pub trait PartSink {
    fn store(&mut self, file_name: &str, bytes: Vec<u8>) -> Result<()>;
}

/// Writes each part as a file inside a directory.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl PartSink for DirectorySink {
    fn store(&mut self, file_name: &str, bytes: Vec<u8>) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(file_name);
        std::fs::write(&path, bytes)?;
        tracing::info!(path = %path.display(), "wrote archive part");
        Ok(())
    }
}

/// Keeps finished parts in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    pub parts: Vec<(String, Vec<u8>)>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PartSink for MemorySink {
    fn store(&mut self, file_name: &str, bytes: Vec<u8>) -> Result<()> {
        self.parts.push((file_name.to_string(), bytes));
        Ok(())
    }
}

/// Accumulates frames and flushes them into numbered archive parts.
pub struct FrameBuffer<K> {
    prefix: String,
    frame_rate: u32,
    chunk_size: usize,
    timestamp: i64,
    next_part: u32,
    frames: Vec<FrameRecord>,
    parts: Vec<ArchivePart>,
    sink: K,
}

impl<K: PartSink> FrameBuffer<K> {
    pub fn new(prefix: impl Into<String>, frame_rate: u32, sink: K) -> Self {
        Self {
            prefix: prefix.into(),
            frame_rate,
            chunk_size: DEFAULT_CHUNK_SIZE,
            timestamp: 0,
            next_part: 1,
            frames: Vec::new(),
            parts: Vec::new(),
            sink,
        }
    }

    /// Overrides the automatic flush threshold. Zero is treated as one.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Starts a new run: part numbering restarts at 1 and buffered frames
    /// are dropped.
    pub fn begin_run(&mut self, timestamp: i64) {
        self.timestamp = timestamp;
        self.next_part = 1;
        self.frames.clear();
        self.parts.clear();
    }

    /// Buffers `frame`, flushing a part once the chunk size is reached.
    pub fn push(&mut self, frame: FrameRecord) -> Result<Option<ArchivePart>> {
        self.frames.push(frame);
        if self.frames.len() >= self.chunk_size {
            return self.flush();
        }
        Ok(None)
    }

    /// Archives every buffered frame as the next part and clears the buffer.
    /// Does nothing when the buffer is empty. On failure the frames stay
    /// buffered.
    pub fn flush(&mut self) -> Result<Option<ArchivePart>> {
        if self.frames.is_empty() {
            return Ok(None);
        }
        let frames = std::mem::take(&mut self.frames);
        match self.write_part(&frames) {
            Ok(part) => Ok(Some(part)),
            Err(err) => {
                self.frames = frames;
                Err(err)
            }
        }
    }

    /// Archives `frames` as the next part without touching the buffer.
    pub fn flush_frames(&mut self, frames: &[FrameRecord]) -> Result<Option<ArchivePart>> {
        if frames.is_empty() {
            return Ok(None);
        }
        self.write_part(frames).map(Some)
    }

    /// Drops buffered frames, returning how many were discarded.
    pub fn discard(&mut self) -> usize {
        let dropped = self.frames.len();
        self.frames.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Parts written since the last [`FrameBuffer::begin_run`].
    pub fn parts(&self) -> &[ArchivePart] {
        &self.parts
    }

    pub fn next_part(&self) -> u32 {
        self.next_part
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut K {
        &mut self.sink
    }

    pub fn into_sink(self) -> K {
        self.sink
    }

    fn write_part(&mut self, frames: &[FrameRecord]) -> Result<ArchivePart> {
        let part_number = self.next_part;
        let include_recipe = part_number == 1;

        let mut sorted: Vec<&FrameRecord> = frames.iter().collect();
        sorted.sort_by_key(|frame| frame.frame_number);
        if let Some(pair) = sorted
            .windows(2)
            .find(|pair| pair[0].frame_number == pair[1].frame_number)
        {
            return Err(CueSyncError::Encoding(format!(
                "frame {} buffered twice",
                pair[0].frame_number
            )));
        }

        tracing::info!(
            part = part_number,
            frames = sorted.len(),
            "creating archive part"
        );
        let bytes = build_archive(&sorted, include_recipe.then(|| {
            encoding_recipe(&self.prefix, self.frame_rate)
        }))?;

        let file_name = archive_filename(&self.prefix, part_number, self.timestamp);
        self.sink.store(&file_name, bytes)?;

        let part = ArchivePart {
            part_number,
            file_name,
            frames: sorted.iter().map(|frame| frame.frame_number).collect(),
            timestamp: self.timestamp,
            has_recipe: include_recipe,
        };
        self.parts.push(part.clone());
        self.next_part += 1;
        Ok(part)
    }
}

impl<K> fmt::Debug for FrameBuffer<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("prefix", &self.prefix)
            .field("buffered", &self.frames.len())
            .field("chunk_size", &self.chunk_size)
            .field("next_part", &self.next_part)
            .finish()
    }
}

fn build_archive(frames: &[&FrameRecord], recipe: Option<String>) -> Result<Vec<u8>> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    // PNG data is already compressed.
    let stored = FileOptions::default().compression_method(CompressionMethod::Stored);

    for (added, frame) in frames.iter().enumerate() {
        zip.start_file(frame.filename.as_str(), stored)?;
        zip.write_all(&frame.image_data)
            .map_err(|e| CueSyncError::Encoding(e.to_string()))?;
        if (added + 1) % 100 == 0 {
            tracing::debug!(added = added + 1, total = frames.len(), "adding frames");
        }
    }

    if let Some(recipe) = recipe {
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
        zip.start_file(RECIPE_FILE, options)?;
        zip.write_all(recipe.as_bytes())
            .map_err(|e| CueSyncError::Encoding(e.to_string()))?;
    }

    Ok(zip.finish()?.into_inner())
}
