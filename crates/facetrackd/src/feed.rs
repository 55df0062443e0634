//! Frame sources for the frame loop.
//!
//! The replay feed reads JSON Lines, one frame per line:
//!
//! ```json
//! {"image": "frames/0001.jpg", "processing_width": 640, "processing_height": 360,
//!  "at_ms": 100, "detections": [{"x": 10, "y": 20, "width": 40, "height": 40, "score": 0.9}]}
//! ```
//!
//! `image` is the full-resolution frame; relative paths resolve against the
//! feed file's directory. `at_ms` (optional) paces replay relative to the
//! first frame.

use facetrack_core::{BoundingBox, FrameInput};
use serde::Deserialize;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("feed I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("frame image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// A source of frames with their raw detections.
pub trait FrameFeed: Send {
    /// The next frame, or `None` when the source is exhausted.
    fn next_frame(&mut self) -> Option<Result<FrameInput, FeedError>>;
}

#[derive(Debug, Deserialize)]
struct FrameRecord {
    image: PathBuf,
    processing_width: u32,
    processing_height: u32,
    #[serde(default)]
    at_ms: Option<u64>,
    #[serde(default)]
    detections: Vec<BoundingBox>,
}

/// Replays recorded frames from a JSON Lines source.
pub struct ReplayFeed<R> {
    reader: R,
    base_dir: PathBuf,
    line: usize,
    started: Option<Instant>,
}

impl<R: BufRead + Send> ReplayFeed<R> {
    pub fn new(reader: R, base_dir: PathBuf) -> Self {
        Self { reader, base_dir, line: 0, started: None }
    }

    fn read_record(&mut self) -> Option<Result<FrameRecord, FeedError>> {
        let mut buf = String::new();
        loop {
            buf.clear();
            match self.reader.read_line(&mut buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
            self.line += 1;
            let trimmed = buf.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let line = self.line;
            return Some(
                serde_json::from_str(trimmed).map_err(|source| FeedError::Parse { line, source }),
            );
        }
    }

    fn pace(&mut self, at_ms: Option<u64>) {
        let started = *self.started.get_or_insert_with(Instant::now);
        if let Some(at) = at_ms {
            let due = started + Duration::from_millis(at);
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
        }
    }
}

impl<R: BufRead + Send> FrameFeed for ReplayFeed<R> {
    fn next_frame(&mut self) -> Option<Result<FrameInput, FeedError>> {
        let record = match self.read_record()? {
            Ok(record) => record,
            Err(e) => return Some(Err(e)),
        };
        self.pace(record.at_ms);

        let path = if record.image.is_absolute() {
            record.image
        } else {
            self.base_dir.join(record.image)
        };
        let image = match image::open(&path) {
            Ok(img) => img.to_rgb8(),
            Err(source) => return Some(Err(FeedError::Image { path, source })),
        };

        Some(Ok(FrameInput {
            captured_at: Instant::now(),
            image,
            processing_width: record.processing_width,
            processing_height: record.processing_height,
            detections: record.detections,
        }))
    }
}

/// Open the configured feed. `-` is stdin; `None` means no frame loop.
pub fn open(path: Option<&Path>) -> Result<Option<Box<dyn FrameFeed>>, FeedError> {
    let Some(path) = path else {
        return Ok(None);
    };
    if path == Path::new("-") {
        let cwd = std::env::current_dir()?;
        let stdin = BufReader::new(std::io::stdin());
        return Ok(Some(Box::new(ReplayFeed::new(stdin, cwd))));
    }

    let file = std::fs::File::open(path)?;
    let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    tracing::info!(path = %path.display(), "replay feed opened");
    Ok(Some(Box::new(ReplayFeed::new(BufReader::new(file), base_dir))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use std::io::Cursor;

    #[test]
    fn test_replay_reads_frames_and_resolves_images() {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::new(64, 36).save(dir.path().join("f1.png")).unwrap();

        let jsonl = "# recorded session\n\
            {\"image\": \"f1.png\", \"processing_width\": 32, \"processing_height\": 18, \
             \"detections\": [{\"x\": 1, \"y\": 2, \"width\": 10, \"height\": 12, \"score\": 0.8}]}\n\
            \n";
        let mut feed = ReplayFeed::new(Cursor::new(jsonl), dir.path().to_path_buf());

        let frame = feed.next_frame().unwrap().unwrap();
        assert_eq!(frame.image.dimensions(), (64, 36));
        assert_eq!(frame.processing_width, 32);
        assert_eq!(frame.detections.len(), 1);
        assert!((frame.detections[0].confidence - 0.8).abs() < 1e-6);
        assert!(feed.next_frame().is_none());
    }

    #[test]
    fn test_bad_line_reports_line_number() {
        let jsonl = "\n{\"image\": 5}\n";
        let mut feed = ReplayFeed::new(Cursor::new(jsonl), PathBuf::new());
        match feed.next_frame() {
            Some(Err(FeedError::Parse { line, .. })) => assert_eq!(line, 2),
            _ => panic!("expected a parse error"),
        }
    }

    #[test]
    fn test_missing_image() {
        let jsonl = "{\"image\": \"/nonexistent/f.png\", \"processing_width\": 1, \"processing_height\": 1}\n";
        let mut feed = ReplayFeed::new(Cursor::new(jsonl), PathBuf::new());
        assert!(matches!(feed.next_frame(), Some(Err(FeedError::Image { .. }))));
    }

    #[test]
    fn test_no_feed_configured() {
        assert!(open(None).unwrap().is_none());
    }
}
