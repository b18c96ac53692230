use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use indicatif::{ProgressBar, ProgressStyle};
use prost::Message;

use crate::{config::LoggingConfig, metrics::StepSnapshot, TrainingError};

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
}

impl LoggingSettings {
    pub fn from_config(config: &LoggingConfig) -> Self {
        Self {
            enable_stdout: config.enable_stdout,
            tensorboard_dir: config.tensorboard.clone(),
            tensorboard_flush_every_n: config.tensorboard_flush_every_n.max(1),
        }
    }
}

/// Per-iteration view of the run, rendered on the status line and exported
/// as scalars.
#[derive(Debug, Clone, Copy)]
pub struct IterationReport<'a> {
    pub iteration: usize,
    pub resolution: usize,
    pub alpha: f64,
    pub learning_rate: f64,
    pub snapshot: &'a StepSnapshot,
}

pub struct Logger {
    settings: LoggingSettings,
    status: ProgressBar,
    tensorboard: Option<TensorBoardWriter>,
}

impl Logger {
    pub fn new(settings: LoggingSettings, total_iterations: usize) -> Result<Self, TrainingError> {
        let tensorboard = if let Some(dir) = settings.tensorboard_dir.as_ref() {
            Some(TensorBoardWriter::create(
                dir,
                settings.tensorboard_flush_every_n,
            )?)
        } else {
            None
        };

        let status = if settings.enable_stdout {
            let bar = ProgressBar::new(total_iterations as u64);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] {bar:30.cyan/blue} {pos}/{len} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=>-"),
            );
            bar
        } else {
            ProgressBar::hidden()
        };

        Ok(Self {
            settings,
            status,
            tensorboard,
        })
    }

    pub fn log_iteration(&mut self, report: &IterationReport<'_>) {
        let snapshot = report.snapshot;
        self.status.set_message(status_line(
            report.resolution,
            snapshot.generator_loss,
            snapshot.discriminator_loss,
            snapshot.penalty,
            report.alpha,
        ));
        self.status.set_position(report.iteration as u64 + 1);

        if let Some(writer) = self.tensorboard.as_mut() {
            let scalars = [
                ("train/d_loss", snapshot.discriminator_loss),
                ("train/g_loss", snapshot.generator_loss),
                ("train/grad_penalty", snapshot.penalty),
                ("train/alpha", report.alpha),
                ("train/resolution", report.resolution as f64),
                ("train/images_per_sec", snapshot.images_per_sec),
                ("train/learning_rate", report.learning_rate),
            ];
            if let Err(err) = writer.write_scalars(report.iteration as i64, &scalars) {
                self.status.println(format!("tensorboard disabled: {err}"));
                self.tensorboard = None;
            }
        }
    }

    /// Life-cycle message printed above the status line.
    pub fn info(&self, message: impl AsRef<str>) {
        if self.settings.enable_stdout {
            self.status.println(message.as_ref());
        }
    }

    pub fn finish(&mut self) {
        self.status.finish();
        self.flush();
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            let _ = writer.flush();
        }
    }
}

/// `Size: r; G: g; D: d; Grad: p; Alpha: a`
pub fn status_line(resolution: usize, g_loss: f64, d_loss: f64, penalty: f64, alpha: f64) -> String {
    format!(
        "Size: {}; G: {:.3}; D: {:.3}; Grad: {:.3}; Alpha: {:.5}",
        resolution, g_loss, d_loss, penalty, alpha
    )
}

/// TFRecord framing: little-endian length, masked CRC of the length, payload,
/// masked CRC of the payload.
struct RecordWriter<W: Write> {
    sink: W,
    unflushed: usize,
    flush_every: usize,
}

impl<W: Write> RecordWriter<W> {
    fn new(sink: W, flush_every: usize) -> Self {
        Self {
            sink,
            unflushed: 0,
            flush_every: flush_every.max(1),
        }
    }

    fn write_record(&mut self, payload: &[u8]) -> std::io::Result<()> {
        let header = (payload.len() as u64).to_le_bytes();
        self.sink.write_all(&header)?;
        self.sink.write_all(&masked_crc32(&header).to_le_bytes())?;
        self.sink.write_all(payload)?;
        self.sink.write_all(&masked_crc32(payload).to_le_bytes())?;

        self.unflushed += 1;
        if self.unflushed >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.unflushed = 0;
        self.sink.flush()
    }
}

/// Scalar summaries in the event-file layout TensorBoard reads.
struct TensorBoardWriter<W: Write = BufWriter<File>> {
    records: RecordWriter<W>,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<TensorBoardWriter, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let path = dir.join(format!("events.out.tfevents.{seconds}.{}", hostname()));
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        TensorBoardWriter::from_sink(BufWriter::new(file), flush_every)
    }
}

impl<W: Write> TensorBoardWriter<W> {
    /// Starts the stream with the file-version event readers expect first.
    fn from_sink(sink: W, flush_every: usize) -> Result<Self, TrainingError> {
        let mut writer = Self {
            records: RecordWriter::new(sink, flush_every),
        };
        writer.write_event(Event {
            wall_time: wall_time(),
            step: 0,
            file_version: Some("brain.Event:2".to_string()),
            summary: None,
        })?;
        Ok(writer)
    }

    fn write_scalars(&mut self, step: i64, scalars: &[(&str, f64)]) -> Result<(), TrainingError> {
        let value = scalars
            .iter()
            .map(|(tag, value)| summary::Value {
                tag: (*tag).to_string(),
                simple_value: Some(*value as f32),
            })
            .collect();
        self.write_event(Event {
            wall_time: wall_time(),
            step,
            file_version: None,
            summary: Some(Summary { value }),
        })
    }

    fn write_event(&mut self, event: Event) -> Result<(), TrainingError> {
        let mut payload = BytesMut::with_capacity(event.encoded_len());
        event.encode(&mut payload).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;
        self.records.write_record(&payload).map_err(|err| {
            TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
        })
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.records.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })
    }
}

impl<W: Write> Drop for TensorBoardWriter<W> {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let crc = crc32fast::hash(data);
    crc.rotate_right(15).wrapping_add(0xa282_ead8)
}

fn wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |elapsed| elapsed.as_secs_f64())
}

fn hostname() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .find_map(|key| std::env::var(key).ok())
        .unwrap_or_else(|| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(string, optional, tag = "3")]
    file_version: Option<String>,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_line_matches_console_format() {
        assert_eq!(
            status_line(16, -1.23456, 0.5, 2.0, 0.125),
            "Size: 16; G: -1.235; D: 0.500; Grad: 2.000; Alpha: 0.12500"
        );
    }

    #[test]
    fn records_carry_length_and_checksums() {
        let mut sink = Vec::new();
        RecordWriter::new(&mut sink, 1)
            .write_record(b"abc")
            .expect("record");

        assert_eq!(sink.len(), 8 + 4 + 3 + 4);
        assert_eq!(&sink[..8], &3u64.to_le_bytes());
        assert_eq!(&sink[8..12], &masked_crc32(&sink[..8]).to_le_bytes());
        assert_eq!(&sink[12..15], b"abc");
        assert_eq!(&sink[15..], &masked_crc32(b"abc").to_le_bytes());
    }

    #[test]
    fn event_stream_starts_with_file_version() {
        let mut sink = Vec::new();
        {
            let mut writer = TensorBoardWriter::from_sink(&mut sink, 4).expect("writer");
            writer
                .write_scalars(3, &[("train/d_loss", 0.25), ("train/alpha", 1.0)])
                .expect("scalars");
        }

        let mut events = Vec::new();
        let mut offset = 0;
        while offset < sink.len() {
            let len = u64::from_le_bytes(sink[offset..offset + 8].try_into().unwrap()) as usize;
            let payload = &sink[offset + 12..offset + 12 + len];
            events.push(Event::decode(payload).expect("event"));
            offset += 12 + len + 4;
        }

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].file_version.as_deref(), Some("brain.Event:2"));
        let summary = events[1].summary.as_ref().expect("summary");
        assert_eq!(events[1].step, 3);
        assert_eq!(summary.value.len(), 2);
        assert_eq!(summary.value[0].tag, "train/d_loss");
        assert_eq!(summary.value[0].simple_value, Some(0.25));
    }

    #[test]
    fn event_file_is_named_for_tensorboard() {
        let dir = tempfile::tempdir().expect("tempdir");
        drop(TensorBoardWriter::create(dir.path(), 1).expect("writer"));
        let name = fs::read_dir(dir.path())
            .expect("read dir")
            .next()
            .expect("event file")
            .expect("entry")
            .file_name();
        assert!(name.to_string_lossy().starts_with("events.out.tfevents."));
    }
}
