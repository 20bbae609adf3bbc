//! External transcoder invocations.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::utils::fs;
use crate::{Error, Result};

/// Number of stderr lines kept for error reports.
const STDERR_TAIL_LINES: usize = 20;

/// Transformations a pipeline asks of the media toolchain.
///
/// Every method must leave the named output file on disk or fail.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Extract mono 16 kHz low bitrate audio.
    async fn extract_audio(&self, input: &Path, output: &Path) -> Result<()>;

    /// Extract a single still frame.
    async fn extract_frame(&self, input: &Path, output: &Path) -> Result<()>;

    /// Re-encode `input`, burning in `subtitles` when given.
    async fn burn_subtitles(&self, input: &Path, subtitles: Option<&Path>, output: &Path)
    -> Result<()>;

    /// Start time of the container in seconds, zero when unknown.
    async fn probe_start_time(&self, input: &Path) -> Result<f64>;
}

/// Output of a finished command.
pub struct CommandOutput {
    pub status: std::process::ExitStatus,
    pub duration: f64,
    /// Last lines printed on stderr.
    pub stderr_tail: Vec<String>,
}

/// Run a command, streaming stderr into the debug log.
///
/// The child is killed when the returned future is dropped, so a cancelled
/// driver never leaves a transcoder running.
pub async fn run_command_with_logs(command: &mut Command) -> Result<CommandOutput> {
    let start = Instant::now();

    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| Error::transcode(format!("Failed to spawn command: {}", e)))?;

    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    if let Some(stderr) = child.stderr.take() {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("stderr: {}", line);
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| Error::transcode(format!("Failed to wait for command: {}", e)))?;

    Ok(CommandOutput {
        status,
        duration: start.elapsed().as_secs_f64(),
        stderr_tail: tail.into(),
    })
}

/// FFmpeg filter option escaping: backslash, colon and quote are special.
fn escape_filter_path(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace(':', "\\:")
        .replace('\'', "\\'")
}

/// Build the `subtitles` filter, aligned bottom center.
fn subtitles_filter(path: &Path) -> String {
    format!(
        "subtitles=filename='{}':force_style='Alignment=2,MarginV=20'",
        escape_filter_path(&path.to_string_lossy())
    )
}

fn audio_args(input: &Path, output: &Path) -> Vec<String> {
    vec![
        "-i".into(),
        input.to_string_lossy().into_owned(),
        "-vn".into(),
        "-acodec".into(),
        "aac".into(),
        "-ac".into(),
        "1".into(),
        "-ar".into(),
        "16000".into(),
        "-ab".into(),
        "30k".into(),
        "-y".into(),
        output.to_string_lossy().into_owned(),
    ]
}

fn frame_args(input: &Path, output: &Path) -> Vec<String> {
    vec![
        "-i".into(),
        input.to_string_lossy().into_owned(),
        "-frames:v".into(),
        "1".into(),
        "-q:v".into(),
        "10".into(),
        "-y".into(),
        output.to_string_lossy().into_owned(),
    ]
}

fn overlay_args(input: &Path, subtitles: Option<&Path>, output: &Path) -> Vec<String> {
    let mut args: Vec<String> = vec!["-i".into(), input.to_string_lossy().into_owned()];
    if let Some(srt) = subtitles {
        args.push("-vf".into());
        args.push(subtitles_filter(srt));
    }
    args.extend(
        [
            "-vcodec",
            "libx264",
            "-profile:v",
            "main",
            "-preset:v",
            "medium",
            "-tune",
            "zerolatency",
            // No B frames, the output is also played over WebRTC.
            "-bf",
            "0",
            "-acodec",
            "aac",
            // Keep source timestamps so subtitles stay aligned.
            "-copyts",
            "-y",
        ]
        .map(String::from),
    );
    args.push(output.to_string_lossy().into_owned());
    args
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    format: ProbeFormat,
}

#[derive(Debug, Default, Deserialize)]
struct ProbeFormat {
    #[serde(default)]
    start_time: Option<String>,
}

fn parse_start_time(stdout: &[u8]) -> Result<f64> {
    let probe: ProbeOutput = serde_json::from_slice(stdout)?;
    Ok(probe
        .format
        .start_time
        .and_then(|s| s.trim().parse::<f64>().ok())
        .unwrap_or(0.0))
}

/// [`Transcoder`] backed by the `ffmpeg` and `ffprobe` binaries.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    ffmpeg_path: String,
    ffprobe_path: String,
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self {
            ffmpeg_path: std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
            ffprobe_path: std::env::var("FFPROBE_PATH").unwrap_or_else(|_| "ffprobe".to_string()),
        }
    }
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg_path: impl Into<String>, ffprobe_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            ffprobe_path: ffprobe_path.into(),
        }
    }

    async fn run_ffmpeg(&self, args: Vec<String>, output: &Path) -> Result<()> {
        debug!("FFmpeg args: {:?}", args);

        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(&args).env("LC_ALL", "C");

        let command_output = run_command_with_logs(&mut cmd).await?;
        if !command_output.status.success() {
            warn!(
                status = %command_output.status,
                output = %output.display(),
                "FFmpeg failed"
            );
            return Err(Error::transcode(format!(
                "ffmpeg exited with {} for {}: {}",
                command_output.status,
                output.display(),
                command_output.stderr_tail.join("\n")
            )));
        }

        if !fs::file_exists(output).await {
            return Err(Error::transcode(format!(
                "ffmpeg produced no output at {}",
                output.display()
            )));
        }

        debug!(
            output = %output.display(),
            duration = command_output.duration,
            "FFmpeg finished"
        );
        Ok(())
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn extract_audio(&self, input: &Path, output: &Path) -> Result<()> {
        self.run_ffmpeg(audio_args(input, output), output).await
    }

    async fn extract_frame(&self, input: &Path, output: &Path) -> Result<()> {
        self.run_ffmpeg(frame_args(input, output), output).await
    }

    async fn burn_subtitles(
        &self,
        input: &Path,
        subtitles: Option<&Path>,
        output: &Path,
    ) -> Result<()> {
        self.run_ffmpeg(overlay_args(input, subtitles, output), output)
            .await
    }

    async fn probe_start_time(&self, input: &Path) -> Result<f64> {
        let output = Command::new(&self.ffprobe_path)
            .args(["-v", "quiet", "-print_format", "json", "-show_format"])
            .arg(input)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::transcode(format!("Failed to run ffprobe: {}", e)))?;

        if !output.status.success() {
            return Err(Error::transcode(format!(
                "ffprobe exited with {} for {}",
                output.status,
                input.display()
            )));
        }

        parse_start_time(&output.stdout)
    }
}
