use crate::config::VideoQuality;
use crate::error::EncoderError;
use crate::frame::Frame;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// External image-sequence to MP4 encoder.
///
/// The adapter receives complete JPEG frames in order and must fully consume
/// them before returning; the recording controller releases its frame
/// references only after `encode` resolves.
#[async_trait]
pub trait ClipEncoder: Send + Sync {
    async fn encode(
        &self,
        frames: &[Frame],
        output: &Path,
        fps: u32,
        quality: VideoQuality,
    ) -> Result<PathBuf, EncoderError>;
}

/// ffmpeg subprocess adapter: JPEGs are piped to stdin as an image2pipe
/// sequence.
pub struct FfmpegEncoder {
    binary: String,
    codec: String,
    preset: String,
}

impl FfmpegEncoder {
    pub fn new(codec: &str, preset: &str) -> Self {
        Self {
            binary: "ffmpeg".to_string(),
            codec: codec.to_string(),
            preset: preset.to_string(),
        }
    }

    pub fn with_binary(mut self, binary: &str) -> Self {
        self.binary = binary.to_string();
        self
    }
}

#[async_trait]
impl ClipEncoder for FfmpegEncoder {
    async fn encode(
        &self,
        frames: &[Frame],
        output: &Path,
        fps: u32,
        quality: VideoQuality,
    ) -> Result<PathBuf, EncoderError> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        debug!(
            "Encoding {} frames to {} ({} fps, crf {})",
            frames.len(),
            output.display(),
            fps,
            quality.crf()
        );

        let mut child = Command::new(&self.binary)
            .arg("-y")
            .arg("-f")
            .arg("image2pipe")
            .arg("-framerate")
            .arg(fps.to_string())
            .arg("-i")
            .arg("-")
            .arg("-c:v")
            .arg(&self.codec)
            .arg("-preset")
            .arg(&self.preset)
            .arg("-crf")
            .arg(quality.crf().to_string())
            .arg("-pix_fmt")
            .arg("yuv420p")
            .arg(output)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EncoderError::Spawn {
                binary: self.binary.clone(),
                source: e,
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| {
            EncoderError::Io(std::io::Error::other("encoder stdin unavailable"))
        })?;
        for frame in frames {
            stdin.write_all(frame.data()).await?;
        }
        stdin.shutdown().await?;
        drop(stdin);

        let result = child.wait_with_output().await?;
        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let tail: String = stderr
                .lines()
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n");
            return Err(EncoderError::Failed {
                status: result.status.code().unwrap_or(-1),
                stderr: tail,
            });
        }

        info!(
            "Encoded clip: {} ({} frames)",
            output.display(),
            frames.len()
        );
        Ok(output.to_path_buf())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_binary_is_a_spawn_error() {
        let encoder = FfmpegEncoder::new("libx264", "veryfast")
            .with_binary("definitely-not-a-real-encoder-binary");
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");

        let result = encoder
            .encode(&[], &output, 15, VideoQuality::Medium)
            .await;
        assert!(matches!(result, Err(EncoderError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_output_parent_directory_is_created() {
        let encoder = FfmpegEncoder::new("libx264", "veryfast")
            .with_binary("definitely-not-a-real-encoder-binary");
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("2026-08-01/out.mp4");

        // Spawn fails (no binary), but the day directory must exist by then
        let _ = encoder
            .encode(&[], &output, 15, VideoQuality::Medium)
            .await;
        assert!(output.parent().unwrap().is_dir());
    }

    #[test]
    fn test_quality_maps_to_crf() {
        assert_eq!(VideoQuality::Low.crf(), 30);
        assert_eq!(VideoQuality::Medium.crf(), 23);
        assert_eq!(VideoQuality::High.crf(), 18);
    }
}
