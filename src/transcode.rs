//! 媒体转码：外部 ffmpeg / ffprobe / SILK 编码器

use crate::config::MediaConfig;
use crate::error::MediaError;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// 语音统一使用的采样率
pub const SAMPLE_RATE: u32 = 48_000;

/// 16 位单声道 PCM 每秒字节数
pub const PCM_BYTES_PER_SEC: usize = SAMPLE_RATE as usize * 2;

/// 单条语音的最大时长
pub const MAX_VOICE_SECS: usize = 60;

#[async_trait]
pub trait Transcoder: Send + Sync {
    /// 解码为 48kHz 单声道 16 位 PCM
    async fn decode_pcm(&self, input: &Path, output: &Path) -> Result<(), MediaError>;

    /// PCM 编码为 SILK
    async fn encode_silk(&self, pcm: &Path, output: &Path) -> Result<(), MediaError>;

    /// 媒体时长 (秒)
    async fn probe_duration(&self, input: &Path) -> Result<f64, MediaError>;

    /// 截取视频首帧作为封面 (JPEG)
    async fn thumbnail(&self, video: &Path, output: &Path) -> Result<(), MediaError>;
}

/// 按最大时长切分 PCM，切点对齐到采样
pub fn split_pcm(pcm: &[u8], max_secs: usize) -> Vec<&[u8]> {
    let chunk = (PCM_BYTES_PER_SEC * max_secs.max(1)) & !1;
    pcm.chunks(chunk).filter(|c| c.len() >= 2).collect()
}

/// PCM 片段时长 (秒)，向上取整且至少 1 秒
pub fn pcm_seconds(len: usize) -> u32 {
    len.div_ceil(PCM_BYTES_PER_SEC).max(1) as u32
}

/// 调用本机 ffmpeg 系列工具
pub struct FfmpegTranscoder {
    ffmpeg: String,
    ffprobe: String,
    silk_encoder: String,
}

impl FfmpegTranscoder {
    pub fn from_config(cfg: &MediaConfig) -> Self {
        Self {
            ffmpeg: cfg.ffmpeg_path.clone(),
            ffprobe: cfg.ffprobe_path.clone(),
            silk_encoder: cfg.silk_encoder_path.clone(),
        }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<Vec<u8>, MediaError> {
        debug!(target: "Media", "执行 {} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| MediaError::Transcode(format!("无法启动 {}: {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MediaError::Transcode(format!(
                "{} 退出码 {}: {}",
                program,
                output.status.code().unwrap_or(-1),
                crate::message::excerpt(stderr.trim(), 240)
            )));
        }
        Ok(output.stdout)
    }
}

fn path_arg(p: &Path) -> Result<&str, MediaError> {
    p.to_str()
        .ok_or_else(|| MediaError::Transcode(format!("路径不是有效 UTF-8: {}", p.display())))
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn decode_pcm(&self, input: &Path, output: &Path) -> Result<(), MediaError> {
        let rate = SAMPLE_RATE.to_string();
        self.run(
            &self.ffmpeg,
            &[
                "-y",
                "-i",
                path_arg(input)?,
                "-ar",
                &rate,
                "-ac",
                "1",
                "-f",
                "s16le",
                path_arg(output)?,
            ],
        )
        .await
        .map(|_| ())
    }

    async fn encode_silk(&self, pcm: &Path, output: &Path) -> Result<(), MediaError> {
        let rate = SAMPLE_RATE.to_string();
        self.run(
            &self.silk_encoder,
            &[
                path_arg(pcm)?,
                path_arg(output)?,
                "-Fs_API",
                &rate,
                "-tencent",
            ],
        )
        .await
        .map(|_| ())
    }

    async fn probe_duration(&self, input: &Path) -> Result<f64, MediaError> {
        let stdout = self
            .run(
                &self.ffprobe,
                &[
                    "-v",
                    "error",
                    "-show_entries",
                    "format=duration",
                    "-of",
                    "default=noprint_wrappers=1:nokey=1",
                    path_arg(input)?,
                ],
            )
            .await?;
        let text = String::from_utf8_lossy(&stdout);
        text.trim()
            .parse::<f64>()
            .map_err(|_| MediaError::Transcode(format!("无法解析时长: {}", text.trim())))
    }

    async fn thumbnail(&self, video: &Path, output: &Path) -> Result<(), MediaError> {
        self.run(
            &self.ffmpeg,
            &[
                "-y",
                "-i",
                path_arg(video)?,
                "-vframes",
                "1",
                "-f",
                "image2",
                path_arg(output)?,
            ],
        )
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_is_split_into_sixty_second_segments() {
        let pcm = vec![0u8; PCM_BYTES_PER_SEC * 130];
        let parts = split_pcm(&pcm, MAX_VOICE_SECS);
        assert_eq!(parts.len(), 3);
        assert_eq!(pcm_seconds(parts[0].len()), 60);
        assert_eq!(pcm_seconds(parts[2].len()), 10);
        assert!(split_pcm(&[0u8], MAX_VOICE_SECS).is_empty());
    }

    #[test]
    fn short_segments_count_as_one_second() {
        assert_eq!(pcm_seconds(10), 1);
        assert_eq!(pcm_seconds(PCM_BYTES_PER_SEC + 1), 2);
    }

    #[tokio::test]
    async fn missing_binary_is_a_transcode_error() {
        let t = FfmpegTranscoder::from_config(&MediaConfig {
            ffprobe_path: "/nonexistent/ffprobe".to_string(),
            ..Default::default()
        });
        let err = t.probe_duration(Path::new("a.mp4")).await.unwrap_err();
        assert!(matches!(err, MediaError::Transcode(_)));
    }
}
