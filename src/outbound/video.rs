use super::{Outbound, SendResult, VIDEO_TIMEOUT};
use crate::error::MediaError;
use crate::gateway::api::{self, SendReceipt};
use crate::media::ScratchDir;
use tokio::fs;
use tracing::warn;

/// 视频发送失败时的兜底文本
pub fn fallback_text(url: &str) -> String {
    format!("🎬 视频分享：{}", url)
}

/// 下载视频、生成封面并通过 CDN 上传后转发；任何一步失败都改发链接文本
pub async fn send_video_url(out: &Outbound, to: &str, url: &str) -> SendResult {
    match upload_and_forward(out, to, url).await {
        Ok(receipt) => SendResult::sent(receipt),
        Err(e) => {
            warn!(target: "Outbound", "视频发送失败，改为发送链接: {}", e);
            out.send_text_to(to, &fallback_text(url), &[]).await
        }
    }
}

async fn upload_and_forward(out: &Outbound, to: &str, url: &str) -> Result<SendReceipt, MediaError> {
    let video = out.download(url, VIDEO_TIMEOUT).await?;
    let scratch = ScratchDir::new(&out.temp_dir, "video")?;
    let video_path = scratch.file("video.mp4");
    let thumb_path = scratch.file("thumb.jpg");
    fs::write(&video_path, &video).await?;

    out.transcoder.thumbnail(&video_path, &thumb_path).await?;
    let thumb = fs::read(&thumb_path).await?;
    let seconds = match out.transcoder.probe_duration(&video_path).await {
        Ok(d) => d.round() as i64,
        Err(e) => {
            warn!(target: "Outbound", "无法获取视频时长: {}", e);
            0
        }
    };

    let upload = api::upload_video(out.gateway.as_ref(), to, &video, &thumb, seconds, VIDEO_TIMEOUT).await?;
    Ok(api::forward_video(out.gateway.as_ref(), to, &upload, VIDEO_TIMEOUT).await?)
}
