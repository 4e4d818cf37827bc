use super::{Outbound, SendResult, VOICE_TIMEOUT};
use crate::error::{GatewayError, MediaError};
use crate::gateway::api::{self, SendReceipt};
use crate::media::ScratchDir;
use crate::transcode::{MAX_VOICE_SECS, pcm_seconds, split_pcm};
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};

/// 发送 mp3 语音：转 PCM，按 60 秒切段，逐段编码 SILK 后依次发送
/// 临时文件在任何结果下都会被清理。
pub async fn send_voice(out: &Outbound, to: &str, path: &Path) -> SendResult {
    let is_mp3 = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("mp3"));
    if !is_mp3 {
        return SendResult::failed(MediaError::Unsupported(format!(
            "语音仅支持 mp3: {}",
            path.display()
        )));
    }

    let scratch = match ScratchDir::new(&out.temp_dir, "voice") {
        Ok(s) => s,
        Err(e) => return SendResult::failed(e),
    };
    match send_segments(out, to, path, &scratch).await {
        Ok(receipt) => SendResult::sent(receipt),
        Err(e) => SendResult::failed(e),
    }
}

async fn send_segments(
    out: &Outbound,
    to: &str,
    path: &Path,
    scratch: &ScratchDir,
) -> Result<SendReceipt, MediaError> {
    let pcm_path = scratch.file("full.pcm");
    out.transcoder.decode_pcm(path, &pcm_path).await?;
    let pcm = fs::read(&pcm_path).await?;

    let segments = split_pcm(&pcm, MAX_VOICE_SECS);
    if segments.is_empty() {
        return Err(MediaError::Transcode("语音解码结果为空".to_string()));
    }
    let total = segments.len();
    if total > 1 {
        info!(target: "Outbound", "语音分为 {} 段发送", total);
    }

    let mut last: Option<SendReceipt> = None;
    let mut failed = 0usize;
    for (i, segment) in segments.into_iter().enumerate() {
        let seg_pcm = scratch.file(&format!("seg_{}.pcm", i));
        let seg_silk = scratch.file(&format!("seg_{}.silk", i));
        fs::write(&seg_pcm, segment).await?;
        out.transcoder.encode_silk(&seg_pcm, &seg_silk).await?;
        let silk = fs::read(&seg_silk).await?;

        match api::send_voice(
            out.gateway.as_ref(),
            to,
            &silk,
            pcm_seconds(segment.len()),
            VOICE_TIMEOUT,
        )
        .await
        {
            Ok(receipt) => last = Some(receipt),
            Err(e) => {
                warn!(target: "Outbound", "语音第 {}/{} 段发送失败: {}", i + 1, total, e);
                failed += 1;
            }
        }

        if i + 1 < total {
            tokio::time::sleep(out.segment_gap).await;
        }
    }

    match (last, failed) {
        (Some(receipt), 0) => Ok(receipt),
        (_, n) => Err(MediaError::Gateway(GatewayError::Api {
            code: -1,
            message: format!("{}/{} 段语音发送失败", n, total),
        })),
    }
}
