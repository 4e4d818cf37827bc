use crate::config::{SharedConfig, build_config};
use crate::event::Context;
use crate::message::excerpt;
use crate::plugins::{PluginError, get_config};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use toml::Value;
use tracing::{debug, info};

#[derive(Serialize, Deserialize)]
struct LoggerConfig {
    enabled: bool,
    #[serde(default)]
    debug: bool,
}

pub fn default_config() -> Value {
    build_config(LoggerConfig {
        enabled: true,
        debug: false,
    })
}

pub fn handle(
    ctx: Context,
    config: SharedConfig,
) -> BoxFuture<'static, Result<Option<Context>, PluginError>> {
    Box::pin(async move {
        let config: LoggerConfig = get_config(&config, "logger").unwrap_or(LoggerConfig {
            enabled: true,
            debug: false,
        });

        if config.debug {
            debug!(target: "Plugin", "ctx: {:?}", ctx);
        }

        let sender = ctx.sender_label();
        let content = format!("[{}] {}", ctx.kind, excerpt(&ctx.content, 200));
        if ctx.is_group {
            // 格式: 接收 <- 群聊 [GroupName(ID)] [Sender(ID)] Content
            info!(
                target: "Channel",
                "接收 <- 群聊 [{}({})] [{}] {}",
                ctx.group_name.as_deref().unwrap_or("未知群聊"),
                ctx.session_id,
                sender,
                content
            );
        } else {
            info!(target: "Channel", "接收 <- 私聊 [{}] {}", sender, content);
        }

        Ok(Some(ctx))
    })
}
