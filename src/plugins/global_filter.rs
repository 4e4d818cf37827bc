use crate::config::{SharedConfig, build_config};
use crate::event::Context;
use crate::plugins::PluginError;
use futures_util::future::BoxFuture;
use serde::Serialize;
use toml::Value;
use tracing::debug;

#[derive(Serialize)]
struct Config {
    enabled: bool,
}

pub fn default_config() -> Value {
    build_config(Config { enabled: true })
}

/// 名单匹配发送者 wxid 或会话 (群) ID
fn listed(list: &[String], ctx: &Context) -> bool {
    list.iter()
        .any(|id| id == &ctx.sender_id || id == &ctx.session_id)
}

pub fn handle(
    ctx: Context,
    config: SharedConfig,
) -> BoxFuture<'static, Result<Option<Context>, PluginError>> {
    Box::pin(async move {
        let blocked = {
            let guard = config.read();
            let f = &guard.global_filter;
            (f.enable_blacklist && listed(&f.blacklist, &ctx))
                || (f.enable_whitelist && !listed(&f.whitelist, &ctx))
        };

        if blocked {
            debug!(
                target: "Plugin",
                "[global_filter] 拦截 {} 在 {} 的消息",
                ctx.sender_id, ctx.session_id
            );
            return Ok(None);
        }
        Ok(Some(ctx))
    })
}
