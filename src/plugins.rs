use crate::config::{AppConfig, SharedConfig};
use crate::event::Context;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use std::sync::OnceLock;
use toml::Value;
use tracing::{debug, info};

pub mod global_filter;
pub mod logger;

pub type PluginError = Box<dyn std::error::Error + Send + Sync>;

/// 分发前钩子：返回 `Some` 继续传递 (可修改上下文)，返回 `None` 终止本条消息
pub type PluginHandler =
    fn(Context, SharedConfig) -> BoxFuture<'static, Result<Option<Context>, PluginError>>;

pub struct Plugin {
    pub name: &'static str,
    pub description: &'static str,
    pub handler: PluginHandler,
    pub default_config: fn() -> Value,
}

static PLUGINS: OnceLock<Vec<Plugin>> = OnceLock::new();

/// 获取全局插件列表 (注册顺序即执行顺序)
pub fn get_plugins() -> &'static [Plugin] {
    PLUGINS.get_or_init(|| {
        vec![
            Plugin {
                name: "global_filter",
                description: "按 wxid 黑白名单拦截消息",
                handler: global_filter::handle,
                default_config: global_filter::default_config,
            },
            Plugin {
                name: "logger",
                description: "打印每条分发的消息",
                handler: logger::handle,
                default_config: logger::default_config,
            },
        ]
    })
}

/// 为缺失配置块的插件写入默认配置，返回是否有改动
pub fn register_defaults(cfg: &mut AppConfig) -> bool {
    let mut modified = false;
    for plugin in get_plugins() {
        if !cfg.plugins.contains_key(plugin.name) {
            info!(target: "Plugin", "+ 初始化插件配置: {}", plugin.name);
            cfg.plugins
                .insert(plugin.name.to_string(), (plugin.default_config)());
            modified = true;
        }
    }
    modified
}

/// 配置中启用的插件，保持注册顺序
pub fn enabled_plugins(cfg: &AppConfig) -> Vec<&'static Plugin> {
    get_plugins()
        .iter()
        .filter(|p| {
            cfg.plugins
                .get(p.name)
                .and_then(|v| v.get("enabled"))
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
        })
        .collect()
}

/// 依次执行插件链
pub async fn run_chain(
    plugins: &[&Plugin],
    mut ctx: Context,
    config: &SharedConfig,
) -> Result<Option<Context>, PluginError> {
    for plugin in plugins {
        match (plugin.handler)(ctx, config.clone()).await? {
            Some(next) => ctx = next,
            None => {
                debug!(target: "Plugin", "[{}] 终止了消息传递", plugin.name);
                return Ok(None);
            }
        }
    }
    Ok(Some(ctx))
}

pub fn get_config<T>(config: &SharedConfig, plugin_name: &str) -> Option<T>
where
    T: DeserializeOwned,
{
    let guard = config.read();
    guard
        .plugins
        .get(plugin_name)
        .and_then(|v| T::deserialize(v.clone()).ok())
}
