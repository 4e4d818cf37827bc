use chrono::Local;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const GRAY: &str = "\x1b[90m";
const RESET: &str = "\x1b[0m";
const CYAN: &str = "\x1b[36m";

/// 统一日志格式
/// 格式: [Time] [LEVEL] [Target] Message
pub struct ConsoleFormat;

fn level_style(level: &Level) -> (&'static str, &'static str) {
    if *level == Level::ERROR {
        ("\x1b[31m", "ERRO")
    } else if *level == Level::WARN {
        ("\x1b[33m", "WARN")
    } else if *level == Level::INFO {
        ("\x1b[32m", "INFO")
    } else if *level == Level::DEBUG {
        ("\x1b[34m", "DEBG")
    } else {
        ("\x1b[35m", "TRAC")
    }
}

impl<S, N> FormatEvent<S, N> for ConsoleFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();
        let now = Local::now().format("%H:%M:%S");
        let (color, label) = level_style(meta.level());

        if writer.has_ansi_escapes() {
            write!(
                writer,
                "{GRAY}[{now}] {color}[{label}] {RESET}{CYAN}[{}]{RESET} ",
                meta.target()
            )?;
        } else {
            write!(writer, "[{now}] [{label}] [{}] ", meta.target())?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// 初始化日志系统
/// `RUST_LOG` 环境变量优先于配置文件中的 `log_level`
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{level},hyper=warn,hyper_util=warn,reqwest=warn,tungstenite=warn,tokio_tungstenite=warn"
        ))
    });

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(ConsoleFormat)
        .try_init();
}
