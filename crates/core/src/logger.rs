use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{mpsc, Arc, Mutex, OnceLock};

use chrono::Local;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Environment variable holding the filter directive, e.g. `cadence_core=debug`.
pub const LOG_ENV: &str = "CADENCE_LOG";

// Color indices for TUI rendering (mapped in ui.rs)
pub const COLOR_GRAY: u8 = 1;
pub const COLOR_BLUE: u8 = 2;

type TuiSink = Arc<Mutex<Option<mpsc::Sender<String>>>>;

static TUI_SINK: OnceLock<TuiSink> = OnceLock::new();
static PREFIXES: OnceLock<Mutex<HashMap<String, u8>>> = OnceLock::new();

fn tui_sink() -> TuiSink {
    TUI_SINK.get_or_init(|| Arc::new(Mutex::new(None))).clone()
}

/// Install the global subscriber: env filter, `app.log` file layer and the
/// TUI channel layer. Clears the log file.
pub fn init(log_dir: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(log_dir)?;
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(log_dir.join("app.log"))?;

    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(FileLayer { file: Mutex::new(file) })
        .with(TuiLayer { sink: tui_sink() })
        .try_init()?;
    Ok(())
}

/// Wire the TUI log channel.
pub fn set_tui_sender(tx: mpsc::Sender<String>) {
    let sink = tui_sink();
    *sink.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
}

/// Register a color for a prefix. The prefix of an event is its explicit
/// `target:` or the last segment of its module path.
pub fn register_prefix(prefix: &str, color: u8) {
    let map = PREFIXES.get_or_init(|| Mutex::new(HashMap::new()));
    map.lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(prefix.to_string(), color);
}

fn prefix_color(prefix: &str) -> u8 {
    PREFIXES
        .get()
        .and_then(|m| m.lock().ok().and_then(|m| m.get(prefix).copied()))
        .unwrap_or(0)
}

fn prefix_of(target: &str) -> &str {
    target.rsplit("::").next().unwrap_or(target)
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

struct Line {
    level: String,
    prefix: String,
    text: String,
}

fn render(event: &Event<'_>) -> Line {
    let meta = event.metadata();
    let mut v = LineVisitor::default();
    event.record(&mut v);
    Line {
        level: meta.level().to_string(),
        prefix: prefix_of(meta.target()).to_string(),
        text: format!("{}{}", v.message, v.fields),
    }
}

struct FileLayer {
    file: Mutex<File>,
}

impl<S: Subscriber> Layer<S> for FileLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let line = render(event);
        let ts = Local::now().format("%H:%M:%S%.3f");
        if let Ok(mut f) = self.file.lock() {
            writeln!(f, "[{}] [{}] [{}] {}", ts, line.level, line.prefix, line.text).ok();
        }
    }
}

/// Forwards events to the TUI as `level\x1fprefix\x1fcolor\x1ftimestamp\x1fmessage`.
struct TuiLayer {
    sink: TuiSink,
}

impl<S: Subscriber> Layer<S> for TuiLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let Ok(guard) = self.sink.lock() else { return };
        let Some(tx) = guard.as_ref() else { return };
        let line = render(event);
        let ts = Local::now().format("%H:%M:%S");
        let color = prefix_color(&line.prefix);
        tx.send(format!("{}\x1f{}\x1f{}\x1f{}\x1f{}", line.level, line.prefix, color, ts, line.text))
            .ok();
    }
}
