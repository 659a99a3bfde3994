//! Logging setup: console subscriber plus an in-memory ring of recent lines
//! that backs `GET /api/logs`.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::Arc;

use clap::ValueEnum;
use parking_lot::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

/// Number of recent log lines kept for the API.
const LOG_RING_CAPACITY: usize = 2048;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// Shared ring of recently emitted log lines.
#[derive(Clone, Default)]
pub struct LogRing {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl LogRing {
    pub fn new() -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(LOG_RING_CAPACITY))),
        }
    }

    fn push(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() >= LOG_RING_CAPACITY {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Snapshot the buffered lines, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }
}

struct RingLayer {
    ring: LogRing,
}

impl<S: tracing::Subscriber> Layer<S> for RingLayer {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let meta = event.metadata();
        let line = format!(
            "[{}] {} {}: {}",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            meta.level(),
            meta.target(),
            visitor.out
        );
        self.ring.push(line);
    }
}

#[derive(Default)]
struct MessageVisitor {
    out: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.out, "{:?}", value);
        } else {
            if !self.out.is_empty() {
                self.out.push(' ');
            }
            let _ = write!(self.out, "{}={:?}", field.name(), value);
        }
    }
}

/// Initialize tracing with the CLI log level; `RUST_LOG` takes priority.
/// Returns the ring that collects lines for the logs endpoint.
pub fn init(level: LogLevel, verbose_count: u8) -> LogRing {
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "vibeshine=error,tower_http=error",
        LogLevel::Warn => "vibeshine=warn,tower_http=warn",
        LogLevel::Info => "vibeshine=info,tower_http=info",
        LogLevel::Debug => "vibeshine=debug,tower_http=debug",
        LogLevel::Trace => "vibeshine=trace,tower_http=debug",
    };

    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let ring = LogRing::new();
    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(RingLayer { ring: ring.clone() })
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }

    ring
}
