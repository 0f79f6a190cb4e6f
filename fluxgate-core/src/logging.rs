use crate::error::Error;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Once};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static INIT: Once = Once::new();

/// Global buffer of recent log lines, pulled by UI shells that have no
/// console attached.
static LOG_BUFFER: once_cell::sync::Lazy<Arc<Mutex<LogBuffer>>> =
    once_cell::sync::Lazy::new(|| Arc::new(Mutex::new(LogBuffer::new(2000))));

pub struct LogBuffer {
    lines: VecDeque<String>,
    max_size: usize,
}

impl LogBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(max_size),
            max_size,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() >= self.max_size {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn tail(&self, count: usize) -> Vec<String> {
        if count == 0 || count >= self.lines.len() {
            return self.lines.iter().cloned().collect();
        }
        let start = self.lines.len() - count;
        self.lines.iter().skip(start).cloned().collect()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

/// Get the most recent `count` buffered log lines (0 = all).
pub fn get_recent_logs(count: usize) -> Vec<String> {
    match LOG_BUFFER.lock() {
        Ok(buffer) => buffer.tail(count),
        Err(_) => vec![],
    }
}

pub fn clear_logs() {
    if let Ok(mut buffer) = LOG_BUFFER.lock() {
        buffer.clear();
    }
}

fn add_log(line: String) {
    if let Ok(mut buffer) = LOG_BUFFER.lock() {
        buffer.push(line);
    }
}

/// Initialize the tracing stack: console output plus the in-memory buffer.
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,fluxgate_core=debug,fluxgate_dns=debug,fluxgate_lib=debug")
        });

        let fmt_layer = fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .compact()
            .with_filter(filter);

        let result = tracing_subscriber::registry()
            .with(fmt_layer)
            .with(BufferLayer)
            .try_init();

        if result.is_ok() {
            tracing::info!("logging initialized");
        }
    });
}

/// Layer that mirrors events into the log buffer.
struct BufferLayer;

impl<S> tracing_subscriber::Layer<S> for BufferLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let metadata = event.metadata();
        let target = metadata.target();

        if target.starts_with("tokio") || target.starts_with("hyper") || target.starts_with("rustls")
        {
            return;
        }

        let mut visitor = LogVisitor::default();
        event.record(&mut visitor);

        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        add_log(format!(
            "[{}] [{}] {}",
            timestamp,
            metadata.level(),
            visitor.message
        ));
    }
}

#[derive(Default)]
struct LogVisitor {
    message: String,
}

impl tracing::field::Visit for LogVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" || self.message.is_empty() {
            self.message = value.to_string();
        } else {
            self.message.push_str(&format!(" {}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" || self.message.is_empty() {
            self.message = format!("{:?}", value);
        } else {
            self.message
                .push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

/// Log an error at a level matching its category.
pub fn log_error(error: &Error, context: Option<&str>) {
    match error.code() {
        "CONNECT" | "TIMEOUT" | "IO" | "RESOLVE" => {
            if let Some(ctx) = context {
                tracing::warn!("{}: {}", ctx, error);
            } else {
                tracing::warn!("{}", error);
            }
        }
        _ => {
            if let Some(ctx) = context {
                tracing::error!("{}: {}", ctx, error);
            } else {
                tracing::error!("{}", error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_buffer_caps_size() {
        let mut buffer = LogBuffer::new(3);
        for i in 0..5 {
            buffer.push(format!("line {}", i));
        }
        let all = buffer.tail(0);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0], "line 2");
        assert_eq!(all[2], "line 4");
    }

    #[test]
    fn test_log_buffer_tail() {
        let mut buffer = LogBuffer::new(10);
        for i in 0..5 {
            buffer.push(format!("line {}", i));
        }
        let tail = buffer.tail(2);
        assert_eq!(tail, vec!["line 3".to_string(), "line 4".to_string()]);
    }
}
