//! Operator alerts: this bot's WARN/ERROR events, posted to a Telegram chat.
//!
//! Only events from our own modules are considered (see [`alert_filter`]).
//! An alert is posted the first time its text is seen; identical alerts
//! inside the repeat window are counted and reported once the window closes,
//! so a dead upstream produces one message per window instead of one per
//! user message.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::level_filters::LevelFilter;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::Context;

use crate::assistant::telegram::{self, MessageSender};

pub const REPEAT_WINDOW: Duration = Duration::from_secs(60);
const QUEUE_CAPACITY: usize = 256;
const MAX_CHARS: usize = 3500;

/// WARN and above from this crate, never from the Telegram client itself
/// (its send failures would feed back into the alert chat).
pub fn alert_filter() -> Targets {
    Targets::new()
        .with_target(env!("CARGO_CRATE_NAME"), Level::WARN)
        .with_target(telegram::LOG_TARGET, LevelFilter::OFF)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Alert {
    level: Level,
    /// Last path segment of the event target, e.g. `membership`.
    source: String,
    text: String,
}

impl Alert {
    fn render(&self) -> String {
        let icon = if self.level == Level::ERROR { "❌" } else { "⚠️" };
        let line = format!("{icon} [{}] {}", self.source, self.text);
        if line.chars().count() > MAX_CHARS {
            let cut: String = line.chars().take(MAX_CHARS).collect();
            format!("{cut}…")
        } else {
            line
        }
    }
}

/// Per-text repeat counter.
#[derive(Debug)]
struct RepeatWindow {
    window: Duration,
    open: HashMap<String, (Instant, u32)>,
}

impl RepeatWindow {
    fn new(window: Duration) -> Self {
        Self {
            window,
            open: HashMap::new(),
        }
    }

    /// True when `key` should be posted now; false when it is a repeat.
    fn admit(&mut self, key: &str, now: Instant) -> bool {
        match self.open.get_mut(key) {
            Some((opened, repeats)) if now.duration_since(*opened) < self.window => {
                *repeats += 1;
                false
            }
            _ => {
                self.open.insert(key.to_string(), (now, 0));
                true
            }
        }
    }

    /// Closes expired windows, returning the ones that saw repeats.
    fn close_expired(&mut self, now: Instant) -> Vec<(String, u32)> {
        let window = self.window;
        let mut closed = Vec::new();
        self.open.retain(|key, (opened, repeats)| {
            if now.duration_since(*opened) < window {
                return true;
            }
            if *repeats > 0 {
                closed.push((key.clone(), *repeats));
            }
            false
        });
        closed.sort();
        closed
    }

    fn close_all(&mut self) -> Vec<(String, u32)> {
        let mut closed: Vec<_> = self
            .open
            .drain()
            .filter(|(_, (_, repeats))| *repeats > 0)
            .map(|(key, (_, repeats))| (key, repeats))
            .collect();
        closed.sort();
        closed
    }
}

pub struct AlertLayer {
    tx: mpsc::Sender<Alert>,
}

impl AlertLayer {
    /// Spawns the delivery task; must be called inside a tokio runtime.
    pub fn new(sender: Arc<dyn MessageSender>, chat_id: i64, window: Duration) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(deliver(rx, sender, chat_id, window));
        Self { tx }
    }
}

async fn deliver(mut rx: mpsc::Receiver<Alert>, sender: Arc<dyn MessageSender>, chat_id: i64, window: Duration) {
    let mut repeats = RepeatWindow::new(window);
    let mut sweep = tokio::time::interval(window);

    loop {
        tokio::select! {
            alert = rx.recv() => {
                let Some(alert) = alert else { break };
                let text = alert.render();
                if repeats.admit(&text, Instant::now()) {
                    post(sender.as_ref(), chat_id, &text).await;
                }
            }
            _ = sweep.tick() => {
                for (text, count) in repeats.close_expired(Instant::now()) {
                    post(sender.as_ref(), chat_id, &repeat_summary(&text, count)).await;
                }
            }
        }
    }

    for (text, count) in repeats.close_all() {
        post(sender.as_ref(), chat_id, &repeat_summary(&text, count)).await;
    }
}

fn repeat_summary(text: &str, count: u32) -> String {
    format!("{text}\n(repeated {count} more times)")
}

async fn post(sender: &dyn MessageSender, chat_id: i64, text: &str) {
    // Logging here would re-enter the layer.
    if let Err(e) = sender.send_text(chat_id, text).await {
        eprintln!("alert delivery to chat {chat_id} failed: {e}");
    }
}

/// Collects the message plus any structured fields as `key=value`.
#[derive(Default)]
struct AlertText {
    message: String,
    fields: String,
}

impl AlertText {
    fn push_field(&mut self, name: &str, value: std::fmt::Arguments<'_>) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{name}={value}");
    }

    fn finish(self) -> String {
        match (self.message.is_empty(), self.fields.is_empty()) {
            (_, true) => self.message,
            (true, false) => self.fields,
            (false, false) => format!("{} ({})", self.message, self.fields),
        }
    }
}

impl Visit for AlertText {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.push_field(field.name(), format_args!("{value}"));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.push_field(field.name(), format_args!("{value:?}"));
        }
    }
}

impl<S: Subscriber> Layer<S> for AlertLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut text = AlertText::default();
        event.record(&mut text);

        let alert = Alert {
            level: *meta.level(),
            source: meta.target().rsplit("::").next().unwrap_or_default().to_string(),
            text: text.finish(),
        };
        // A full queue means the chat is already flooded.
        let _ = self.tx.try_send(alert);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::telegram::testing::RecordingSender;
    use tracing_subscriber::prelude::*;

    fn alert(level: Level, text: &str) -> Alert {
        Alert {
            level,
            source: "intent".into(),
            text: text.into(),
        }
    }

    fn emit(sender: Arc<RecordingSender>, window: Duration, log: impl FnOnce()) {
        let layer = AlertLayer::new(sender, -42, window).with_filter(alert_filter());
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, log);
    }

    #[test]
    fn test_render_marks_severity_and_source() {
        assert_eq!(alert(Level::WARN, "upstream slow").render(), "⚠️ [intent] upstream slow");
        assert_eq!(alert(Level::ERROR, "bind failed").render(), "❌ [intent] bind failed");
    }

    #[test]
    fn test_render_truncates_long_text() {
        let rendered = alert(Level::WARN, &"x".repeat(10_000)).render();
        assert_eq!(rendered.chars().count(), MAX_CHARS + 1);
        assert!(rendered.ends_with('…'));
    }

    #[test]
    fn test_repeat_window_counts_duplicates() {
        let start = Instant::now();
        let mut window = RepeatWindow::new(Duration::from_secs(60));
        assert!(window.admit("a", start));
        assert!(!window.admit("a", start + Duration::from_secs(1)));
        assert!(!window.admit("a", start + Duration::from_secs(2)));
        assert!(window.admit("b", start + Duration::from_secs(2)));

        assert!(window.close_expired(start + Duration::from_secs(30)).is_empty());
        assert_eq!(
            window.close_expired(start + Duration::from_secs(90)),
            vec![("a".to_string(), 2)]
        );
        // Window closed, so the next occurrence is posted again.
        assert!(window.admit("a", start + Duration::from_secs(91)));
    }

    #[test]
    fn test_close_all_reports_only_repeated() {
        let now = Instant::now();
        let mut window = RepeatWindow::new(Duration::from_secs(60));
        window.admit("once", now);
        window.admit("twice", now);
        window.admit("twice", now);
        assert_eq!(window.close_all(), vec![("twice".to_string(), 1)]);
        assert!(window.open.is_empty());
    }

    #[test]
    fn test_alert_text_appends_fields() {
        let mut text = AlertText {
            message: "Intent query failed".into(),
            ..Default::default()
        };
        text.push_field("kind", format_args!("{}", "timeout"));
        text.push_field("chat", format_args!("{}", 7));
        assert_eq!(text.finish(), "Intent query failed (kind=timeout chat=7)");
    }

    #[tokio::test]
    async fn test_own_warnings_posted() {
        let sender = Arc::new(RecordingSender::default());
        emit(sender.clone(), REPEAT_WINDOW, || {
            tracing::warn!("intent service down");
            tracing::info!("routine");
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sender.sent(), vec![(-42, "⚠️ [tests] intent service down".to_string())]);
    }

    #[tokio::test]
    async fn test_foreign_and_client_targets_filtered() {
        let sender = Arc::new(RecordingSender::default());
        emit(sender.clone(), REPEAT_WINDOW, || {
            tracing::error!(target: "hyper::proto", "connection reset");
            tracing::warn!(target: telegram::LOG_TARGET, "Failed to send to chat -42");
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sender.sent().is_empty());
    }

    #[tokio::test]
    async fn test_repeats_summarized_after_window() {
        let sender = Arc::new(RecordingSender::default());
        emit(sender.clone(), Duration::from_millis(200), || {
            for _ in 0..3 {
                tracing::warn!("Intent query failed");
            }
        });

        tokio::time::sleep(Duration::from_millis(600)).await;
        let texts: Vec<String> = sender.sent().into_iter().map(|(_, text)| text).collect();
        assert_eq!(
            texts,
            vec![
                "⚠️ [tests] Intent query failed".to_string(),
                "⚠️ [tests] Intent query failed\n(repeated 2 more times)".to_string(),
            ]
        );
    }
}
