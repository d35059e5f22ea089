use crate::error::SessionError;
use crate::provider::{EventKind, EventOrigin, RealtimeEvent};
use crate::state::{SessionSink, SessionView};
use std::io::Write;

/// Prints the conversation to a terminal as it grows.
pub struct ConsoleSink<W: Write + Send> {
    out: W,
    printed: usize,
    active: bool,
    ai_speaking: bool,
}

impl ConsoleSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> ConsoleSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            printed: 0,
            active: false,
            ai_speaking: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn line(&mut self, text: &str) {
        if let Err(e) = writeln!(self.out, "{}", text).and_then(|_| self.out.flush()) {
            log::warn!("[console] write failed: {}", e);
        }
    }
}

fn format_event(ev: &RealtimeEvent) -> String {
    let arrow = match ev.origin() {
        EventOrigin::Client => ">>",
        EventOrigin::Server => "<<",
    };
    let time = ev.timestamp.as_deref().unwrap_or("--:--:--");
    let label = match ev.classify() {
        EventKind::ItemCreate => "you",
        EventKind::TranscriptDone | EventKind::ResponseDone => "assistant",
        EventKind::Error => "error",
        _ => ev.kind.as_str(),
    };
    match ev.display_text() {
        Some(text) => format!("{} {} {}: {}", time, arrow, label, text),
        None => format!("{} {} {}", time, arrow, ev.kind),
    }
}

impl<W: Write + Send> SessionSink for ConsoleSink<W> {
    fn render(&mut self, view: SessionView<'_>) {
        if view.active != self.active {
            self.active = view.active;
            self.line(if view.active {
                "-- session open --"
            } else {
                "-- session closed --"
            });
        }

        let len = view.log.len();
        if len < self.printed {
            self.printed = 0;
        }
        // Streaming deltas that piled up between renders collapse to the
        // newest one of each type.
        let fresh = if self.printed == 0 {
            view.log.display()
        } else {
            view.log.display_newest(len - self.printed)
        };
        let lines: Vec<String> = fresh.into_iter().rev().map(format_event).collect();
        for line in lines {
            self.line(&line);
        }
        self.printed = len;

        if view.ai_speaking != self.ai_speaking {
            self.ai_speaking = view.ai_speaking;
            self.line(if view.ai_speaking {
                "-- assistant speaking, mic muted --"
            } else {
                "-- your turn --"
            });
        }
    }

    fn report(&mut self, error: &SessionError) {
        self.line(&format!("!! {}", error));
        if error.is_fatal() {
            self.line("-- session stopped, /start to try again --");
        }
    }
}
