use std::future::Future;
use std::pin::Pin;

use super::{Event, EventSink};

/// Prints one JSON line per event on stderr.
#[derive(Debug, Default)]
pub struct TerminalEventSink {
    /// Consume events are noisy on busy gateways; only failures and status changes by default.
    include_consume: bool,
}

impl TerminalEventSink {
    pub fn new(include_consume: bool) -> Self {
        Self { include_consume }
    }
}

impl EventSink for TerminalEventSink {
    fn write<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if matches!(event, Event::Consume(_)) && !self.include_consume {
                return;
            }
            match serde_json::to_string(event) {
                Ok(line) => eprintln!("{line}"),
                Err(err) => {
                    eprintln!("{{\"event\":\"event_serialize_error\",\"error\":\"{err}\"}}")
                }
            }
        })
    }
}
