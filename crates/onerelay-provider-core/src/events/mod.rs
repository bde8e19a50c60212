mod hub;
mod terminal_sink;
mod types;

pub use hub::{EventHub, EventSink};
pub use terminal_sink::TerminalEventSink;
pub use types::{ChannelStatusEvent, ConsumeEvent, Event, RelayFailedEvent};
