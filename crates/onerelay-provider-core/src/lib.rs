//! Shared vocabulary for upstream adaptors: channels, the per-request relay
//! context, the adaptor contract and the event hub.

pub mod adaptor;
pub mod channel;
pub mod errors;
pub mod events;
pub mod registry;
pub mod relay_error;
pub mod relay_info;
pub mod upstream;
pub mod usage;
pub mod writer;

pub use adaptor::{Adaptor, AdaptorOutput, AudioRequest, ImageRequest, RequestBody};
pub use channel::{Ability, Channel, ChannelStatus, ChannelType};
pub use errors::{ProviderError, ProviderResult};
pub use events::{
    ChannelStatusEvent, ConsumeEvent, Event, EventHub, EventSink, RelayFailedEvent,
    TerminalEventSink,
};
pub use registry::AdaptorRegistry;
pub use relay_error::{RelayError, RelayErrorKind};
pub use relay_info::{CallerInfo, PriceData, RelayFormat, RelayInfo, RelayMode, RequestMeta};
pub use upstream::{
    ByteStream, Headers, HttpMethod, UpstreamBody, UpstreamClient, UpstreamFailure,
    UpstreamHttpRequest, UpstreamHttpResponse, UpstreamTransportErrorKind, header_get, header_set,
};
pub use usage::Usage;
pub use writer::{ResponseWriter, encode_batch};
