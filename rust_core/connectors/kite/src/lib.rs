//! Kite Connect ticker: binary tick decoding and a self-healing socket client.

pub mod config;
pub mod decode;
pub mod frame;
pub mod protocol;
pub mod session;
pub mod ws;

pub use config::{FeedConfig, KITE_WS_ENDPOINT};
pub use decode::{decode_tick, Layout};
pub use frame::split_packets;
pub use protocol::{Request, ServerNotice};
pub use session::{ConnectionStatus, ReconnectPolicy, Reconnect, Session};
pub use ws::KiteTicker;
