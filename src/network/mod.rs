pub mod http_client;
pub mod portal_server;
pub mod time;
pub mod wifi;

pub use http_client::EspTransport;
pub use portal_server::PortalServer;
pub use time::{EspClock, SntpTimeSource};
pub use wifi::EspRadio;
