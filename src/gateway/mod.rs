//! Device lookup gateway and its HTTP surface

mod lookup;
mod router;
mod server;

pub use lookup::{DeviceGateway, GatewayStats, LookupOutcome, UpstreamFailure};
pub use router::{AppState, create_router, status_for};
pub use server::Server;
