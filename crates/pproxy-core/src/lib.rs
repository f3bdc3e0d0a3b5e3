pub mod bootstrap;
pub mod engine;
pub mod state;
pub mod upstream_client;

pub use engine::{ProxyBody, ProxyEngine, ProxyRequest, ProxyResponse};
pub use state::{AppState, ModelSnapshot};
pub use upstream_client::{UpstreamClient, UpstreamError, UpstreamRequest, UpstreamResponse};
