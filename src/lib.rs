pub mod auth;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod logging;
pub mod parser;
pub mod prebuffered;
pub mod relay;
pub mod response;
pub mod safeguards;
pub mod server;
pub mod stats;
pub mod upstream;

pub use config::Config;
pub use context::{AccessRecord, Outcome, RequestContext};
pub use engine::{EngineSettings, ProxyEngine};
pub use error::ProxyError;
pub use server::ProxyServer;
