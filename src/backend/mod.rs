// Remote collaborators: job creation, chat turns, event streams, document counts

pub mod provider;
pub mod http;

pub use provider::*;
pub use http::HttpBackend;
