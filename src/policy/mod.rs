use hyper::Uri;
use thiserror::Error;

pub mod directive;
pub mod script;

pub use directive::RouteDirective;
pub use script::{ConstantScriptResolver, fetch_script, hardcoded_proxy_script};

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy evaluation failed: {0}")]
    Evaluation(String),
}

/// The routing policy seam. One instance is built at startup and shared
/// read-only across all concurrent requests; implementations must be safe
/// for concurrent use. A full PAC engine plugs in here.
pub trait PolicyResolver: Send + Sync {
    fn find_proxy(&self, target: &Uri) -> Result<RouteDirective, PolicyError>;
}
