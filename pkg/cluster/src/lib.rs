pub mod error;
pub mod registry;
pub mod services;

pub use error::ClusterError;
pub use registry::ClusterRegistry;
