mod middleware;
mod registry;

pub use middleware::RequestContext;
pub use registry::{RegistryState, build_router};
