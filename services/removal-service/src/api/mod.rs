use std::sync::Arc;

pub mod handlers;
pub mod router;
pub mod types;

pub use handlers::*;
pub use router::create_router;
pub use types::*;

use crate::config::RemovalServiceConfig;
use crate::dispatch::Dispatcher;

pub struct ApiState {
    pub dispatcher: Dispatcher,
    pub config: Arc<RemovalServiceConfig>,
}

impl ApiState {
    pub fn new(dispatcher: Dispatcher, config: RemovalServiceConfig) -> Self {
        Self {
            dispatcher,
            config: Arc::new(config),
        }
    }
}
