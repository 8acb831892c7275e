//! HTTP API surface.

pub mod routes;

use std::sync::Arc;

use crate::auth::JwtHandler;
use crate::config::Config;
use crate::db::Database;
use crate::pipeline::ReceivingPipeline;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Arc<Database>,
    pub pipeline: Arc<ReceivingPipeline>,
    pub jwt: Arc<JwtHandler>,
}
