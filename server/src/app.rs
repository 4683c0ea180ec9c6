//! Shared application state handed to every axum route and the WS handler.

use std::sync::Arc;

use crate::coalesce::Coalescer;
use crate::facade::AxiDrawFacade;
use crate::queue::JobQueue;
use crate::session::SessionCoordinator;
use crate::spatial::SpatialProcessor;

#[derive(Clone)]
pub struct AppState {
    pub facade: Arc<AxiDrawFacade>,
    pub spatial: Arc<SpatialProcessor>,
    pub sessions: Arc<SessionCoordinator>,
    pub queue: Arc<JobQueue>,
    pub coalesce_move: Arc<Coalescer>,
    pub coalesce_lineto: Arc<Coalescer>,
}
