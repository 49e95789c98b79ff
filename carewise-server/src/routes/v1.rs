use axum::{
    Router,
    routing::{get, post},
};

use carewise_core::routes::v1;

use crate::{
    handlers::{analysis, batch, queue},
    infra::app_state::AppState,
};

/// Create all v1 API routes
pub fn create_v1_router() -> Router<AppState> {
    Router::new()
        .merge(create_analysis_routes())
        .merge(create_batch_routes())
        .merge(create_queue_routes())
}

fn create_analysis_routes() -> Router<AppState> {
    Router::new()
        .route(
            v1::analyses::COLLECTION,
            get(analysis::list_analyses_handler).post(analysis::create_analysis_handler),
        )
        .route(v1::analyses::EXPORT, get(analysis::export_analyses_handler))
        .route(v1::analyses::ITEM, get(analysis::get_analysis_handler))
        .route(v1::analyses::CANCEL, post(analysis::cancel_analysis_handler))
        .route(v1::analyses::RETRY, post(analysis::retry_analysis_handler))
        .route(v1::analyses::RESULT, get(analysis::analysis_result_handler))
        .route(v1::analyses::FEEDBACK, post(analysis::feedback_handler))
        .route(v1::analyses::MODULE, get(analysis::module_result_handler))
}

fn create_batch_routes() -> Router<AppState> {
    Router::new()
        .route(v1::batches::COLLECTION, post(batch::create_batch_handler))
        .route(v1::batches::ITEM, get(batch::get_batch_handler))
}

fn create_queue_routes() -> Router<AppState> {
    Router::new()
        .route(v1::queue::STATUS, get(queue::queue_status_handler))
        .route(v1::queue::PENDING, get(queue::pending_jobs_handler))
        .route(v1::queue::FAILED, get(queue::failed_jobs_handler))
}
