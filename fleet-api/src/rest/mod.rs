pub mod handlers;
pub mod problem;
mod routes;

pub use handlers::AppState;
pub use problem::{ApiError, ProblemDetails};
pub use routes::{ApiDoc, create_router};
