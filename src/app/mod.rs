pub mod context;
pub mod errors;
pub mod service;

pub use context::AppContext;
pub use errors::AppError;
pub use service::AppService;
