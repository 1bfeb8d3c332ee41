pub mod app;

pub use app::config::PipelineConfig;
pub use app::error::AppError;
pub use app::pipeline::Pipeline;
pub use app::report::Report;
