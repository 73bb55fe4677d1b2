pub mod image_ops;
pub mod metrics;

// Re-export commonly used items
pub use image_ops::{decode_image_async, has_allowed_extension, ALLOWED_EXTENSIONS};
#[cfg(test)]
pub use image_ops::encode_png;
pub use metrics::{Metrics, MetricsSnapshot};
