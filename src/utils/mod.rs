pub mod expiry;
pub mod image_ops;
pub mod metrics;

// Re-export commonly used items
pub use expiry::{annotate_expiry, normalize_expiry, today_at_offset};
pub use image_ops::{
    clamp_bbox,
    crop_and_encode_jpeg_async,
    data_url_for,
    decode_data_url,
    encode_jpeg,
    extract_crop,
    load_image_from_memory_async,
    save_crop_async,
};
pub use metrics::Metrics;
