//! Reading technical metadata and content hashes back from image files.

pub mod hashing;
pub mod metadata;

pub use hashing::sha256_file;
pub use metadata::{extract_metadata, ExtractedMetadata};
