use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Technical metadata read back from an image file.
///
/// User-editable fields are deliberately absent: the database is the source
/// of truth for those.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedMetadata {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub taken_at: Option<String>,
    pub file_size: u64,
    pub file_modified: Option<DateTime<Utc>>,
}

pub fn extract_metadata(path: &Path) -> Result<ExtractedMetadata> {
    let fs_meta = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?;

    let mut metadata = ExtractedMetadata {
        file_size: fs_meta.len(),
        file_modified: fs_meta.modified().ok().map(DateTime::<Utc>::from),
        ..Default::default()
    };

    if let Ok(reader) = image::ImageReader::open(path) {
        if let Ok(reader) = reader.with_guessed_format() {
            if let Ok((w, h)) = reader.into_dimensions() {
                metadata.width = Some(w);
                metadata.height = Some(h);
            }
        }
    }

    // Files without an EXIF container are fine; they just have no camera info.
    if let Ok(file) = File::open(path) {
        let mut bufreader = BufReader::new(file);
        if let Ok(exif) = exif::Reader::new().read_from_container(&mut bufreader) {
            metadata.camera_make = ascii_field(&exif, exif::Tag::Make);
            metadata.camera_model = ascii_field(&exif, exif::Tag::Model);
            metadata.taken_at = ascii_field(&exif, exif::Tag::DateTimeOriginal);
        }
    }

    Ok(metadata)
}

fn ascii_field(exif: &exif::Exif, tag: exif::Tag) -> Option<String> {
    let field = exif.get_field(tag, exif::In::PRIMARY)?;
    let value = field
        .display_value()
        .to_string()
        .trim_matches('"')
        .trim()
        .to_string();
    (!value.is_empty()).then_some(value)
}
