//! Typed field edits and their exiftool argument rendering.

use serde::{Deserialize, Serialize};

use super::{FieldKind, OperationError, OperationType, PendingOperation};

/// A named face rectangle in normalized (0..1) image coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    #[serde(default)]
    pub name: Option<String>,
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

/// One field mutation, validated and ready to render.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldEdit {
    Keyword { keyword: String, op: OperationType },
    Caption(Option<String>),
    Description(Option<String>),
    Copyright(Option<String>),
    Rating(Option<u8>),
    /// Orientation in degrees clockwise; `None` resets to upright.
    Rotation(Option<u16>),
    FaceRegion { region: FaceRegion, op: OperationType },
}

impl FieldEdit {
    /// Validate a field/op/payload triple.
    pub fn parse(field: FieldKind, op: OperationType, payload: &str) -> Result<Self, OperationError> {
        let text = || match op {
            OperationType::Add => Some(payload.to_string()),
            OperationType::Remove => None,
        };

        let edit = match field {
            FieldKind::Keyword => {
                if payload.trim().is_empty() {
                    return Err(OperationError::EmptyKeyword);
                }
                FieldEdit::Keyword {
                    keyword: payload.to_string(),
                    op,
                }
            }
            FieldKind::Caption => FieldEdit::Caption(text()),
            FieldKind::Description => FieldEdit::Description(text()),
            FieldKind::Copyright => FieldEdit::Copyright(text()),
            FieldKind::Rating => match op {
                OperationType::Add => FieldEdit::Rating(Some(parse_rating(payload)?)),
                OperationType::Remove => FieldEdit::Rating(None),
            },
            FieldKind::Rotation => match op {
                OperationType::Add => FieldEdit::Rotation(Some(parse_rotation(payload)?)),
                OperationType::Remove => FieldEdit::Rotation(None),
            },
            FieldKind::FaceRegion => FieldEdit::FaceRegion {
                region: serde_json::from_str(payload)?,
                op,
            },
        };
        Ok(edit)
    }

    pub fn from_operation(operation: &PendingOperation) -> Result<Self, OperationError> {
        Self::parse(operation.field, operation.op, &operation.payload)
    }

    /// Command-line clauses for this edit, one tag assignment per element.
    pub fn exiftool_args(&self) -> Vec<String> {
        match self {
            // Removing first guarantees the keyword is never present twice,
            // whatever the file held before.
            FieldEdit::Keyword { keyword, op } => {
                let mut args = vec![format!("-Keywords-={keyword}")];
                if *op == OperationType::Add {
                    args.push(format!("-Keywords+={keyword}"));
                }
                args
            }
            FieldEdit::Caption(text) => {
                vec![format!("-IPTC:Caption-Abstract={}", text.as_deref().unwrap_or(""))]
            }
            FieldEdit::Description(text) => {
                let text = text.as_deref().unwrap_or("");
                vec![
                    format!("-XMP-dc:Description={text}"),
                    format!("-EXIF:ImageDescription={text}"),
                ]
            }
            FieldEdit::Copyright(text) => {
                let text = text.as_deref().unwrap_or("");
                vec![
                    format!("-EXIF:Copyright={text}"),
                    format!("-IPTC:CopyrightNotice={text}"),
                ]
            }
            FieldEdit::Rating(rating) => match rating {
                Some(r) => vec![format!("-XMP:Rating={r}")],
                None => vec!["-XMP:Rating=".to_string()],
            },
            FieldEdit::Rotation(degrees) => {
                vec![format!("-EXIF:Orientation#={}", degrees_to_orientation(degrees.unwrap_or(0)))]
            }
            FieldEdit::FaceRegion { region, op } => {
                let sign = match op {
                    OperationType::Add => '+',
                    OperationType::Remove => '-',
                };
                vec![format!("-XMP-mwg-rs:RegionList{sign}={}", region_struct(region))]
            }
        }
    }
}

fn parse_rating(payload: &str) -> Result<u8, OperationError> {
    match payload.trim().parse::<u8>() {
        Ok(r) if r <= 5 => Ok(r),
        _ => Err(OperationError::InvalidRating(payload.to_string())),
    }
}

fn parse_rotation(payload: &str) -> Result<u16, OperationError> {
    match payload.trim().parse::<u16>() {
        Ok(d @ (0 | 90 | 180 | 270)) => Ok(d),
        _ => Err(OperationError::InvalidRotation(payload.to_string())),
    }
}

/// EXIF orientation value for a clockwise rotation.
fn degrees_to_orientation(degrees: u16) -> u8 {
    match degrees {
        90 => 6,
        180 => 3,
        270 => 8,
        _ => 1,
    }
}

/// Render an MWG region as an exiftool structure literal.
fn region_struct(region: &FaceRegion) -> String {
    let name = region
        .name
        .as_deref()
        .map(|n| format!("Name={},", escape_struct_value(n)))
        .unwrap_or_default();
    format!(
        "{{{name}Type=Face,Area={{X={},Y={},W={},H={},Unit=normalized}}}}",
        region.x, region.y, region.w, region.h
    )
}

/// Escape characters that are significant inside exiftool structure syntax.
fn escape_struct_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '|' | ',' | '{' | '}' | '[' | ']' | '=') {
            out.push('|');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_remove_then_add() {
        let add = FieldEdit::parse(FieldKind::Keyword, OperationType::Add, "cat").unwrap();
        assert_eq!(add.exiftool_args(), vec!["-Keywords-=cat", "-Keywords+=cat"]);

        let remove = FieldEdit::parse(FieldKind::Keyword, OperationType::Remove, "cat").unwrap();
        assert_eq!(remove.exiftool_args(), vec!["-Keywords-=cat"]);
    }

    #[test]
    fn test_keyword_case_is_preserved() {
        let edit = FieldEdit::parse(FieldKind::Keyword, OperationType::Add, "Cat").unwrap();
        assert_eq!(edit.exiftool_args()[1], "-Keywords+=Cat");
    }

    #[test]
    fn test_empty_keyword_rejected() {
        assert!(matches!(
            FieldEdit::parse(FieldKind::Keyword, OperationType::Add, "  "),
            Err(OperationError::EmptyKeyword)
        ));
    }

    #[test]
    fn test_single_valued_remove_clears() {
        let edit = FieldEdit::parse(FieldKind::Caption, OperationType::Remove, "old").unwrap();
        assert_eq!(edit.exiftool_args(), vec!["-IPTC:Caption-Abstract="]);

        let edit = FieldEdit::parse(FieldKind::Rating, OperationType::Remove, "").unwrap();
        assert_eq!(edit.exiftool_args(), vec!["-XMP:Rating="]);
    }

    #[test]
    fn test_rating_validation() {
        let edit = FieldEdit::parse(FieldKind::Rating, OperationType::Add, "4").unwrap();
        assert_eq!(edit, FieldEdit::Rating(Some(4)));
        assert!(FieldEdit::parse(FieldKind::Rating, OperationType::Add, "6").is_err());
        assert!(FieldEdit::parse(FieldKind::Rating, OperationType::Add, "four").is_err());
    }

    #[test]
    fn test_rotation_to_orientation() {
        let edit = FieldEdit::parse(FieldKind::Rotation, OperationType::Add, "90").unwrap();
        assert_eq!(edit.exiftool_args(), vec!["-EXIF:Orientation#=6"]);

        let edit = FieldEdit::parse(FieldKind::Rotation, OperationType::Remove, "").unwrap();
        assert_eq!(edit.exiftool_args(), vec!["-EXIF:Orientation#=1"]);

        assert!(FieldEdit::parse(FieldKind::Rotation, OperationType::Add, "45").is_err());
    }

    #[test]
    fn test_face_region_rendering() {
        let payload = r#"{"name":"Smith, Jo","x":0.1,"y":0.2,"w":0.3,"h":0.4}"#;
        let edit = FieldEdit::parse(FieldKind::FaceRegion, OperationType::Add, payload).unwrap();
        assert_eq!(
            edit.exiftool_args(),
            vec!["-XMP-mwg-rs:RegionList+={Name=Smith|, Jo,Type=Face,Area={X=0.1,Y=0.2,W=0.3,H=0.4,Unit=normalized}}"]
        );

        assert!(matches!(
            FieldEdit::parse(FieldKind::FaceRegion, OperationType::Add, "not json"),
            Err(OperationError::InvalidFaceRegion(_))
        ));
    }
}
