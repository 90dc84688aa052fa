//! Images and their relations.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension};
use std::collections::HashMap;
use std::path::PathBuf;

use super::{from_millis, placeholders, to_millis, Database};
use crate::metadata::{FaceRegion, FieldEdit, OperationType};
use crate::scanner::ExtractedMetadata;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Folder {
    pub id: i64,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub id: i64,
    pub folder_id: i64,
    pub file_name: String,
    pub file_size: i64,
    pub file_modified: Option<DateTime<Utc>>,
    /// Advanced whenever the file's metadata is written back.
    pub last_updated: DateTime<Utc>,
    pub metadata_scanned_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageMetadata {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub date_taken: Option<String>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub caption: Option<String>,
    pub description: Option<String>,
    pub copyright: Option<String>,
    pub rating: Option<u8>,
    pub rotation: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHash {
    pub sha256: String,
    pub perceptual: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub id: i64,
    pub keyword: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Face,
    Object,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Face => "face",
            ObjectKind::Object => "object",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "face" => Some(ObjectKind::Face),
            "object" => Some(ObjectKind::Object),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageObject {
    pub id: i64,
    pub kind: ObjectKind,
    pub label: Option<String>,
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

/// An image with every relation needed to display or edit it.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageAggregate {
    pub image: Image,
    pub folder: Folder,
    pub metadata: Option<ImageMetadata>,
    pub hash: Option<ImageHash>,
    pub tags: Vec<Tag>,
    pub objects: Vec<ImageObject>,
}

impl ImageAggregate {
    pub fn id(&self) -> i64 {
        self.image.id
    }

    pub fn path(&self) -> PathBuf {
        PathBuf::from(&self.folder.path).join(&self.image.file_name)
    }

    pub fn keywords(&self) -> Vec<&str> {
        self.tags.iter().map(|t| t.keyword.as_str()).collect()
    }
}

/// Largest `IN (...)` list sent in one statement.
const HYDRATE_CHUNK: usize = 500;

impl Database {
    // ========================================================================
    // Images
    // ========================================================================

    pub fn add_folder(&self, path: &str) -> Result<i64> {
        let conn = self.conn();
        conn.execute("INSERT OR IGNORE INTO folders (path) VALUES (?)", [path])?;
        let id = conn.query_row("SELECT id FROM folders WHERE path = ?", [path], |row| row.get(0))?;
        Ok(id)
    }

    pub fn add_image(&self, folder_id: i64, file_name: &str, file_size: i64) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO images (folder_id, file_name, file_size, last_updated)
            VALUES (?, ?, ?, ?)
            "#,
            params![folder_id, file_name, file_size, to_millis(Utc::now())],
        )?;
        Ok(conn.last_insert_rowid())
    }

    #[cfg(test)]
    pub(crate) fn add_test_image(&self, folder: &str, file_name: &str) -> Result<i64> {
        let folder_id = self.add_folder(folder)?;
        self.add_image(folder_id, file_name, 0)
    }

    pub fn image_path(&self, image_id: i64) -> Result<Option<PathBuf>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                r#"
                SELECT f.path, i.file_name
                FROM images i
                JOIN folders f ON f.id = i.folder_id
                WHERE i.id = ?
                "#,
                [image_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        Ok(row.map(|(folder, name)| PathBuf::from(folder).join(name)))
    }

    /// Advance the image's modification marker so scans notice the change.
    ///
    /// The marker is strictly increasing, and always lands after the last
    /// metadata scan, even if the clock is not.
    pub fn touch_image(&self, image_id: i64) -> Result<()> {
        let now = to_millis(Utc::now());
        self.conn().execute(
            r#"
            UPDATE images
            SET last_updated = MAX(?, last_updated + 1, COALESCE(metadata_scanned_at + 1, 0))
            WHERE id = ?
            "#,
            params![now, image_id],
        )?;
        Ok(())
    }

    pub fn recently_modified_image_ids(&self, limit: usize) -> Result<Vec<i64>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT id FROM images ORDER BY last_updated DESC, id DESC LIMIT ?")?;
        let ids = stmt
            .query_map([limit as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    /// Images written since their metadata was last extracted.
    pub fn images_needing_reindex(&self, limit: usize) -> Result<Vec<(i64, PathBuf)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT i.id, f.path, i.file_name
            FROM images i
            JOIN folders f ON f.id = i.folder_id
            WHERE i.metadata_scanned_at IS NULL OR i.metadata_scanned_at < i.last_updated
            ORDER BY i.last_updated ASC
            LIMIT ?
            "#,
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    PathBuf::from(row.get::<_, String>(1)?).join(row.get::<_, String>(2)?),
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Record a metadata extraction. Marks the image scanned even when
    /// `extracted` is `None`, so unreadable files are not retried every cycle.
    pub fn store_extracted_metadata(
        &self,
        image_id: i64,
        extracted: Option<&ExtractedMetadata>,
        sha256: Option<&str>,
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        if let Some(meta) = extracted {
            tx.execute(
                "INSERT OR IGNORE INTO image_metadata (image_id) VALUES (?)",
                [image_id],
            )?;
            tx.execute(
                r#"
                UPDATE image_metadata
                SET width = ?, height = ?, date_taken = ?, camera_make = ?, camera_model = ?
                WHERE image_id = ?
                "#,
                params![
                    meta.width,
                    meta.height,
                    meta.taken_at,
                    meta.camera_make,
                    meta.camera_model,
                    image_id
                ],
            )?;
            tx.execute(
                "UPDATE images SET file_size = ?, file_modified = ? WHERE id = ?",
                params![
                    meta.file_size as i64,
                    meta.file_modified.map(to_millis),
                    image_id
                ],
            )?;
        }

        if let Some(sha256) = sha256 {
            tx.execute(
                r#"
                INSERT INTO hashes (image_id, sha256) VALUES (?, ?)
                ON CONFLICT(image_id) DO UPDATE SET sha256 = excluded.sha256
                "#,
                params![image_id, sha256],
            )?;
        }

        tx.execute(
            "UPDATE images SET metadata_scanned_at = MAX(?, last_updated) WHERE id = ?",
            params![to_millis(Utc::now()), image_id],
        )?;

        tx.commit()?;
        Ok(())
    }

    // ========================================================================
    // Relation edits
    // ========================================================================

    /// Mirror user edits into the image's relations. Callers must evict the
    /// image from the aggregate cache afterwards.
    pub fn apply_field_edits(&self, image_id: i64, edits: &[FieldEdit]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        apply_edits(&tx, image_id, edits)?;
        tx.commit()?;
        Ok(())
    }

    pub fn add_image_object(
        &self,
        image_id: i64,
        kind: ObjectKind,
        label: Option<&str>,
        rect: (f64, f64, f64, f64),
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO image_objects (image_id, kind, label, x, y, w, h) VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![image_id, kind.as_str(), label, rect.0, rect.1, rect.2, rect.3],
        )?;
        Ok(conn.last_insert_rowid())
    }

    // ========================================================================
    // Hydration
    // ========================================================================

    /// Load aggregates for `ids`. Row order is unspecified; unknown ids are
    /// simply absent.
    pub fn hydrate_images(&self, ids: &[i64]) -> Result<Vec<ImageAggregate>> {
        let mut aggregates = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(HYDRATE_CHUNK) {
            aggregates.extend(self.hydrate_chunk(chunk)?);
        }
        Ok(aggregates)
    }

    fn hydrate_chunk(&self, ids: &[i64]) -> Result<Vec<ImageAggregate>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn();
        let in_list = placeholders(ids.len());

        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT i.id, i.folder_id, i.file_name, i.file_size, i.file_modified,
                   i.last_updated, i.metadata_scanned_at,
                   f.path,
                   m.image_id, m.width, m.height, m.date_taken, m.camera_make, m.camera_model,
                   m.caption, m.description, m.copyright, m.rating, m.rotation,
                   h.sha256, h.perceptual
            FROM images i
            JOIN folders f ON f.id = i.folder_id
            LEFT JOIN image_metadata m ON m.image_id = i.id
            LEFT JOIN hashes h ON h.image_id = i.id
            WHERE i.id IN ({in_list})
            "#
        ))?;

        let mut by_id: HashMap<i64, ImageAggregate> = stmt
            .query_map(params_from_iter(ids.iter()), |row| {
                let image = Image {
                    id: row.get(0)?,
                    folder_id: row.get(1)?,
                    file_name: row.get(2)?,
                    file_size: row.get(3)?,
                    file_modified: row.get::<_, Option<i64>>(4)?.map(from_millis),
                    last_updated: from_millis(row.get(5)?),
                    metadata_scanned_at: row.get::<_, Option<i64>>(6)?.map(from_millis),
                };
                let folder = Folder {
                    id: image.folder_id,
                    path: row.get(7)?,
                };
                let metadata = match row.get::<_, Option<i64>>(8)? {
                    Some(_) => Some(ImageMetadata {
                        width: row.get(9)?,
                        height: row.get(10)?,
                        date_taken: row.get(11)?,
                        camera_make: row.get(12)?,
                        camera_model: row.get(13)?,
                        caption: row.get(14)?,
                        description: row.get(15)?,
                        copyright: row.get(16)?,
                        rating: row.get(17)?,
                        rotation: row.get(18)?,
                    }),
                    None => None,
                };
                let perceptual: Option<String> = row.get(20)?;
                let hash = row
                    .get::<_, Option<String>>(19)?
                    .map(|sha256| ImageHash { sha256, perceptual });
                Ok(ImageAggregate {
                    image,
                    folder,
                    metadata,
                    hash,
                    tags: Vec::new(),
                    objects: Vec::new(),
                })
            })?
            .map(|r| r.map(|agg| (agg.id(), agg)))
            .collect::<rusqlite::Result<_>>()?;

        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT it.image_id, t.id, t.keyword
            FROM image_tags it
            JOIN tags t ON t.id = it.tag_id
            WHERE it.image_id IN ({in_list})
            ORDER BY t.keyword
            "#
        ))?;
        let tags = stmt.query_map(params_from_iter(ids.iter()), |row| {
            Ok((
                row.get::<_, i64>(0)?,
                Tag {
                    id: row.get(1)?,
                    keyword: row.get(2)?,
                },
            ))
        })?;
        for tag in tags {
            let (image_id, tag) = tag?;
            if let Some(agg) = by_id.get_mut(&image_id) {
                agg.tags.push(tag);
            }
        }

        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT image_id, id, kind, label, x, y, w, h
            FROM image_objects
            WHERE image_id IN ({in_list})
            ORDER BY id
            "#
        ))?;
        let objects = stmt.query_map(params_from_iter(ids.iter()), |row| {
            let kind: String = row.get(2)?;
            Ok((
                row.get::<_, i64>(0)?,
                ImageObject {
                    id: row.get(1)?,
                    kind: ObjectKind::from_str(&kind).unwrap_or(ObjectKind::Object),
                    label: row.get(3)?,
                    x: row.get(4)?,
                    y: row.get(5)?,
                    w: row.get(6)?,
                    h: row.get(7)?,
                },
            ))
        })?;
        for object in objects {
            let (image_id, object) = object?;
            if let Some(agg) = by_id.get_mut(&image_id) {
                agg.objects.push(object);
            }
        }

        Ok(by_id.into_values().collect())
    }
}

/// Mirror `edits` into the image's relations inside `tx`. Fails if the image
/// does not exist.
pub(super) fn apply_edits(
    tx: &rusqlite::Transaction<'_>,
    image_id: i64,
    edits: &[FieldEdit],
) -> Result<()> {
    let exists: bool = tx
        .query_row("SELECT 1 FROM images WHERE id = ?", [image_id], |_| Ok(true))
        .optional()?
        .unwrap_or(false);
    if !exists {
        bail!("Unknown image {image_id}");
    }

    for edit in edits {
        match edit {
            FieldEdit::Keyword { keyword, op } => match op {
                OperationType::Add => {
                    tx.execute("INSERT OR IGNORE INTO tags (keyword) VALUES (?)", [keyword])?;
                    tx.execute(
                        r#"
                        INSERT OR IGNORE INTO image_tags (image_id, tag_id)
                        SELECT ?, id FROM tags WHERE keyword = ?
                        "#,
                        params![image_id, keyword],
                    )?;
                }
                OperationType::Remove => {
                    tx.execute(
                        r#"
                        DELETE FROM image_tags
                        WHERE image_id = ? AND tag_id IN (SELECT id FROM tags WHERE keyword = ?)
                        "#,
                        params![image_id, keyword],
                    )?;
                }
            },
            FieldEdit::FaceRegion { region, op } => match op {
                OperationType::Add => insert_face(tx, image_id, region)?,
                OperationType::Remove => delete_face(tx, image_id, region)?,
            },
            FieldEdit::Caption(text) => set_metadata(tx, image_id, "caption", text)?,
            FieldEdit::Description(text) => set_metadata(tx, image_id, "description", text)?,
            FieldEdit::Copyright(text) => set_metadata(tx, image_id, "copyright", text)?,
            FieldEdit::Rating(rating) => set_metadata(tx, image_id, "rating", rating)?,
            FieldEdit::Rotation(degrees) => {
                set_metadata(tx, image_id, "rotation", &degrees.unwrap_or(0))?
            }
        }
    }
    Ok(())
}

fn set_metadata<T: rusqlite::ToSql>(
    tx: &rusqlite::Transaction<'_>,
    image_id: i64,
    column: &'static str,
    value: &T,
) -> Result<()> {
    tx.execute(
        "INSERT OR IGNORE INTO image_metadata (image_id) VALUES (?)",
        [image_id],
    )?;
    tx.execute(
        &format!("UPDATE image_metadata SET {column} = ? WHERE image_id = ?"),
        params![value, image_id],
    )?;
    Ok(())
}

fn insert_face(tx: &rusqlite::Transaction<'_>, image_id: i64, region: &FaceRegion) -> Result<()> {
    tx.execute(
        "INSERT INTO image_objects (image_id, kind, label, x, y, w, h) VALUES (?, 'face', ?, ?, ?, ?, ?)",
        params![image_id, region.name, region.x, region.y, region.w, region.h],
    )?;
    Ok(())
}

fn delete_face(tx: &rusqlite::Transaction<'_>, image_id: i64, region: &FaceRegion) -> Result<()> {
    tx.execute(
        r#"
        DELETE FROM image_objects
        WHERE image_id = ? AND kind = 'face'
          AND label IS ? AND x = ? AND y = ? AND w = ? AND h = ?
        "#,
        params![image_id, region.name, region.x, region.y, region.w, region.h],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Database, i64) {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        let id = db.add_test_image("/photos/2024", "beach.jpg").unwrap();
        (db, id)
    }

    fn keyword(k: &str, op: OperationType) -> FieldEdit {
        FieldEdit::Keyword {
            keyword: k.to_string(),
            op,
        }
    }

    #[test]
    fn test_image_path() {
        let (db, id) = setup();
        assert_eq!(
            db.image_path(id).unwrap(),
            Some(PathBuf::from("/photos/2024/beach.jpg"))
        );
        assert_eq!(db.image_path(id + 100).unwrap(), None);
    }

    #[test]
    fn test_hydrate_joins_relations() {
        let (db, id) = setup();
        db.apply_field_edits(
            id,
            &[
                keyword("sunset", OperationType::Add),
                keyword("Sea", OperationType::Add),
                FieldEdit::Caption(Some("Evening".to_string())),
                FieldEdit::Rating(Some(4)),
            ],
        )
        .unwrap();
        db.add_image_object(id, ObjectKind::Object, Some("boat"), (0.1, 0.2, 0.3, 0.4))
            .unwrap();
        db.store_extracted_metadata(id, None, Some("abc123")).unwrap();

        let aggs = db.hydrate_images(&[id]).unwrap();
        assert_eq!(aggs.len(), 1);
        let agg = &aggs[0];

        assert_eq!(agg.path(), PathBuf::from("/photos/2024/beach.jpg"));
        assert_eq!(agg.keywords(), vec!["Sea", "sunset"]);
        let meta = agg.metadata.as_ref().unwrap();
        assert_eq!(meta.caption.as_deref(), Some("Evening"));
        assert_eq!(meta.rating, Some(4));
        assert_eq!(agg.hash.as_ref().unwrap().sha256, "abc123");
        assert_eq!(agg.objects.len(), 1);
        assert_eq!(agg.objects[0].label.as_deref(), Some("boat"));
    }

    #[test]
    fn test_hydrate_skips_unknown_ids() {
        let (db, id) = setup();
        let aggs = db.hydrate_images(&[id, 9999]).unwrap();
        assert_eq!(aggs.len(), 1);
        assert!(db.hydrate_images(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_keyword_remove_and_case_sensitivity() {
        let (db, id) = setup();
        db.apply_field_edits(
            id,
            &[keyword("Cat", OperationType::Add), keyword("cat", OperationType::Add)],
        )
        .unwrap();
        db.apply_field_edits(id, &[keyword("cat", OperationType::Remove)])
            .unwrap();

        let agg = db.hydrate_images(&[id]).unwrap().remove(0);
        assert_eq!(agg.keywords(), vec!["Cat"]);
    }

    #[test]
    fn test_face_region_add_and_remove() {
        let (db, id) = setup();
        let region = FaceRegion {
            name: Some("Jo".to_string()),
            x: 0.1,
            y: 0.1,
            w: 0.2,
            h: 0.2,
        };
        let add = FieldEdit::FaceRegion {
            region: region.clone(),
            op: OperationType::Add,
        };
        db.apply_field_edits(id, &[add.clone(), add]).unwrap();
        assert_eq!(db.hydrate_images(&[id]).unwrap()[0].objects.len(), 2);

        db.apply_field_edits(
            id,
            &[FieldEdit::FaceRegion {
                region,
                op: OperationType::Remove,
            }],
        )
        .unwrap();
        assert!(db.hydrate_images(&[id]).unwrap()[0].objects.is_empty());
    }

    #[test]
    fn test_apply_to_unknown_image_fails() {
        let (db, _) = setup();
        assert!(db
            .apply_field_edits(424242, &[keyword("x", OperationType::Add)])
            .is_err());
    }

    #[test]
    fn test_touch_marks_image_for_reindex() {
        let (db, id) = setup();
        assert_eq!(db.images_needing_reindex(10).unwrap().len(), 1);

        db.store_extracted_metadata(id, None, None).unwrap();
        assert!(db.images_needing_reindex(10).unwrap().is_empty());

        db.touch_image(id).unwrap();
        let pending = db.images_needing_reindex(10).unwrap();
        assert_eq!(pending, vec![(id, PathBuf::from("/photos/2024/beach.jpg"))]);
    }

    #[test]
    fn test_recently_modified_order() {
        let (db, first) = setup();
        let second = db.add_test_image("/photos/2024", "dunes.jpg").unwrap();
        db.touch_image(first).unwrap();
        db.touch_image(first).unwrap();

        let ids = db.recently_modified_image_ids(10).unwrap();
        assert_eq!(ids[0], first);
        assert!(ids.contains(&second));
        assert_eq!(db.recently_modified_image_ids(1).unwrap().len(), 1);
    }
}
