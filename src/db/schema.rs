pub const SCHEMA: &str = r#"
-- Folders containing indexed images
CREATE TABLE IF NOT EXISTS folders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE
);

-- Images: one row per file
CREATE TABLE IF NOT EXISTS images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    folder_id INTEGER NOT NULL,
    file_name TEXT NOT NULL,
    file_size INTEGER NOT NULL DEFAULT 0,
    file_modified INTEGER,             -- epoch ms, from the filesystem
    last_updated INTEGER NOT NULL,     -- epoch ms, advanced on every write-back
    metadata_scanned_at INTEGER,       -- epoch ms, last metadata extraction
    UNIQUE (folder_id, file_name),
    FOREIGN KEY (folder_id) REFERENCES folders(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_images_last_updated ON images(last_updated);

-- Core metadata, both extracted and user-edited
CREATE TABLE IF NOT EXISTS image_metadata (
    image_id INTEGER PRIMARY KEY,
    width INTEGER,
    height INTEGER,
    date_taken TEXT,
    camera_make TEXT,
    camera_model TEXT,
    caption TEXT,
    description TEXT,
    copyright TEXT,
    rating INTEGER,
    rotation INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (image_id) REFERENCES images(id) ON DELETE CASCADE
);

-- Content hashes
CREATE TABLE IF NOT EXISTS hashes (
    image_id INTEGER PRIMARY KEY,
    sha256 TEXT NOT NULL,
    perceptual TEXT,
    FOREIGN KEY (image_id) REFERENCES images(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_hashes_sha256 ON hashes(sha256);

-- Keywords; identity is case-sensitive
CREATE TABLE IF NOT EXISTS tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    keyword TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS image_tags (
    image_id INTEGER NOT NULL,
    tag_id INTEGER NOT NULL,
    PRIMARY KEY (image_id, tag_id),
    FOREIGN KEY (image_id) REFERENCES images(id) ON DELETE CASCADE,
    FOREIGN KEY (tag_id) REFERENCES tags(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_image_tags_tag ON image_tags(tag_id);

-- Derived objects: faces and recognised objects with normalized rectangles
CREATE TABLE IF NOT EXISTS image_objects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    image_id INTEGER NOT NULL,
    kind TEXT NOT NULL,                -- 'face' or 'object'
    label TEXT,
    x REAL NOT NULL,
    y REAL NOT NULL,
    w REAL NOT NULL,
    h REAL NOT NULL,
    FOREIGN KEY (image_id) REFERENCES images(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_image_objects_image ON image_objects(image_id);

-- Append-only log of metadata edits awaiting write-back
CREATE TABLE IF NOT EXISTS pending_operations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    image_id INTEGER NOT NULL,
    field TEXT NOT NULL,
    op TEXT NOT NULL,                  -- 'add' or 'remove'
    payload TEXT NOT NULL,
    timestamp INTEGER NOT NULL,        -- epoch ms
    actor_id INTEGER,
    state TEXT NOT NULL DEFAULT 'pending',
    FOREIGN KEY (image_id) REFERENCES images(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_pending_operations_state_ts ON pending_operations(state, timestamp);
CREATE INDEX IF NOT EXISTS idx_pending_operations_image ON pending_operations(image_id);
"#;

/// Column additions for databases created by earlier versions.
pub const MIGRATIONS: &[&str] = &[
    // When an operation left the pending state; drives the retention sweep
    "ALTER TABLE pending_operations ADD COLUMN state_changed_at INTEGER",
];
