pub const SCHEMA: &str = r#"
-- Trading partners. One row is this server's own identity (see settings).
CREATE TABLE IF NOT EXISTS companies (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    sync_addr TEXT NOT NULL DEFAULT '',
    sync_api_key TEXT NOT NULL DEFAULT '',  -- sealed with the process sync key
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS companies_name_idx ON companies (lower(name));

-- Companies hold no user reference; the cycle is broken on this side.
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    company_id TEXT NOT NULL REFERENCES companies(id) ON DELETE CASCADE,
    username TEXT NOT NULL,
    email TEXT NOT NULL DEFAULT '',
    password_hash TEXT NOT NULL,
    role INTEGER NOT NULL CHECK (role IN (100, 110, 120, 200)),
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS users_username_idx ON users (lower(username));
CREATE INDEX IF NOT EXISTS users_company_idx ON users (company_id);

CREATE TABLE IF NOT EXISTS slices (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    slice_type TEXT NOT NULL CHECK (slice_type IN (
        'aces-file', 'aces-items', 'asset-files',
        'pies-file', 'pies-items', 'pies-marketcopy', 'pies-pricesheet',
        'partspro-file', 'partspro-items'
    )),
    content_hash TEXT,  -- NULL while the summary is unknown
    content_count INTEGER NOT NULL DEFAULT 0,
    content_date TEXT NOT NULL,
    allow_sync INTEGER NOT NULL DEFAULT 1,  -- 0 while a writer holds the slice
    sync_status TEXT NOT NULL DEFAULT 'none'
        CHECK (sync_status IN ('none', 'updating', 'success', 'error')),
    last_sync_attempt TEXT,
    last_good_sync TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS slices_name_idx ON slices (lower(name));

CREATE TABLE IF NOT EXISTS slice_metadata (
    slice_id TEXT NOT NULL REFERENCES slices(id) ON DELETE CASCADE,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (slice_id, key)
);

CREATE TABLE IF NOT EXISTS tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT ''
);
CREATE UNIQUE INDEX IF NOT EXISTS tags_name_idx ON tags (lower(name));

CREATE TABLE IF NOT EXISTS slice_tags (
    tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
    slice_id TEXT NOT NULL REFERENCES slices(id) ON DELETE CASCADE,
    PRIMARY KEY (tag_id, slice_id)
);

CREATE TABLE IF NOT EXISTS subscriptions (
    sub_id TEXT PRIMARY KEY,
    slice_id TEXT NOT NULL REFERENCES slices(id) ON DELETE CASCADE,
    company_id TEXT NOT NULL REFERENCES companies(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    UNIQUE (slice_id, company_id)
);
CREATE UNIQUE INDEX IF NOT EXISTS subscriptions_name_idx ON subscriptions (lower(name));
CREATE INDEX IF NOT EXISTS subscriptions_company_idx ON subscriptions (company_id);

-- Grains are never updated in place; replacement is delete + insert.
CREATE TABLE IF NOT EXISTS grains (
    id TEXT PRIMARY KEY,
    slice_id TEXT NOT NULL REFERENCES slices(id) ON DELETE CASCADE,
    grain_key TEXT NOT NULL CHECK (grain_key = lower(grain_key)),
    encoding TEXT NOT NULL CHECK (encoding IN ('raw', 'b64', 'z64', 'a85', 'z85')),
    payload TEXT NOT NULL,  -- streamed rows are stored as blobs of the same text
    source TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    UNIQUE (slice_id, grain_key)
);

CREATE TABLE IF NOT EXISTS activity (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sub_id TEXT,
    success INTEGER NOT NULL,
    message TEXT NOT NULL,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

-- Singleton: the primary key can only ever be TRUE.
CREATE TABLE IF NOT EXISTS settings (
    id BOOLEAN PRIMARY KEY DEFAULT TRUE CHECK (id),
    server_role TEXT NOT NULL CHECK (server_role IN ('primary', 'secondary')),
    server_id TEXT NOT NULL REFERENCES companies(id)
);
"#;
