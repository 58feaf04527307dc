pub const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Uploaded videos (written by the upload flow, read by jobs)
CREATE TABLE IF NOT EXISTS videos (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    filename TEXT NOT NULL,
    original_filename TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    duration REAL,
    frame_count INTEGER,
    width INTEGER,
    height INTEGER,
    status TEXT NOT NULL DEFAULT 'uploaded',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_videos_status ON videos(status);

-- Reference faces for person search
CREATE TABLE IF NOT EXISTS reference_images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    filename TEXT NOT NULL,
    original_filename TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    description TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS analysis_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    video_id INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    progress INTEGER NOT NULL DEFAULT 0,
    error_code TEXT,
    error_message TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    FOREIGN KEY (video_id) REFERENCES videos(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_analysis_jobs_video ON analysis_jobs(video_id, created_at);

-- At most one active analysis job per video
CREATE UNIQUE INDEX IF NOT EXISTS idx_analysis_jobs_active
    ON analysis_jobs(video_id) WHERE status IN ('pending', 'running');

-- One result per completed analysis job
CREATE TABLE IF NOT EXISTS analysis_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER NOT NULL UNIQUE,
    video_id INTEGER NOT NULL,
    total_frames INTEGER NOT NULL,
    total_people INTEGER NOT NULL,
    unique_people INTEGER NOT NULL,
    people_per_frame TEXT NOT NULL,  -- JSON array
    tracking_data TEXT NOT NULL,     -- JSON array
    created_at TEXT NOT NULL,
    FOREIGN KEY (job_id) REFERENCES analysis_jobs(id) ON DELETE CASCADE,
    FOREIGN KEY (video_id) REFERENCES videos(id) ON DELETE CASCADE
);

-- Consolidated identities of one analysis result
CREATE TABLE IF NOT EXISTS persons (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    analysis_result_id INTEGER NOT NULL,
    video_id INTEGER NOT NULL,
    person_number INTEGER NOT NULL,
    first_frame INTEGER NOT NULL,
    last_frame INTEGER NOT NULL,
    first_seen REAL NOT NULL,
    last_seen REAL NOT NULL,
    total_frames INTEGER NOT NULL,
    FOREIGN KEY (analysis_result_id) REFERENCES analysis_results(id) ON DELETE CASCADE,
    FOREIGN KEY (video_id) REFERENCES videos(id) ON DELETE CASCADE,
    UNIQUE (analysis_result_id, person_number)
);

CREATE TABLE IF NOT EXISTS person_faces (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    person_id INTEGER NOT NULL,
    video_id INTEGER NOT NULL,
    frame_number INTEGER NOT NULL,
    timestamp REAL NOT NULL,
    bbox_x REAL NOT NULL,
    bbox_y REAL NOT NULL,
    bbox_w REAL NOT NULL,
    bbox_h REAL NOT NULL,
    confidence REAL NOT NULL,
    face_image BLOB NOT NULL,
    is_best_face INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (person_id) REFERENCES persons(id) ON DELETE CASCADE,
    FOREIGN KEY (video_id) REFERENCES videos(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_person_faces_person ON person_faces(person_id);

-- At most one best face per person
CREATE UNIQUE INDEX IF NOT EXISTS idx_person_faces_best
    ON person_faces(person_id) WHERE is_best_face = 1;

CREATE TABLE IF NOT EXISTS search_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    reference_image_id INTEGER NOT NULL,
    video_ids TEXT NOT NULL,  -- JSON array, empty = all analyzed videos
    status TEXT NOT NULL DEFAULT 'pending',
    progress INTEGER NOT NULL DEFAULT 0,
    error_code TEXT,
    error_message TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    FOREIGN KEY (reference_image_id) REFERENCES reference_images(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_search_jobs_reference ON search_jobs(reference_image_id, created_at);

CREATE TABLE IF NOT EXISTS search_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    search_job_id INTEGER NOT NULL,
    video_id INTEGER NOT NULL,
    reference_image_id INTEGER NOT NULL,
    matches TEXT NOT NULL,  -- JSON array
    first_appearance REAL NOT NULL,
    last_appearance REAL NOT NULL,
    total_appearances INTEGER NOT NULL,
    confidence REAL NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (search_job_id) REFERENCES search_jobs(id) ON DELETE CASCADE,
    FOREIGN KEY (video_id) REFERENCES videos(id) ON DELETE CASCADE,
    FOREIGN KEY (reference_image_id) REFERENCES reference_images(id) ON DELETE CASCADE,
    UNIQUE (search_job_id, video_id)
);
"#;
