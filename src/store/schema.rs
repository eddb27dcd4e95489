//! DDL for both backends. Applied by `killfeed migrate` and at worker start.
//!
//! Postgres stores timestamps as `TIMESTAMPTZ` and payloads as `JSONB`;
//! SQLite stores timestamps as integer Unix milliseconds so range
//! comparisons stay numeric.

pub const POSTGRES: &str = r#"
CREATE TABLE IF NOT EXISTS log_streams (
    id          BIGSERIAL PRIMARY KEY,
    name        TEXT NOT NULL UNIQUE,
    generation  BIGINT NOT NULL DEFAULT 0,
    line_offset BIGINT NOT NULL DEFAULT 0 CHECK (line_offset >= 0),
    remote_path TEXT,
    last_fetch  TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS stream_events (
    id          BIGSERIAL PRIMARY KEY,
    stream_id   BIGINT NOT NULL REFERENCES log_streams(id),
    generation  BIGINT NOT NULL,
    line_offset BIGINT NOT NULL,
    kind        TEXT NOT NULL,
    payload     JSONB NOT NULL,
    x           DOUBLE PRECISION,
    z           DOUBLE PRECISION,
    occurred_at TIMESTAMPTZ NOT NULL,
    dispatched  BOOLEAN NOT NULL DEFAULT FALSE,
    UNIQUE (stream_id, generation, line_offset)
);
CREATE INDEX IF NOT EXISTS stream_events_pending
    ON stream_events (stream_id, generation, line_offset) WHERE NOT dispatched;
CREATE INDEX IF NOT EXISTS stream_events_combat
    ON stream_events (occurred_at) WHERE kind IN ('kill', 'death');

CREATE TABLE IF NOT EXISTS player_links (
    gamertag TEXT PRIMARY KEY,
    identity TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS clan_members (
    identity TEXT PRIMARY KEY,
    clan_tag TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS bases (
    id       BIGSERIAL PRIMARY KEY,
    owner_id TEXT NOT NULL UNIQUE,
    clan_tag TEXT,
    name     TEXT NOT NULL DEFAULT '',
    x        DOUBLE PRECISION NOT NULL,
    z        DOUBLE PRECISION NOT NULL,
    radius   DOUBLE PRECISION NOT NULL CHECK (radius > 0 AND radius <= 500)
);

CREATE TABLE IF NOT EXISTS player_stats (
    gamertag        TEXT PRIMARY KEY,
    kills           BIGINT NOT NULL DEFAULT 0,
    deaths          BIGINT NOT NULL DEFAULT 0,
    zombie_kills    BIGINT NOT NULL DEFAULT 0,
    fish_caught     BIGINT NOT NULL DEFAULT 0,
    placements      BIGINT NOT NULL DEFAULT 0,
    killstreak      BIGINT NOT NULL DEFAULT 0,
    best_killstreak BIGINT NOT NULL DEFAULT 0,
    longest_shot    DOUBLE PRECISION NOT NULL DEFAULT 0,
    updated_at      TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS achievement_progress (
    identity        TEXT NOT NULL,
    achievement_key TEXT NOT NULL,
    progress        BIGINT NOT NULL DEFAULT 0 CHECK (progress >= 0),
    unlocked        BOOLEAN NOT NULL DEFAULT FALSE,
    unlocked_at     TIMESTAMPTZ,
    updated_at      TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (identity, achievement_key)
);

CREATE TABLE IF NOT EXISTS activity_log (
    id         BIGSERIAL PRIMARY KEY,
    identity   TEXT NOT NULL,
    action     TEXT NOT NULL,
    details    TEXT NOT NULL DEFAULT '',
    created_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS economy_ledger (
    id         BIGSERIAL PRIMARY KEY,
    identity   TEXT NOT NULL,
    amount     BIGINT NOT NULL,
    reason     TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS economy_ledger_identity
    ON economy_ledger (identity, reason, created_at);

CREATE TABLE IF NOT EXISTS clan_wars (
    id          BIGSERIAL PRIMARY KEY,
    clan1_tag   TEXT NOT NULL,
    clan2_tag   TEXT NOT NULL,
    clan1_score BIGINT NOT NULL DEFAULT 0,
    clan2_score BIGINT NOT NULL DEFAULT 0,
    active      BOOLEAN NOT NULL DEFAULT TRUE,
    started_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
"#;

pub const SQLITE: &str = r#"
CREATE TABLE IF NOT EXISTS log_streams (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL UNIQUE,
    generation  INTEGER NOT NULL DEFAULT 0,
    line_offset INTEGER NOT NULL DEFAULT 0 CHECK (line_offset >= 0),
    remote_path TEXT,
    last_fetch  INTEGER
);

CREATE TABLE IF NOT EXISTS stream_events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    stream_id   INTEGER NOT NULL REFERENCES log_streams(id),
    generation  INTEGER NOT NULL,
    line_offset INTEGER NOT NULL,
    kind        TEXT NOT NULL,
    payload     TEXT NOT NULL,
    x           REAL,
    z           REAL,
    occurred_at INTEGER NOT NULL,
    dispatched  INTEGER NOT NULL DEFAULT 0,
    UNIQUE (stream_id, generation, line_offset)
);
CREATE INDEX IF NOT EXISTS stream_events_pending
    ON stream_events (stream_id, dispatched, generation, line_offset);
CREATE INDEX IF NOT EXISTS stream_events_combat
    ON stream_events (kind, occurred_at);

CREATE TABLE IF NOT EXISTS player_links (
    gamertag TEXT PRIMARY KEY,
    identity TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS clan_members (
    identity TEXT PRIMARY KEY,
    clan_tag TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS bases (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id TEXT NOT NULL UNIQUE,
    clan_tag TEXT,
    name     TEXT NOT NULL DEFAULT '',
    x        REAL NOT NULL,
    z        REAL NOT NULL,
    radius   REAL NOT NULL CHECK (radius > 0 AND radius <= 500)
);

CREATE TABLE IF NOT EXISTS player_stats (
    gamertag        TEXT PRIMARY KEY,
    kills           INTEGER NOT NULL DEFAULT 0,
    deaths          INTEGER NOT NULL DEFAULT 0,
    zombie_kills    INTEGER NOT NULL DEFAULT 0,
    fish_caught     INTEGER NOT NULL DEFAULT 0,
    placements      INTEGER NOT NULL DEFAULT 0,
    killstreak      INTEGER NOT NULL DEFAULT 0,
    best_killstreak INTEGER NOT NULL DEFAULT 0,
    longest_shot    REAL NOT NULL DEFAULT 0,
    updated_at      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS achievement_progress (
    identity        TEXT NOT NULL,
    achievement_key TEXT NOT NULL,
    progress        INTEGER NOT NULL DEFAULT 0 CHECK (progress >= 0),
    unlocked        INTEGER NOT NULL DEFAULT 0,
    unlocked_at     INTEGER,
    updated_at      INTEGER NOT NULL,
    PRIMARY KEY (identity, achievement_key)
);

CREATE TABLE IF NOT EXISTS activity_log (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    identity   TEXT NOT NULL,
    action     TEXT NOT NULL,
    details    TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS economy_ledger (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    identity   TEXT NOT NULL,
    amount     INTEGER NOT NULL,
    reason     TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS economy_ledger_identity
    ON economy_ledger (identity, reason, created_at);

CREATE TABLE IF NOT EXISTS clan_wars (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    clan1_tag   TEXT NOT NULL,
    clan2_tag   TEXT NOT NULL,
    clan1_score INTEGER NOT NULL DEFAULT 0,
    clan2_score INTEGER NOT NULL DEFAULT 0,
    active      INTEGER NOT NULL DEFAULT 1,
    started_at  INTEGER NOT NULL DEFAULT 0
);
"#;
