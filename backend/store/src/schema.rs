/// Schema for the session store. Applied on every open; all statements are idempotent.
pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id                   TEXT PRIMARY KEY,
    agent_id             TEXT NOT NULL,
    session_key          TEXT NOT NULL,
    status               TEXT NOT NULL DEFAULT 'active',
    token_count_estimate INTEGER NOT NULL DEFAULT 0,
    message_count        INTEGER NOT NULL DEFAULT 0,
    last_input_tokens    INTEGER NOT NULL DEFAULT 0,
    distillation_count   INTEGER NOT NULL DEFAULT 0,
    turn_count           INTEGER NOT NULL DEFAULT 0,
    parent_session_id    TEXT,
    thread_id            TEXT,
    working_state        TEXT,
    created_at           TEXT NOT NULL,
    updated_at           TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_live_key
    ON sessions(agent_id, session_key) WHERE status != 'archived';

CREATE TABLE IF NOT EXISTS messages (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id     TEXT NOT NULL REFERENCES sessions(id),
    seq            INTEGER NOT NULL,
    role           TEXT NOT NULL,
    content        TEXT NOT NULL,
    tool_call_id   TEXT,
    tool_name      TEXT,
    is_error       INTEGER NOT NULL DEFAULT 0,
    token_estimate INTEGER NOT NULL DEFAULT 0,
    is_distilled   INTEGER NOT NULL DEFAULT 0,
    created_at     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_session_seq ON messages(session_id, seq);

CREATE TABLE IF NOT EXISTS distillations (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id      TEXT NOT NULL,
    messages_before INTEGER NOT NULL,
    messages_after  INTEGER NOT NULL,
    tokens_before   INTEGER NOT NULL,
    tokens_after    INTEGER NOT NULL,
    facts_extracted INTEGER NOT NULL,
    model           TEXT NOT NULL,
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_distillations_session ON distillations(session_id);

CREATE TABLE IF NOT EXISTS notes (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    agent_id   TEXT NOT NULL,
    content    TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_notes_session ON notes(session_id);

CREATE TABLE IF NOT EXISTS blackboard (
    key             TEXT PRIMARY KEY,
    value           TEXT NOT NULL,
    author_agent_id TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    expires_at      TEXT
);

CREATE TABLE IF NOT EXISTS cross_agent_calls (
    id                TEXT PRIMARY KEY,
    source_agent_id   TEXT NOT NULL,
    source_session_id TEXT,
    target_agent_id   TEXT NOT NULL,
    target_session_id TEXT,
    kind              TEXT NOT NULL,
    content           TEXT NOT NULL,
    response          TEXT,
    status            TEXT NOT NULL,
    created_at        TEXT NOT NULL,
    completed_at      TEXT
);
CREATE INDEX IF NOT EXISTS idx_calls_source ON cross_agent_calls(source_agent_id);

CREATE TABLE IF NOT EXISTS interaction_signals (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT,
    agent_id   TEXT NOT NULL,
    kind       TEXT NOT NULL,
    detail     TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS thread_summaries (
    thread_id  TEXT PRIMARY KEY,
    agent_id   TEXT NOT NULL,
    summary    TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";
