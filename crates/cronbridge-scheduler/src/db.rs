use rusqlite::Connection;

/// Initialise the queue scheduler schema in `conn`.
///
/// Creates the `queue_actions` table (idempotent) plus the indexes used by
/// the claim query and by per-hook lookups.
pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS queue_actions (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            hook          TEXT    NOT NULL,
            args          TEXT    NOT NULL,   -- JSON array
            args_sig      TEXT    NOT NULL,   -- sha256 of args, for exact matching
            group_name    TEXT    NOT NULL DEFAULT '',
            status        TEXT    NOT NULL DEFAULT 'pending',
            scheduled_at  INTEGER NOT NULL,   -- unix seconds
            interval_secs INTEGER,            -- NULL for one-shot actions
            attempts      INTEGER NOT NULL DEFAULT 0,
            last_error    TEXT,
            finished_at   INTEGER,            -- unix seconds, set on complete/failed/canceled
            created_at    TEXT    NOT NULL,
            updated_at    TEXT    NOT NULL
        ) STRICT;

        -- Claim query: WHERE status = 'pending' AND scheduled_at <= ? ORDER BY scheduled_at
        CREATE INDEX IF NOT EXISTS idx_queue_actions_due
            ON queue_actions (status, scheduled_at);
        CREATE INDEX IF NOT EXISTS idx_queue_actions_hook
            ON queue_actions (hook, status);
        ",
    )
}
