use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (chats, messages)");
        conn.execute_batch(
            "
            CREATE TABLE chats (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                owner               TEXT NOT NULL,
                profile_pic_owner   TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE messages (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id     INTEGER NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
                author      TEXT NOT NULL,
                content     TEXT NOT NULL DEFAULT '',
                media_link  TEXT NOT NULL DEFAULT '',
                date        TEXT NOT NULL
            );

            CREATE INDEX idx_messages_chat ON messages(chat_id, id);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    if version < 2 {
        info!("Running migration v2 (downloadable files)");
        conn.execute_batch(
            "
            CREATE TABLE downloadable_files (
                id      INTEGER PRIMARY KEY AUTOINCREMENT,
                name    TEXT NOT NULL,
                url     TEXT NOT NULL,
                size    INTEGER NOT NULL DEFAULT 0
            );

            ALTER TABLE messages
                ADD COLUMN downloadable_id INTEGER REFERENCES downloadable_files(id);

            CREATE INDEX idx_messages_downloadable ON messages(downloadable_id);

            INSERT INTO schema_version (version) VALUES (2);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
