use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE user_info (
                id          BLOB PRIMARY KEY,
                account_id  TEXT NOT NULL UNIQUE,
                full_name   TEXT NOT NULL,
                avatar      TEXT NOT NULL DEFAULT '',
                type        TEXT NOT NULL DEFAULT 'INTERNAL',
                created_at  TEXT NOT NULL
            );

            CREATE TABLE conversation (
                id              BLOB PRIMARY KEY,
                type            TEXT NOT NULL CHECK (type IN ('DM', 'GROUP')),
                title           TEXT NOT NULL DEFAULT '',
                avatar          TEXT NOT NULL DEFAULT '',
                last_message_id BLOB,
                revision        INTEGER NOT NULL DEFAULT 0,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL,
                deleted_at      TEXT
            );

            CREATE TABLE conversation_member (
                id              BLOB PRIMARY KEY,
                conversation_id BLOB NOT NULL REFERENCES conversation(id),
                user_id         BLOB NOT NULL REFERENCES user_info(id),
                created_at      TEXT NOT NULL,
                UNIQUE(conversation_id, user_id)
            );

            CREATE INDEX idx_conversation_member_user
                ON conversation_member(user_id);

            CREATE TABLE message (
                id              BLOB PRIMARY KEY,
                conversation_id BLOB NOT NULL REFERENCES conversation(id),
                user_id         BLOB NOT NULL REFERENCES user_info(id),
                type            TEXT NOT NULL,
                body            TEXT NOT NULL,
                reply_to        BLOB,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL,
                deleted_at      TEXT
            );

            CREATE INDEX idx_message_conversation
                ON message(conversation_id, id);

            CREATE TABLE user_online (
                id              BLOB PRIMARY KEY,
                user_id         BLOB NOT NULL REFERENCES user_info(id),
                connection_id   BLOB NOT NULL UNIQUE,
                created_at      TEXT NOT NULL
            );

            CREATE INDEX idx_user_online_user
                ON user_online(user_id);

            CREATE TABLE seen_message (
                id              BLOB PRIMARY KEY,
                message_id      BLOB NOT NULL,
                user_id         BLOB NOT NULL REFERENCES user_info(id),
                conversation_id BLOB NOT NULL REFERENCES conversation(id),
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL,
                UNIQUE(user_id, conversation_id)
            );

            CREATE TABLE fcm_token (
                id          BLOB PRIMARY KEY,
                user_id     BLOB NOT NULL REFERENCES user_info(id),
                token       TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                UNIQUE(user_id, token)
            );

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
