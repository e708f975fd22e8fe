use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id                      INTEGER PRIMARY KEY,
            username                TEXT NOT NULL UNIQUE,
            email                   TEXT NOT NULL UNIQUE,
            password_hash           TEXT NOT NULL,
            token                   TEXT UNIQUE,
            token_expires           TEXT,
            name                    TEXT,
            bio                     TEXT,
            picture                 TEXT,
            presence_status         INTEGER NOT NULL DEFAULT 0,
            in_foreground           INTEGER NOT NULL DEFAULT 0,
            shutdown_on_screen_off  INTEGER NOT NULL DEFAULT 0,
            last_online             TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_users_token ON users(token);

        CREATE TABLE IF NOT EXISTS messages (
            id                      INTEGER PRIMARY KEY,
            body                    TEXT NOT NULL,
            sent_at                 TEXT NOT NULL,
            sender_id               INTEGER NOT NULL REFERENCES users(id),
            recipient_id            INTEGER NOT NULL REFERENCES users(id),
            edited                  INTEGER NOT NULL DEFAULT 0,
            deleted_for_author      INTEGER NOT NULL DEFAULT 0,
            deleted_for_recipient   INTEGER NOT NULL DEFAULT 0,
            delivery_status         INTEGER NOT NULL DEFAULT 1
        );

        CREATE INDEX IF NOT EXISTS idx_messages_pair
            ON messages(sender_id, recipient_id, sent_at);

        CREATE TABLE IF NOT EXISTS abandoned_pictures (
            id          INTEGER PRIMARY KEY,
            path        TEXT NOT NULL,
            user_id     INTEGER NOT NULL REFERENCES users(id)
        );

        CREATE TABLE IF NOT EXISTS user_pov (
            id                      INTEGER PRIMARY KEY,
            pov_user_id             INTEGER NOT NULL REFERENCES users(id),
            user_id                 INTEGER NOT NULL REFERENCES users(id),
            display_name            TEXT,
            note                    TEXT,
            mute_until              TEXT,
            min_push_interval_secs  INTEGER,
            UNIQUE(pov_user_id, user_id)
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
