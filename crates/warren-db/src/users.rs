use argon2::{
    password_hash::{rand_core::OsRng, SaltString},
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::{PovRow, UserRow};
use crate::{Database, StoreError};

/// Default bearer token lifetime.
pub const TOKEN_TTL_SECS: i64 = 3600;

/// An existing token with more validity left than this is reused
/// instead of minting a new one.
const TOKEN_FRESHNESS_SECS: i64 = 60;

const RESET_TTL_SECS: i64 = 600;

pub fn hash_password(password: &str) -> Result<String, StoreError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| StoreError::Internal(anyhow::anyhow!("password hash failed: {}", e)))
}

fn verify_password(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

pub(crate) fn parse_ts(raw: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>().unwrap_or_else(|e| {
        warn!("Corrupt timestamp '{}': {}", raw, e);
        DateTime::default()
    })
}

/// Fields of a partial profile update. `picture` distinguishes
/// "leave alone" (None) from "clear" (Some(None)).
#[derive(Debug, Default)]
pub struct ProfilePatch {
    pub name: Option<String>,
    pub bio: Option<String>,
    pub email: Option<String>,
    pub picture: Option<Option<String>>,
    pub presence_status: Option<i64>,
    pub in_foreground: Option<bool>,
    pub shutdown_on_screen_off: Option<bool>,
}

impl Database {
    // -- Accounts --

    pub fn create_user(
        &self,
        username: &str,
        email: &str,
        password: &str,
        name: Option<&str>,
        bio: Option<&str>,
    ) -> Result<UserRow, StoreError> {
        if username.is_empty() || email.is_empty() || password.is_empty() {
            return Err(StoreError::validation(
                "Must include username, email and password fields",
            ));
        }

        let password_hash = hash_password(password)?;

        self.with_conn(|conn| {
            if user_by_username(conn, username)?.is_some() {
                return Err(StoreError::validation("Please use a different username"));
            }
            if user_by_email(conn, email)?.is_some() {
                return Err(StoreError::validation(
                    "Please use a different email address",
                ));
            }

            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO users (username, email, password_hash, name, bio, last_online)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![username, email, password_hash, name, bio, now],
            )?;
            let id = conn.last_insert_rowid();

            user_by_id(conn, id)?.ok_or(StoreError::NotFound)
        })
    }

    pub fn authenticate(&self, username: &str, password: &str) -> Result<UserRow, StoreError> {
        let user = self
            .with_conn(|conn| user_by_username(conn, username))?
            .ok_or(StoreError::Auth)?;

        if verify_password(password, &user.password_hash) {
            Ok(user)
        } else {
            Err(StoreError::Auth)
        }
    }

    // -- Bearer tokens --

    /// Returns the user's current token, minting a new one unless the
    /// existing token still has more than the freshness window left.
    pub fn issue_token(&self, user_id: i64) -> Result<(String, DateTime<Utc>), StoreError> {
        self.with_conn(|conn| {
            let user = user_by_id(conn, user_id)?.ok_or(StoreError::NotFound)?;
            let now = Utc::now();

            if let (Some(token), Some(expires)) = (&user.token, user.token_expires) {
                if expires > now + Duration::seconds(TOKEN_FRESHNESS_SECS) {
                    return Ok((token.clone(), expires));
                }
            }

            let mut raw = [0u8; 24];
            rand::rng().fill_bytes(&mut raw);
            let token = B64.encode(raw);
            let expires = now + Duration::seconds(TOKEN_TTL_SECS);

            conn.execute(
                "UPDATE users SET token = ?1, token_expires = ?2 WHERE id = ?3",
                rusqlite::params![token, expires.to_rfc3339(), user_id],
            )?;

            Ok((token, expires))
        })
    }

    pub fn revoke_token(&self, user_id: i64) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let expired = (Utc::now() - Duration::seconds(1)).to_rfc3339();
            conn.execute(
                "UPDATE users SET token_expires = ?1 WHERE id = ?2",
                rusqlite::params![expired, user_id],
            )?;
            Ok(())
        })
    }

    pub fn verify_token(&self, token: &str) -> Result<UserRow, StoreError> {
        let user = self
            .with_conn(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM users WHERE token = ?1",
                    USER_COLUMNS
                ))?;
                let row = stmt.query_row([token], map_user).optional()?;
                Ok(row)
            })?
            .ok_or(StoreError::Auth)?;

        match user.token_expires {
            Some(expires) if expires > Utc::now() => Ok(user),
            _ => Err(StoreError::Auth),
        }
    }

    // -- Password reset --

    pub fn reset_password(
        &self,
        reset_token: &str,
        secret: &str,
        new_password: &str,
    ) -> Result<(), StoreError> {
        let user_id = verify_reset_token(reset_token, secret).ok_or(StoreError::Auth)?;
        let password_hash = hash_password(new_password)?;

        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET password_hash = ?1 WHERE id = ?2",
                rusqlite::params![password_hash, user_id],
            )?;
            if changed == 0 {
                return Err(StoreError::Auth);
            }
            Ok(())
        })
    }

    // -- Lookups --

    pub fn get_user_by_id(&self, id: i64) -> Result<Option<UserRow>, StoreError> {
        self.with_conn(|conn| user_by_id(conn, id))
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>, StoreError> {
        self.with_conn(|conn| user_by_username(conn, username))
    }

    /// One page of users ordered by username, plus the total count.
    pub fn list_users(&self, page: u32, per_page: u32) -> Result<(Vec<UserRow>, u64), StoreError> {
        self.with_conn(|conn| {
            let total: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;

            let offset = (page.saturating_sub(1) as i64) * per_page as i64;
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM users ORDER BY username LIMIT ?1 OFFSET ?2",
                USER_COLUMNS
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![per_page, offset], map_user)?
                .collect::<Result<Vec<_>, _>>()?;

            Ok((rows, total as u64))
        })
    }

    // -- Profile --

    pub fn update_user(&self, user_id: i64, patch: ProfilePatch) -> Result<UserRow, StoreError> {
        self.with_conn(|conn| {
            let user = user_by_id(conn, user_id)?.ok_or(StoreError::NotFound)?;

            if let Some(email) = &patch.email {
                if *email != user.email && user_by_email(conn, email)?.is_some() {
                    return Err(StoreError::validation("Please use different email address"));
                }
                conn.execute(
                    "UPDATE users SET email = ?1 WHERE id = ?2",
                    rusqlite::params![email, user_id],
                )?;
            }
            if let Some(name) = &patch.name {
                conn.execute(
                    "UPDATE users SET name = ?1 WHERE id = ?2",
                    rusqlite::params![name, user_id],
                )?;
            }
            if let Some(bio) = &patch.bio {
                conn.execute(
                    "UPDATE users SET bio = ?1 WHERE id = ?2",
                    rusqlite::params![bio, user_id],
                )?;
            }
            if let Some(picture) = &patch.picture {
                // Displacing an existing picture leaves an audit row
                // behind for cleanup.
                if let Some(old) = &user.picture {
                    abandon_picture(conn, user_id, old)?;
                }
                conn.execute(
                    "UPDATE users SET picture = ?1 WHERE id = ?2",
                    rusqlite::params![picture, user_id],
                )?;
            }
            if let Some(status) = patch.presence_status {
                conn.execute(
                    "UPDATE users SET presence_status = ?1 WHERE id = ?2",
                    rusqlite::params![status, user_id],
                )?;
            }
            if let Some(fg) = patch.in_foreground {
                conn.execute(
                    "UPDATE users SET in_foreground = ?1 WHERE id = ?2",
                    rusqlite::params![fg, user_id],
                )?;
            }
            if let Some(screen) = patch.shutdown_on_screen_off {
                conn.execute(
                    "UPDATE users SET shutdown_on_screen_off = ?1 WHERE id = ?2",
                    rusqlite::params![screen, user_id],
                )?;
            }

            user_by_id(conn, user_id)?.ok_or(StoreError::NotFound)
        })
    }

    pub fn delete_picture(&self, user_id: i64) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let user = user_by_id(conn, user_id)?.ok_or(StoreError::NotFound)?;
            if let Some(old) = &user.picture {
                abandon_picture(conn, user_id, old)?;
                conn.execute(
                    "UPDATE users SET picture = NULL WHERE id = ?1",
                    [user_id],
                )?;
            }
            Ok(())
        })
    }

    pub fn abandoned_pictures(&self, user_id: i64) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT path FROM abandoned_pictures WHERE user_id = ?1 ORDER BY id")?;
            let rows = stmt
                .query_map([user_id], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(rows)
        })
    }

    /// Presence driven by the gateway: status change plus a last-online
    /// touch.
    pub fn set_presence(&self, user_id: i64, status: i64) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET presence_status = ?1, last_online = ?2 WHERE id = ?3",
                rusqlite::params![status, Utc::now().to_rfc3339(), user_id],
            )?;
            Ok(())
        })
    }

    // -- Per-viewer annotations --

    pub fn upsert_pov(
        &self,
        pov_user_id: i64,
        user_id: i64,
        display_name: Option<&str>,
        note: Option<&str>,
        mute_until: Option<DateTime<Utc>>,
        min_push_interval_secs: Option<i64>,
    ) -> Result<PovRow, StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO user_pov
                     (pov_user_id, user_id, display_name, note, mute_until, min_push_interval_secs)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(pov_user_id, user_id) DO UPDATE SET
                     display_name = excluded.display_name,
                     note = excluded.note,
                     mute_until = excluded.mute_until,
                     min_push_interval_secs = excluded.min_push_interval_secs",
                rusqlite::params![
                    pov_user_id,
                    user_id,
                    display_name,
                    note,
                    mute_until.map(|t| t.to_rfc3339()),
                    min_push_interval_secs
                ],
            )?;

            pov_for(conn, pov_user_id, user_id)?.ok_or(StoreError::NotFound)
        })
    }

    pub fn get_pov(&self, pov_user_id: i64, user_id: i64) -> Result<Option<PovRow>, StoreError> {
        self.with_conn(|conn| pov_for(conn, pov_user_id, user_id))
    }
}

// -- Signed reset credentials --

#[derive(Debug, Serialize, Deserialize)]
struct ResetClaims {
    reset_password: i64,
    exp: usize,
}

pub fn reset_token(user_id: i64, secret: &str) -> Result<String, StoreError> {
    let claims = ResetClaims {
        reset_password: user_id,
        exp: (Utc::now() + Duration::seconds(RESET_TTL_SECS)).timestamp() as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| StoreError::Internal(e.into()))
}

/// Any decode, signature, or expiry failure yields `None`.
pub fn verify_reset_token(token: &str, secret: &str) -> Option<i64> {
    decode::<ResetClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .ok()
    .map(|data| data.claims.reset_password)
}

// -- Row plumbing --

const USER_COLUMNS: &str = "id, username, email, password_hash, token, token_expires, \
     name, bio, picture, presence_status, in_foreground, shutdown_on_screen_off, last_online";

fn map_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        token: row.get(4)?,
        token_expires: row
            .get::<_, Option<String>>(5)?
            .map(|raw| parse_ts(&raw)),
        name: row.get(6)?,
        bio: row.get(7)?,
        picture: row.get(8)?,
        presence_status: row.get(9)?,
        in_foreground: row.get(10)?,
        shutdown_on_screen_off: row.get(11)?,
        last_online: parse_ts(&row.get::<_, String>(12)?),
    })
}

fn user_by_id(conn: &Connection, id: i64) -> Result<Option<UserRow>, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS))?;
    Ok(stmt.query_row([id], map_user).optional()?)
}

fn user_by_username(conn: &Connection, username: &str) -> Result<Option<UserRow>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM users WHERE username = ?1",
        USER_COLUMNS
    ))?;
    Ok(stmt.query_row([username], map_user).optional()?)
}

fn user_by_email(conn: &Connection, email: &str) -> Result<Option<UserRow>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM users WHERE email = ?1",
        USER_COLUMNS
    ))?;
    Ok(stmt.query_row([email], map_user).optional()?)
}

fn abandon_picture(conn: &Connection, user_id: i64, path: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO abandoned_pictures (path, user_id) VALUES (?1, ?2)",
        rusqlite::params![path, user_id],
    )?;
    Ok(())
}

fn pov_for(
    conn: &Connection,
    pov_user_id: i64,
    user_id: i64,
) -> Result<Option<PovRow>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, pov_user_id, user_id, display_name, note, mute_until, min_push_interval_secs
         FROM user_pov WHERE pov_user_id = ?1 AND user_id = ?2",
    )?;
    Ok(stmt
        .query_row([pov_user_id, user_id], |row| {
            Ok(PovRow {
                id: row.get(0)?,
                pov_user_id: row.get(1)?,
                user_id: row.get(2)?,
                display_name: row.get(3)?,
                note: row.get(4)?,
                mute_until: row
                    .get::<_, Option<String>>(5)?
                    .map(|raw| parse_ts(&raw)),
                min_push_interval_secs: row.get(6)?,
            })
        })
        .optional()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn create_then_authenticate_returns_same_id() {
        let db = db();
        let created = db
            .create_user("carrot", "carrot@example.com", "hunter22", None, None)
            .unwrap();
        let authed = db.authenticate("carrot", "hunter22").unwrap();
        assert_eq!(created.id, authed.id);
    }

    #[test]
    fn wrong_password_is_an_auth_error() {
        let db = db();
        db.create_user("carrot", "carrot@example.com", "hunter22", None, None)
            .unwrap();
        assert!(matches!(
            db.authenticate("carrot", "nope"),
            Err(StoreError::Auth)
        ));
        assert!(matches!(
            db.authenticate("nobody", "hunter22"),
            Err(StoreError::Auth)
        ));
    }

    #[test]
    fn duplicate_username_and_email_are_validation_errors() {
        let db = db();
        db.create_user("carrot", "carrot@example.com", "hunter22", None, None)
            .unwrap();
        assert!(matches!(
            db.create_user("carrot", "other@example.com", "x", None, None),
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            db.create_user("other", "carrot@example.com", "x", None, None),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn fresh_token_is_reused_not_reminted() {
        let db = db();
        let user = db
            .create_user("carrot", "carrot@example.com", "hunter22", None, None)
            .unwrap();

        let (first, _) = db.issue_token(user.id).unwrap();
        let (second, _) = db.issue_token(user.id).unwrap();
        assert_eq!(first, second);

        let verified = db.verify_token(&first).unwrap();
        assert_eq!(verified.id, user.id);
    }

    #[test]
    fn revoked_token_fails_verification_and_is_replaced() {
        let db = db();
        let user = db
            .create_user("carrot", "carrot@example.com", "hunter22", None, None)
            .unwrap();

        let (token, _) = db.issue_token(user.id).unwrap();
        db.revoke_token(user.id).unwrap();
        assert!(matches!(db.verify_token(&token), Err(StoreError::Auth)));

        let (fresh, _) = db.issue_token(user.id).unwrap();
        assert_ne!(token, fresh);
    }

    #[test]
    fn reset_token_fails_closed() {
        assert_eq!(verify_reset_token("garbage", "secret"), None);

        let token = reset_token(7, "secret").unwrap();
        assert_eq!(verify_reset_token(&token, "secret"), Some(7));
        // Wrong secret: signature check must reject.
        assert_eq!(verify_reset_token(&token, "other-secret"), None);
    }

    #[test]
    fn reset_password_changes_credentials() {
        let db = db();
        let user = db
            .create_user("carrot", "carrot@example.com", "hunter22", None, None)
            .unwrap();

        let token = reset_token(user.id, "secret").unwrap();
        db.reset_password(&token, "secret", "newpassword").unwrap();

        assert!(db.authenticate("carrot", "hunter22").is_err());
        assert!(db.authenticate("carrot", "newpassword").is_ok());
    }

    #[test]
    fn replacing_picture_abandons_the_old_one() {
        let db = db();
        let user = db
            .create_user("carrot", "carrot@example.com", "hunter22", None, None)
            .unwrap();

        let patch = ProfilePatch {
            picture: Some(Some("/files/a.png".into())),
            ..Default::default()
        };
        db.update_user(user.id, patch).unwrap();
        assert!(db.abandoned_pictures(user.id).unwrap().is_empty());

        let patch = ProfilePatch {
            picture: Some(Some("/files/b.png".into())),
            ..Default::default()
        };
        let updated = db.update_user(user.id, patch).unwrap();
        assert_eq!(updated.picture.as_deref(), Some("/files/b.png"));
        assert_eq!(db.abandoned_pictures(user.id).unwrap(), vec!["/files/a.png"]);

        db.delete_picture(user.id).unwrap();
        let user = db.get_user_by_id(user.id).unwrap().unwrap();
        assert!(user.picture.is_none());
        assert_eq!(
            db.abandoned_pictures(user.id).unwrap(),
            vec!["/files/a.png", "/files/b.png"]
        );
    }

    #[test]
    fn duplicate_email_update_is_rejected() {
        let db = db();
        db.create_user("carrot", "carrot@example.com", "x", None, None)
            .unwrap();
        let other = db
            .create_user("turnip", "turnip@example.com", "x", None, None)
            .unwrap();

        let patch = ProfilePatch {
            email: Some("carrot@example.com".into()),
            ..Default::default()
        };
        assert!(matches!(
            db.update_user(other.id, patch),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn pov_upsert_keeps_one_row_per_pair() {
        let db = db();
        let a = db
            .create_user("carrot", "carrot@example.com", "x", None, None)
            .unwrap();
        let b = db
            .create_user("turnip", "turnip@example.com", "x", None, None)
            .unwrap();

        let first = db
            .upsert_pov(a.id, b.id, Some("Mr. T"), None, None, Some(120))
            .unwrap();
        let second = db
            .upsert_pov(a.id, b.id, Some("Turnip"), Some("met at work"), None, None)
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.display_name.as_deref(), Some("Turnip"));
        assert!(second.min_push_interval_secs.is_none());
        assert!(db.get_pov(b.id, a.id).unwrap().is_none());
    }

    #[test]
    fn user_listing_pages_and_counts() {
        let db = db();
        for i in 0..25 {
            db.create_user(
                &format!("user{:02}", i),
                &format!("u{}@example.com", i),
                "x",
                None,
                None,
            )
            .unwrap();
        }

        let (page1, total) = db.list_users(1, 10).unwrap();
        assert_eq!(page1.len(), 10);
        assert_eq!(total, 25);

        let (page3, _) = db.list_users(3, 10).unwrap();
        assert_eq!(page3.len(), 5);
    }
}
