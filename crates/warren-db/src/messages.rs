use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use warren_types::models::{ConversationSide, DeliveryStatus};

use crate::models::MessageRow;
use crate::users::parse_ts;
use crate::{Database, StoreError};

impl Database {
    // -- Messages --

    /// Appends a message at status `Sent` with a server-assigned
    /// timestamp. Durable before this returns.
    pub fn append_message(
        &self,
        sender_id: i64,
        recipient_id: i64,
        body: &str,
    ) -> Result<MessageRow, StoreError> {
        if body.is_empty() {
            return Err(StoreError::validation("Message body must not be empty"));
        }

        self.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO messages (body, sent_at, sender_id, recipient_id, delivery_status)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    body,
                    now,
                    sender_id,
                    recipient_id,
                    DeliveryStatus::Sent.as_i64()
                ],
            )?;
            let id = conn.last_insert_rowid();
            message_by_id(conn, id)?.ok_or(StoreError::NotFound)
        })
    }

    pub fn get_message(&self, id: i64) -> Result<Option<MessageRow>, StoreError> {
        self.with_conn(|conn| message_by_id(conn, id))
    }

    /// One page of the conversation between `viewer` and `other`,
    /// ascending by time. Rows the viewer soft-deleted on their side
    /// are excluded; the other side's view is unaffected.
    pub fn conversation(
        &self,
        viewer_id: i64,
        other_id: i64,
        page: u32,
        per_page: u32,
    ) -> Result<(Vec<MessageRow>, u64), StoreError> {
        self.with_conn(|conn| {
            let visible = "((sender_id = ?1 AND recipient_id = ?2 AND deleted_for_author = 0)
                 OR (sender_id = ?2 AND recipient_id = ?1 AND deleted_for_recipient = 0))";

            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM messages WHERE {}", visible),
                [viewer_id, other_id],
                |row| row.get(0),
            )?;

            let offset = (page.saturating_sub(1) as i64) * per_page as i64;
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM messages WHERE {} ORDER BY sent_at, id LIMIT ?3 OFFSET ?4",
                MESSAGE_COLUMNS, visible
            ))?;
            let rows = stmt
                .query_map(
                    rusqlite::params![viewer_id, other_id, per_page, offset],
                    map_message,
                )?
                .collect::<Result<Vec<_>, _>>()?;

            Ok((rows, total as u64))
        })
    }

    /// Single forward transition. The store validates and rejects;
    /// it never clamps.
    pub fn set_delivery_status(
        &self,
        message_id: i64,
        to: DeliveryStatus,
    ) -> Result<MessageRow, StoreError> {
        self.with_conn(|conn| {
            let row = message_by_id(conn, message_id)?.ok_or(StoreError::NotFound)?;
            let current = DeliveryStatus::from_i64(row.delivery_status).ok_or_else(|| {
                StoreError::Internal(anyhow::anyhow!(
                    "corrupt delivery status {} on message {}",
                    row.delivery_status,
                    row.id
                ))
            })?;

            let next = current.advance_to(to)?;
            conn.execute(
                "UPDATE messages SET delivery_status = ?1 WHERE id = ?2",
                rusqlite::params![next.as_i64(), message_id],
            )?;

            message_by_id(conn, message_id)?.ok_or(StoreError::NotFound)
        })
    }

    /// Bulk `Sent -> Received` for everything `sender` has pending
    /// toward `recipient`. Used when the recipient fetches history or
    /// comes online; rows already past `Sent` are untouched.
    pub fn mark_received(&self, recipient_id: i64, sender_id: i64) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET delivery_status = ?1
                 WHERE recipient_id = ?2 AND sender_id = ?3 AND delivery_status = ?4",
                rusqlite::params![
                    DeliveryStatus::Received.as_i64(),
                    recipient_id,
                    sender_id,
                    DeliveryStatus::Sent.as_i64()
                ],
            )?;
            Ok(changed)
        })
    }

    /// Per-side soft delete. The body stays in storage; only that
    /// side's view loses the row.
    pub fn soft_delete(&self, message_id: i64, side: ConversationSide) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let column = match side {
                ConversationSide::Author => "deleted_for_author",
                ConversationSide::Recipient => "deleted_for_recipient",
            };
            let changed = conn.execute(
                &format!("UPDATE messages SET {} = 1 WHERE id = ?1", column),
                [message_id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
    }

    /// Replaces the body and flags the row as edited. Timestamp and
    /// delivery status are untouched.
    pub fn edit_message(&self, message_id: i64, body: &str) -> Result<MessageRow, StoreError> {
        if body.is_empty() {
            return Err(StoreError::validation("Message body must not be empty"));
        }

        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET body = ?1, edited = 1 WHERE id = ?2",
                rusqlite::params![body, message_id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound);
            }
            message_by_id(conn, message_id)?.ok_or(StoreError::NotFound)
        })
    }
}

const MESSAGE_COLUMNS: &str = "id, body, sent_at, sender_id, recipient_id, edited, \
     deleted_for_author, deleted_for_recipient, delivery_status";

fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        body: row.get(1)?,
        sent_at: parse_ts(&row.get::<_, String>(2)?),
        sender_id: row.get(3)?,
        recipient_id: row.get(4)?,
        edited: row.get(5)?,
        deleted_for_author: row.get(6)?,
        deleted_for_recipient: row.get(7)?,
        delivery_status: row.get(8)?,
    })
}

fn message_by_id(conn: &Connection, id: i64) -> Result<Option<MessageRow>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM messages WHERE id = ?1",
        MESSAGE_COLUMNS
    ))?;
    Ok(stmt.query_row([id], map_message).optional()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with_pair() -> (Database, i64, i64) {
        let db = Database::open_in_memory().unwrap();
        let a = db
            .create_user("alice", "alice@example.com", "x", None, None)
            .unwrap();
        let b = db
            .create_user("bob", "bob@example.com", "x", None, None)
            .unwrap();
        (db, a.id, b.id)
    }

    #[test]
    fn append_starts_at_sent() {
        let (db, a, b) = db_with_pair();
        let msg = db.append_message(a, b, "hi").unwrap();
        assert_eq!(msg.delivery_status, DeliveryStatus::Sent.as_i64());
        assert!(!msg.edited);
    }

    #[test]
    fn empty_body_is_rejected() {
        let (db, a, b) = db_with_pair();
        assert!(matches!(
            db.append_message(a, b, ""),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn status_only_moves_forward() {
        let (db, a, b) = db_with_pair();
        let msg = db.append_message(a, b, "hi").unwrap();

        let msg = db
            .set_delivery_status(msg.id, DeliveryStatus::Received)
            .unwrap();
        assert_eq!(msg.delivery_status, DeliveryStatus::Received.as_i64());

        // Backward move rejected, state unchanged.
        let err = db
            .set_delivery_status(msg.id, DeliveryStatus::Sent)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition(_)));
        let row = db.get_message(msg.id).unwrap().unwrap();
        assert_eq!(row.delivery_status, DeliveryStatus::Received.as_i64());

        let msg = db
            .set_delivery_status(msg.id, DeliveryStatus::Read)
            .unwrap();
        assert_eq!(msg.delivery_status, DeliveryStatus::Read.as_i64());
    }

    #[test]
    fn skip_from_sent_to_read_is_rejected() {
        let (db, a, b) = db_with_pair();
        let msg = db.append_message(a, b, "hi").unwrap();
        assert!(matches!(
            db.set_delivery_status(msg.id, DeliveryStatus::Read),
            Err(StoreError::InvalidTransition(_))
        ));
    }

    #[test]
    fn soft_delete_is_per_side() {
        let (db, a, b) = db_with_pair();
        let msg = db.append_message(a, b, "hi").unwrap();

        db.soft_delete(msg.id, ConversationSide::Author).unwrap();

        // Author's view loses the row, recipient's keeps it.
        let (for_author, _) = db.conversation(a, b, 1, 10).unwrap();
        assert!(for_author.is_empty());
        let (for_recipient, _) = db.conversation(b, a, 1, 10).unwrap();
        assert_eq!(for_recipient.len(), 1);

        // Hidden on both sides: gone from both views, still in storage.
        db.soft_delete(msg.id, ConversationSide::Recipient).unwrap();
        let (for_recipient, _) = db.conversation(b, a, 1, 10).unwrap();
        assert!(for_recipient.is_empty());
        assert!(db.get_message(msg.id).unwrap().is_some());
    }

    #[test]
    fn conversation_is_ascending_and_paginated() {
        let (db, a, b) = db_with_pair();
        for i in 0..7 {
            // Alternate directions; ordering is by time, not sender.
            if i % 2 == 0 {
                db.append_message(a, b, &format!("m{}", i)).unwrap();
            } else {
                db.append_message(b, a, &format!("m{}", i)).unwrap();
            }
        }

        let (page1, total) = db.conversation(a, b, 1, 5).unwrap();
        assert_eq!(total, 7);
        assert_eq!(page1.len(), 5);
        let bodies: Vec<_> = page1.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, ["m0", "m1", "m2", "m3", "m4"]);

        let (page2, _) = db.conversation(a, b, 2, 5).unwrap();
        assert_eq!(page2.len(), 2);
    }

    #[test]
    fn mark_received_only_touches_pending_rows() {
        let (db, a, b) = db_with_pair();
        let first = db.append_message(a, b, "one").unwrap();
        let second = db.append_message(a, b, "two").unwrap();

        db.set_delivery_status(first.id, DeliveryStatus::Received)
            .unwrap();
        db.set_delivery_status(first.id, DeliveryStatus::Read)
            .unwrap();

        let changed = db.mark_received(b, a).unwrap();
        assert_eq!(changed, 1);

        let first = db.get_message(first.id).unwrap().unwrap();
        let second = db.get_message(second.id).unwrap().unwrap();
        assert_eq!(first.delivery_status, DeliveryStatus::Read.as_i64());
        assert_eq!(second.delivery_status, DeliveryStatus::Received.as_i64());
    }

    #[test]
    fn edit_flags_but_keeps_timestamp_and_status() {
        let (db, a, b) = db_with_pair();
        let msg = db.append_message(a, b, "hi").unwrap();
        let edited = db.edit_message(msg.id, "hi, fixed").unwrap();

        assert!(edited.edited);
        assert_eq!(edited.body, "hi, fixed");
        assert_eq!(edited.sent_at, msg.sent_at);
        assert_eq!(edited.delivery_status, msg.delivery_status);
    }
}
