use crate::Database;
use crate::models::{ConversationListRow, MessageRow, UnreadRow, UserRow};
use anyhow::Result;
use rusqlite::Connection;

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, username: &str, password_hash: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password) VALUES (?1, ?2, ?3)",
                (id, username, password_hash),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    /// Every registered user except the given one — the pool a new
    /// conversation can be started with.
    pub fn list_users(&self, exclude_id: &str) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, username, password, created_at FROM users
                 WHERE id != ?1
                 ORDER BY username",
            )?;
            let rows = stmt
                .query_map([exclude_id], |row| {
                    Ok(UserRow {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        password: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Conversations --

    /// Create a conversation between two users and enroll both as
    /// participants.
    pub fn create_conversation(&self, user_a: &str, user_b: &str) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute("INSERT INTO conversations DEFAULT VALUES", [])?;
            let conversation_id = conn.last_insert_rowid();

            conn.execute(
                "INSERT INTO conversation_participants (conversation_id, user_id) VALUES (?1, ?2), (?1, ?3)",
                rusqlite::params![conversation_id, user_a, user_b],
            )?;

            Ok(conversation_id)
        })
    }

    /// First existing conversation both users participate in, if any.
    pub fn find_conversation_between(&self, user_a: &str, user_b: &str) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            let id = conn
                .query_row(
                    "SELECT p1.conversation_id
                     FROM conversation_participants p1
                     JOIN conversation_participants p2
                       ON p2.conversation_id = p1.conversation_id
                     WHERE p1.user_id = ?1 AND p2.user_id = ?2
                     ORDER BY p1.conversation_id
                     LIMIT 1",
                    [user_a, user_b],
                    |row| row.get(0),
                )
                .optional()?;

            Ok(id)
        })
    }

    /// Conversations the user participates in, each with the user's
    /// current unread count (single query, no per-row follow-ups).
    pub fn conversations_for_user(&self, user_id: &str) -> Result<Vec<ConversationListRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.created_at,
                        (SELECT COUNT(*) FROM messages m
                          WHERE m.conversation_id = c.id
                            AND m.sender_id != p.user_id
                            AND m.id > p.last_read_message_id) AS unread
                 FROM conversations c
                 JOIN conversation_participants p ON p.conversation_id = c.id
                 WHERE p.user_id = ?1
                 ORDER BY c.id",
            )?;

            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(ConversationListRow {
                        id: row.get(0)?,
                        created_at: row.get(1)?,
                        unread_count: row.get::<_, i64>(2)? as u64,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    pub fn is_participant(&self, conversation_id: i64, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM conversation_participants
                 WHERE conversation_id = ?1 AND user_id = ?2",
                rusqlite::params![conversation_id, user_id],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    pub fn participant_ids(&self, conversation_id: i64) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id FROM conversation_participants WHERE conversation_id = ?1",
            )?;
            let rows = stmt
                .query_map([conversation_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn participant_usernames(&self, conversation_id: i64) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT u.username
                 FROM conversation_participants p
                 JOIN users u ON u.id = p.user_id
                 WHERE p.conversation_id = ?1
                 ORDER BY u.username",
            )?;
            let rows = stmt
                .query_map([conversation_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Messages --

    /// Append a message. The returned id is assigned by SQLite in insert
    /// order, which is what makes it the conversation's delivery order.
    pub fn insert_message(
        &self,
        conversation_id: i64,
        sender_id: &str,
        body: &str,
        created_at: &str,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (conversation_id, sender_id, body, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![conversation_id, sender_id, body, created_at],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Latest `limit` messages of a conversation, newest first.
    pub fn get_messages(&self, conversation_id: i64, limit: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            // JOIN users to fetch sender_username in a single query
            let mut stmt = conn.prepare(
                "SELECT m.id, m.conversation_id, m.sender_id, u.username, m.body, m.created_at
                 FROM messages m
                 LEFT JOIN users u ON m.sender_id = u.id
                 WHERE m.conversation_id = ?1
                 ORDER BY m.id DESC
                 LIMIT ?2",
            )?;

            let rows = stmt
                .query_map(rusqlite::params![conversation_id, limit], |row| {
                    Ok(MessageRow {
                        id: row.get(0)?,
                        conversation_id: row.get(1)?,
                        sender_id: row.get(2)?,
                        sender_username: row
                            .get::<_, Option<String>>(3)?
                            .unwrap_or_else(|| "unknown".to_string()),
                        body: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Unread state --

    /// The user's unread count for one conversation: messages from other
    /// senders past the user's read cursor.
    pub fn unread_count(&self, user_id: &str, conversation_id: i64) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*)
                 FROM messages m
                 JOIN conversation_participants p
                   ON p.conversation_id = m.conversation_id AND p.user_id = ?1
                 WHERE m.conversation_id = ?2
                   AND m.sender_id != ?1
                   AND m.id > p.last_read_message_id",
                rusqlite::params![user_id, conversation_id],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    /// All conversations with a non-zero unread count for the user. This
    /// is the full-state sync a fresh unread-feed connection performs.
    pub fn unread_counts(&self, user_id: &str) -> Result<Vec<UnreadRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.conversation_id, COUNT(*)
                 FROM messages m
                 JOIN conversation_participants p
                   ON p.conversation_id = m.conversation_id AND p.user_id = ?1
                 WHERE m.sender_id != ?1
                   AND m.id > p.last_read_message_id
                 GROUP BY m.conversation_id
                 ORDER BY m.conversation_id",
            )?;

            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(UnreadRow {
                        conversation_id: row.get(0)?,
                        count: row.get::<_, i64>(1)? as u64,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Advance the user's read cursor to the conversation's newest message.
    /// Messages persisted after this call count as unread again.
    pub fn mark_read(&self, user_id: &str, conversation_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE conversation_participants
                 SET last_read_message_id =
                     (SELECT COALESCE(MAX(id), 0) FROM messages WHERE conversation_id = ?1)
                 WHERE conversation_id = ?1 AND user_id = ?2",
                rusqlite::params![conversation_id, user_id],
            )?;
            Ok(())
        })
    }
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let sql = format!(
        "SELECT id, username, password, created_at FROM users WHERE {} = ?1",
        column
    );
    let mut stmt = conn.prepare(&sql)?;

    let row = stmt
        .query_row([value], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                password: row.get(2)?,
                created_at: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::Database;

    fn seed() -> (Database, i64) {
        let db = Database::open_in_memory().unwrap();
        db.create_user("user-a", "alice", "hash-a").unwrap();
        db.create_user("user-b", "bob", "hash-b").unwrap();
        let conversation_id = db.create_conversation("user-a", "user-b").unwrap();
        (db, conversation_id)
    }

    #[test]
    fn find_or_create_conversation() {
        let (db, conversation_id) = seed();

        assert_eq!(
            db.find_conversation_between("user-a", "user-b").unwrap(),
            Some(conversation_id)
        );
        assert_eq!(
            db.find_conversation_between("user-b", "user-a").unwrap(),
            Some(conversation_id)
        );

        db.create_user("user-c", "carol", "hash-c").unwrap();
        assert_eq!(db.find_conversation_between("user-a", "user-c").unwrap(), None);
    }

    #[test]
    fn message_ids_are_monotonic() {
        let (db, conversation_id) = seed();

        let mut last = 0;
        for i in 0..5 {
            let id = db
                .insert_message(conversation_id, "user-a", &format!("msg {}", i), "2026-08-07T12:00:00Z")
                .unwrap();
            assert!(id > last);
            last = id;
        }

        let rows = db.get_messages(conversation_id, 50).unwrap();
        assert_eq!(rows.len(), 5);
        // Newest first
        assert!(rows.windows(2).all(|w| w[0].id > w[1].id));
        assert_eq!(rows[0].sender_username, "alice");
    }

    #[test]
    fn unread_counts_follow_read_cursor() {
        let (db, conversation_id) = seed();

        for i in 0..3 {
            db.insert_message(conversation_id, "user-a", &format!("msg {}", i), "2026-08-07T12:00:00Z")
                .unwrap();
        }

        // Bob has not read anything; Alice never counts her own messages.
        assert_eq!(db.unread_count("user-b", conversation_id).unwrap(), 3);
        assert_eq!(db.unread_count("user-a", conversation_id).unwrap(), 0);

        db.mark_read("user-b", conversation_id).unwrap();
        assert_eq!(db.unread_count("user-b", conversation_id).unwrap(), 0);

        // A message after the cursor advance counts again.
        db.insert_message(conversation_id, "user-a", "another", "2026-08-07T12:01:00Z")
            .unwrap();
        assert_eq!(db.unread_count("user-b", conversation_id).unwrap(), 1);
    }

    #[test]
    fn sending_does_not_reset_own_unread() {
        let (db, conversation_id) = seed();

        db.insert_message(conversation_id, "user-a", "one", "2026-08-07T12:00:00Z")
            .unwrap();
        db.insert_message(conversation_id, "user-a", "two", "2026-08-07T12:00:01Z")
            .unwrap();
        assert_eq!(db.unread_count("user-b", conversation_id).unwrap(), 2);

        // Bob replying does not acknowledge Alice's messages.
        db.insert_message(conversation_id, "user-b", "reply", "2026-08-07T12:00:02Z")
            .unwrap();
        assert_eq!(db.unread_count("user-b", conversation_id).unwrap(), 2);
        assert_eq!(db.unread_count("user-a", conversation_id).unwrap(), 1);
    }

    #[test]
    fn unread_counts_enumerates_nonzero_conversations() {
        let (db, first) = seed();
        db.create_user("user-c", "carol", "hash-c").unwrap();
        let second = db.create_conversation("user-b", "user-c").unwrap();

        db.insert_message(first, "user-a", "hello", "2026-08-07T12:00:00Z").unwrap();
        db.insert_message(second, "user-c", "hey", "2026-08-07T12:00:01Z").unwrap();
        db.insert_message(second, "user-c", "you there?", "2026-08-07T12:00:02Z")
            .unwrap();

        let rows = db.unread_counts("user-b").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!((rows[0].conversation_id, rows[0].count), (first, 1));
        assert_eq!((rows[1].conversation_id, rows[1].count), (second, 2));

        db.mark_read("user-b", second).unwrap();
        let rows = db.unread_counts("user-b").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].conversation_id, first);
    }

    #[test]
    fn conversation_list_includes_unread() {
        let (db, conversation_id) = seed();
        db.insert_message(conversation_id, "user-a", "hello", "2026-08-07T12:00:00Z")
            .unwrap();

        let rows = db.conversations_for_user("user-b").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, conversation_id);
        assert_eq!(rows[0].unread_count, 1);

        let names = db.participant_usernames(conversation_id).unwrap();
        assert_eq!(names, vec!["alice".to_string(), "bob".to_string()]);
    }

    #[test]
    fn participant_membership() {
        let (db, conversation_id) = seed();
        db.create_user("user-c", "carol", "hash-c").unwrap();

        assert!(db.is_participant(conversation_id, "user-a").unwrap());
        assert!(!db.is_participant(conversation_id, "user-c").unwrap());

        let mut ids = db.participant_ids(conversation_id).unwrap();
        ids.sort();
        assert_eq!(ids, vec!["user-a".to_string(), "user-b".to_string()]);
    }
}
