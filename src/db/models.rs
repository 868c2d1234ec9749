use rusqlite::{params, Connection, OptionalExtension};

/// A registered user row.
#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: Option<String>,
    pub password_hash: String,
}

/// Look up a user by username. Returns None if no such user.
pub fn find_user_by_username(
    conn: &Connection,
    username: &str,
) -> Result<Option<User>, rusqlite::Error> {
    conn.query_row(
        "SELECT id, username, email, password_hash FROM users WHERE username = ?1",
        params![username],
        |row| {
            Ok(User {
                id: row.get(0)?,
                username: row.get(1)?,
                email: row.get(2)?,
                password_hash: row.get(3)?,
            })
        },
    )
    .optional()
}

/// Look up a user's username by id. Returns None if the user was deleted.
pub fn find_username_by_id(
    conn: &Connection,
    user_id: &str,
) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT username FROM users WHERE id = ?1",
        params![user_id],
        |row| row.get(0),
    )
    .optional()
}

/// Check whether a username exists in the user directory.
pub fn user_exists(conn: &Connection, username: &str) -> Result<bool, rusqlite::Error> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM users WHERE username = ?1)",
        params![username],
        |row| row.get(0),
    )
}
