//! User-authentication queries over the `user` table.

use crate::connection::{escape_literal, DbConnection};
use crate::error::DbResult;

/// True when `username` exists and the stored password matches.
pub fn verify(conn: &mut DbConnection, username: &str, password: &str) -> DbResult<bool> {
    let sql = format!(
        "SELECT password FROM \"user\" WHERE username = '{}'",
        escape_literal(username)
    );
    let result = conn.query(&sql)?;
    Ok(result.get(0, "password") == Some(password))
}

/// Insert a new user. False when the name is already taken.
pub fn register(conn: &mut DbConnection, username: &str, password: &str) -> DbResult<bool> {
    let check = format!(
        "SELECT username FROM \"user\" WHERE username = '{}'",
        escape_literal(username)
    );
    if !conn.query(&check)?.rows.is_empty() {
        return Ok(false);
    }
    let insert = format!(
        "INSERT INTO \"user\" (username, password) VALUES ('{}', '{}')",
        escape_literal(username),
        escape_literal(password)
    );
    conn.query(&insert)?;
    Ok(true)
}
