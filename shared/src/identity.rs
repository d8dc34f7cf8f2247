//! Read-mostly access to the accounts directory maintained by the identity
//! integration. The core only needs email addresses and subscription roles.

use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use strum_macros::{Display, EnumString};

use crate::error::AppError;

/// Subscription tier of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Role {
    FreeUser,
    PremiumUser,
}

impl Role {
    pub fn is_premium(self) -> bool {
        self == Role::PremiumUser
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub email: String,
    pub role: Role,
}

/// Ensure the accounts table exists; the identity integration owns the rows.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), AppError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            user_id text PRIMARY KEY,
            email   text NOT NULL,
            role    text NOT NULL DEFAULT 'free_user'
        );
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| AppError::Transport(format!("create accounts table: {e}")))?;
    Ok(())
}

pub async fn get_user_profile(pool: &PgPool, user_id: &str) -> Result<UserProfile, AppError> {
    let row = sqlx::query("SELECT user_id, email, role FROM accounts WHERE user_id = $1")
        .bind(user_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| AppError::Transport(format!("fetch profile: {e}")))?
        .ok_or_else(|| AppError::NotFound(format!("user {user_id}")))?;

    let role: String = row.get("role");
    let role = role
        .parse::<Role>()
        .map_err(|_| AppError::Schema(format!("unknown role {role} for user {user_id}")))?;
    Ok(UserProfile {
        user_id: row.get("user_id"),
        email: row.get("email"),
        role,
    })
}

/// Flip a user's subscription tier; used by the upgrade flow.
pub async fn set_role(pool: &PgPool, user_id: &str, role: Role) -> Result<(), AppError> {
    let res = sqlx::query("UPDATE accounts SET role = $2 WHERE user_id = $1")
        .bind(user_id)
        .bind(role.to_string())
        .execute(pool)
        .await
        .map_err(|e| AppError::Transport(format!("update role: {e}")))?;
    if res.rows_affected() == 0 {
        return Err(AppError::NotFound(format!("user {user_id}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_round_trip_their_wire_names() {
        assert_eq!(Role::FreeUser.to_string(), "free_user");
        assert_eq!("premium_user".parse::<Role>().unwrap(), Role::PremiumUser);
        assert!(Role::PremiumUser.is_premium());
        assert!(!Role::FreeUser.is_premium());
    }
}
