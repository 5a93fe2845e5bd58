//! Users and Access Roles
//!
//! Every bot keeps its own user table with one of three roles:
//! - **User**: default for anyone who writes to the bot
//! - **Admin**: may inspect and clear other users' history
//! - **Owner**: exactly one per bot, taken from the bot config; may promote admins

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::db::{Database, StoreError, StoreResult};

/// Access role of a user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessRole {
    User,
    Admin,
    Owner,
}

impl AccessRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessRole::User => "user",
            AccessRole::Admin => "admin",
            AccessRole::Owner => "owner",
        }
    }

    /// Display name ("Admin")
    pub fn title(&self) -> &'static str {
        match self {
            AccessRole::User => "User",
            AccessRole::Admin => "Admin",
            AccessRole::Owner => "Owner",
        }
    }

    pub fn is_privileged(&self) -> bool {
        matches!(self, AccessRole::Admin | AccessRole::Owner)
    }
}

impl fmt::Display for AccessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessRole {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(AccessRole::User),
            "admin" => Ok(AccessRole::Admin),
            "owner" => Ok(AccessRole::Owner),
            other => Err(StoreError::UnknownRole(other.to_string())),
        }
    }
}

/// A user known to a bot
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub telegram_id: i64,
    pub username: String,
    pub role: AccessRole,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn is_owner(&self) -> bool {
        self.role == AccessRole::Owner
    }
}

type RawUser = (i64, String, String, i64);

fn raw_user(row: &Row<'_>) -> rusqlite::Result<RawUser> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn into_user((telegram_id, username, role, created_at): RawUser) -> StoreResult<User> {
    Ok(User {
        telegram_id,
        username,
        role: role.parse()?,
        created_at: DateTime::<Utc>::from_timestamp(created_at, 0).unwrap_or_default(),
    })
}

/// User registry of one bot
pub struct UserStore {
    db: Arc<Database>,
    bot_id: String,
    bot_row: i64,
    clock: Arc<dyn Clock>,
}

impl UserStore {
    /// Registry for `bot_id`, registering the bot on first use
    pub fn open(db: Arc<Database>, bot_id: &str, clock: Arc<dyn Clock>) -> StoreResult<Self> {
        let bot_row = db.ensure_bot(bot_id)?;
        Ok(Self {
            db,
            bot_id: bot_id.to_string(),
            bot_row,
            clock,
        })
    }

    pub fn find_user(&self, telegram_id: i64) -> StoreResult<Option<User>> {
        let raw = self
            .db
            .conn()
            .query_row(
                "SELECT telegram_id, username, role, created_at FROM users
                 WHERE bot_id = ?1 AND telegram_id = ?2",
                params![self.bot_row, telegram_id],
                raw_user,
            )
            .optional()?;
        raw.map(into_user).transpose()
    }

    fn find_owner(&self) -> StoreResult<Option<User>> {
        let raw = self
            .db
            .conn()
            .query_row(
                "SELECT telegram_id, username, role, created_at FROM users
                 WHERE bot_id = ?1 AND role = 'owner'",
                params![self.bot_row],
                raw_user,
            )
            .optional()?;
        raw.map(into_user).transpose()
    }

    fn insert(&self, telegram_id: i64, username: &str, role: AccessRole) -> StoreResult<User> {
        let created_at = self.clock.now().timestamp();
        let result = self.db.conn().execute(
            "INSERT INTO users (bot_id, telegram_id, username, role, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![self.bot_row, telegram_id, username, role.as_str(), created_at],
        );

        match result {
            Ok(_) => Ok(User {
                telegram_id,
                username: username.to_string(),
                role,
                created_at: DateTime::<Utc>::from_timestamp(created_at, 0).unwrap_or_default(),
            }),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if role == AccessRole::Owner
                    && e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::OwnerExists)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn set_role(&self, telegram_id: i64, role: AccessRole) -> StoreResult<()> {
        self.db.conn().execute(
            "UPDATE users SET role = ?3 WHERE bot_id = ?1 AND telegram_id = ?2",
            params![self.bot_row, telegram_id, role.as_str()],
        )?;
        Ok(())
    }

    /// Make sure the configured owner exists with the owner role
    pub fn ensure_owner(&self, telegram_id: i64) -> StoreResult<User> {
        if let Some(owner) = self.find_owner()? {
            if owner.telegram_id == telegram_id {
                return Ok(owner);
            }
            warn!(
                bot = %self.bot_id,
                "Bot already has owner {}, refusing to register {}",
                owner.telegram_id, telegram_id
            );
            return Err(StoreError::OwnerExists);
        }

        match self.find_user(telegram_id)? {
            Some(mut user) => {
                self.set_role(telegram_id, AccessRole::Owner)?;
                user.role = AccessRole::Owner;
                info!(bot = %self.bot_id, "Promoted existing user {} to owner", telegram_id);
                Ok(user)
            }
            None => {
                let user = self.insert(telegram_id, "", AccessRole::Owner)?;
                info!(bot = %self.bot_id, "Registered owner {}", telegram_id);
                Ok(user)
            }
        }
    }

    /// Fetch a user, creating it on first contact.
    ///
    /// New users get the `user` role, or `owner` when `is_owner` is set and the
    /// bot has no owner yet. An existing non-owner never becomes owner here.
    pub fn get_or_create_user(
        &self,
        telegram_id: i64,
        username: &str,
        is_owner: bool,
    ) -> StoreResult<User> {
        if let Some(user) = self.find_user(telegram_id)? {
            if is_owner && !user.is_owner() {
                return Err(StoreError::CannotBecomeOwner);
            }
            return Ok(user);
        }

        if is_owner {
            if self.find_owner()?.is_some() {
                return Err(StoreError::OwnerExists);
            }
            return self.insert(telegram_id, username, AccessRole::Owner);
        }

        self.insert(telegram_id, username, AccessRole::User)
    }

    pub fn update_username(&self, telegram_id: i64, username: &str) -> StoreResult<()> {
        self.db.conn().execute(
            "UPDATE users SET username = ?3 WHERE bot_id = ?1 AND telegram_id = ?2",
            params![self.bot_row, telegram_id, username],
        )?;
        Ok(())
    }

    /// Unknown users and lookup failures count as unprivileged
    pub fn is_admin_or_owner(&self, telegram_id: i64) -> bool {
        match self.find_user(telegram_id) {
            Ok(Some(user)) => user.role.is_privileged(),
            Ok(None) => false,
            Err(e) => {
                warn!(bot = %self.bot_id, "Role lookup failed for {}: {}", telegram_id, e);
                false
            }
        }
    }

    /// Owner-only: grant the admin role
    pub fn promote_to_admin(&self, actor_id: i64, target_id: i64) -> StoreResult<User> {
        let actor = self
            .find_user(actor_id)?
            .ok_or(StoreError::UserNotFound(actor_id))?;
        if !actor.is_owner() {
            return Err(StoreError::PermissionDenied);
        }

        let mut target = self
            .find_user(target_id)?
            .ok_or(StoreError::UserNotFound(target_id))?;
        if target.is_owner() {
            return Err(StoreError::PermissionDenied);
        }

        self.set_role(target_id, AccessRole::Admin)?;
        target.role = AccessRole::Admin;
        info!(bot = %self.bot_id, "User {} promoted {} to admin", actor_id, target_id);
        Ok(target)
    }

    /// Number of users registered with this bot
    pub fn count(&self) -> StoreResult<usize> {
        let count: i64 = self.db.conn().query_row(
            "SELECT COUNT(*) FROM users WHERE bot_id = ?1",
            params![self.bot_row],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
