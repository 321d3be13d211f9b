//! Shared POSIX users staged for node-side creation.
//!
//! The lifecycle scripts read `shared_users.txt` (`username,uid,home`) and
//! create each user with the same uid on every node, homed on the shared
//! filesystem.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use hyperpod_config::{FIRST_USER_UID, UserSpec};

pub const USERS_FILE: &str = "shared_users.txt";
pub const DEFAULT_HOME_ROOT: &str = "/fsx";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedUser {
    pub username: String,
    pub uid: u32,
    pub home: String,
}

/// Assign uids and homes. Explicit uids are kept; the rest count up from 2001
/// skipping taken ones.
pub fn plan_users(specs: &[UserSpec], home_root: &str) -> Result<Vec<SharedUser>, UsersError> {
    let mut names = HashSet::new();
    let mut taken: HashSet<u32> = HashSet::new();

    for spec in specs {
        if !is_valid_username(&spec.username) {
            return Err(UsersError::InvalidName(spec.username.clone()));
        }
        if !names.insert(spec.username.as_str()) {
            return Err(UsersError::DuplicateName(spec.username.clone()));
        }
        if let Some(uid) = spec.uid
            && !taken.insert(uid)
        {
            return Err(UsersError::DuplicateUid(uid));
        }
    }

    let root = home_root.trim_end_matches('/');
    let mut next = FIRST_USER_UID;
    let mut users = Vec::with_capacity(specs.len());
    for spec in specs {
        let uid = if let Some(uid) = spec.uid {
            uid
        } else {
            while taken.contains(&next) {
                next += 1;
            }
            taken.insert(next);
            next
        };
        let home = spec
            .home
            .clone()
            .unwrap_or_else(|| format!("{root}/{}", spec.username));
        if !is_valid_home(&home) {
            return Err(UsersError::InvalidHome {
                username: spec.username.clone(),
                home,
            });
        }
        users.push(SharedUser {
            username: spec.username.clone(),
            uid,
            home,
        });
    }
    Ok(users)
}

/// Parse a comma separated list of usernames.
#[must_use]
pub fn parse_usernames(list: &str) -> Vec<UserSpec> {
    list.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| UserSpec {
            username: name.to_string(),
            uid: None,
            home: None,
        })
        .collect()
}

#[must_use]
pub fn render(users: &[SharedUser]) -> String {
    users
        .iter()
        .map(|u| format!("{},{},{}\n", u.username, u.uid, u.home))
        .collect()
}

/// Write `shared_users.txt` into `dir`.
pub fn write_users_file(dir: &Path, users: &[SharedUser]) -> Result<PathBuf, UsersError> {
    std::fs::create_dir_all(dir).map_err(|e| UsersError::Io(dir.to_path_buf(), e))?;
    let path = dir.join(USERS_FILE);
    std::fs::write(&path, render(users)).map_err(|e| UsersError::Io(path.clone(), e))?;
    tracing::info!("Wrote {} users to {}", users.len(), path.display());
    Ok(path)
}

/// Portable POSIX login names.
fn is_valid_username(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= 32
        && (first.is_ascii_lowercase() || first == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// An absolute path that fits in one field of the users file.
fn is_valid_home(home: &str) -> bool {
    home.len() > 1
        && home.starts_with('/')
        && !home.chars().any(|c| c == ',' || c.is_whitespace() || c.is_control())
}

#[derive(Debug, thiserror::Error)]
pub enum UsersError {
    #[error("invalid username '{0}'")]
    InvalidName(String),
    #[error("user {0} is listed twice")]
    DuplicateName(String),
    #[error("uid {0} is assigned twice")]
    DuplicateUid(u32),
    #[error("home {home:?} for user {username} must be an absolute path without commas or whitespace")]
    InvalidHome { username: String, home: String },
    #[error("failed to write {0}: {1}")]
    Io(PathBuf, std::io::Error),
}
