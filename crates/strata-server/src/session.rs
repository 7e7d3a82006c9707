//! Session registry: the set of connected users.
//!
//! Users are kept sorted by index. Indices are dense: a new user always takes
//! the smallest index not held by anyone else, so a slot freed by a departing
//! user is reused by the next arrival.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use strata_net::{ConnectionId, Pose};
use thiserror::Error;

/// A connected user.
#[derive(Debug, Clone)]
pub struct User {
    pub index: u32,
    /// Where UDP packets for this user go.
    pub endpoint: SocketAddr,
    /// Bound TCP connection, once the client has completed the TCP handshake.
    pub tcp: Option<ConnectionId>,
    pub username: String,
    pub pose: Pose,
    pub last_keepalive: Instant,
    /// Set by a pose update, cleared once the pose has been broadcast.
    pub dirty_position: bool,
}

/// Read-only view of a session for administration.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub index: u32,
    pub username: String,
    pub endpoint: SocketAddr,
    pub tcp: Option<ConnectionId>,
    pub pose: Pose,
    /// Time since the last keepalive.
    pub idle: Duration,
}

/// Errors from [`SessionRegistry::register`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegisterError {
    /// Another session already uses this username.
    #[error("username {0:?} is already connected")]
    Conflict(String),
}

/// All connected users.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    users: Vec<User>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self { users: Vec::new() }
    }

    /// Registers a new user under the lowest free index.
    pub fn register(
        &mut self,
        username: &str,
        endpoint: SocketAddr,
        now: Instant,
    ) -> Result<&User, RegisterError> {
        if self.find_by_username(username).is_some() {
            return Err(RegisterError::Conflict(username.to_string()));
        }

        let index = self.lowest_free_index();
        let user = User {
            index,
            endpoint,
            tcp: None,
            username: username.to_string(),
            pose: Pose::default(),
            last_keepalive: now,
            dirty_position: false,
        };
        // The free index is also the insertion point that keeps the list sorted.
        let position = index as usize;
        self.users.insert(position, user);
        Ok(&self.users[position])
    }

    /// First index that is not at its dense position, or the count if none.
    fn lowest_free_index(&self) -> u32 {
        self.users
            .iter()
            .enumerate()
            .find(|(expected, user)| user.index as usize != *expected)
            .map_or(self.users.len(), |(expected, _)| expected) as u32
    }

    fn position(&self, index: u32) -> Option<usize> {
        self.users.binary_search_by_key(&index, |u| u.index).ok()
    }

    fn get_mut(&mut self, index: u32) -> Option<&mut User> {
        let position = self.position(index)?;
        Some(&mut self.users[position])
    }

    /// Binds a TCP connection to a user. A connection belongs to at most one
    /// user, so it is detached from any previous owner first.
    pub fn attach_tcp(&mut self, index: u32, conn: ConnectionId) -> Option<&User> {
        let position = self.position(index)?;
        self.detach_tcp(conn);
        let user = &mut self.users[position];
        user.tcp = Some(conn);
        Some(user)
    }

    /// Clears the TCP handle of whichever user holds `conn`, returning that
    /// user's index.
    pub fn detach_tcp(&mut self, conn: ConnectionId) -> Option<u32> {
        let user = self.users.iter_mut().find(|u| u.tcp == Some(conn))?;
        user.tcp = None;
        Some(user.index)
    }

    pub fn find_by_index(&self, index: u32) -> Option<&User> {
        self.position(index).map(|position| &self.users[position])
    }

    pub fn find_by_username(&self, username: &str) -> Option<&User> {
        self.users.iter().find(|u| u.username == username)
    }

    pub fn find_by_tcp_conn(&self, conn: ConnectionId) -> Option<&User> {
        self.users.iter().find(|u| u.tcp == Some(conn))
    }

    pub fn remove(&mut self, index: u32) -> Option<User> {
        let position = self.position(index)?;
        Some(self.users.remove(position))
    }

    /// Refreshes a user's keepalive timestamp. Returns `false` for an
    /// unknown index.
    pub fn touch(&mut self, index: u32, now: Instant) -> bool {
        match self.get_mut(index) {
            Some(user) => {
                user.last_keepalive = now;
                true
            }
            None => false,
        }
    }

    /// Stores a new pose and marks it for the next broadcast.
    pub fn update_pose(&mut self, index: u32, pose: Pose) -> bool {
        match self.get_mut(index) {
            Some(user) => {
                user.pose = pose;
                user.dirty_position = true;
                true
            }
            None => false,
        }
    }

    /// Poses of every user that moved since the last call, in index order.
    /// Clears their dirty flags.
    pub fn take_dirty_poses(&mut self) -> Vec<(u32, Pose)> {
        self.users
            .iter_mut()
            .filter(|u| u.dirty_position)
            .map(|u| {
                u.dirty_position = false;
                (u.index, u.pose)
            })
            .collect()
    }

    /// Indices of users silent for longer than `grace`.
    pub fn timed_out(&self, now: Instant, grace: Duration) -> Vec<u32> {
        self.users
            .iter()
            .filter(|u| now.saturating_duration_since(u.last_keepalive) > grace)
            .map(|u| u.index)
            .collect()
    }

    /// `(index, username)` of every user, in index order.
    pub fn roster(&self) -> Vec<(u32, String)> {
        self.users
            .iter()
            .map(|u| (u.index, u.username.clone()))
            .collect()
    }

    pub fn snapshot(&self, now: Instant) -> Vec<SessionInfo> {
        self.users
            .iter()
            .map(|u| SessionInfo {
                index: u.index,
                username: u.username.clone(),
                endpoint: u.endpoint,
                tcp: u.tcp,
                pose: u.pose,
                idle: now.saturating_duration_since(u.last_keepalive),
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &User> {
        self.users.iter()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
