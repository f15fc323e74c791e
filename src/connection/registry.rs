//! Socket registries.
//!
//! Four independently locked collections record where every connection is:
//!
//! ```text
//! all sockets ──┬── read-registered   (armed in the multiplexer or reading)
//!               ├── processing        (inside Parse-and-Run)
//!               └── write-pending     (inside Write, or parked for writability)
//! ```
//!
//! A connection is in at most one of the three stage sets. Moving between
//! them takes every lock involved in hierarchy order, so the move is atomic
//! with respect to anyone inspecting the sets.

use crate::connection::session::ConnId;
use crate::sync::{LockLevel, OrderedMutex};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;
use thiserror::Error;

/// A pipeline stage that owns a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    ReadRegistered,
    Processing,
    WritePending,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::ReadRegistered => "read-registered",
            Stage::Processing => "processing",
            Stage::WritePending => "write-pending",
        };
        f.write_str(name)
    }
}

/// Bookkeeping kept for every open connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnInfo {
    pub peer: SocketAddr,
    pub opened_at: Instant,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} is not registered")]
    Unknown(ConnId),

    #[error("connection {id} expected in stage {expected:?}, found in {found:?}")]
    WrongStage {
        id: ConnId,
        expected: Option<Stage>,
        found: Option<Stage>,
    },
}

/// Occupancy of each registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryCounts {
    pub total: usize,
    pub read_registered: usize,
    pub processing: usize,
    pub write_pending: usize,
}

pub struct Registries {
    all: OrderedMutex<HashMap<ConnId, ConnInfo>>,
    read_registered: OrderedMutex<HashSet<ConnId>>,
    processing: OrderedMutex<HashSet<ConnId>>,
    write_pending: OrderedMutex<HashSet<ConnId>>,
}

impl Default for Registries {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registries")
            .field("counts", &self.counts())
            .finish()
    }
}

/// The three stage sets, locked together.
struct StageSets<'a> {
    read_registered: &'a mut HashSet<ConnId>,
    processing: &'a mut HashSet<ConnId>,
    write_pending: &'a mut HashSet<ConnId>,
}

impl StageSets<'_> {
    fn get(&mut self, stage: Stage) -> &mut HashSet<ConnId> {
        match stage {
            Stage::ReadRegistered => &mut *self.read_registered,
            Stage::Processing => &mut *self.processing,
            Stage::WritePending => &mut *self.write_pending,
        }
    }

    fn find(&self, id: ConnId) -> Option<Stage> {
        let found = [
            (Stage::ReadRegistered, self.read_registered.contains(&id)),
            (Stage::Processing, self.processing.contains(&id)),
            (Stage::WritePending, self.write_pending.contains(&id)),
        ];
        let mut stages = found.iter().filter(|(_, present)| *present).map(|(s, _)| *s);
        let stage = stages.next();
        debug_assert!(stages.next().is_none(), "connection {} in two stages", id);
        stage
    }
}

impl Registries {
    pub fn new() -> Self {
        Self {
            all: OrderedMutex::with_level(LockLevel::AllSockets),
            read_registered: OrderedMutex::with_level(LockLevel::ReadRegistered),
            processing: OrderedMutex::with_level(LockLevel::Processing),
            write_pending: OrderedMutex::with_level(LockLevel::WritePending),
        }
    }

    /// Locks the stage sets in hierarchy order and runs `f` on them.
    fn with_stages<R>(&self, f: impl FnOnce(&mut StageSets<'_>) -> R) -> R {
        let mut read_registered = self.read_registered.lock();
        let mut processing = self.processing.lock();
        let mut write_pending = self.write_pending.lock();
        f(&mut StageSets {
            read_registered: &mut read_registered,
            processing: &mut processing,
            write_pending: &mut write_pending,
        })
    }

    /// Records a newly accepted connection. It belongs to no stage until it
    /// is first armed for reading.
    pub fn insert(&self, id: ConnId, peer: SocketAddr) -> usize {
        let mut all = self.all.lock();
        all.insert(
            id,
            ConnInfo {
                peer,
                opened_at: Instant::now(),
            },
        );
        all.len()
    }

    /// Moves `id` from stage `from` (`None` for a connection not yet in any
    /// stage) to stage `to`.
    pub fn transition(&self, id: ConnId, from: Option<Stage>, to: Stage) -> Result<(), RegistryError> {
        let all = self.all.lock();
        if !all.contains_key(&id) {
            return Err(RegistryError::Unknown(id));
        }

        self.with_stages(|sets| {
            let found = sets.find(id);
            if found != from {
                return Err(RegistryError::WrongStage {
                    id,
                    expected: from,
                    found,
                });
            }
            if let Some(from) = from {
                sets.get(from).remove(&id);
            }
            sets.get(to).insert(id);
            Ok(())
        })
    }

    /// Erases `id` from every registry.
    pub fn remove(&self, id: ConnId) -> Option<ConnInfo> {
        let mut all = self.all.lock();
        let info = all.remove(&id);
        self.with_stages(|sets| {
            sets.read_registered.remove(&id);
            sets.processing.remove(&id);
            sets.write_pending.remove(&id);
        });
        info
    }

    pub fn stage_of(&self, id: ConnId) -> Option<Stage> {
        let _all = self.all.lock();
        self.with_stages(|sets| sets.find(id))
    }

    /// Number of open connections.
    pub fn len(&self) -> usize {
        self.all.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn counts(&self) -> RegistryCounts {
        let all = self.all.lock();
        self.with_stages(|sets| RegistryCounts {
            total: all.len(),
            read_registered: sets.read_registered.len(),
            processing: sets.processing.len(),
            write_pending: sets.write_pending.len(),
        })
    }

    /// Forgets every connection, returning how many there were.
    pub fn clear(&self) -> usize {
        let mut all = self.all.lock();
        let count = all.len();
        all.clear();
        self.with_stages(|sets| {
            sets.read_registered.clear();
            sets.processing.clear();
            sets.write_pending.clear();
        });
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    #[test]
    fn test_full_cycle() {
        let registries = Registries::new();
        let id = ConnId(1);

        assert_eq!(registries.insert(id, peer()), 1);
        assert_eq!(registries.stage_of(id), None);

        registries.transition(id, None, Stage::ReadRegistered).unwrap();
        registries
            .transition(id, Some(Stage::ReadRegistered), Stage::Processing)
            .unwrap();
        assert_eq!(registries.stage_of(id), Some(Stage::Processing));

        registries
            .transition(id, Some(Stage::Processing), Stage::WritePending)
            .unwrap();
        registries
            .transition(id, Some(Stage::WritePending), Stage::ReadRegistered)
            .unwrap();

        assert_eq!(
            registries.counts(),
            RegistryCounts {
                total: 1,
                read_registered: 1,
                processing: 0,
                write_pending: 0,
            }
        );
    }

    #[test]
    fn test_wrong_stage_rejected() {
        let registries = Registries::new();
        let id = ConnId(7);
        registries.insert(id, peer());
        registries.transition(id, None, Stage::ReadRegistered).unwrap();

        let err = registries
            .transition(id, Some(Stage::Processing), Stage::WritePending)
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::WrongStage {
                id,
                expected: Some(Stage::Processing),
                found: Some(Stage::ReadRegistered),
            }
        );
        // Nothing moved
        assert_eq!(registries.stage_of(id), Some(Stage::ReadRegistered));
    }

    #[test]
    fn test_unknown_connection() {
        let registries = Registries::new();
        assert_eq!(
            registries.transition(ConnId(3), None, Stage::ReadRegistered),
            Err(RegistryError::Unknown(ConnId(3)))
        );
    }

    #[test]
    fn test_remove_clears_every_set() {
        let registries = Registries::new();
        let id = ConnId(2);
        registries.insert(id, peer());
        registries.transition(id, None, Stage::ReadRegistered).unwrap();
        registries
            .transition(id, Some(Stage::ReadRegistered), Stage::Processing)
            .unwrap();

        let info = registries.remove(id).unwrap();
        assert_eq!(info.peer, peer());
        assert!(registries.is_empty());
        assert_eq!(registries.counts(), RegistryCounts::default());
        assert!(registries.remove(id).is_none());
    }

    #[test]
    fn test_removed_connection_cannot_advance() {
        let registries = Registries::new();
        let id = ConnId(5);
        registries.insert(id, peer());
        registries.transition(id, None, Stage::ReadRegistered).unwrap();
        registries.remove(id);

        assert_eq!(
            registries.transition(id, Some(Stage::ReadRegistered), Stage::Processing),
            Err(RegistryError::Unknown(id))
        );
    }

    #[test]
    fn test_clear() {
        let registries = Registries::new();
        for n in 0..5 {
            registries.insert(ConnId(n), peer());
            registries.transition(ConnId(n), None, Stage::ReadRegistered).unwrap();
        }
        assert_eq!(registries.clear(), 5);
        assert!(registries.is_empty());
    }

    #[test]
    fn test_concurrent_transitions_keep_one_stage() {
        let registries = Arc::new(Registries::new());
        let cycle = [
            Stage::ReadRegistered,
            Stage::Processing,
            Stage::WritePending,
        ];

        let mut handles = vec![];
        for t in 0..8 {
            let registries = Arc::clone(&registries);
            handles.push(thread::spawn(move || {
                let id = ConnId(t);
                registries.insert(id, peer());
                registries.transition(id, None, Stage::ReadRegistered).unwrap();
                for i in 0..300 {
                    let from = cycle[i % 3];
                    let to = cycle[(i + 1) % 3];
                    registries.transition(id, Some(from), to).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // 300 steps around a 3-cycle lands back where it started
        let counts = registries.counts();
        assert_eq!(counts.total, 8);
        assert_eq!(counts.read_registered, 8);
        assert_eq!(counts.processing + counts.write_pending, 0);
    }
}
