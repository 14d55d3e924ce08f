//! Fixed-capacity connection pool.
//!
//! Slots are addressed by a stable [`ConnectionIndex`]. A slot is vacant,
//! holds an idle connection available for reuse, or holds a busy connection
//! owned by the transfer in progress. Busy slots are never handed out and
//! never evicted.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::error::TransferError;

use super::{Connection, ConnectionIndex, ReuseKey};

/// Rule selecting which idle connection to evict when every slot is taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosurePolicy {
    /// Evict the connection created first.
    Oldest,
    /// Evict the connection used least recently.
    #[default]
    LeastRecentlyUsed,
    /// Evict the cheapest protocol to re-establish first, least recently
    /// used within a protocol rank.
    LeastRecentlyUsedByProtocol,
}

#[derive(Debug)]
enum Slot {
    Vacant,
    Idle(Box<Connection>),
    Busy(Box<Connection>),
}

impl Slot {
    fn connection(&self) -> Option<&Connection> {
        match self {
            Self::Idle(conn) | Self::Busy(conn) => Some(&**conn),
            Self::Vacant => None,
        }
    }
}

/// Result of [`ConnectionPool::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquisition {
    /// Slot now marked busy for the caller.
    pub index: ConnectionIndex,
    /// True when an existing connection was reused.
    pub reused: bool,
}

/// Slot occupancy counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Number of slots.
    pub capacity: usize,
    /// Slots holding a connection.
    pub occupied: usize,
    /// Slots holding a reusable connection.
    pub idle: usize,
    /// Slots in use by a transfer.
    pub busy: usize,
}

/// Bounded owner of connection records.
#[derive(Debug)]
pub struct ConnectionPool {
    slots: Vec<Slot>,
    policy: ClosurePolicy,
}

impl ConnectionPool {
    /// Creates a pool with `capacity` vacant slots.
    #[must_use]
    pub fn new(capacity: usize, policy: ClosurePolicy) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Slot::Vacant);
        Self { slots, policy }
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Eviction policy.
    #[must_use]
    pub fn policy(&self) -> ClosurePolicy {
        self.policy
    }

    /// Changes the eviction policy.
    pub fn set_policy(&mut self, policy: ClosurePolicy) {
        self.policy = policy;
    }

    /// Marks a slot busy for a transfer described by `key`.
    ///
    /// Unless `force_fresh` is set, an idle connection matching `key` is
    /// reused. Otherwise a vacant slot receives the record built by `make`,
    /// evicting an idle connection per the closure policy when the pool is
    /// full.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::PoolExhausted`] when every slot is busy.
    #[instrument(skip(self, make), fields(protocol = %key.protocol, host = %key.host, port = key.port))]
    pub async fn acquire<F>(
        &mut self,
        key: &ReuseKey,
        force_fresh: bool,
        make: F,
    ) -> Result<Acquisition, TransferError>
    where
        F: FnOnce(ConnectionIndex) -> Connection,
    {
        if !force_fresh
            && let Some(position) = self.find_reusable(key)
        {
            match std::mem::replace(&mut self.slots[position], Slot::Vacant) {
                Slot::Idle(mut conn) => {
                    conn.bits.reuse = true;
                    self.slots[position] = Slot::Busy(conn);
                    debug!(index = position, "Reusing pooled connection");
                    return Ok(Acquisition {
                        index: ConnectionIndex::new(position),
                        reused: true,
                    });
                }
                other => self.slots[position] = other,
            }
        }

        let position = match self.slots.iter().position(|s| matches!(s, Slot::Vacant)) {
            Some(position) => position,
            None => {
                let Some(victim) = self.select_victim() else {
                    return Err(TransferError::PoolExhausted {
                        capacity: self.capacity(),
                    });
                };
                let slot = std::mem::replace(&mut self.slots[victim], Slot::Vacant);
                if let Slot::Idle(mut conn) = slot {
                    info!(
                        index = victim,
                        protocol = %conn.protocol(),
                        policy = ?self.policy,
                        "Evicting idle connection"
                    );
                    conn.teardown().await;
                }
                victim
            }
        };

        let index = ConnectionIndex::new(position);
        let mut conn = make(index);
        conn.set_index(index);
        conn.bits.reuse = false;
        self.slots[position] = Slot::Busy(Box::new(conn));
        debug!(index = position, "Allocated new connection");
        Ok(Acquisition {
            index,
            reused: false,
        })
    }

    fn find_reusable(&self, key: &ReuseKey) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                Slot::Idle(conn) if conn.can_reuse_for(key) => Some((i, conn.last_used())),
                _ => None,
            })
            .max_by_key(|(_, last_used)| *last_used)
            .map(|(i, _)| i)
    }

    fn select_victim(&self) -> Option<usize> {
        let idle = self.slots.iter().enumerate().filter_map(|(i, slot)| match slot {
            Slot::Idle(conn) => Some((i, conn)),
            _ => None,
        });
        match self.policy {
            ClosurePolicy::Oldest => idle.min_by_key(|(_, conn)| conn.created()),
            ClosurePolicy::LeastRecentlyUsed => idle.min_by_key(|(_, conn)| conn.last_used()),
            ClosurePolicy::LeastRecentlyUsedByProtocol => {
                idle.min_by_key(|(_, conn)| (conn.protocol().eviction_rank(), conn.last_used()))
            }
        }
        .map(|(i, _)| i)
    }

    /// Connection in a slot, busy or idle.
    #[must_use]
    pub fn get(&self, index: ConnectionIndex) -> Option<&Connection> {
        self.slots.get(index.get()).and_then(Slot::connection)
    }

    /// Mutable access to a busy connection.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::StaleIndex`] unless the slot is busy.
    pub fn get_mut(&mut self, index: ConnectionIndex) -> Result<&mut Connection, TransferError> {
        match self.slots.get_mut(index.get()) {
            Some(Slot::Busy(conn)) => Ok(&mut **conn),
            _ => Err(TransferError::StaleIndex { index: index.get() }),
        }
    }

    /// True when the slot is in use by a transfer.
    #[must_use]
    pub fn is_busy(&self, index: ConnectionIndex) -> bool {
        matches!(self.slots.get(index.get()), Some(Slot::Busy(_)))
    }

    /// Returns a busy slot to the pool.
    ///
    /// With `reusable` set and no close-after-use flag the connection stays
    /// pooled; otherwise it is torn down and the slot emptied.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::StaleIndex`] unless the slot is busy.
    #[instrument(skip(self), fields(index = %index))]
    pub async fn release(
        &mut self,
        index: ConnectionIndex,
        reusable: bool,
    ) -> Result<(), TransferError> {
        let position = index.get();
        if !self.is_busy(index) {
            return Err(TransferError::StaleIndex { index: position });
        }
        let slot = std::mem::replace(&mut self.slots[position], Slot::Vacant);
        if let Slot::Busy(mut conn) = slot {
            conn.bits.reuse = false;
            if reusable && !conn.bits.close {
                conn.touch();
                debug!("Connection returned to pool");
                self.slots[position] = Slot::Idle(conn);
            } else {
                debug!(close = conn.bits.close, "Closing connection on release");
                conn.teardown().await;
            }
        }
        Ok(())
    }

    /// Tears down connections left busy by a transfer that never released
    /// them (its future was dropped). Returns how many were reclaimed.
    pub async fn reclaim_busy(&mut self) -> usize {
        let mut reclaimed = 0;
        for slot in &mut self.slots {
            if matches!(slot, Slot::Busy(_))
                && let Slot::Busy(mut conn) = std::mem::replace(slot, Slot::Vacant)
            {
                conn.teardown().await;
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            info!(reclaimed, "Reclaimed abandoned busy connections");
        }
        reclaimed
    }

    /// Tears down every connection and empties every slot. Idempotent.
    #[instrument(skip(self))]
    pub async fn close_all(&mut self) {
        let mut closed = 0usize;
        for slot in &mut self.slots {
            if let Slot::Idle(mut conn) | Slot::Busy(mut conn) =
                std::mem::replace(slot, Slot::Vacant)
            {
                conn.teardown().await;
                closed += 1;
            }
        }
        if closed > 0 {
            info!(closed, "Closed all pooled connections");
        }
    }

    /// Changes the number of slots.
    ///
    /// Growing adds vacant slots. Shrinking tears down idle connections in
    /// the removed slots.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::PoolExhausted`] if a removed slot is busy; the
    /// pool is left unchanged.
    #[instrument(skip(self))]
    pub async fn resize(&mut self, capacity: usize) -> Result<(), TransferError> {
        let current = self.slots.len();
        if capacity >= current {
            self.slots.resize_with(capacity, || Slot::Vacant);
            return Ok(());
        }
        if self.slots[capacity..]
            .iter()
            .any(|slot| matches!(slot, Slot::Busy(_)))
        {
            return Err(TransferError::PoolExhausted { capacity: current });
        }
        for slot in self.slots.drain(capacity..) {
            if let Slot::Idle(mut conn) = slot {
                conn.teardown().await;
            }
        }
        debug!(from = current, to = capacity, "Pool resized");
        Ok(())
    }

    /// Current occupancy.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            capacity: self.slots.len(),
            ..PoolStats::default()
        };
        for slot in &self.slots {
            match slot {
                Slot::Vacant => {}
                Slot::Idle(_) => stats.idle += 1,
                Slot::Busy(_) => stats.busy += 1,
            }
        }
        stats.occupied = stats.idle + stats.busy;
        stats
    }
}
