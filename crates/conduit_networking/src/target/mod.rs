//! # RPC Targets
//!
//! Who a procedure call is addressed to.
//!
//! ## Target Kinds
//!
//! ```text
//! SendTo (fixed policy, no allocation)
//!   Owner │ NotOwner │ Server │ NotServer │ Me │ NotMe │ Everyone │ ClientsAndHost
//!
//! RpcTargets (built per call)
//!   single(id) / group(ids) / not(ids)   ──► TargetRef::Temporary   (locked, reused)
//!   allocate_*(..)                       ──► TargetRef::Persistent  (pooled, caller releases)
//! ```
//!
//! Temporary targets share one slot that is overwritten by the next
//! temporary target; a stale reference resolves to
//! [`NetworkError::InvalidTarget`]. Persistent targets live in a
//! [`SlotPool`] and must be released by the caller.

mod proxy;
mod resolver;

pub use proxy::{read_proxy, write_proxy, ProxyHeader};
pub use resolver::{Resolution, ResolveContext, TargetResolver};

use conduit_core::{SlotHandle, SlotPool};

use crate::error::{NetworkError, NetworkResult};

/// Fixed routing policies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SendTo {
    /// The object's current owner.
    Owner,
    /// Every observer except the owner.
    NotOwner,
    /// The server.
    Server,
    /// Every observer except the server.
    NotServer,
    /// The local process only.
    Me,
    /// Every observer except the local process.
    NotMe,
    /// Every observer, the server included.
    Everyone,
    /// Every client, plus the server when it is a host.
    ClientsAndHost,
    /// The target is supplied with the call.
    SpecifiedInParams,
}

impl SendTo {
    /// The equivalent target, `None` for [`SendTo::SpecifiedInParams`].
    #[must_use]
    pub fn target(self) -> Option<&'static RpcTarget> {
        let index = match self {
            Self::Owner => 0,
            Self::NotOwner => 1,
            Self::Server => 2,
            Self::NotServer => 3,
            Self::Me => 4,
            Self::NotMe => 5,
            Self::Everyone => 6,
            Self::ClientsAndHost => 7,
            Self::SpecifiedInParams => return None,
        };
        Some(&FIXED_TARGETS[index])
    }
}

static FIXED_TARGETS: [RpcTarget; 8] = [
    RpcTarget::Owner,
    RpcTarget::NotOwner,
    RpcTarget::Server,
    RpcTarget::NotServer,
    RpcTarget::Me,
    RpcTarget::NotMe,
    RpcTarget::Everyone,
    RpcTarget::ClientsAndHost,
];

/// A routing policy.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RpcTarget {
    /// The local process only.
    Me,
    /// One client.
    Single(u64),
    /// The server.
    Server,
    /// The object's current owner.
    Owner,
    /// Every observer except the owner.
    NotOwner,
    /// Every observer except the server.
    NotServer,
    /// Every observer except the local process.
    NotMe,
    /// Every observer, the server included.
    Everyone,
    /// Every client, plus the server when it is a host.
    ClientsAndHost,
    /// An explicit list of clients.
    Group(Vec<u64>),
    /// Every connected client and the server, except the listed ids.
    Not(Vec<u64>),
}

/// Handle to a target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetRef {
    /// A fixed policy.
    Fixed(SendTo),
    /// The shared temporary target as of `generation`.
    Temporary {
        /// Generation of the temporary slot this reference was issued for.
        generation: u64,
    },
    /// A pooled target owned by the caller.
    Persistent(SlotHandle),
}

impl From<SendTo> for TargetRef {
    fn from(send_to: SendTo) -> Self {
        Self::Fixed(send_to)
    }
}

/// Factory and owner of non-fixed targets.
pub struct RpcTargets {
    temporary: RpcTarget,
    generation: u64,
    persistent: SlotPool<RpcTarget>,
}

impl RpcTargets {
    /// Creates a factory able to hold `max_persistent` persistent targets.
    #[must_use]
    pub fn new(max_persistent: usize) -> Self {
        Self {
            temporary: RpcTarget::Me,
            generation: 0,
            persistent: SlotPool::new(max_persistent),
        }
    }

    fn set_temporary(&mut self, target: RpcTarget) -> TargetRef {
        self.temporary = target;
        self.generation += 1;
        TargetRef::Temporary {
            generation: self.generation,
        }
    }

    /// Temporary target for one client.
    pub fn single(&mut self, client: u64) -> TargetRef {
        self.set_temporary(RpcTarget::Single(client))
    }

    /// Temporary target for a list of clients.
    pub fn group(&mut self, clients: impl IntoIterator<Item = u64>) -> TargetRef {
        let mut ids = match std::mem::replace(&mut self.temporary, RpcTarget::Me) {
            RpcTarget::Group(mut ids) | RpcTarget::Not(mut ids) => {
                ids.clear();
                ids
            }
            _ => Vec::new(),
        };
        ids.extend(clients);
        self.set_temporary(RpcTarget::Group(ids))
    }

    /// Temporary target for everyone except a list of clients.
    pub fn not(&mut self, excluded: impl IntoIterator<Item = u64>) -> TargetRef {
        let mut ids = match std::mem::replace(&mut self.temporary, RpcTarget::Me) {
            RpcTarget::Group(mut ids) | RpcTarget::Not(mut ids) => {
                ids.clear();
                ids
            }
            _ => Vec::new(),
        };
        ids.extend(excluded);
        self.set_temporary(RpcTarget::Not(ids))
    }

    /// Stores `target` in the pool.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Pool`] when the pool is full.
    pub fn allocate(&mut self, target: RpcTarget) -> NetworkResult<TargetRef> {
        Ok(TargetRef::Persistent(self.persistent.allocate(target)?))
    }

    /// Persistent target for one client.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Pool`] when the pool is full.
    pub fn allocate_single(&mut self, client: u64) -> NetworkResult<TargetRef> {
        self.allocate(RpcTarget::Single(client))
    }

    /// Persistent target for a list of clients.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Pool`] when the pool is full.
    pub fn allocate_group(&mut self, clients: &[u64]) -> NetworkResult<TargetRef> {
        self.allocate(RpcTarget::Group(clients.to_vec()))
    }

    /// Persistent target for everyone except a list of clients.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Pool`] when the pool is full.
    pub fn allocate_not(&mut self, excluded: &[u64]) -> NetworkResult<TargetRef> {
        self.allocate(RpcTarget::Not(excluded.to_vec()))
    }

    /// Looks up the target behind `target_ref`.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::InvalidTarget`] for stale temporary or
    /// released persistent references and [`NetworkError::MissingTarget`]
    /// for [`SendTo::SpecifiedInParams`].
    pub fn get(&self, target_ref: TargetRef) -> NetworkResult<&RpcTarget> {
        match target_ref {
            TargetRef::Fixed(send_to) => send_to.target().ok_or(NetworkError::MissingTarget),
            TargetRef::Temporary { generation } if generation == self.generation => {
                Ok(&self.temporary)
            }
            TargetRef::Temporary { .. } => Err(NetworkError::InvalidTarget),
            TargetRef::Persistent(handle) => self
                .persistent
                .get(handle)
                .ok_or(NetworkError::InvalidTarget),
        }
    }

    /// Releases a persistent target.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::TemporaryTargetRelease`] for fixed and
    /// temporary targets, which the session owns, and
    /// [`NetworkError::Pool`] for handles already released.
    pub fn release(&mut self, target_ref: TargetRef) -> NetworkResult<()> {
        match target_ref {
            TargetRef::Persistent(handle) => {
                self.persistent.free(handle)?;
                Ok(())
            }
            TargetRef::Fixed(_) | TargetRef::Temporary { .. } => {
                tracing::error!(
                    "attempted to release a locked rpc target; only allocated targets can be released"
                );
                Err(NetworkError::TemporaryTargetRelease)
            }
        }
    }

    /// Number of persistent targets held.
    #[must_use]
    pub fn persistent_count(&self) -> usize {
        self.persistent.allocated_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::PoolError;

    #[test]
    fn test_fixed_targets() {
        let targets = RpcTargets::new(4);
        assert_eq!(targets.get(SendTo::Owner.into()), Ok(&RpcTarget::Owner));
        assert_eq!(
            targets.get(SendTo::SpecifiedInParams.into()),
            Err(NetworkError::MissingTarget)
        );
    }

    #[test]
    fn test_temporary_target_goes_stale() {
        let mut targets = RpcTargets::new(4);
        let first = targets.single(3);
        assert_eq!(targets.get(first), Ok(&RpcTarget::Single(3)));

        let second = targets.group([1, 2]);
        assert_eq!(targets.get(first), Err(NetworkError::InvalidTarget));
        assert_eq!(targets.get(second), Ok(&RpcTarget::Group(vec![1, 2])));

        let third = targets.not([5]);
        assert_eq!(targets.get(third), Ok(&RpcTarget::Not(vec![5])));
    }

    #[test]
    fn test_temporary_release_is_rejected() {
        let mut targets = RpcTargets::new(4);
        let temporary = targets.single(1);
        assert_eq!(
            targets.release(temporary),
            Err(NetworkError::TemporaryTargetRelease)
        );
        assert_eq!(
            targets.release(SendTo::Everyone.into()),
            Err(NetworkError::TemporaryTargetRelease)
        );
        assert_eq!(targets.get(temporary), Ok(&RpcTarget::Single(1)));
    }

    #[test]
    fn test_persistent_lifecycle() {
        let mut targets = RpcTargets::new(1);
        let group = targets.allocate_group(&[4, 5]).unwrap();
        targets.single(9);

        assert_eq!(targets.get(group), Ok(&RpcTarget::Group(vec![4, 5])));
        assert!(matches!(
            targets.allocate_single(2),
            Err(NetworkError::Pool(PoolError::Exhausted { .. }))
        ));

        targets.release(group).unwrap();
        assert_eq!(targets.get(group), Err(NetworkError::InvalidTarget));
        assert!(targets.release(group).is_err());
        assert_eq!(targets.persistent_count(), 0);
    }
}
