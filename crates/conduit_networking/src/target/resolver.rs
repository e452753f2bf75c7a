//! # Target Resolution
//!
//! Turns a target and an object route into the set of clients a message
//! goes to, whether the local process runs it too, and whether the remote
//! part has to be relayed through the server.
//!
//! ```text
//! target + route ──► members ──┬── local id  ──► local invocation
//!                              └── others    ──► remote list
//!                                                   │
//!                         client with non-server ──►  proxy via server
//! ```
//!
//! Owner and observer data come from the route on every call, so ownership
//! changes are picked up without invalidating anything.

use crate::session::{ObjectRoute, SessionRole};
use crate::SERVER_CLIENT_ID;

use super::RpcTarget;

/// Session facts a resolution depends on.
#[derive(Clone, Copy, Debug)]
pub struct ResolveContext<'a> {
    /// Local client id.
    pub local_id: u64,
    /// Local role.
    pub role: SessionRole,
    /// The server also runs a local client.
    pub server_is_host: bool,
    /// Connected client ids (used by [`RpcTarget::Not`]).
    pub connected: &'a [u64],
}

/// Outcome of [`TargetResolver::resolve`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolution<'a> {
    /// Remote destinations, local id excluded, no duplicates.
    pub remote: &'a [u64],
    /// The local process is a destination.
    pub local: bool,
    /// The remote part must be wrapped in a proxy envelope for the server.
    pub via_relay: bool,
}

/// Reusable resolver.
#[derive(Debug, Default)]
pub struct TargetResolver {
    members: Vec<u64>,
}

impl TargetResolver {
    /// Creates a resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves `target` for the object behind `route`.
    pub fn resolve(
        &mut self,
        context: &ResolveContext<'_>,
        target: &RpcTarget,
        route: &ObjectRoute,
    ) -> Resolution<'_> {
        self.members.clear();
        let observers = route.observers.iter().copied();
        let with_server = || observers.clone().chain(std::iter::once(SERVER_CLIENT_ID));

        match target {
            RpcTarget::Me => self.members.push(context.local_id),
            RpcTarget::Single(client) => self.members.push(*client),
            RpcTarget::Server => self.members.push(SERVER_CLIENT_ID),
            RpcTarget::Owner => self.members.push(route.owner),
            RpcTarget::Everyone => self.members.extend(with_server()),
            RpcTarget::NotOwner => self
                .members
                .extend(with_server().filter(|&id| id != route.owner)),
            RpcTarget::NotServer => self
                .members
                .extend(observers.clone().filter(|&id| id != SERVER_CLIENT_ID)),
            RpcTarget::NotMe => self
                .members
                .extend(with_server().filter(|&id| id != context.local_id)),
            RpcTarget::ClientsAndHost => self.members.extend(
                observers
                    .clone()
                    .filter(|&id| id != SERVER_CLIENT_ID || context.server_is_host),
            ),
            RpcTarget::Group(clients) => self.members.extend_from_slice(clients),
            RpcTarget::Not(excluded) => self.members.extend(
                context
                    .connected
                    .iter()
                    .copied()
                    .chain(std::iter::once(SERVER_CLIENT_ID))
                    .filter(|id| !excluded.contains(id)),
            ),
        }

        self.finish(context)
    }

    /// Resolves an explicit client list, for messages not tied to an object.
    pub fn resolve_clients(&mut self, context: &ResolveContext<'_>, clients: &[u64]) -> Resolution<'_> {
        self.members.clear();
        self.members.extend_from_slice(clients);
        self.finish(context)
    }

    fn finish(&mut self, context: &ResolveContext<'_>) -> Resolution<'_> {
        self.members.sort_unstable();
        self.members.dedup();

        let local = match self.members.binary_search(&context.local_id) {
            Ok(position) => {
                self.members.remove(position);
                true
            }
            Err(_) => false,
        };
        let via_relay = !context.role.is_server()
            && self.members.iter().any(|&id| id != SERVER_CLIENT_ID);

        Resolution {
            remote: &self.members,
            local,
            via_relay,
        }
    }
}
