//! DSDC master role: membership tracking, snapshot hand-out, and routing
//! passthrough for dumb clients.

mod membership;
mod master;

pub use master::{Master, MasterConfig};

pub(crate) use membership::{Membership, RouteTarget};
