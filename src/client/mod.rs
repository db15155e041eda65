//! DSDC client side: the smart client library, plus the master-link state
//! machine that slave and lock-server processes share.

mod masterlink;
mod smartcli;

pub(crate) use masterlink::MasterLink;
pub use smartcli::{ClientConfig, DsdcClient};
