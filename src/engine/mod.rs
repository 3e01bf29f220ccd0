//! Container engine module
//!
//! The upstream source of container state. The poller talks to it only
//! through the [`ContainerLister`] trait.

mod container;
mod docker;
mod lister;

pub use container::*;
pub use docker::*;
pub use lister::*;
