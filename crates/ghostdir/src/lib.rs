//! ghostdir: races a privileged directory-provisioning service.
//!
//! The service handles a provisioning request in two observable steps:
//! create a `tmp` subdirectory, then assign its ownership to the caller.
//! A truncation bug (see the `protocol` crate) makes the creation step
//! target `Data/tmp` instead of `Data/tmp/`. Between the two steps this
//! tool swaps a decoy directory into `Data`, so the ownership step lands
//! on a hard link to a file we want to own.

pub mod config;
pub mod fsops;
pub mod race;
pub mod signals;
pub mod trigger;
