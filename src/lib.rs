//! CSI driver for Alcubierre/RBD block volumes.
//!
//! The controller provisions images and fences unreachable nodes; the node
//! plugin attaches, formats and mounts them. Both keep the single-holder
//! invariant through the `AlcubVolume` records owned by [`volume::VolumeRegistry`].

pub mod attach;
pub mod backend;
pub mod config;
pub mod controller;
pub mod crd;
pub mod csi;
pub mod error;
pub mod health;
pub mod store;
pub mod volume;

pub use error::{Error, Result};
