//! Core library for the vcsd repository server.
//!
//! The [`store::Store`] is the heart of the crate: it maps remote
//! repositories to local clone directories, clones them on first access,
//! and shares opened handles between concurrent callers. The [`backend`]
//! module defines the VCS abstraction the store is generic over, and
//! [`paths`] computes the on-disk location of each repository.
pub mod backend;
pub mod paths;
pub mod store;

pub use backend::{Backend, Backends, Repository, TransportOptions, Vcs};
pub use store::{CloneSpec, Config, Error, Opened, Store};
