//! Public entry point for embedding the volume engine in a host process:
//! a [`VolumeManager`] that owns the shared mountpoint pool, runs
//! admission control ahead of every new volume, and tracks open
//! [`Volume`] handles by namespace.

mod manager;

pub use manager::VolumeManager;
