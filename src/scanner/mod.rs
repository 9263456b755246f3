//! Filesystem scanning: root walking and candidate discovery.

pub mod walker;
