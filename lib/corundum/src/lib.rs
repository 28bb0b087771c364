//! `Corundum` is the host side of the render pipeline: a server that accepts
//! proxy connections, spawns an isolated worker per guest graphics context and
//! relays the per-context command protocol between the guest driver and the
//! renderer backend.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod context;
pub mod dispatch;
pub mod jail;
pub mod net;
pub mod render;
pub mod shared;
pub mod supervisor;
pub mod timeline;
pub mod worker;
