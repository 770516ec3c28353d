//! Engine for syncing a local directory tree onto a remote one through a
//! helper process driven over its stdin/stdout.
//!
//! The pieces, client to server: [`snapshot`] scans the local tree and
//! [`plan`] diffs two scans into delete/upload work; [`driver`] pushes that
//! work through a [`session`], which speaks the framed binary protocol
//! defined by [`wire`] over any `Read`/`Write` pair; [`executor`] is the
//! other end of that conversation, applying operations to the remote
//! filesystem. [`state`] persists the snapshot between runs.

pub mod driver;
pub mod errors;
pub mod executor;
pub mod frame;
pub mod logger;
pub mod plan;
pub mod session;
pub mod snapshot;
pub mod state;
pub mod stream;
pub mod wire;
