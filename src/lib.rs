// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Cooperative coroutine runtime for non-blocking network I/O.
//!
//! User code runs as coroutines (plain Rust futures) on a pool of workers,
//! one single-threaded event loop per worker. Socket operations look
//! blocking but suspend the calling coroutine on would-block and resume it
//! when the reactor reports readiness. On top of that suspension protocol
//! sit cross-coroutine primitives ([`sync::Event`], [`sync::Mutex`],
//! [`sync::Pool`]) and a TLS adapter ([`tls`]) that drives an OpenSSL
//! session over the same non-blocking file descriptors.

#[macro_use]
extern crate log;

mod pal;

pub mod runtime;

pub mod sock;

pub mod sync;

pub mod tls;

pub use crate::runtime::{
    fail::Fail,
    Runtime,
};

/// Asserts that two expressions are equal, bailing out of the enclosing
/// test with an [`anyhow::Error`] instead of panicking.
#[macro_export]
macro_rules! ensure_eq {
    ($left:expr, $right:expr) => {{
        let left = $left;
        let right = $right;
        if left != right {
            ::anyhow::bail!(
                "ensure_eq failed: `{} == {}` (left: `{:?}`, right: `{:?}`)",
                stringify!($left),
                stringify!($right),
                left,
                right,
            );
        }
    }};
}

/// Counterpart of [`ensure_eq`] for inequality.
#[macro_export]
macro_rules! ensure_neq {
    ($left:expr, $right:expr) => {{
        let left = $left;
        let right = $right;
        if left == right {
            ::anyhow::bail!(
                "ensure_neq failed: `{} != {}` (left: `{:?}`, right: `{:?}`)",
                stringify!($left),
                stringify!($right),
                left,
                right,
            );
        }
    }};
}
