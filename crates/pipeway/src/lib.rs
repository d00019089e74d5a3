// Copyright 2024-2026 Pipeway Developers <dev@pipeway.dev>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Streaming HTTP rendezvous relay.
//!
//! One sender (`POST`/`PUT`) and `n` receivers (`GET`) meet on an arbitrary
//! path; the sender's request body streams straight into every receiver's
//! response body. Nothing is stored, nothing is buffered beyond small
//! per-receiver windows, and a path is forgotten the moment its transfer
//! concludes.

pub mod body;
pub mod error;
pub mod multipart;
pub mod opts;
pub mod pages;
pub mod pipe;
pub mod registry;
pub mod route;
pub mod server;
pub mod transfer;

pub use opts::Opts;
pub use registry::Registry;
pub use server::run;
