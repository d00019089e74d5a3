// Copyright 2024-2026 Pipeway Developers <dev@pipeway.dev>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Minimal HTTP serving tools for the pipeway relay

pub mod nursery;
pub mod response;
pub mod server;
pub mod signal;

pub use server::Server;
