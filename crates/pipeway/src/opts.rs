// Copyright 2024-2026 Pipeway Developers <dev@pipeway.dev>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::net::IpAddr;

use clap::{crate_version, Parser};

#[derive(Debug, Parser)]
#[clap(
    name = "pipeway",
    about = "Streaming HTTP rendezvous relay",
    version = crate_version!()
)]
pub struct Opts {
    #[clap(
        long,
        help = "Address to bind.",
        default_value = "0.0.0.0",
        env = "PIPEWAY_HOST"
    )]
    pub host: IpAddr,

    #[clap(
        short,
        long,
        help = "Port to listen on.",
        default_value = "8080",
        env = "PIPEWAY_PORT"
    )]
    pub port: u16,

    #[clap(
        long,
        help = "Maximum simultaneously connected clients before connections are no longer accepted",
        default_value = "1024",
        env = "PIPEWAY_MAX_CLIENTS"
    )]
    pub max_clients: usize,
}
