// Copyright 2024-2026 Pipeway Developers <dev@pipeway.dev>
// SPDX-License-Identifier: MIT OR Apache-2.0

use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let opts = pipeway::Opts::parse();
    pipeway::run(opts).await
}
