// Copyright (c) The testpilot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

mod dispatch;

use clap::Parser;
use color_eyre::Result;
use dispatch::TestPilotApp;
use tracing_subscriber::{
    Layer,
    filter::{LevelFilter, Targets},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

fn main() -> Result<()> {
    color_eyre::install()?;
    init_logging();

    let app = TestPilotApp::parse();
    match app.exec() {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            eprintln!("testpilot: {error}");
            let mut source = std::error::Error::source(&error);
            while let Some(cause) = source {
                eprintln!("  caused by: {cause}");
                source = cause.source();
            }
            std::process::exit(error.exit_code())
        }
    }
}

fn init_logging() {
    let level_str = std::env::var("TESTPILOT_LOG").unwrap_or_default();
    // An empty setting means the standard info-level filter.
    let targets = if level_str.is_empty() {
        Targets::new().with_default(LevelFilter::INFO)
    } else {
        level_str.parse().expect("unable to parse TESTPILOT_LOG")
    };

    let layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(targets);
    tracing_subscriber::registry().with(layer).init();
}
