// Copyright (c) The testwright Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use clap::Parser;
use color_eyre::Result;
use testwright_cli::TestwrightApp;

fn main() -> Result<()> {
    color_eyre::install()?;
    testwright_cli::init_logging();

    let app = TestwrightApp::parse();
    let code = app.exec()?;
    std::process::exit(code);
}
