// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

use clap::Parser;

mod cli;
mod config;
mod play;

// Allow eprintln: the log sink may not be installed when a command fails
#[allow(clippy::disallowed_macros)]
fn main() {
    let cli = cli::Cli::parse();
    if let Err(e) = cli::handle_command(&cli) {
        eprintln!("mediactl: {e:#}");
        std::process::exit(1);
    }
}
