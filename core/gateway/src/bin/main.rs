// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;

use dualgate::args::Args;
use dualgate::runner;

fn main() {
    let args = Args::parse();

    if let Err(e) = runner::run(args.config()) {
        eprintln!("dualgate: {e:#}");
        std::process::exit(1);
    }
}
