// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Sets the configuration file
    #[arg(short, long, value_name = "FILE", env = "DUALGATE_CONFIG")]
    config: String,
}

impl Args {
    pub fn config(&self) -> &str {
        &self.config
    }
}
