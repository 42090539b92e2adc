// Veriboard - Embedded Board Emulation Platform
// Copyright (C) 2026 The Veriboard Authors
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

mod board;

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use veriboard_config::Config;

const EXIT_OK: u8 = 0;
const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_RUNTIME_ERROR: u8 = 3;

#[derive(Parser, Debug)]
#[command(author, version, about = "Veriboard emulator", long_about = None)]
struct Cli {
    /// Configuration file(s), loaded in order; the first binding of a key
    /// wins.
    #[arg(required = true)]
    configs: Vec<PathBuf>,

    /// Log filter (tracing EnvFilter syntax), e.g. "debug" or
    /// "veriboard_core=trace".
    #[arg(long, default_value = "info")]
    log: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&cli.log)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::new();
    for path in &cli.configs {
        if let Err(e) = config.read_file(path) {
            error!("{e}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    }

    let board = match board::Board::from_config(config) {
        Ok(board) => board,
        Err(e) => {
            error!("board bring-up failed: {e:#}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    if let Some(addr) = board.gdb_addr() {
        tracing::info!("debug access on {addr}");
    }

    match board.run(None) {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(e) => {
            error!("emulator stopped: {e:#}");
            ExitCode::from(EXIT_RUNTIME_ERROR)
        }
    }
}
