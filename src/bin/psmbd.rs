// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Broker entry point: loads `config.yaml` (or a path given on the
//! command line), binds the listener, and runs the accept loop.
//! Mirrors `pypsmb/entry.py`'s `-c/--config` flag and startup sequence;
//! TLS wrapping of the listener is not implemented (see DESIGN.md).

use std::net::TcpListener;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use psmb::config::Config;
use psmb::worker::Broker;

#[derive(Parser)]
#[command(name = "psmbd", about = "Pub/sub message broker")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            log::error!("configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let address = format!("{}:{}", config.listen.address, config.listen.port);
    let listener = match TcpListener::bind(&address) {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("cannot bind {}: {}", address, e);
            return ExitCode::FAILURE;
        }
    };
    log::info!("listening on {}", address);

    if config.ssl.is_some() {
        log::warn!("ssl configuration present but TLS termination is not implemented; serving plaintext");
    }

    let broker = Broker::new(config.connection.max_threads, config.connection.keep_alive);
    broker.accept_loop(listener);

    ExitCode::SUCCESS
}
