// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The entry point into a running server instance: parses the command line
//! options, loads the configuration, and launches the core threads.

#[macro_use]
extern crate log;

use backtrace::Backtrace;
use clap::{App, Arg};
use config::McbpserverConfig;
use mcbpserver::Mcbpserver;

fn main() {
    // custom panic hook to terminate whole process after unwinding
    std::panic::set_hook(Box::new(|s| {
        error!("{}", s);
        eprintln!("{:?}", Backtrace::new());
        std::process::exit(101);
    }));

    // parse command line options
    let matches = App::new(env!("CARGO_BIN_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .long_about(
            "A key/value server speaking the binary protocol, serving an \
            in-memory bucket. Supports TLS, feature negotiation, and \
            change-feed channels.",
        )
        .arg(
            Arg::with_name("stats")
                .short("s")
                .long("stats")
                .help("List all metrics in stats")
                .takes_value(false),
        )
        .arg(
            Arg::with_name("CONFIG")
                .help("Server configuration file")
                .index(1),
        )
        .arg(
            Arg::with_name("print-config")
                .help("List all options in config")
                .long("config")
                .short("c"),
        )
        .get_matches();

    // output stats descriptions and exit if the `stats` option was provided
    if matches.is_present("stats") {
        println!("{:<31} VALUE", "NAME");
        let mut stats = metrics_names();
        stats.sort_unstable();
        for name in stats {
            println!("{}", name);
        }
        std::process::exit(0);
    }

    // load config from file
    let config = if let Some(file) = matches.value_of("CONFIG") {
        match McbpserverConfig::load(file) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("unable to load config file: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        Default::default()
    };

    if matches.is_present("print-config") {
        config.print();
        std::process::exit(0);
    }

    // launch the server
    match Mcbpserver::new(config) {
        Ok(server) => server.wait(),
        Err(e) => {
            eprintln!("error launching server: {}", e);
            std::process::exit(1);
        }
    }
}

fn metrics_names() -> Vec<&'static str> {
    metrics::snapshot().into_iter().map(|(name, _)| name).collect()
}
