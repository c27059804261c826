/*
BSD 2-Clause License

Copyright (c) 2022, Diagnosis and Control of Clouds Laboratory
All rights reserved.

Redistribution and use in source and binary forms, with or without
modification, are permitted provided that the following conditions are met:

1. Redistributions of source code must retain the above copyright notice, this
   list of conditions and the following disclaimer.

2. Redistributions in binary form must reproduce the above copyright notice,
   this list of conditions and the following disclaimer in the documentation
   and/or other materials provided with the distribution.

THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS"
AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE
FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER
CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY,
OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

*/

use clap::{App, Arg, SubCommand};

use correlator::settings::{Settings, SETTINGS_PATH};

fn main() {
    let matches = App::new("correlator")
        .about("Joins live log streams on shared keys and emits correlations")
        .arg(
            Arg::with_name("config")
                .long("config")
                .takes_value(true)
                .help("Path to the settings toml"),
        )
        .subcommand(
            SubCommand::with_name("validate")
                .about("Parse a query and print the parse tree")
                .arg(Arg::with_name("query").required(true)),
        )
        .subcommand(
            SubCommand::with_name("correlate")
                .about("Run a query against the configured adapters")
                .arg(Arg::with_name("query").required(true)),
        )
        .subcommand(SubCommand::with_name("show-config").about("Print the effective settings"))
        .get_matches();

    let settings = match matches.value_of("config") {
        Some(path) => match Settings::read_from(path) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        },
        None => Settings::read_from(SETTINGS_PATH).unwrap_or_default(),
    };

    match matches.subcommand() {
        ("validate", Some(args)) => {
            correlator::check_query(args.value_of("query").unwrap());
        }
        ("correlate", Some(args)) => {
            if let Err(e) = correlator::run_query(settings, args.value_of("query").unwrap()) {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        }
        ("show-config", _) => {
            correlator::show_config(&settings);
        }
        _ => {
            eprintln!("No subcommand given; try validate, correlate, or show-config");
            std::process::exit(2);
        }
    }
}
