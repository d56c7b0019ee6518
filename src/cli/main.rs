//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Mailcore.
//
// Mailcore is free software: you can  redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailcore is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mailcore. If not, see <http://www.gnu.org/licenses/>.

use std::path::{Path, PathBuf};

use structopt::StructOpt;

use mailcore::support::sysexits::*;
use mailcore::support::system_config::SystemConfig;

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
enum Command {
    /// Validate a configuration file and exercise the store with it.
    ///
    /// The configuration is loaded and validated, then a short scenario is
    /// run against an in-memory store built from it: mailboxes are created,
    /// messages appended, copied, flagged, moved and deleted, and the quota
    /// counters are checked to follow along. Nothing is persisted.
    Check(CheckSubcommand),
    /// Hammer one lock with concurrent readers and writers.
    ///
    /// Each thread takes and releases the lock of a single mailbox the given
    /// number of times, choosing read or write at random. The whole run is
    /// repeated and the elapsed time of each repetition reported. A
    /// repetition that does not finish indicates a deadlock.
    StressLocks(StressSubcommand),
}

#[derive(StructOpt)]
pub(super) struct CheckSubcommand {
    /// The configuration file to check. Without it, the defaults are used.
    #[structopt(long, parse(from_os_str))]
    pub(super) config: Option<PathBuf>,
}

#[derive(StructOpt)]
pub(super) struct StressSubcommand {
    /// Number of concurrent threads.
    #[structopt(long, default_value = "100")]
    pub(super) threads: usize,
    /// Lock/unlock cycles per thread.
    #[structopt(long, default_value = "10")]
    pub(super) cycles: usize,
    /// Number of times to repeat the whole run.
    #[structopt(long, default_value = "20")]
    pub(super) repetitions: usize,
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more concise
    // API
    let cmd = Command::from_clap(&match Command::clap().get_matches_safe() {
        Ok(matches) => matches,
        Err(
            e @ clap::Error {
                kind: clap::ErrorKind::HelpDisplayed,
                ..
            },
        )
        | Err(
            e @ clap::Error {
                kind: clap::ErrorKind::VersionDisplayed,
                ..
            },
        ) => {
            println!("{}", e.message);
            return;
        },
        Err(e) => {
            eprintln!("{}", e.message);
            EX_USAGE.exit()
        },
    });

    match cmd {
        Command::Check(cmd) => {
            let config = load_config(cmd.config.as_deref());
            init_logging(cmd.config.as_deref().and_then(Path::parent));
            super::check::check(&config).exit()
        },
        Command::StressLocks(cmd) => {
            init_logging(None);
            super::stress::stress_locks(&cmd).exit()
        },
    }
}

fn load_config(path: Option<&Path>) -> SystemConfig {
    let path = match path {
        Some(path) => path,
        None => return SystemConfig::default(),
    };

    match SystemConfig::load(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error in config file at '{}': {}", path.display(), e);
            Sysexit::from(&e).exit()
        },
    }
}

fn init_logging(root: Option<&Path>) {
    if Ok(true) == nix::unistd::isatty(2) {
        // Running interactively; ignore logging configuration and just write
        // to stderr.
        mailcore::init_simple_log();
        return;
    }

    let log_config_file = root.map(|root| root.join("logging.toml"));
    if let Some(log_config_file) = log_config_file.filter(|f| f.is_file()) {
        if let Err(e) = log4rs::init_file(
            &log_config_file,
            log4rs::file::Deserializers::new(),
        ) {
            eprintln!(
                "Failed to initialise logging from '{}': {}",
                log_config_file.display(),
                e
            );
            EX_CONFIG.exit();
        }
        return;
    }

    let formatter = syslog::Formatter3164 {
        facility: syslog::Facility::LOG_MAIL,
        hostname: None,
        process: env!("CARGO_PKG_NAME").to_owned(),
        pid: nix::unistd::getpid().as_raw(),
    };
    match syslog::unix(formatter) {
        Ok(logger) => {
            if log::set_boxed_logger(Box::new(syslog::BasicLogger::new(
                logger,
            )))
            .is_ok()
            {
                log::set_max_level(log::LevelFilter::Info);
            }
        },
        // No syslog daemon; fall back to stderr rather than logging nothing
        Err(_) => mailcore::init_simple_log(),
    }
}
