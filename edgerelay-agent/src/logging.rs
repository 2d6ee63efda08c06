//! Logging setup.

use log::LevelFilter;

/// Verbosity chosen on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// Warnings and errors only
    Silent,
    Normal,
    /// Everything down to debug
    Verbose,
}

impl Verbosity {
    pub fn from_flags(verbose: bool, silent: bool) -> Self {
        match (verbose, silent) {
            (true, _) => Verbosity::Verbose,
            (false, true) => Verbosity::Silent,
            (false, false) => Verbosity::Normal,
        }
    }

    pub fn level(self) -> LevelFilter {
        match self {
            Verbosity::Silent => LevelFilter::Warn,
            Verbosity::Normal => LevelFilter::Info,
            Verbosity::Verbose => LevelFilter::Debug,
        }
    }
}

/// Init logging.
///
/// `RUST_LOG`, when set, takes precedence over the command-line verbosity.
pub fn init(verbosity: Verbosity) {
    let mut builder = pretty_env_logger::formatted_timed_builder();
    match std::env::var("RUST_LOG") {
        Ok(filters) => {
            builder.parse_filters(&filters);
        }
        Err(_) => {
            builder.filter_level(verbosity.level());
        }
    }
    // a second init (tests, embedding) keeps the first logger
    let _ = builder.try_init();
}
