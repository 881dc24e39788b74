//! Driver-facing configuration.

use log::LevelFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OptLevel {
    O0,
    O1,
    O2,
    O3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Silent,
    Info,
    Debug,
}

impl LogLevel {
    /// The `log` facade filter the driver should install.
    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Silent => LevelFilter::Off,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub opt_level: OptLevel,
    pub log_level: LogLevel,
    /// Explicit ordered pass list; `None` selects the defaults for
    /// `opt_level`. Unknown names are reported, not ignored.
    pub passes: Option<Vec<String>>,
    /// Verify the IR between every two passes.
    pub debug_ir: bool,
    /// Fully unroll loops with a constant trip count up to this many
    /// iterations.
    pub unroll_full_threshold: u32,
    /// Largest partial-unroll factor.
    pub unroll_factor: u32,
    /// Inline callees up to this many instructions.
    pub inline_threshold: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            opt_level: OptLevel::O2,
            log_level: LogLevel::Silent,
            passes: None,
            debug_ir: false,
            unroll_full_threshold: 64,
            unroll_factor: 4,
            inline_threshold: 200,
        }
    }
}

impl Config {
    pub fn at_level(level: OptLevel) -> Config {
        Config { opt_level: level, ..Config::default() }
    }
}
