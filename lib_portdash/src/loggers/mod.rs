/// Installs the `fern` logger and rotates old log files.
pub mod setup;
