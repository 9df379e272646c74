//! Logging initialization

/// Initialize the logging system
///
/// Uses env_logger with default filter level of `info`.
/// Override with RUST_LOG environment variable, e.g. `RUST_LOG=brickpool=trace`
/// to see every bucket load and write-back.
///
/// # Example
/// ```
/// brickpool::core::logging::init();
/// log::info!("Pool opened");
/// ```
pub fn init() {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    )
    .format_timestamp_millis()
    .try_init();
}
