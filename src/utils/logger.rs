/// Initialise the global logger. `RUST_LOG` overrides the default `info` level.
/// Safe to call more than once; later calls are ignored.
pub fn setup_logger() {
    let _ = env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .try_init();
}
