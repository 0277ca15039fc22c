use env_logger::Env;

/// Install an `env_logger` backend for the `log` facade.
///
/// Defaults to `info`; `RUST_LOG` overrides it. Returns `false` if a logger
/// was already installed.
pub fn init_logger() -> bool {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init()
        .is_ok()
}

#[cfg(test)]
pub(crate) fn init_test_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
