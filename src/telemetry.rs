//! Logging/tracing bootstrap. Installs a `tracing_subscriber::fmt` layer
//! driven by `RUST_LOG`, the `tracing` equivalent of the teacher's
//! `env_logger::builder().format_module_path(false).try_init()`.

#[cfg(feature = "bin")]
pub fn init() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .try_init();
}
