use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

pub fn ensure_initialized() {
    INIT.call_once(|| {
        let filter_str = std::env::var("RUST_LOG")
            .unwrap_or_else(|_| "info,embergrid_offheap=debug".to_string());
        let filter = EnvFilter::try_new(&filter_str).unwrap_or_else(|_| EnvFilter::new("info"));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    });
}
