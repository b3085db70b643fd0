use std::sync::Once;

static INIT: Once = Once::new();

// Setup function that is only run once, even if called multiple times
#[allow(dead_code)]
pub fn setup() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .init()
    });
}
