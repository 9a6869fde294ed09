use std::sync::Once;

static INIT: Once = Once::new();

pub fn setup() {
    INIT.call_once(|| {
        let _trace_sub = tracing_subscriber::fmt::try_init();
    });
}
