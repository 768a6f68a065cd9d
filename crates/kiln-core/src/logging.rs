pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter("debug")
        .init();
}

/// Like [`init`], but safe to call more than once. Intended for tests,
/// where several cases may race to install the subscriber.
pub fn try_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .try_init();
}
