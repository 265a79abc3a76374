pub fn trace_enabled() -> bool {
    std::env::var("OBJCACHE_TRACE")
        .ok()
        .as_deref()
        .map(|v| v == "1")
        .unwrap_or(false)
}

pub fn trace(msg: &str) {
    if trace_enabled() {
        eprintln!("[objcache] {}", msg);
    }
}
