// Persistent terminal host (shared between the daemon binary and tests)

// Session management: pty service, persistent processes, replay and revival
pub mod session;

// Tracing subscriber setup
pub mod logging;

// Fakes and polling helpers for tests
pub mod test_utils;
