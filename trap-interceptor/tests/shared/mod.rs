#![allow(dead_code)]

pub use trap_interceptor::{Backend, Config, TrapInterceptor};

/// The signal-context backend uses process wide state, so every test that can
/// end up using it must hold this
pub static SERIAL: parking_lot::Mutex<()> = parking_lot::const_mutex(());

/// Every backend supported on the current target
pub fn backends() -> Vec<Backend> {
    [Backend::ExceptionPort, Backend::SignalContext]
        .into_iter()
        .filter(|backend| backend.is_supported())
        .collect()
}

pub fn interceptor(backend: Backend) -> TrapInterceptor {
    TrapInterceptor::new(Config::default().backend(backend))
}

/// Runs `test` once for each supported backend
pub fn with_each_backend(test: impl Fn(TrapInterceptor, Backend)) {
    let _serial = SERIAL.lock();

    for backend in backends() {
        test(interceptor(backend), backend);
    }
}
