//! The service entry point: parses CLI flags, builds the registry/engine/
//! signal subsystems, and serves the pseudo-process protocol until
//! `SIGINT`/`SIGTERM` asks it to shut down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use nix::sys::signal::{signal, SigHandler, Signal};

use veosd::{config::Config, server, service::Service};

/// Set from the `SIGINT`/`SIGTERM` handler; async-signal-safe since it
/// only touches a `Relaxed` atomic. This is the service process's own
/// termination, not to be confused with signal delivery to a VE task.
static SHOULD_TERMINATE: AtomicBool = AtomicBool::new(false);

extern "C" fn request_termination(_signum: i32) {
    SHOULD_TERMINATE.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    // SAFETY: the handler body only stores to an atomic, which is
    // async-signal-safe; no allocation or locking happens inside it.
    unsafe {
        let _ = signal(Signal::SIGINT, SigHandler::Handler(request_termination));
        let _ = signal(Signal::SIGTERM, SigHandler::Handler(request_termination));
    }
}

fn main() -> std::io::Result<()> {
    let config = Arc::new(Config::parse());

    env_logger::Builder::new().filter_level(config.log_level()).init();

    log::info!(
        "starting veosd for node {} (socket={}, driver={})",
        config.node,
        config.socket_path(),
        config.driver_device_path()
    );

    install_signal_handlers();

    let service = Service::new(&config)?;

    {
        let registry = service.registry.clone();
        std::thread::spawn(move || {
            while !SHOULD_TERMINATE.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(50));
            }
            log::info!("termination signal received, shutting down");
            registry.terminate_flag.store(true, Ordering::SeqCst);
        });
    }

    let result = server::serve(service.clone(), config);
    service.shutdown();
    result
}
