//! The request-handler accept loop: one UNIX stream socket per VE node,
//! one thread per connected pseudo process, each connection served as a
//! sequence of length-prefixed command/reply round trips.

use std::io::{BufReader, BufWriter, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use ve_proto::command::Command;
use ve_proto::envelope::Envelope;
use ve_proto::reply::Reply;

use crate::config::Config;
use crate::dispatch::dispatch;
use crate::service::Service;

/// How often the accept loop wakes up to re-check `terminate_flag` while
/// no connection is pending.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Binds the socket and serves connections until `registry.terminate_flag`
/// is set (by the `SIGINT`/`SIGTERM` handler installed in `main`).
pub fn serve(service: Arc<Service>, config: Arc<Config>) -> std::io::Result<()> {
    let socket_path = config.socket_path();
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)?;
    listener.set_nonblocking(true)?;
    log::info!("serving pseudo-process protocol on {socket_path}");

    while !service.registry.terminate_flag.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _addr)) => {
                let service = service.clone();
                let config = config.clone();
                std::thread::spawn(move || {
                    if let Err(e) = handle_connection(&service, &config, stream) {
                        log::debug!("connection handler exited: {e}");
                    }
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => return Err(e),
        }
    }

    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}

fn handle_connection(service: &Service, config: &Config, stream: UnixStream) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);

    loop {
        let envelope = match Envelope::read_from(&mut reader) {
            Ok(e) => e,
            Err(ve_proto::Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => {
                log::debug!("malformed envelope, closing connection: {e}");
                return Ok(());
            }
        };

        // Held for the duration of one request: shutdown takes this lock
        // for write, so a handler in flight always finishes before the
        // engine and registry are torn down.
        let _permit = service.registry.handling_request_lock.read().unwrap();
        let reply = match Command::decode(envelope.command_id, &envelope.payload) {
            Ok(command) => dispatch(service, config, envelope.caller_pid, command),
            Err(e) => Reply::err(e.to_errno()),
        };
        drop(_permit);

        reply.write_to(&mut writer).map_err(|e| std::io::Error::other(e.to_string()))?;
        writer.flush()?;
    }
}
