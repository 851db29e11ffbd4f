//! Local, owner-only control socket gating the supervisor's detection scan.

use crate::error::Error;
use crate::ControlBlock;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Binds the control socket at `path` (mode 0700) and spawns its accept loop
/// on a dedicated OS thread. The loop polls `quit` between accepts and
/// removes the socket file on every exit path.
pub fn spawn_control_socket(
    path: impl Into<PathBuf>,
    control: Arc<ControlBlock>,
    quit: CancellationToken,
) -> Result<thread::JoinHandle<()>, Error> {
    let path = path.into();
    if path.exists() {
        fs::remove_file(&path).map_err(|source| Error::Socket {
            path: path.clone(),
            source,
        })?;
    }
    let listener = UnixListener::bind(&path).map_err(|source| Error::Socket {
        path: path.clone(),
        source,
    })?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o700)).map_err(|source| Error::Socket {
        path: path.clone(),
        source,
    })?;
    listener
        .set_nonblocking(true)
        .map_err(|source| Error::Socket {
            path: path.clone(),
            source,
        })?;

    let socket_path = path.clone();
    let handle = thread::Builder::new()
        .name("wisdom-ctl".into())
        .spawn(move || {
            while !quit.is_cancelled() {
                match listener.accept() {
                    Ok((stream, _)) => handle_connection(stream, &control),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(ACCEPT_POLL);
                    }
                    Err(source) => {
                        warn!(%source, "control socket accept failed, shutting the listener down");
                        break;
                    }
                }
            }
            let _ = fs::remove_file(&socket_path);
        })
        .map_err(|source| Error::ThreadSpawnError {
            thread_name: "wisdom-ctl".into(),
            source,
        })?;
    Ok(handle)
}

fn handle_connection(stream: UnixStream, control: &ControlBlock) {
    let Ok(mut reader) = stream.try_clone().map(BufReader::new) else {
        return;
    };
    let mut line = String::new();
    if reader.read_line(&mut line).unwrap_or(0) == 0 {
        return;
    }
    let mut writer = stream;
    let reply = match line.trim() {
        "start" => {
            control.enable();
            "ok\n"
        }
        "stop" => {
            control.disable();
            "ok\n"
        }
        other => {
            debug!(command = other, "unrecognized control socket command");
            "unknown\n"
        }
    };
    let _ = writer.write_all(reply.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ControlBlock;
    use std::io::{BufRead, BufReader, Write};
    use std::os::unix::net::UnixStream;

    #[test]
    fn start_and_stop_toggle_the_control_block() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("wisdom.sock");
        let control = Arc::new(ControlBlock::new(false));
        let quit = CancellationToken::new();
        let handle = spawn_control_socket(&path, Arc::clone(&control), quit.clone()).unwrap();

        // Give the accept loop a moment to start polling.
        thread::sleep(Duration::from_millis(50));

        let mut stream = UnixStream::connect(&path).unwrap();
        stream.write_all(b"start\n").unwrap();
        let mut reply = String::new();
        BufReader::new(&stream).read_line(&mut reply).unwrap();
        assert_eq!(reply, "ok\n");
        assert!(control.is_enabled());

        let mut stream = UnixStream::connect(&path).unwrap();
        stream.write_all(b"stop\n").unwrap();
        let mut reply = String::new();
        BufReader::new(&stream).read_line(&mut reply).unwrap();
        assert_eq!(reply, "ok\n");
        assert!(!control.is_enabled());

        quit.cancel();
        handle.join().unwrap();
    }
}
