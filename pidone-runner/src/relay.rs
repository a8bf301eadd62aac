// Byte relays between supervisor and child streams

use nix::libc;
use std::io::{self, Read, Write};
use std::thread;
use tokio::sync::oneshot;
use tracing::{debug, error, trace};

const BUFFER_SIZE: usize = 8192;

/// Copy `reader` into `writer` until end-of-stream.
///
/// Every chunk is flushed so partial lines (prompts) reach the terminal.
/// `EIO` counts as end-of-stream: a pty master reports it once the last
/// slave descriptor closes.
pub fn copy_stream<R: Read, W: Write>(reader: &mut R, writer: &mut W) -> io::Result<u64> {
    let mut buf = [0u8; BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.raw_os_error() == Some(libc::EIO) => return Ok(total),
            Err(e) => return Err(e),
        };

        writer.write_all(&buf[..n])?;
        writer.flush()?;
        total += n as u64;
        trace!(bytes = n, "Relayed chunk");
    }
}

/// A relay running on its own OS thread
pub struct Relay {
    name: &'static str,
    done: oneshot::Receiver<io::Result<u64>>,
}

impl Relay {
    /// Start copying on a dedicated thread. The thread is never joined; a
    /// relay still blocked in `read` when the supervisor exits is abandoned.
    pub fn spawn<R, W>(name: &'static str, mut reader: R, mut writer: W) -> io::Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        Self::spawn_then(name, move || copy_stream(&mut reader, &mut writer), |_| {})
    }

    /// Like [`Relay::spawn`] with a hook that runs on the relay thread once
    /// copying has stopped, whatever the outcome.
    pub fn spawn_with<R, W, F>(
        name: &'static str,
        mut reader: R,
        mut writer: W,
        on_finish: F,
    ) -> io::Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
        F: FnOnce(&io::Result<u64>) + Send + 'static,
    {
        Self::spawn_then(name, move || copy_stream(&mut reader, &mut writer), on_finish)
    }

    fn spawn_then<C, F>(name: &'static str, copy: C, on_finish: F) -> io::Result<Self>
    where
        C: FnOnce() -> io::Result<u64> + Send + 'static,
        F: FnOnce(&io::Result<u64>) + Send + 'static,
    {
        let (tx, done) = oneshot::channel();
        thread::Builder::new()
            .name(format!("relay-{}", name))
            .spawn(move || {
                let result = copy();
                match &result {
                    Ok(bytes) => debug!(relay = name, bytes, "Relay reached end of stream"),
                    Err(e) => error!(relay = name, error = %e, "Relay failed"),
                }
                on_finish(&result);
                let _ = tx.send(result);
            })?;

        Ok(Self { name, done })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Wait for the relay thread to stop copying
    pub async fn finished(self) -> io::Result<u64> {
        match self.done.await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("relay {} stopped without reporting", self.name),
            )),
        }
    }
}
