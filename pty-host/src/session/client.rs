// Blocking client for the pty host daemon
// Talks newline-delimited JSON over the daemon's Unix socket.

use super::config::Config;
use super::protocol::{deserialize_message, serialize_message, PtyHostEvent, PtyRequest, PtyResponse};
use anyhow::{Context, Result};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

/// Responses larger than this are treated as a protocol error
pub const MAX_RESPONSE_FRAME_SIZE: usize = 64 * 1024 * 1024;

const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Send a request to the daemon and wait for its response.
///
/// Host events that arrive before the response (on a connection that has
/// subscribed) are skipped.
pub fn send_request(config: &Config, request: &PtyRequest) -> Result<PtyResponse> {
    let mut stream = UnixStream::connect(&config.socket_path).with_context(|| {
        format!(
            "Failed to connect to pty host at {}",
            config.socket_path.display()
        )
    })?;
    stream
        .set_read_timeout(Some(READ_TIMEOUT))
        .context("Failed to set read timeout")?;

    let bytes = serialize_message(request).context("Failed to serialize request")?;
    stream
        .write_all(&bytes)
        .context("Failed to send request to pty host")?;
    stream.flush().context("Failed to flush stream")?;

    read_response(&mut stream)
}

/// Read lines until one parses as a response, enforcing frame size limits
fn read_response(stream: &mut UnixStream) -> Result<PtyResponse> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .context("Failed to read response from pty host")?;
        if read == 0 {
            return Err(anyhow::anyhow!("Pty host closed connection unexpectedly"));
        }
        if line.len() > MAX_RESPONSE_FRAME_SIZE {
            return Err(anyhow::anyhow!(
                "Response frame too large: {} bytes (max {})",
                line.len(),
                MAX_RESPONSE_FRAME_SIZE
            ));
        }

        if deserialize_message::<PtyHostEvent>(line.as_bytes()).is_ok() {
            continue;
        }

        return deserialize_message::<PtyResponse>(line.as_bytes()).with_context(|| {
            format!("Failed to parse pty host response (line: {})", line.trim())
        });
    }
}

/// Turn an error response into a message, or extract the expected payload
pub fn response_to_result<T, F>(response: PtyResponse, extract: F) -> Result<T, String>
where
    F: FnOnce(PtyResponse) -> Option<T>,
{
    if let PtyResponse::Error { code: _, message } = response {
        return Err(message);
    }

    extract(response).ok_or_else(|| "Unexpected response from pty host".to_string())
}
