use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Dispatcher, ProtocolError, RequestContext, error_response};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Reads newline-delimited requests until EOF or shutdown, writing one line per response.
/// Lines longer than the configured limit are discarded and answered with `InvalidRequest`.
pub async fn serve_connection<R, W>(
    dispatcher: &Dispatcher,
    ctx: RequestContext,
    mut reader: R,
    mut writer: W,
    shutdown: CancellationToken,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let max_bytes = dispatcher.settings().max_request_bytes;
    let mut buf = Vec::new();
    let result = loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            frame = read_frame(&mut reader, &mut buf, max_bytes) => frame,
        };
        let line = match frame {
            Ok(Frame::Line(line)) => line,
            Ok(Frame::TooLong) => {
                warn!(connection_id = ctx.connection_id, max_bytes, "request line too long");
                let response = error_response(
                    None,
                    &ProtocolError::InvalidRequest(format!(
                        "request exceeds {max_bytes} bytes"
                    )),
                );
                if let Err(err) = write_line(&mut writer, &response).await {
                    break Err(err);
                }
                continue;
            }
            Ok(Frame::Eof) => break Ok(()),
            Err(err) => break Err(err),
        };
        if line.trim().is_empty() {
            continue;
        }

        if let Some(response) = dispatcher.handle_line(&ctx, &line).await {
            if let Err(err) = write_line(&mut writer, &response).await {
                break Err(err);
            }
        }
    };

    dispatcher.connection_closed(ctx.connection_id);
    debug!(connection_id = ctx.connection_id, "connection closed");
    result
}

#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Line(String),
    TooLong,
    Eof,
}

/// Reads one line of at most `max_bytes`. An oversized line is consumed through its newline
/// without being buffered.
async fn read_frame<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_bytes: usize,
) -> std::io::Result<Frame> {
    buf.clear();
    let mut oversized = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if oversized {
                return Ok(Frame::TooLong);
            }
            if buf.is_empty() {
                return Ok(Frame::Eof);
            }
            break;
        }

        let newline = available.iter().position(|byte| *byte == b'\n');
        let chunk = &available[..newline.unwrap_or(available.len())];
        if !oversized {
            if buf.len() + chunk.len() > max_bytes {
                oversized = true;
                buf.clear();
            } else {
                buf.extend_from_slice(chunk);
            }
        }
        let consumed = newline.map_or(available.len(), |idx| idx + 1);
        reader.consume(consumed);

        if newline.is_some() {
            if oversized {
                return Ok(Frame::TooLong);
            }
            break;
        }
    }

    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(Frame::Line(String::from_utf8_lossy(buf).into_owned()))
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Serves a single client over stdin/stdout. Logging must go to stderr.
pub async fn serve_stdio(
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    info!("serving protocol on stdio");
    let ctx = RequestContext::local(next_connection_id());
    serve_connection(
        &dispatcher,
        ctx,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        shutdown,
    )
    .await
}

/// Accepts local socket clients until shutdown. Connections beyond `max_connections` get one
/// `ConnectionLimitReached` error line and are closed.
pub async fn serve_unix(
    dispatcher: Dispatcher,
    socket_path: &Path,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if socket_path.exists() {
        tokio::fs::remove_file(socket_path).await?;
    }
    if let Some(parent) = socket_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let listener = UnixListener::bind(socket_path)?;
    restrict_permissions(socket_path)?;
    let limit = dispatcher.settings().max_connections;
    let slots = Arc::new(Semaphore::new(limit));
    info!(path = %socket_path.display(), max_connections = limit, "serving protocol on unix socket");

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "failed to accept connection");
                    continue;
                }
            },
        };

        let connection_id = next_connection_id();
        let (read_half, mut write_half) = stream.into_split();

        let Ok(permit) = slots.clone().try_acquire_owned() else {
            warn!(connection_id, limit, "connection limit reached, rejecting");
            let line = error_response(None, &ProtocolError::ConnectionLimitReached { limit });
            if let Err(err) = write_line(&mut write_half, &line).await {
                debug!(connection_id, error = %err, "failed to notify rejected connection");
            }
            let _ = write_half.shutdown().await;
            continue;
        };

        let dispatcher = dispatcher.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _permit = permit;
            debug!(connection_id, "connection accepted");
            if let Err(err) = serve_connection(
                &dispatcher,
                RequestContext::local(connection_id),
                BufReader::new(read_half),
                write_half,
                shutdown,
            )
            .await
            {
                warn!(connection_id, error = %err, "connection ended with error");
            }
        });
    }

    if let Err(err) = tokio::fs::remove_file(socket_path).await {
        debug!(error = %err, "failed to remove socket file");
    }
    Ok(())
}

fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(test)]
mod tests {
    use serde_json::Value;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;

    use super::super::ProtocolSettings;
    use super::super::test_support::{harness, parse};
    use super::*;

    #[tokio::test]
    async fn serve_connection_answers_each_request_line() {
        let h = harness(ProtocolSettings::default()).await;
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#,
            "\n\n",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"nope"}"#,
            "\n",
        );
        let mut output = Vec::new();

        serve_connection(
            &h.dispatcher,
            RequestContext::local(77),
            BufReader::new(input.as_bytes()),
            &mut output,
            CancellationToken::new(),
        )
        .await
        .expect("serve");

        let text = String::from_utf8(output).expect("utf8");
        let responses: Vec<Value> = text.lines().map(parse).collect();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["id"], 1);
        assert!(responses[0]["result"]["tools"].is_array());
        assert_eq!(responses[1]["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn oversized_request_is_refused_and_the_connection_continues() {
        let settings = ProtocolSettings {
            max_request_bytes: 64,
            ..ProtocolSettings::default()
        };
        let h = harness(settings).await;
        let input = format!(
            "{{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\",\"params\":{{\"pad\":\"{}\"}}}}\n{}\n",
            "x".repeat(200),
            r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#,
        );
        let mut output = Vec::new();

        serve_connection(
            &h.dispatcher,
            RequestContext::local(78),
            BufReader::with_capacity(16, input.as_bytes()),
            &mut output,
            CancellationToken::new(),
        )
        .await
        .expect("serve");

        let text = String::from_utf8(output).expect("utf8");
        let responses: Vec<Value> = text.lines().map(parse).collect();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["error"]["code"], -32600);
        assert!(responses[0]["id"].is_null());
        assert_eq!(responses[1]["id"], 2);
        assert!(responses[1]["result"].is_object());
    }

    #[tokio::test]
    async fn frames_strip_line_endings_and_report_eof() {
        let mut reader = BufReader::new("one\r\ntwo".as_bytes());
        let mut buf = Vec::new();
        assert_eq!(
            read_frame(&mut reader, &mut buf, 16).await.expect("frame"),
            Frame::Line("one".into())
        );
        assert_eq!(
            read_frame(&mut reader, &mut buf, 16).await.expect("frame"),
            Frame::Line("two".into())
        );
        assert_eq!(
            read_frame(&mut reader, &mut buf, 16).await.expect("frame"),
            Frame::Eof
        );
    }

    #[tokio::test]
    async fn unix_socket_rejects_connections_over_the_cap() {
        let settings = ProtocolSettings {
            max_connections: 1,
            ..ProtocolSettings::default()
        };
        let h = harness(settings).await;
        let socket = h._dir.path().join("duomail.sock");
        let shutdown = CancellationToken::new();

        let server = tokio::spawn({
            let dispatcher = h.dispatcher.clone();
            let socket = socket.clone();
            let shutdown = shutdown.clone();
            async move { serve_unix(dispatcher, &socket, shutdown).await }
        });

        let mut first = None;
        for _ in 0..50 {
            match UnixStream::connect(&socket).await {
                Ok(stream) => {
                    first = Some(stream);
                    break;
                }
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(20)).await,
            }
        }
        let first = first.expect("first connection");
        let (first_read, mut first_write) = first.into_split();
        first_write
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n")
            .await
            .expect("write");
        let mut first_lines = BufReader::new(first_read).lines();
        let pong = first_lines.next_line().await.expect("read").expect("line");
        assert_eq!(parse(&pong)["id"], 1);

        let second = UnixStream::connect(&socket).await.expect("second connect");
        let mut second_lines = BufReader::new(second).lines();
        let rejected = second_lines
            .next_line()
            .await
            .expect("read")
            .expect("error line");
        assert_eq!(parse(&rejected)["error"]["code"], -32006);
        assert!(second_lines.next_line().await.expect("read").is_none());

        shutdown.cancel();
        server.await.expect("join").expect("serve");
    }
}
