//! Line-delimited JSON transport.
//!
//! Events arrive one JSON document per line; replies leave the same way.

use std::io;

use corral_events::{Event, Reply};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Read events until EOF or until the receiving side goes away.
///
/// Lines that do not decode as an event are logged and skipped. Returns the
/// number of events forwarded.
pub async fn read_events<R>(reader: R, events: mpsc::Sender<Event>) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut forwarded = 0;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let event: Event = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Skipping undecodable event line");
                continue;
            }
        };

        if events.send(event).await.is_err() {
            debug!("Event receiver closed, stop reading");
            break;
        }
        forwarded += 1;
    }

    Ok(forwarded)
}

/// Write replies until every sender is dropped. Returns the number written.
pub async fn write_replies<W>(mut writer: W, mut replies: mpsc::UnboundedReceiver<Reply>) -> io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;

    while let Some(reply) = replies.recv().await {
        let mut line = serde_json::to_vec(&reply).map_err(io::Error::from)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
        written += 1;
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_skips_garbage() {
        let input = b"{\"id\":\"1\",\"name\":\"ping\"}\nnot json\n\n{\"id\":\"2\",\"name\":\"instance.activate\"}\n";
        let (tx, mut rx) = mpsc::channel(8);

        let forwarded = read_events(&input[..], tx).await.unwrap();
        assert_eq!(forwarded, 2);
        assert_eq!(rx.recv().await.unwrap().id, "1");
        assert_eq!(rx.recv().await.unwrap().name, "instance.activate");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_write_one_reply_per_line() {
        let (tx, rx) = mpsc::unbounded_channel();
        let event = Event::new("ping").with_reply_to("reply-to");
        tx.send(Reply::success(&event, serde_json::json!({})).unwrap()).unwrap();
        tx.send(Reply::error(&event, "boom").unwrap()).unwrap();
        drop(tx);

        let mut out = Vec::new();
        let written = write_replies(&mut out, rx).await.unwrap();
        assert_eq!(written, 2);

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: Reply = serde_json::from_str(lines[1]).unwrap();
        assert!(second.is_error());
        assert_eq!(second.name, "reply-to");
    }
}
