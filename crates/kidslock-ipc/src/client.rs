//! IPC client implementation

use kidslock_api::{Command, Event, Request, Response, ResponsePayload, ResponseResult, RetainedState};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

use crate::{IpcError, IpcResult};

/// IPC Client for connecting to kidslockd
pub struct IpcClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_request_id: u64,
}

impl IpcClient {
    /// Connect to kidslockd
    pub async fn connect(socket_path: impl AsRef<Path>) -> IpcResult<Self> {
        let stream = UnixStream::connect(socket_path).await?;
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            next_request_id: 1,
        })
    }

    /// Send a command and wait for its response.
    ///
    /// Event lines that arrive first are skipped.
    pub async fn send(&mut self, command: Command) -> IpcResult<Response> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let request = Request::new(request_id, command);
        let mut json = serde_json::to_string(&request)?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;

        loop {
            let line = read_line(&mut self.reader).await?;
            let value: serde_json::Value = serde_json::from_str(&line)?;
            if value.get("request_id").is_none() {
                continue;
            }

            let response: Response = serde_json::from_value(value)?;
            if response.request_id == request_id || response.request_id == 0 {
                return Ok(response);
            }
        }
    }

    /// Subscribe to events and consume this client to return an event stream
    pub async fn subscribe(mut self) -> IpcResult<EventStream> {
        let response = self.send(Command::SubscribeEvents).await?;

        let retained = match response.result {
            ResponseResult::Ok(ResponsePayload::Subscribed { retained, .. }) => retained,
            ResponseResult::Ok(other) => {
                return Err(IpcError::InvalidMessage(format!(
                    "unexpected subscribe response: {:?}",
                    other
                )));
            }
            ResponseResult::Err(e) => {
                return Err(IpcError::Rejected {
                    code: e.code,
                    message: e.message,
                });
            }
        };

        Ok(EventStream {
            reader: self.reader,
            _writer: self.writer,
            retained,
        })
    }
}

/// Stream of events from kidslockd
pub struct EventStream {
    reader: BufReader<OwnedReadHalf>,
    // Dropping the write half shuts the socket down, which the server reads as EOF
    _writer: OwnedWriteHalf,
    retained: Vec<RetainedState>,
}

impl EventStream {
    /// Device states retained at the moment of subscribing
    pub fn retained(&self) -> &[RetainedState] {
        &self.retained
    }

    /// Wait for the next event
    pub async fn next(&mut self) -> IpcResult<Event> {
        let line = read_line(&mut self.reader).await?;
        let event: Event = serde_json::from_str(&line)?;
        Ok(event)
    }
}

async fn read_line(reader: &mut BufReader<OwnedReadHalf>) -> IpcResult<String> {
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(IpcError::ConnectionClosed);
        }
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }
}
