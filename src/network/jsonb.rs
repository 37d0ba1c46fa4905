// Copyright 2025 The vephor Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! JSONB: one JSON header plus an ordered list of opaque binary payloads.
//!
//! Wire layout, every integer an 8 byte little-endian u64:
//!
//! ```text
//! total_length | payload_count | len header_json | (len payload)*
//! ```
//!
//! `total_length` is `header_len + 8 * (1 + payload_count) + sum(payload_len)`.
//! The receiver recomputes the same sum and rejects the message on mismatch.

use bytes::Bytes;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

use super::frame::{FrameReader, FrameWriter, LENGTH_FIELD_SIZE, MAX_FRAME_SIZE};
use super::ConnectionId;
use crate::{AppError, AppResult};

pub const TYPE_KEY: &str = "type";
pub const CONN_ID_KEY: &str = "conn_id";
pub const TIME_KEY: &str = "time";
pub const DISCONNECT_TYPE: &str = "disconnect";

#[derive(Debug, Clone, PartialEq)]
pub struct JsonbMessage {
    pub header: Value,
    pub payloads: Vec<Bytes>,
}

impl JsonbMessage {
    pub fn new(header: Value, payloads: Vec<Bytes>) -> JsonbMessage {
        JsonbMessage { header, payloads }
    }

    pub fn header_only(header: Value) -> JsonbMessage {
        JsonbMessage {
            header,
            payloads: Vec::new(),
        }
    }

    /// The marker a peer sends right before closing its side.
    pub fn disconnect() -> JsonbMessage {
        JsonbMessage::header_only(json!({ TYPE_KEY: DISCONNECT_TYPE }))
    }

    pub fn message_type(&self) -> Option<&str> {
        self.header.get(TYPE_KEY).and_then(Value::as_str)
    }

    pub fn is_disconnect(&self) -> bool {
        self.message_type() == Some(DISCONNECT_TYPE)
    }

    pub fn conn_id(&self) -> Option<ConnectionId> {
        self.header.get(CONN_ID_KEY).and_then(Value::as_i64)
    }

    pub fn time(&self) -> Option<f64> {
        self.header.get(TIME_KEY).and_then(Value::as_f64)
    }

    /// Bytes of header text plus payloads, without framing.
    pub fn size(&self) -> usize {
        self.header.to_string().len() + self.payloads.iter().map(Bytes::len).sum::<usize>()
    }
}

pub fn total_length(header_len: usize, payloads: &[Bytes]) -> u64 {
    let payload_bytes: usize = payloads.iter().map(Bytes::len).sum();
    (header_len + LENGTH_FIELD_SIZE * (1 + payloads.len()) + payload_bytes) as u64
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub async fn send_jsonb(&mut self, header: &Value, payloads: &[Bytes]) -> AppResult<()> {
        let header_text = header.to_string();
        let total = total_length(header_text.len(), payloads);
        trace!(
            "sending jsonb of {} bytes with {} payloads",
            total,
            payloads.len()
        );
        self.send_u64(total).await?;
        self.send_u64(payloads.len() as u64).await?;
        self.send_message(header_text.as_bytes()).await?;
        for payload in payloads {
            self.send_message(payload).await?;
        }
        self.flush().await
    }

    pub async fn send_jsonb_message(&mut self, msg: &JsonbMessage) -> AppResult<()> {
        self.send_jsonb(&msg.header, &msg.payloads).await
    }
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Reads one JSONB message. `Ok(None)` means nothing was pending within the
    /// wait window; once the first length byte arrives the whole message is read.
    pub async fn receive_jsonb(&mut self) -> AppResult<Option<JsonbMessage>> {
        let Some(expected_total) = self.receive_u64(true).await? else {
            return Ok(None);
        };
        let payload_count = self
            .receive_u64(false)
            .await?
            .ok_or_else(|| AppError::Disconnected("payload count missing".into()))?;
        if expected_total > MAX_FRAME_SIZE
            || payload_count > expected_total / LENGTH_FIELD_SIZE as u64
        {
            return Err(AppError::MalformedProtocol(format!(
                "jsonb length {} can't hold {} payloads",
                expected_total, payload_count
            )));
        }

        let mut received_total = LENGTH_FIELD_SIZE as u64 * (1 + payload_count);
        let header_buf = self.receive_message().await?;
        received_total += header_buf.len() as u64;
        let header: Value = serde_json::from_slice(&header_buf).map_err(|e| {
            AppError::MalformedProtocol(format!("jsonb header is not valid json: {}", e))
        })?;

        let mut payloads = Vec::with_capacity(payload_count as usize);
        for _ in 0..payload_count {
            let payload = self.receive_message().await?;
            received_total += payload.len() as u64;
            if received_total > expected_total {
                return Err(AppError::MalformedProtocol(format!(
                    "jsonb payloads exceed declared length {}",
                    expected_total
                )));
            }
            payloads.push(payload.freeze());
        }

        if received_total != expected_total {
            return Err(AppError::MalformedProtocol(format!(
                "jsonb length mismatch: expected {}, received {}",
                expected_total, received_total
            )));
        }
        Ok(Some(JsonbMessage { header, payloads }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::frame::LinkState;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    fn endpoints() -> (FrameWriter<DuplexStream>, FrameReader<DuplexStream>) {
        let (near, far) = duplex(256 * 1024);
        (
            FrameWriter::new(near, LinkState::new_connected()),
            FrameReader::new(far, LinkState::new_connected(), Duration::from_millis(100)),
        )
    }

    #[tokio::test]
    async fn test_jsonb_round_trip() -> AppResult<()> {
        let (mut writer, mut reader) = endpoints();
        let header = json!({"type": "x", "k": 1});
        let payloads = vec![Bytes::from_static(&[1, 2, 3]), Bytes::new()];
        writer.send_jsonb(&header, &payloads).await?;

        let msg = reader.receive_jsonb().await?.expect("message pending");
        assert_eq!(msg.header, header);
        assert_eq!(msg.payloads, payloads);
        Ok(())
    }

    #[test]
    fn test_header_only_total_length() {
        let header = json!({"type": "x", "k": 1});
        let text = header.to_string();
        assert_eq!(total_length(text.len(), &[]), text.len() as u64 + 8);
    }

    #[tokio::test]
    async fn test_nothing_pending() -> AppResult<()> {
        let (_writer, mut reader) = endpoints();
        assert!(reader.receive_jsonb().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_length_mismatch_rejected() {
        let (near, far) = duplex(4096);
        let mut raw = near;
        let mut reader = FrameReader::new(far, LinkState::new_connected(), Duration::from_millis(100));

        let header = br#"{"type":"x"}"#;
        // declared total is one byte short of what follows
        let wrong_total = (header.len() + 8 - 1) as u64;
        let mut frame = Vec::new();
        frame.extend_from_slice(&wrong_total.to_le_bytes());
        frame.extend_from_slice(&0u64.to_le_bytes());
        frame.extend_from_slice(&(header.len() as u64).to_le_bytes());
        frame.extend_from_slice(header);
        raw.write_all(&frame).await.unwrap();

        let result = reader.receive_jsonb().await;
        assert!(matches!(result, Err(AppError::MalformedProtocol(_))));
    }

    #[test]
    fn test_message_accessors() {
        let msg = JsonbMessage::header_only(json!({"type": "scene", "conn_id": 3, "time": 1.5}));
        assert_eq!(msg.message_type(), Some("scene"));
        assert_eq!(msg.conn_id(), Some(3));
        assert_eq!(msg.time(), Some(1.5));
        assert!(!msg.is_disconnect());
        assert!(JsonbMessage::disconnect().is_disconnect());
    }
}
