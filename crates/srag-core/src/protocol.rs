//! Wire protocol: request/response shapes and the length-prefixed frame
//! codec (C8). See §3 and §4.7.
//!
//! ```text
//! [u32 BE: length][UTF-8 JSON payload of `length` bytes]
//! ```
//!
//! Framing is connection-scoped: nothing here remembers state between
//! frames, so a single `read_frame`/`write_frame` pair is always safe to
//! call in isolation.

use crate::config::ProtocolConfig;
use crate::error::{Result, SragError};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// `{id, method, params, auth?}` (§3). Unknown top-level fields are
/// ignored by `serde`'s default behavior (we never deny unknown fields).
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default = "default_params")]
    pub params: serde_json::Value,
    #[serde(default, rename = "auth")]
    pub auth: Option<String>,
}

fn default_params() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

/// `{id, result}` or `{id, error: {code, message}}`, both carrying a
/// `"2.0"` version tag for interoperability (§3).
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub jsonrpc: &'static str,
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseError {
    pub code: i32,
    pub message: String,
}

impl Response {
    pub fn success(id: u64, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response. `id` is `None` when the request couldn't
    /// be parsed far enough to recover one (e.g. `ParseError`).
    pub fn error(id: Option<u64>, err: &SragError) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(ResponseError {
                code: err.to_rpc_error_code(),
                message: err.to_string(),
            }),
        }
    }
}

/// Read one length-prefixed frame. Returns `Ok(None)` on a clean EOF
/// (the peer closed before sending any bytes of the length prefix).
///
/// A short read partway through the length prefix or the payload is
/// also treated as EOF (§4.7): the connection is ending, not malformed.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    let mut read_total = 0usize;
    while read_total < 4 {
        let n = reader.read(&mut len_buf[read_total..]).await?;
        if n == 0 {
            return Ok(None);
        }
        read_total += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > ProtocolConfig::MAX_FRAME_BYTES {
        return Err(SragError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    let mut got = 0usize;
    while got < len {
        let n = reader.read(&mut payload[got..]).await?;
        if n == 0 {
            return Ok(None);
        }
        got += n;
    }

    Ok(Some(payload))
}

/// Write a length-prefixed frame as a single logical send.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = payload.len() as u32;
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ignores_unknown_fields() {
        let req: Request =
            serde_json::from_str(r#"{"id":1,"method":"ping","params":{},"bogus":true}"#).unwrap();
        assert_eq!(req.id, 1);
        assert_eq!(req.method, "ping");
    }

    #[test]
    fn request_defaults_missing_params() {
        let req: Request = serde_json::from_str(r#"{"id":7,"method":"ping"}"#).unwrap();
        assert_eq!(req.params, serde_json::json!({}));
        assert!(req.auth.is_none());
    }

    #[test]
    fn response_success_echoes_id() {
        let resp = Response::success(42, serde_json::json!({"status": "ok"}));
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["id"], 42);
        assert_eq!(v["jsonrpc"], "2.0");
        assert!(v.get("error").is_none());
    }

    #[test]
    fn response_error_carries_code_and_message() {
        let err = SragError::BadArgs("missing texts".to_string());
        let resp = Response::error(Some(3), &err);
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["id"], 3);
        assert_eq!(v["error"]["code"], -32603);
        assert!(v.get("result").is_none());
    }

    #[tokio::test]
    async fn frame_roundtrip_is_byte_identical() {
        let payload = br#"{"id":1,"method":"ping"}"#.to_vec();
        let mut buf = Vec::new();
        write_frame(&mut buf, &payload).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let got = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn frame_read_on_empty_stream_is_eof() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn frame_over_max_size_is_rejected() {
        let huge_len = (ProtocolConfig::MAX_FRAME_BYTES + 1) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&huge_len.to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, SragError::FrameTooLarge(_)));
    }
}
