//! Content-Length-framed JSON-RPC wire format used to talk to the Analysis
//! Backend subprocess. Mirrors the framing the editor-facing LSP transport
//! uses, but this copy is private to the core/backend boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::ProtocolError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: &'static str,
    pub id: Option<u64>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Request {
            jsonrpc: "2.0",
            id: Some(id),
            method: method.into(),
            params: Some(params),
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Request {
            jsonrpc: "2.0",
            id: None,
            method: method.into(),
            params: Some(params),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    value: &impl Serialize,
) -> std::result::Result<(), ProtocolError> {
    let body = serde_json::to_string(value)?;
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer
        .write_all(header.as_bytes())
        .await
        .map_err(|e| ProtocolError::InvalidJsonRpc(e.to_string()))?;
    writer
        .write_all(body.as_bytes())
        .await
        .map_err(|e| ProtocolError::InvalidJsonRpc(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| ProtocolError::InvalidJsonRpc(e.to_string()))?;
    Ok(())
}

pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
) -> std::result::Result<Value, ProtocolError> {
    let content_length = read_content_length(reader).await?;
    let mut buffer = vec![0u8; content_length];
    tokio::io::AsyncReadExt::read_exact(reader, &mut buffer)
        .await
        .map_err(|e| ProtocolError::InvalidJsonRpc(e.to_string()))?;
    let value: Value = serde_json::from_slice(&buffer)?;
    Ok(value)
}

async fn read_content_length<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
) -> std::result::Result<usize, ProtocolError> {
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| ProtocolError::InvalidJsonRpc(e.to_string()))?;
        if n == 0 {
            return Err(ProtocolError::InvalidJsonRpc("eof before headers complete".into()));
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some(value) = trimmed.strip_prefix("Content-Length:") {
            content_length = value.trim().parse().ok();
        }
    }
    content_length.ok_or(ProtocolError::MissingContentLength)
}

#[cfg(test)]
pub fn encode_message(value: &impl Serialize) -> Vec<u8> {
    let body = serde_json::to_string(value).unwrap();
    format!("Content-Length: {}\r\n\r\n{}", body.len(), body).into_bytes()
}
