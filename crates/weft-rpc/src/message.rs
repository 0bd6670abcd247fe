//! RPC message types
//!
//! A request carries an id for correlation, the method name, and the
//! caller's arguments as an opaque codec-encoded blob. A response echoes
//! the id; on failure the result blob is empty and `error` carries the
//! message.

use crate::codec::{Decoder, Encoder};
use crate::wire_record;
use weft_core::WeftResult;

/// One RPC call on the wire
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RpcRequest {
    pub request_id: u64,
    pub method: String,
    pub params: Vec<u8>,
}

wire_record!(RpcRequest {
    request_id,
    method,
    params
});

/// One RPC reply on the wire
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RpcResponse {
    pub request_id: u64,
    pub success: bool,
    pub result: Vec<u8>,
    pub error: String,
}

wire_record!(RpcResponse {
    request_id,
    success,
    result,
    error
});

impl RpcRequest {
    pub fn to_payload(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.encode(self);
        enc.into_bytes()
    }

    pub fn from_payload(payload: &[u8]) -> WeftResult<Self> {
        Decoder::new(payload).decode()
    }
}

impl RpcResponse {
    /// A successful reply carrying an encoded result
    pub fn ok(request_id: u64, result: Vec<u8>) -> Self {
        Self {
            request_id,
            success: true,
            result,
            error: String::new(),
        }
    }

    /// A failed reply carrying an error message
    pub fn fail(request_id: u64, error: String) -> Self {
        Self {
            request_id,
            success: false,
            result: Vec::new(),
            error,
        }
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.encode(self);
        enc.into_bytes()
    }

    pub fn from_payload(payload: &[u8]) -> WeftResult<Self> {
        Decoder::new(payload).decode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let req = RpcRequest {
            request_id: 42,
            method: "echo".to_string(),
            params: vec![1, 2, 3],
        };
        let payload = req.to_payload();
        assert_eq!(RpcRequest::from_payload(&payload).unwrap(), req);
    }

    #[test]
    fn test_response_roundtrip() {
        let resp = RpcResponse::ok(42, vec![9, 9]);
        let payload = resp.to_payload();
        assert_eq!(RpcResponse::from_payload(&payload).unwrap(), resp);

        let resp = RpcResponse::fail(7, "Division by zero".to_string());
        let payload = resp.to_payload();
        let back = RpcResponse::from_payload(&payload).unwrap();
        assert!(!back.success);
        assert!(back.result.is_empty());
        assert_eq!(back.error, "Division by zero");
    }

    #[test]
    fn test_garbage_payload_fails() {
        assert!(RpcRequest::from_payload(&[1, 2]).is_err());
    }
}
