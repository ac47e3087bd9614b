use crate::storage::page::BlockNumber;
use serde::{Deserialize, Serialize};

const HEADER_SIZE: usize = 4;

/// Summary of one page range: the range's first heap block followed by an opaque payload
/// produced by the operator class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrinTuple {
    pub heap_blk: BlockNumber,
    pub payload: Vec<u8>,
}

impl BrinTuple {
    pub fn new(heap_blk: BlockNumber, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            heap_blk,
            payload: payload.into(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&self.heap_blk.to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }
        let (head, payload) = bytes.split_at(HEADER_SIZE);
        Some(Self {
            heap_blk: u32::from_le_bytes([head[0], head[1], head[2], head[3]]),
            payload: payload.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rejects_short_items() {
        assert_eq!(BrinTuple::decode(&[1, 2, 3]), None);
        let tuple = BrinTuple::decode(&[7, 0, 0, 0]).unwrap();
        assert_eq!(tuple.heap_blk, 7);
        assert!(tuple.payload.is_empty());
    }
}
