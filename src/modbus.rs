use tokio_util::bytes::{Buf, BufMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Largest number of registers a single read may ask for.
pub const MAX_SAFE_READ_COUNT: u16 = 125;
/// Largest number of registers a single write may carry.
pub const MAX_SAFE_WRITE_COUNT: usize = 123;

const READ_HOLDING_REGISTERS: u8 = 3;
const WRITE_MULTIPLE_REGISTERS: u8 = 16;

#[derive(Debug, Clone)]
pub struct Request {
    pub unit_id: u8,
    pub transaction_id: u16,
    pub operation: Operation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    GetHoldings { address: u16, count: u16 },
    SetHoldings { address: u16, values: Vec<u16> },
}

#[derive(Debug, PartialEq, Eq)]
pub struct Response {
    pub unit_id: u8,
    pub transaction_id: u16,
    pub kind: ResponseKind,
}

impl Response {
    pub fn exception_code(&self) -> Option<u8> {
        match &self.kind {
            ResponseKind::ErrorCode(c) => Some(*c),
            ResponseKind::GetHoldings { .. } => None,
            ResponseKind::SetHoldings { .. } => None,
        }
    }

    pub fn is_server_busy(&self) -> bool {
        self.exception_code() == Some(6)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ResponseKind {
    ErrorCode(u8),
    GetHoldings { values: Vec<u8> },
    SetHoldings { address: u16, words: u16 },
}

/// Split big-endian register payload into words.
pub fn words_from_bytes(bytes: &[u8]) -> Vec<u16> {
    bytes.chunks_exact(2).map(|w| u16::from_be_bytes([w[0], w[1]])).collect()
}

pub struct ModbusTCPCodec {}

impl Encoder<Request> for ModbusTCPCodec {
    type Error = std::io::Error;
    fn encode(
        &mut self,
        req: Request,
        dst: &mut tokio_util::bytes::BytesMut,
    ) -> Result<(), Self::Error> {
        let pdu_length = match &req.operation {
            Operation::GetHoldings { count, .. } => {
                if *count == 0 || *count > MAX_SAFE_READ_COUNT {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("cannot read {count} registers in one request"),
                    ));
                }
                5
            }
            Operation::SetHoldings { values, .. } => {
                if values.is_empty() || values.len() > MAX_SAFE_WRITE_COUNT {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("cannot write {} registers in one request", values.len()),
                    ));
                }
                6 + 2 * values.len()
            }
        };
        dst.reserve(7 + pdu_length);
        dst.put_u16(req.transaction_id);
        dst.put_u16(0);
        // Unit identifier is counted towards the length, the rest of the header isn't.
        dst.put_u16((pdu_length + 1) as u16);
        dst.put_u8(req.unit_id);
        match req.operation {
            Operation::GetHoldings { address, count } => {
                dst.put_u8(READ_HOLDING_REGISTERS);
                dst.put_u16(address);
                dst.put_u16(count);
            }
            Operation::SetHoldings { address, values } => {
                dst.put_u8(WRITE_MULTIPLE_REGISTERS);
                dst.put_u16(address);
                dst.put_u16(values.len() as u16);
                dst.put_u8((values.len() * 2) as u8);
                for value in values {
                    dst.put_u16(value);
                }
            }
        };
        trace!(message = "sending encoded", buffer = ?dst);
        Ok(())
    }
}

impl Decoder for ModbusTCPCodec {
    type Item = Response;
    type Error = std::io::Error;
    fn decode(
        &mut self,
        src: &mut tokio_util::bytes::BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            trace!(message = "attempt at decoding", buffer = ?src);
            let Some((tr_id_buffer, remainder)) = src.split_first_chunk::<2>() else {
                return Ok(None);
            };
            let transaction_id = u16::from_be_bytes(*tr_id_buffer);
            let Some((proto_buffer, remainder)) = remainder.split_first_chunk::<2>() else {
                return Ok(None);
            };
            if u16::from_be_bytes(*proto_buffer) != 0 {
                src.advance(1);
                continue;
            }
            let Some((length_buffer, remainder)) = remainder.split_first_chunk::<2>() else {
                return Ok(None);
            };
            let required_length = usize::from(u16::from_be_bytes(*length_buffer));
            let Some((data, _)) = remainder.split_at_checked(required_length) else {
                return Ok(None);
            };
            let frame_length = 6 + required_length;
            let [unit_id, function_code, payload @ ..] = data else {
                src.advance(frame_length);
                continue;
            };
            let (unit_id, function_code) = (*unit_id, *function_code);
            let kind = match (function_code, payload) {
                (fc, [code, ..]) if fc > 0x80 => ResponseKind::ErrorCode(*code),
                (READ_HOLDING_REGISTERS, [byte_count, values @ ..])
                    if usize::from(*byte_count) == values.len() =>
                {
                    ResponseKind::GetHoldings { values: values.to_vec() }
                }
                (WRITE_MULTIPLE_REGISTERS, [a0, a1, n0, n1]) => ResponseKind::SetHoldings {
                    address: u16::from_be_bytes([*a0, *a1]),
                    words: u16::from_be_bytes([*n0, *n1]),
                },
                _ => {
                    trace!(message = "skipping an unrecognized frame", function_code);
                    src.advance(frame_length);
                    continue;
                }
            };
            src.advance(frame_length);
            return Ok(Some(Response { unit_id, transaction_id, kind }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::bytes::BytesMut;

    fn encode(operation: Operation) -> Vec<u8> {
        let mut dst = BytesMut::new();
        let request = Request { unit_id: 247, transaction_id: 0x0102, operation };
        ModbusTCPCodec {}.encode(request, &mut dst).unwrap();
        dst.to_vec()
    }

    #[test]
    fn encodes_a_read() {
        let frame = encode(Operation::GetHoldings { address: 47785, count: 28 });
        assert_eq!(frame, [0x01, 0x02, 0, 0, 0, 6, 247, 3, 0xBA, 0xA9, 0, 28]);
    }

    #[test]
    fn encodes_a_multi_register_write() {
        let frame = encode(Operation::SetHoldings { address: 47807, values: vec![0xFFFF, 1] });
        assert_eq!(
            frame,
            [0x01, 0x02, 0, 0, 0, 11, 247, 16, 0xBA, 0xBF, 0, 2, 4, 0xFF, 0xFF, 0, 1]
        );
    }

    #[test]
    fn refuses_requests_of_unsupported_size() {
        let operations = [
            Operation::SetHoldings { address: 1, values: vec![] },
            Operation::SetHoldings { address: 1, values: vec![0; MAX_SAFE_WRITE_COUNT + 1] },
            Operation::GetHoldings { address: 1, count: 0 },
            Operation::GetHoldings { address: 1, count: MAX_SAFE_READ_COUNT + 1 },
        ];
        for operation in operations {
            let mut dst = BytesMut::new();
            let request = Request { unit_id: 1, transaction_id: 1, operation };
            assert!(ModbusTCPCodec {}.encode(request, &mut dst).is_err());
            assert!(dst.is_empty());
        }
        let largest = encode(Operation::GetHoldings { address: 1, count: MAX_SAFE_READ_COUNT });
        assert_eq!(largest.len(), 12);
    }

    #[test]
    fn decodes_read_response() {
        let mut src = BytesMut::from(&[0, 7, 0, 0, 0, 7, 247, 3, 4, 0x12, 0x34, 0, 1][..]);
        let response = ModbusTCPCodec {}.decode(&mut src).unwrap().unwrap();
        assert_eq!(response.transaction_id, 7);
        assert_eq!(response.kind, ResponseKind::GetHoldings { values: vec![0x12, 0x34, 0, 1] });
        assert_eq!(words_from_bytes(&[0x12, 0x34, 0, 1]), [0x1234, 1]);
        assert!(src.is_empty());
    }

    #[test]
    fn decodes_write_response_and_exception() {
        let mut src = BytesMut::from(
            &[
                0, 1, 0, 0, 0, 6, 247, 16, 0xBA, 0xAA, 0, 7, // write ack
                0, 2, 0, 0, 0, 3, 247, 0x90, 6, // server busy
            ][..],
        );
        let mut codec = ModbusTCPCodec {};
        let ack = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(ack.kind, ResponseKind::SetHoldings { address: 47786, words: 7 });
        let busy = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(busy.transaction_id, 2);
        assert!(busy.is_server_busy());
        assert_eq!(codec.decode(&mut src).unwrap(), None);
    }

    #[test]
    fn waits_for_the_whole_frame() {
        let mut src = BytesMut::from(&[0, 7, 0, 0, 0, 7, 247, 3, 4, 0x12][..]);
        assert_eq!(ModbusTCPCodec {}.decode(&mut src).unwrap(), None);
        src.extend_from_slice(&[0x34, 0, 1]);
        assert!(ModbusTCPCodec {}.decode(&mut src).unwrap().is_some());
    }
}
