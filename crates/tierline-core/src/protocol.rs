//! Agent wire protocol: opcodes and payload codecs.
//!
//! A frame is a one-byte opcode followed by the payload. All integers are
//! big-endian. Strings are an `i32` byte length followed by UTF-8.
//!
//! | opcode          | payload                                                              |
//! |-----------------|----------------------------------------------------------------------|
//! | `CONNECT`       | host, agent, uri                                                     |
//! | `METRIC_SUBMIT` | token i64, host, agent, type u8, ns count i32, ns.., name, ts i64, value i64 |
//! | `PING`          | host, agent                                                          |
//! | `DISCONNECT`    | host, agent                                                          |

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::MetricType;

// =============================================================================
// Opcodes
// =============================================================================

/// Single-byte request opcode. The space is open: handlers may claim any
/// value, the constants are the ones the built-in handlers use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpCode(pub u8);

impl OpCode {
    pub const CONNECT: Self = Self(0x01);
    pub const METRIC_SUBMIT: Self = Self(0x02);
    pub const PING: Self = Self(0x03);
    pub const DISCONNECT: Self = Self(0x04);

    /// Name of a built-in opcode.
    #[must_use]
    pub fn name(self) -> Option<&'static str> {
        match self {
            Self::CONNECT => Some("CONNECT"),
            Self::METRIC_SUBMIT => Some("METRIC_SUBMIT"),
            Self::PING => Some("PING"),
            Self::DISCONNECT => Some("DISCONNECT"),
            _ => None,
        }
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}(0x{:02x})", self.0),
            None => write!(f, "0x{:02x}", self.0),
        }
    }
}

/// Split a frame into opcode and payload.
pub fn split_frame(frame: &[u8]) -> Result<(OpCode, &[u8]), ProtocolError> {
    match frame.split_first() {
        Some((op, payload)) => Ok((OpCode(*op), payload)),
        None => Err(ProtocolError::EmptyFrame),
    }
}

// =============================================================================
// Limits
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolLimits {
    pub max_string_len: usize,
    pub max_namespace_depth: usize,
}

impl Default for ProtocolLimits {
    fn default() -> Self {
        Self {
            max_string_len: 4096,
            max_namespace_depth: 32,
        }
    }
}

// =============================================================================
// Cursor
// =============================================================================

/// Big-endian reader over a payload.
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    limits: ProtocolLimits,
}

impl<'a> Reader<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8], limits: ProtocolLimits) -> Self {
        Self {
            buf,
            pos: 0,
            limits,
        }
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, ProtocolError> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    fn read_len(&mut self) -> Result<usize, ProtocolError> {
        let len = self.read_i32()?;
        usize::try_from(len).map_err(|_| ProtocolError::NegativeLength(len))
    }

    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_len()?;
        if len > self.limits.max_string_len {
            return Err(ProtocolError::StringTooLong {
                len,
                max: self.limits.max_string_len,
            });
        }
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Fail if anything is left unread.
    pub fn finish(self) -> Result<(), ProtocolError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(ProtocolError::TrailingBytes(n)),
        }
    }
}

/// Big-endian frame builder.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    #[must_use]
    pub fn frame(op: OpCode) -> Self {
        Self { buf: vec![op.0] }
    }

    #[must_use]
    pub fn u8(mut self, v: u8) -> Self {
        self.buf.push(v);
        self
    }

    #[must_use]
    pub fn i32(mut self, v: i32) -> Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    #[must_use]
    pub fn i64(mut self, v: i64) -> Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    #[must_use]
    pub fn string(self, s: &str) -> Self {
        let len = i32::try_from(s.len()).unwrap_or(i32::MAX);
        let mut this = self.i32(len);
        this.buf.extend_from_slice(s.as_bytes());
        this
    }

    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

// =============================================================================
// Messages
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub host: String,
    pub agent: String,
    pub uri: String,
}

impl ConnectRequest {
    pub fn decode(payload: &[u8], limits: ProtocolLimits) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload, limits);
        let req = Self {
            host: r.read_string()?,
            agent: r.read_string()?,
            uri: r.read_string()?,
        };
        r.finish()?;
        Ok(req)
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        Writer::frame(OpCode::CONNECT)
            .string(&self.host)
            .string(&self.agent)
            .string(&self.uri)
            .finish()
    }
}

/// Payload of `PING` and `DISCONNECT`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRef {
    pub host: String,
    pub agent: String,
}

impl AgentRef {
    pub fn decode(payload: &[u8], limits: ProtocolLimits) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload, limits);
        let req = Self {
            host: r.read_string()?,
            agent: r.read_string()?,
        };
        r.finish()?;
        Ok(req)
    }

    /// Frame with the given opcode (`PING` or `DISCONNECT`).
    #[must_use]
    pub fn encode(&self, op: OpCode) -> Vec<u8> {
        Writer::frame(op)
            .string(&self.host)
            .string(&self.agent)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSubmit {
    pub token: i64,
    pub host: String,
    pub agent: String,
    pub metric_type: MetricType,
    pub namespace: Vec<String>,
    pub name: String,
    pub timestamp_ms: i64,
    pub value: i64,
}

impl MetricSubmit {
    pub fn decode(payload: &[u8], limits: ProtocolLimits) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload, limits);
        let token = r.read_i64()?;
        let host = r.read_string()?;
        let agent = r.read_string()?;
        let type_id = r.read_u8()?;
        let metric_type =
            MetricType::from_id(type_id).ok_or(ProtocolError::UnknownMetricType(type_id))?;
        let depth = r.read_len()?;
        if depth > limits.max_namespace_depth {
            return Err(ProtocolError::NamespaceTooDeep {
                depth,
                max: limits.max_namespace_depth,
            });
        }
        let namespace = (0..depth)
            .map(|_| r.read_string())
            .collect::<Result<Vec<_>, _>>()?;
        let name = r.read_string()?;
        let timestamp_ms = r.read_i64()?;
        let value = r.read_i64()?;
        r.finish()?;
        Ok(Self {
            token,
            host,
            agent,
            metric_type,
            namespace,
            name,
            timestamp_ms,
            value,
        })
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let depth = i32::try_from(self.namespace.len()).unwrap_or(i32::MAX);
        let mut w = Writer::frame(OpCode::METRIC_SUBMIT)
            .i64(self.token)
            .string(&self.host)
            .string(&self.agent)
            .u8(self.metric_type.id())
            .i32(depth);
        for segment in &self.namespace {
            w = w.string(segment);
        }
        w.string(&self.name)
            .i64(self.timestamp_ms)
            .i64(self.value)
            .finish()
    }
}

#[must_use]
pub fn encode_connect(host: &str, agent: &str, uri: &str) -> Vec<u8> {
    ConnectRequest {
        host: host.to_string(),
        agent: agent.to_string(),
        uri: uri.to_string(),
    }
    .encode()
}

#[must_use]
pub fn encode_ping(host: &str, agent: &str) -> Vec<u8> {
    AgentRef {
        host: host.to_string(),
        agent: agent.to_string(),
    }
    .encode(OpCode::PING)
}

#[must_use]
pub fn encode_disconnect(host: &str, agent: &str) -> Vec<u8> {
    AgentRef {
        host: host.to_string(),
        agent: agent.to_string(),
    }
    .encode(OpCode::DISCONNECT)
}

#[must_use]
pub fn encode_submit(submit: &MetricSubmit) -> Vec<u8> {
    submit.encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NO_TOKEN;

    fn sample_submit() -> MetricSubmit {
        MetricSubmit {
            token: NO_TOKEN,
            host: "h1".into(),
            agent: "a1".into(),
            metric_type: MetricType::LongGauge,
            namespace: vec!["jvm".into(), "heap".into()],
            name: "used".into(),
            timestamp_ms: 12_345,
            value: -7,
        }
    }

    #[test]
    fn connect_layout_is_big_endian_prefixed() {
        let frame = encode_connect("h", "ab", "");
        assert_eq!(
            frame,
            vec![0x01, 0, 0, 0, 1, b'h', 0, 0, 0, 2, b'a', b'b', 0, 0, 0, 0]
        );
        let (op, payload) = split_frame(&frame).unwrap();
        assert_eq!(op, OpCode::CONNECT);
        let req = ConnectRequest::decode(payload, ProtocolLimits::default()).unwrap();
        assert_eq!(req.agent, "ab");
        assert_eq!(req.uri, "");
    }

    #[test]
    fn submit_decodes_what_it_encodes() {
        let submit = sample_submit();
        let frame = encode_submit(&submit);
        let (op, payload) = split_frame(&frame).unwrap();
        assert_eq!(op, OpCode::METRIC_SUBMIT);
        assert_eq!(
            MetricSubmit::decode(payload, ProtocolLimits::default()).unwrap(),
            submit
        );
    }

    #[test]
    fn truncated_payload_rejected() {
        let frame = encode_submit(&sample_submit());
        let payload = &frame[1..frame.len() - 3];
        assert!(matches!(
            MetricSubmit::decode(payload, ProtocolLimits::default()),
            Err(ProtocolError::Truncated { needed: 8, remaining: 5 })
        ));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut frame = encode_ping("h", "a");
        frame.push(0xff);
        assert_eq!(
            AgentRef::decode(&frame[1..], ProtocolLimits::default()),
            Err(ProtocolError::TrailingBytes(1))
        );
    }

    #[test]
    fn limits_enforced() {
        let limits = ProtocolLimits {
            max_string_len: 4,
            max_namespace_depth: 1,
        };
        let long = encode_ping("hostname", "a");
        assert!(matches!(
            AgentRef::decode(&long[1..], limits),
            Err(ProtocolError::StringTooLong { len: 8, max: 4 })
        ));
        let deep = encode_submit(&sample_submit());
        assert!(matches!(
            MetricSubmit::decode(&deep[1..], limits),
            Err(ProtocolError::NamespaceTooDeep { depth: 2, max: 1 })
        ));
    }

    #[test]
    fn bad_fields_rejected() {
        let limits = ProtocolLimits::default();
        let negative = Writer::frame(OpCode::PING).i32(-1).finish();
        assert_eq!(
            AgentRef::decode(&negative[1..], limits),
            Err(ProtocolError::NegativeLength(-1))
        );

        let bad_utf8 = Writer::frame(OpCode::PING).i32(1).u8(0xff).string("a").finish();
        assert_eq!(
            AgentRef::decode(&bad_utf8[1..], limits),
            Err(ProtocolError::InvalidUtf8)
        );

        let mut frame = encode_submit(&sample_submit());
        // token(8) + host(4+2) + agent(4+2) puts the type byte at payload offset 20.
        frame[1 + 20] = 99;
        assert_eq!(
            MetricSubmit::decode(&frame[1..], limits),
            Err(ProtocolError::UnknownMetricType(99))
        );
    }

    #[test]
    fn empty_frame_and_opcode_display() {
        assert_eq!(split_frame(&[]), Err(ProtocolError::EmptyFrame));
        assert_eq!(OpCode::PING.to_string(), "PING(0x03)");
        assert_eq!(OpCode(0x7f).to_string(), "0x7f");
    }
}
