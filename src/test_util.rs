//! Test doubles shared by the unit tests of several modules

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use crate::arq::{ArqEngine, ArqEngineFactory, DatagramOutput, NoDelayProfile};
use crate::message::{Protocol, RpcKind};
use crate::send_socket::DatagramSocket;

/// convenience for unit test code: the same number gives the same address
pub fn test_addr_from_number(number: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, number))
}

/// A socket that keeps everything sent through it
pub struct RecordingSocket {
    local_addr: SocketAddr,
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
}

impl RecordingSocket {
    pub fn new(local_addr: SocketAddr) -> Arc<RecordingSocket> {
        Arc::new(RecordingSocket {
            local_addr,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn take_sent(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn sent_payloads(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().iter()
            .map(|(_, buf)| buf.clone())
            .collect()
    }
}

impl DatagramSocket for RecordingSocket {
    fn send_datagram(&self, to: SocketAddr, buf: &[u8]) {
        self.sent.lock().unwrap().push((to, buf.to_vec()));
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Observable state of a [FakeEngine], shared with the test
#[derive(Default)]
pub struct FakeEngineState {
    pub conv: u32,
    pub mtu: Option<usize>,
    pub no_delay: Option<NoDelayProfile>,
    /// segments passed to `send`, in order
    pub sent: Vec<Vec<u8>>,
    /// every datagram passed to `input` becomes one reassembled segment
    pub inbound: VecDeque<Vec<u8>>,
    pub update_calls: Vec<u32>,
    /// if set, `peek_size` reports this instead of the real size
    pub fake_peek_size: Option<usize>,
    pub fail_recv: bool,
    pub reject_input: bool,
    /// `send` fails once this many segments were sent
    pub fail_send_after: Option<usize>,
}

/// An engine without any reliability: it hands its input straight back as segments and writes
///  every sent segment to its output right away
pub struct FakeEngine {
    state: Arc<Mutex<FakeEngineState>>,
    output: DatagramOutput,
}

impl ArqEngine for FakeEngine {
    fn input(&mut self, datagram: &[u8]) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.reject_input {
            bail!("rejected");
        }
        state.inbound.push_back(datagram.to_vec());
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> anyhow::Result<()> {
        use std::io::Write;
        let mut state = self.state.lock().unwrap();
        if state.fail_send_after == Some(state.sent.len()) {
            bail!("send failed");
        }
        state.sent.push(data.to_vec());
        drop(state);
        self.output.write_all(data)?;
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> anyhow::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.fail_recv {
            bail!("recv failed");
        }
        match state.inbound.pop_front() {
            Some(segment) => {
                buf[..segment.len()].copy_from_slice(&segment);
                Ok(segment.len())
            }
            None => bail!("nothing to receive"),
        }
    }

    fn peek_size(&self) -> Option<usize> {
        let state = self.state.lock().unwrap();
        if let Some(size) = state.fake_peek_size {
            return Some(size);
        }
        state.inbound.front().map(|s| s.len())
    }

    fn update(&mut self, now: u32) -> anyhow::Result<()> {
        self.state.lock().unwrap().update_calls.push(now);
        Ok(())
    }

    fn check(&self, now: u32) -> u32 {
        now + 10
    }

    fn set_mtu(&mut self, mtu: usize) -> anyhow::Result<()> {
        self.state.lock().unwrap().mtu = Some(mtu);
        Ok(())
    }

    fn set_no_delay(&mut self, profile: NoDelayProfile) {
        self.state.lock().unwrap().no_delay = Some(profile);
    }
}

/// Creates [FakeEngine]s, keeping a handle to the state of each of them in creation order
#[derive(Default)]
pub struct FakeEngineFactory {
    pub engines: Mutex<Vec<Arc<Mutex<FakeEngineState>>>>,
}

impl FakeEngineFactory {
    pub fn new() -> Arc<FakeEngineFactory> {
        Default::default()
    }

    pub fn engine(&self, index: usize) -> Arc<Mutex<FakeEngineState>> {
        self.engines.lock().unwrap()[index].clone()
    }

    pub fn num_engines(&self) -> usize {
        self.engines.lock().unwrap().len()
    }
}

impl ArqEngineFactory for FakeEngineFactory {
    fn create(&self, conv: u32, output: DatagramOutput) -> anyhow::Result<Box<dyn ArqEngine>> {
        let state = Arc::new(Mutex::new(FakeEngineState {
            conv,
            ..Default::default()
        }));
        self.engines.lock().unwrap().push(state.clone());
        Ok(Box::new(FakeEngine { state, output }))
    }

    fn max_message_len(&self, _mtu: usize) -> usize {
        usize::MAX
    }
}

/// A small application protocol for tests: `Ping` requests are answered with `Pong` responses,
///  `Note` is an event and `Count` a response of a different type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestMessage {
    Ping { rpc_id: u32, payload: Vec<u8> },
    Pong { rpc_id: u32, error: u32, error_message: String, payload: Vec<u8> },
    Note { text: String },
    Count { rpc_id: u32, value: u64 },
}

/// typed view of a successful `Pong`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pong {
    pub payload: Vec<u8>,
}

impl TryFrom<TestMessage> for Pong {
    type Error = TestMessage;

    fn try_from(value: TestMessage) -> Result<Self, Self::Error> {
        match value {
            TestMessage::Pong { payload, .. } => Ok(Pong { payload }),
            other => Err(other),
        }
    }
}

pub struct TestProtocol;

impl Protocol for TestProtocol {
    type Message = TestMessage;

    fn opcode_of(&self, message: &TestMessage) -> anyhow::Result<u16> {
        Ok(match message {
            TestMessage::Ping { .. } => 1,
            TestMessage::Pong { .. } => 2,
            TestMessage::Note { .. } => 3,
            TestMessage::Count { .. } => 4,
        })
    }

    fn serialize(&self, message: &TestMessage, buf: &mut BytesMut) -> anyhow::Result<()> {
        match message {
            TestMessage::Ping { rpc_id, payload } => {
                buf.put_u32_le(*rpc_id);
                buf.put_slice(payload);
            }
            TestMessage::Pong { rpc_id, error, error_message, payload } => {
                buf.put_u32_le(*rpc_id);
                buf.put_u32_le(*error);
                put_string(buf, error_message)?;
                buf.put_slice(payload);
            }
            TestMessage::Note { text } => {
                put_string(buf, text)?;
            }
            TestMessage::Count { rpc_id, value } => {
                buf.put_u32_le(*rpc_id);
                buf.put_u64_le(*value);
            }
        }
        Ok(())
    }

    fn deserialize(&self, opcode: u16, mut buf: &[u8]) -> anyhow::Result<TestMessage> {
        let message = match opcode {
            1 => TestMessage::Ping {
                rpc_id: buf.try_get_u32_le()?,
                payload: buf.to_vec(),
            },
            2 => TestMessage::Pong {
                rpc_id: buf.try_get_u32_le()?,
                error: buf.try_get_u32_le()?,
                error_message: try_get_string(&mut buf)?,
                payload: buf.to_vec(),
            },
            3 => TestMessage::Note {
                text: try_get_string(&mut buf)?,
            },
            4 => TestMessage::Count {
                rpc_id: buf.try_get_u32_le()?,
                value: buf.try_get_u64_le()?,
            },
            _ => bail!("unknown opcode {}", opcode),
        };
        Ok(message)
    }

    fn rpc_kind(&self, message: &TestMessage) -> RpcKind {
        match message {
            TestMessage::Ping { .. } => RpcKind::Request,
            TestMessage::Note { .. } => RpcKind::Event,
            TestMessage::Pong { rpc_id, error, error_message, .. } => RpcKind::Response {
                rpc_id: *rpc_id,
                error: *error,
                error_message: error_message.clone(),
            },
            TestMessage::Count { rpc_id, .. } => RpcKind::Response {
                rpc_id: *rpc_id,
                error: 0,
                error_message: String::new(),
            },
        }
    }

    fn set_rpc_id(&self, message: &mut TestMessage, new_rpc_id: u32) {
        if let TestMessage::Ping { rpc_id, .. } = message {
            *rpc_id = new_rpc_id;
        }
    }
}

fn put_string(buf: &mut BytesMut, s: &str) -> anyhow::Result<()> {
    let len: u16 = s.len().try_into()?;
    buf.put_u16_le(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn try_get_string(buf: &mut &[u8]) -> anyhow::Result<String> {
    let len = buf.try_get_u16_le()? as usize;
    if buf.remaining() < len {
        bail!("string of length {} exceeds the buffer", len);
    }
    let s = String::from_utf8(buf[..len].to_vec())?;
    buf.advance(len);
    Ok(s)
}
