//! Session-oriented RPC over UDP.
//!
//! The layers, bottom up:
//! * an ARQ engine (KCP by default, see [arq]) turns the lossy datagrams of one virtual
//!   connection into a reliable, ordered stream of segments
//! * a [channel::Channel] performs a small handshake to agree on the engine's conversation id,
//!   drives the engine's timers, detects dead peers and cuts the stream into packets
//! * a [session::Session] encodes application messages into packets (opcode, optional
//!   compression, payload) and correlates responses with the calls waiting for them
//! * the [service::NetworkService] owns the UDP socket, routes datagrams to sessions, schedules
//!   channel updates and hands incoming requests and events to the application
//!
//! ## Handshake
//!
//! The initiator sends `SYN` with a random conn id of its own and repeats it every 200 ms until
//!  an `ACK` arrives. The acceptor creates its side of the connection when it sees the first
//!  `SYN`, and answers every `SYN` with an `ACK` that carries the initiator's id and its own conn
//!  id. Both sides then run the ARQ engine with the acceptor's id as the conversation id, which
//!  is also what incoming segments are routed by.
//!
//! There is no teardown message and no keepalive: a connection that does not receive anything
//!  for 20 seconds is dropped.
//!
//! See [wire] for the wire format.

pub mod arq;
pub mod channel;
pub mod compression;
pub mod config;
pub mod error;
pub mod message;
pub mod packet_parser;
pub mod rpc;
pub mod safe_converter;
pub mod scheduler;
pub mod send_socket;
pub mod service;
pub mod session;
pub mod wire;

#[cfg(test)]
pub mod test_util;
