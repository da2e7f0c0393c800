//! tungate: userspace TUN-to-SOCKS gateway core
//!
//! This crate implements the UDP forwarding core of a layer-3 gateway that
//! bridges a TUN interface carrying raw IPv4 traffic to an upstream UDP
//! relay. Applications write IP datagrams to the TUN device; the gateway
//! terminates the transport layer locally, forwards each flow over its own
//! relay socket, and injects synthetic IPv4 response datagrams back through
//! the TUN device.
//!
//! # Architecture
//!
//! ```text
//! TUN read → UdpGateway::handle_udp ─┬─ DNS cache hit → synthesize → TUN write channel
//!                                    └─ FlowTracker → flow worker → relay socket
//!                                                          ↓ response
//!                                             synthesize (+fragment) → TUN write channel
//! ```
//!
//! Each UDP flow (identified by its src/dst address 4-tuple) gets a
//! dedicated worker task that owns the relay socket pair, enforces the idle
//! timeout, and tears everything down on any termination source. Responses
//! are rebuilt as wire-ready IPv4 datagrams (including IPv4 fragmentation
//! for payloads that exceed the MTU) and handed to a single TUN writer
//! task through a shared channel.
//!
//! Flows destined for the DNS port are special-cased: they are one-shot
//! (torn down after the first response), and their answers populate a
//! shared answer cache that short-circuits repeat queries without ever
//! opening a relay socket.
//!
//! # Out of scope
//!
//! Opening and configuring the TUN device, the TCP side of the gateway,
//! and host route installation are the caller's concern. The gateway only
//! consumes parsed IPv4/UDP records plus the raw wire bytes, and produces
//! envelopes on the TUN write channel.
//!
//! # Modules
//!
//! - [`config`]: gateway tunables and wire-format constants
//! - [`dns`]: DNS answer cache
//! - [`error`]: error types
//! - [`flow`]: flow tracking, per-flow workers, UDP ingress
//! - [`io`]: packet buffer pool
//! - [`packet`]: IPv4/UDP codec, envelopes, response synthesizer
//! - [`tun`]: TUN write channel and writer task

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod dns;
pub mod error;
pub mod flow;
pub mod io;
pub mod packet;
pub mod tun;

pub use config::GatewayConfig;
pub use flow::ingress::UdpGateway;
