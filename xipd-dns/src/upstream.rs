use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use tokio::{
    net::{TcpStream, UdpSocket},
    time::timeout,
};
use trust_dns_proto::{
    op::{Message, MessageType, OpCode, Query, ResponseCode},
    rr::{Name, RecordType},
};

use crate::server_handler::{encode, read_frame, write_frame};

pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(2);

/// How a packet travels to the upstream servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

/// The resolver chain consulted when a query is not answered locally.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Relays a raw query packet over `transport` and returns the raw reply.
    async fn forward(&self, packet: &[u8], transport: Transport, timeout: Option<Duration>) -> Result<Vec<u8>>;

    /// Asks the chain for the A records of `name`. A truncated UDP reply is
    /// retried over TCP.
    async fn lookup_address(&self, name: &Name, timeout: Option<Duration>) -> Result<Message> {
        let mut msg = Message::new();
        msg.set_id(rand::random());
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(name.clone(), RecordType::A));
        let packet = encode(&msg)?;

        let reply = self.forward(&packet, Transport::Udp, timeout).await?;
        let reply = Message::from_vec(&reply).with_context(|| format!("parsing upstream reply for {}", name))?;
        if !reply.truncated() {
            return Ok(reply);
        }

        log::debug!("upstream reply for {} truncated, retrying over tcp", name);
        let reply = self.forward(&packet, Transport::Tcp, timeout).await?;

        Message::from_vec(&reply).with_context(|| format!("parsing upstream tcp reply for {}", name))
    }
}

/// Forwards to each configured server in turn.
pub struct NameServerChain {
    servers: Vec<SocketAddr>,
    timeout: Duration,
}

impl NameServerChain {
    pub fn new(servers: Vec<SocketAddr>) -> Self {
        Self {
            servers,
            timeout: DEFAULT_UPSTREAM_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Upstream for NameServerChain {
    async fn forward(&self, packet: &[u8], transport: Transport, wait: Option<Duration>) -> Result<Vec<u8>> {
        if packet.len() < 2 {
            bail!("query packet too short to forward");
        }

        let wait = wait.unwrap_or(self.timeout);
        let mut last_reply = None;
        let mut last_err = None;

        for &server in &self.servers {
            let exchanged = match transport {
                Transport::Udp => timeout(wait, exchange_udp(packet, server)).await,
                Transport::Tcp => timeout(wait, exchange_tcp(packet, server)).await,
            };

            match exchanged {
                Ok(Ok(reply)) if is_domain_error(&reply) => {
                    log::debug!("{} answered with a domain error, trying next", server);
                    last_reply = Some(reply);
                }
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(e)) => {
                    log::warn!("upstream {} ({:?}) failed: {:?}", server, transport, e);
                    last_err = Some(e);
                }
                Err(_) => {
                    log::warn!("upstream {} ({:?}) timed out after {:?}", server, transport, wait);
                    last_err = Some(anyhow!("upstream {} timed out", server));
                }
            }
        }

        if let Some(reply) = last_reply {
            return Ok(reply);
        }

        Err(last_err.unwrap_or_else(|| anyhow!("no upstream name servers configured")))
    }
}

async fn exchange_udp(packet: &[u8], server: SocketAddr) -> Result<Vec<u8>> {
    let bind: SocketAddr = if server.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    // talk to upstream using ephemeral socket
    let socket = UdpSocket::bind(bind).await?;
    socket
        .connect(server)
        .await
        .with_context(|| format!("connecting to {}", server))?;
    socket.send(packet).await?;

    let mut buf = vec![0u8; 4096];
    loop {
        let n = socket.recv(&mut buf).await?;

        // stale or spoofed replies carry a different id
        if n >= 2 && buf[..2] == packet[..2] {
            log::trace!("{} bytes from upstream {}", n, server);
            return Ok(buf[..n].to_vec());
        }
    }
}

async fn exchange_tcp(packet: &[u8], server: SocketAddr) -> Result<Vec<u8>> {
    let mut stream = TcpStream::connect(server)
        .await
        .with_context(|| format!("connecting to {}", server))?;
    write_frame(&mut stream, packet).await?;

    loop {
        let reply = read_frame(&mut stream)
            .await
            .with_context(|| format!("reading tcp reply from {}", server))?;

        if reply.len() >= 2 && reply[..2] == packet[..2] {
            log::trace!("{} bytes from upstream {} over tcp", reply.len(), server);
            return Ok(reply);
        }
    }
}

fn is_domain_error(reply: &[u8]) -> bool {
    match Message::from_vec(reply) {
        Ok(msg) => matches!(
            msg.response_code(),
            ResponseCode::ServFail | ResponseCode::Refused
        ),
        Err(_) => true,
    }
}
