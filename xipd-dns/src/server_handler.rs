use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    sync::watch,
    time::timeout,
};
use trust_dns_proto::{
    op::Message,
    serialize::binary::{BinEncodable, BinEncoder},
};

use crate::{DynamicResolver, upstream::Transport};

const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Keeps the listeners alive. Calling `shutdown` or dropping the handle
/// stops both the UDP and the TCP loop.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: Option<watch::Sender<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Binds UDP and TCP on `listen_addr` and serves queries through `resolver`.
/// With port 0 the UDP socket picks the port and TCP binds the same one.
pub async fn run_server(listen_addr: SocketAddr, resolver: DynamicResolver) -> Result<ServerHandle> {
    let socket = UdpSocket::bind(listen_addr)
        .await
        .with_context(|| format!("binding udp socket to {}", listen_addr))?;
    let local_addr = socket.local_addr()?;

    let listener = TcpListener::bind(local_addr)
        .await
        .with_context(|| format!("binding tcp listener to {}", local_addr))?;

    log::info!("DNS listening on {} (udp, tcp)", local_addr);

    let (shutdown_tx, shutdown_rx) = watch::channel(());

    tokio::spawn(serve_udp(Arc::new(socket), resolver.clone(), shutdown_rx.clone()));
    tokio::spawn(serve_tcp(listener, resolver, shutdown_rx));

    Ok(ServerHandle {
        local_addr,
        shutdown_tx: Some(shutdown_tx),
    })
}

async fn serve_udp(socket: Arc<UdpSocket>, resolver: DynamicResolver, mut shutdown_rx: watch::Receiver<()>) {
    let mut buf = vec![0u8; 4096];
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                log::info!("Shutting down DNS UDP server");
                break;
            }
            recv = socket.recv_from(&mut buf) => {
                match recv {
                    Ok((n, peer)) => {
                        let packet = buf[..n].to_vec();
                        let resolver = resolver.clone();
                        let s = socket.clone();
                        // spawn to handle concurrently
                        tokio::spawn(async move {
                            if let Err(e) = handle_datagram(&packet, peer, &s, &resolver).await {
                                log::warn!("Error handling DNS packet from {}: {:?}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        log::warn!("recv_from error: {:?}", e);
                    }
                }
            }
        }
    }
}

async fn handle_datagram(
    packet: &[u8],
    src: SocketAddr,
    socket: &UdpSocket,
    resolver: &DynamicResolver,
) -> Result<()> {
    if let Some(reply) = resolver.handle_packet(packet, Transport::Udp).await? {
        socket.send_to(&reply, src).await?;
    }

    Ok(())
}

async fn serve_tcp(listener: TcpListener, resolver: DynamicResolver, mut shutdown_rx: watch::Receiver<()>) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                log::info!("Shutting down DNS TCP server");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let resolver = resolver.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, &resolver).await {
                                log::warn!("Error handling DNS connection from {}: {:?}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        log::warn!("accept error: {:?}", e);
                    }
                }
            }
        }
    }
}

/// Serves length-prefixed messages until the peer closes or goes idle.
async fn handle_connection(mut stream: TcpStream, resolver: &DynamicResolver) -> Result<()> {
    loop {
        let packet = match timeout(TCP_IDLE_TIMEOUT, read_frame(&mut stream)).await {
            Ok(Ok(packet)) => packet,
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Ok(Err(e)) => return Err(e).context("reading tcp message"),
            Err(_) => return Ok(()),
        };

        if let Some(reply) = resolver.handle_packet(&packet, Transport::Tcp).await? {
            write_frame(&mut stream, &reply).await?;
        }
    }
}

/// Reads one message with its two-byte length prefix.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> io::Result<Vec<u8>> {
    let len = stream.read_u16().await? as usize;
    let mut packet = vec![0u8; len];
    stream.read_exact(&mut packet).await?;

    Ok(packet)
}

pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, packet: &[u8]) -> Result<()> {
    let len = u16::try_from(packet.len()).context("message too large for tcp")?;
    stream.write_u16(len).await?;
    stream.write_all(packet).await?;

    Ok(())
}

pub(crate) fn encode(msg: &Message) -> Result<Vec<u8>> {
    let mut out: Vec<u8> = Vec::with_capacity(512);
    {
        let mut encoder = BinEncoder::new(&mut out);
        msg.emit(&mut encoder)?;
    }

    Ok(out)
}
