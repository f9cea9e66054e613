pub mod config;
pub mod engine;
pub mod mapping;
pub mod pattern;
pub mod resolver;
pub mod server_handler;
pub mod upstream;
pub mod wildcard;

pub use config::EngineConfig;
pub use engine::{Query, ResolutionEngine, ResolutionOutcome};
pub use mapping::{MappingMatcher, MappingRule, MappingTable};
pub use resolver::{Answer, DynamicResolver};
pub use server_handler::{ServerHandle, run_server};
pub use upstream::{NameServerChain, Transport, Upstream};
pub use wildcard::WildcardMatcher;



#[cfg(test)]
mod integration_tests {
    use super::*;
    use tokio::{
        net::{TcpStream, UdpSocket},
        runtime::Runtime,
    };
    use std::{net::{Ipv4Addr, SocketAddr}, sync::Arc};
    use trust_dns_proto::{
        op::{Message, Query as DnsQuery},
        rr::{Name, RData, RecordType, rdata::A},
    };

    use crate::{
        server_handler::{encode, read_frame, write_frame},
        upstream::tests::truncating_server,
    };
    use hickory_resolver::{
        config::{NameServerConfig, ResolverConfig}, name_server::GenericConnector, proto::{runtime::TokioRuntimeProvider, xfer::Protocol}, TokioResolver
    };

    async fn lookup_v4(server: SocketAddr, protocol: Protocol, name: &str) -> Vec<Ipv4Addr> {
        let mut cfg = ResolverConfig::new();
        cfg.add_name_server(NameServerConfig {
            socket_addr: server,
            protocol,
            http_endpoint: None,
            tls_dns_name: None,
            trust_negative_responses: true,
            bind_addr: None,
        });

        let provider = GenericConnector::new(TokioRuntimeProvider::new());
        let resolver = TokioResolver::builder_with_config(cfg, provider).build();

        // A only: AAAA would be delegated to the (empty) upstream chain
        let response = resolver.ipv4_lookup(name).await.unwrap();
        response.iter().map(|a| a.0).collect()
    }

    #[test]
    fn test_server_resolves_wildcard_and_mapped_names() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let rules = config::parse_mapping(
                r#"{"api.local": "10.0.0.2", "*.local": "gateway.local", "gateway.local": "10.0.0.3"}"#,
            )
            .unwrap();
            let engine = ResolutionEngine::from_config(Some("xip.io"), &rules).unwrap();
            // nothing in these tests should reach upstream
            let upstream = NameServerChain::new(Vec::new());
            let resolver = DynamicResolver::new(engine, Arc::new(upstream));

            let handle = run_server("127.0.0.1:0".parse().unwrap(), resolver).await.unwrap();
            let addr = handle.local_addr();

            assert_eq!(lookup_v4(addr, Protocol::Udp, "www.10.0.0.1.xip.io.").await, vec![Ipv4Addr::new(10, 0, 0, 1)]);
            assert_eq!(lookup_v4(addr, Protocol::Udp, "foo.local.").await, vec![Ipv4Addr::new(10, 0, 0, 3)]);
            assert_eq!(lookup_v4(addr, Protocol::Tcp, "api.local.").await, vec![Ipv4Addr::new(10, 0, 0, 2)]);

            // shutdown server
            handle.shutdown().await;
        });
    }

    fn big_example() -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(31);
        msg.set_recursion_desired(true);
        msg.add_query(DnsQuery::query(Name::from_ascii("big.example.").unwrap(), RecordType::A));
        encode(&msg).unwrap()
    }

    #[tokio::test]
    async fn test_tcp_client_gets_full_reply_from_truncating_upstream() {
        let upstream_addr = truncating_server(Ipv4Addr::new(192, 0, 2, 9)).await;
        let engine = ResolutionEngine::from_config(Some("xip.io"), &[]).unwrap();
        let resolver = DynamicResolver::new(engine, Arc::new(NameServerChain::new(vec![upstream_addr])));

        let handle = run_server("127.0.0.1:0".parse().unwrap(), resolver).await.unwrap();

        let mut stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        write_frame(&mut stream, &big_example()).await.unwrap();
        let reply = Message::from_vec(&read_frame(&mut stream).await.unwrap()).unwrap();

        assert_eq!(reply.id(), 31);
        assert!(!reply.truncated());
        assert_eq!(reply.answers()[0].data(), Some(&RData::A(A(Ipv4Addr::new(192, 0, 2, 9)))));

        // udp clients see the flag and can retry themselves
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.send_to(&big_example(), handle.local_addr()).await.unwrap();
        let mut buf = vec![0u8; 4096];
        let n = socket.recv(&mut buf).await.unwrap();
        let reply = Message::from_vec(&buf[..n]).unwrap();

        assert!(reply.truncated());
        assert!(reply.answers().is_empty());

        handle.shutdown().await;
    }
}
