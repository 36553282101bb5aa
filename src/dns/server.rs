// Copyright the runsd Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::ProtoError;
use hickory_server::ServerFuture;
use tokio::net::{TcpListener, UdpSocket};
use tracing::info;

use crate::config::Config;
use crate::dns::forwarder::{Forwarder, UpstreamForwarder};
use crate::dns::handler::Handler;
use crate::dns::hijack::Hijack;
use crate::dns::Error;

const TCP_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// The DNS hijack server: UDP and TCP listeners on the v4 loopback, plus the
/// v6 pair when the stack supports it. Every listener must come up or
/// startup fails.
pub struct Server {
    server: ServerFuture<Handler>,
    udp_addr: SocketAddr,
    tcp_addr: SocketAddr,
}

impl Server {
    pub async fn bind(cfg: Arc<Config>) -> Result<Self, Error> {
        let upstream = SocketAddr::new(cfg.upstream_nameserver, 53);
        Self::bind_with(&cfg, Arc::new(UpstreamForwarder::new(upstream))).await
    }

    /// Binds with an explicit forwarder; the seam tests use to stub the
    /// upstream resolver out.
    pub async fn bind_with(cfg: &Config, forwarder: Arc<dyn Forwarder>) -> Result<Self, Error> {
        let hijack = Hijack::new(&cfg.internal_zone, cfg.ndots, cfg.serve_ipv6, forwarder)?;
        let handler = Handler::new(Arc::new(hijack));
        let mut server = ServerFuture::new(handler);

        let mut udp_addr = None;
        let mut tcp_addr = None;
        for addr in listen_addrs(cfg) {
            let udp = UdpSocket::bind(addr)
                .await
                .map_err(|e| Error::Bind(addr, e))?;
            udp_addr = Some(udp.local_addr()?);
            server.register_socket(udp);

            let tcp = TcpListener::bind(addr)
                .await
                .map_err(|e| Error::Bind(addr, e))?;
            tcp_addr = Some(tcp.local_addr()?);
            server.register_listener(tcp, TCP_REQUEST_TIMEOUT);

            info!(address = %addr, component = "dns", "dns listener established");
        }

        Ok(Self {
            server,
            udp_addr: udp_addr.expect("at least one listen address"),
            tcp_addr: tcp_addr.expect("at least one listen address"),
        })
    }

    pub fn udp_address(&self) -> SocketAddr {
        self.udp_addr
    }

    pub fn tcp_address(&self) -> SocketAddr {
        self.tcp_addr
    }

    /// Runs the server to completion. Returning at all is a failure: the
    /// listeners are supposed to outlive the process.
    pub async fn run(mut self) -> Result<(), ProtoError> {
        self.server.block_until_done().await
    }
}

fn listen_addrs(cfg: &Config) -> Vec<SocketAddr> {
    let mut addrs = vec![SocketAddr::new(
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        cfg.dns_port,
    )];
    if cfg.serve_ipv6 {
        addrs.push(SocketAddr::new(
            IpAddr::V6(Ipv6Addr::LOCALHOST),
            cfg.dns_port,
        ));
    }
    addrs
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    use hickory_client::client::ClientHandle;
    use hickory_proto::op::ResponseCode;
    use hickory_proto::rr::{DNSClass, RecordType};

    use super::*;
    use crate::test_helpers::dns::{a, n, new_tcp_client, new_udp_client, FakeForwarder};
    use crate::test_helpers::test_config;

    async fn run_server(serve_ipv6: bool, forwarder: FakeForwarder) -> (SocketAddr, SocketAddr) {
        let mut cfg = test_config();
        cfg.serve_ipv6 = serve_ipv6;
        cfg.dns_port = 0;
        let server = Server::bind_with(&cfg, Arc::new(forwarder)).await.unwrap();
        let addrs = (server.udp_address(), server.tcp_address());
        tokio::spawn(server.run());
        addrs
    }

    #[tokio::test]
    async fn shape_violations_get_nxdomain() {
        let (udp, _) = run_server(false, FakeForwarder::default()).await;
        let mut client = new_udp_client(udp).await;

        for name in ["a.foo.bar.", "a.b.c.foo.bar.", "abc.def.foo.bar."] {
            let resp = client
                .query(n(name), DNSClass::IN, RecordType::A)
                .await
                .unwrap();
            assert_eq!(ResponseCode::NXDomain, resp.response_code(), "name: {name}");
            assert!(resp.authoritative(), "name: {name}");
            assert!(resp.answers().is_empty(), "name: {name}");
        }
    }

    #[tokio::test]
    async fn internal_name_resolves_to_loopback() {
        let (udp, _) = run_server(false, FakeForwarder::default()).await;
        let mut client = new_udp_client(udp).await;

        let resp = client
            .query(n("abc.us-central1.foo.bar."), DNSClass::IN, RecordType::A)
            .await
            .unwrap();
        assert_eq!(ResponseCode::NoError, resp.response_code());
        assert!(resp.authoritative());
        assert_eq!(
            vec![a(n("abc.us-central1.foo.bar."), Ipv4Addr::LOCALHOST)],
            resp.answers().to_vec()
        );
        assert!(resp.answers()[0].ttl() <= 10);
    }

    #[tokio::test]
    async fn internal_name_resolves_over_tcp() {
        let (_, tcp) = run_server(false, FakeForwarder::default()).await;
        let mut client = new_tcp_client(tcp).await;

        let resp = client
            .query(n("abc.us-central1.foo.bar."), DNSClass::IN, RecordType::A)
            .await
            .unwrap();
        assert_eq!(ResponseCode::NoError, resp.response_code());
        assert_eq!(1, resp.answers().len());
    }

    #[tokio::test]
    async fn external_name_uses_forwarder() {
        let forwarder = FakeForwarder::with_host(
            n("external.example.com."),
            vec![a(n("external.example.com."), Ipv4Addr::new(198, 51, 100, 4))],
        );
        let (udp, _) = run_server(false, forwarder).await;
        let mut client = new_udp_client(udp).await;

        let resp = client
            .query(n("external.example.com."), DNSClass::IN, RecordType::A)
            .await
            .unwrap();
        assert_eq!(ResponseCode::NoError, resp.response_code());
        assert!(!resp.authoritative());
        assert_eq!(
            vec![a(n("external.example.com."), Ipv4Addr::new(198, 51, 100, 4))],
            resp.answers().to_vec()
        );

        // Names the upstream does not know surface its NXDOMAIN unchanged.
        let resp = client
            .query(n("unknown.example.com."), DNSClass::IN, RecordType::A)
            .await
            .unwrap();
        assert_eq!(ResponseCode::NXDomain, resp.response_code());
        assert!(!resp.authoritative());
    }
}
