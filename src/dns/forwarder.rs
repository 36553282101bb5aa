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

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, Query};
use hickory_proto::rr::Name;
use hickory_proto::xfer::Protocol;
use hickory_server::authority::LookupError;
use hickory_server::server::Request;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::trace;

use crate::dns::resolver::Answer;

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RESPONSE_SIZE: usize = 64 * 1024;

/// Recurses a request to an upstream resolver. A trait seam so tests can
/// stub the upstream out.
#[async_trait::async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, request: &Request) -> Result<Answer, LookupError>;
}

/// Forwards queries to the configured upstream nameserver as a one-shot
/// message exchange, preserving the upstream's response wholesale. There is
/// no in-process retry; the child's stub resolver owns that.
pub struct UpstreamForwarder {
    upstream: SocketAddr,
}

impl UpstreamForwarder {
    pub fn new(upstream: SocketAddr) -> Self {
        Self { upstream }
    }

    async fn exchange_udp(&self, wire: &[u8]) -> Result<Vec<u8>, io::Error> {
        let bind: SocketAddr = if self.upstream.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(self.upstream).await?;
        socket.send(wire).await?;

        let mut buf = vec![0u8; MAX_RESPONSE_SIZE];
        let n = timeout(EXCHANGE_TIMEOUT, socket.recv(&mut buf))
            .await
            .map_err(|_| timed_out())??;
        buf.truncate(n);
        Ok(buf)
    }

    async fn exchange_tcp(&self, wire: &[u8]) -> Result<Vec<u8>, io::Error> {
        let mut stream = timeout(EXCHANGE_TIMEOUT, TcpStream::connect(self.upstream))
            .await
            .map_err(|_| timed_out())??;
        stream.write_all(&(wire.len() as u16).to_be_bytes()).await?;
        stream.write_all(wire).await?;

        let exchange = async {
            let mut len = [0u8; 2];
            stream.read_exact(&mut len).await?;
            let mut buf = vec![0u8; u16::from_be_bytes(len) as usize];
            stream.read_exact(&mut buf).await?;
            Ok(buf)
        };
        timeout(EXCHANGE_TIMEOUT, exchange)
            .await
            .map_err(|_| timed_out())?
    }
}

#[async_trait::async_trait]
impl Forwarder for UpstreamForwarder {
    async fn forward(&self, request: &Request) -> Result<Answer, LookupError> {
        let info = request.request_info()?;

        // Reassemble the query as the client sent it: same id, same
        // question, same recursion and EDNS parameters.
        let mut query = Query::query(
            Name::from(info.query.name().clone()),
            info.query.query_type(),
        );
        query.set_query_class(info.query.query_class());

        let mut msg = Message::new();
        msg.set_id(request.id())
            .set_message_type(MessageType::Query)
            .set_op_code(request.op_code())
            .set_recursion_desired(request.header().recursion_desired())
            .add_query(query);
        if let Some(edns) = request.edns() {
            msg.set_edns(edns.clone());
        }
        let wire = msg.to_vec().map_err(LookupError::from)?;

        trace!(
            name = %info.query.name(),
            query_type = %info.query.query_type(),
            upstream = %self.upstream,
            "recursing to upstream resolver",
        );
        let response = match info.protocol {
            Protocol::Tcp => self.exchange_tcp(&wire).await,
            _ => self.exchange_udp(&wire).await,
        }
        .map_err(LookupError::from)?;

        let message = Message::from_vec(&response).map_err(LookupError::from)?;
        if message.id() != request.id() {
            return Err(LookupError::from(io::Error::other(
                "upstream resolver answered with a mismatched id",
            )));
        }
        Ok(Answer::forwarded(message))
    }
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "upstream resolver timed out")
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use hickory_proto::op::ResponseCode;
    use hickory_proto::rr::RecordType;
    use hickory_proto::xfer::Protocol;

    use super::*;
    use crate::test_helpers::dns::{a, n, ns, request_for, run_stub_upstream, StubAnswer};

    #[tokio::test]
    async fn forwards_upstream_sections_and_code() {
        let name = n("www.example.com.");
        let upstream = run_stub_upstream(StubAnswer {
            response_code: ResponseCode::NoError,
            answers: vec![a(name.clone(), Ipv4Addr::new(93, 184, 216, 34))],
            name_servers: vec![ns(name.clone(), n("ns.example.com."))],
        })
        .await;

        let forwarder = UpstreamForwarder::new(upstream);
        let req = request_for(name.clone(), RecordType::A, Protocol::Udp);
        let answer = forwarder.forward(&req).await.unwrap();

        assert!(!answer.is_authoritative());
        assert!(answer.recursion_available());
        assert_eq!(ResponseCode::NoError, answer.response_code());
        assert_eq!(
            vec![a(name.clone(), Ipv4Addr::new(93, 184, 216, 34))],
            answer.answers().to_vec()
        );
        assert_eq!(vec![ns(name.clone(), n("ns.example.com."))], answer.name_servers().to_vec());
    }

    #[tokio::test]
    async fn forwards_upstream_nxdomain() {
        let upstream = run_stub_upstream(StubAnswer {
            response_code: ResponseCode::NXDomain,
            answers: vec![],
            name_servers: vec![],
        })
        .await;

        let forwarder = UpstreamForwarder::new(upstream);
        let req = request_for(n("no.such.host."), RecordType::A, Protocol::Udp);
        let answer = forwarder.forward(&req).await.unwrap();

        assert_eq!(ResponseCode::NXDomain, answer.response_code());
        assert!(answer.answers().is_empty());
    }
}
