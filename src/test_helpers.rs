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

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use crate::config::Config;

/// A config pointing at the test zone used throughout the DNS tests.
pub fn test_config() -> Config {
    Config {
        internal_zone: "foo.bar.".to_string(),
        ndots: 4,
        upstream_nameserver: IpAddr::V4(Ipv4Addr::LOCALHOST),
        current_region: "us-central1".to_string(),
        project_hash: "dpyb4duzqq".to_string(),
        serve_ipv6: false,
        dns_port: 0,
        http_proxy_port: 0,
        on_platform: true,
        skip_dns_hijack: false,
        skip_http_proxy: false,
        resolv_conf_file: PathBuf::from("/dev/null"),
        original_search: Vec::new(),
        user: None,
        command: Vec::new(),
    }
}

pub mod dns {
    use std::collections::HashMap;
    use std::io;
    use std::net::SocketAddr;

    use hickory_client::client::Client;
    use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
    use hickory_proto::rr::rdata::{A, AAAA, NS};
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use hickory_proto::runtime::iocompat::AsyncIoTokioAsStd;
    use hickory_proto::runtime::TokioRuntimeProvider;
    use hickory_proto::serialize::binary::{BinDecodable, BinEncoder};
    use hickory_proto::tcp::TcpClientStream;
    use hickory_proto::udp::UdpClientStream;
    use hickory_proto::xfer::Protocol;
    use hickory_server::authority::{LookupError, MessageRequest, MessageResponse};
    use hickory_server::server::{Request, ResponseHandler, ResponseInfo};
    use tokio::net::{TcpStream, UdpSocket};
    use tokio::sync::mpsc;

    use crate::dns::forwarder::Forwarder;
    use crate::dns::resolver::Answer;

    const TTL: u32 = 10;

    /// Short-hand for constructing a [Name].
    pub fn n<S: AsRef<str>>(name: S) -> Name {
        Name::from_utf8(name).unwrap()
    }

    pub fn a(name: Name, addr: std::net::Ipv4Addr) -> Record {
        Record::from_rdata(name, TTL, RData::A(A(addr)))
    }

    pub fn aaaa(name: Name, addr: std::net::Ipv6Addr) -> Record {
        Record::from_rdata(name, TTL, RData::AAAA(AAAA(addr)))
    }

    pub fn ns(name: Name, nameserver: Name) -> Record {
        Record::from_rdata(name, TTL, RData::NS(NS(nameserver)))
    }

    pub fn socket_addr<S: AsRef<str>>(addr: S) -> SocketAddr {
        addr.as_ref().parse().unwrap()
    }

    /// A DNS client talking UDP to the given server address.
    pub async fn new_udp_client(addr: SocketAddr) -> Client {
        let stream = UdpClientStream::builder(addr, TokioRuntimeProvider::new()).build();
        let (client, bg) = Client::connect(stream).await.unwrap();
        tokio::spawn(bg);
        client
    }

    /// A DNS client talking TCP to the given server address.
    pub async fn new_tcp_client(addr: SocketAddr) -> Client {
        let (stream, sender) = TcpClientStream::<AsyncIoTokioAsStd<TcpStream>>::new(
            addr,
            None,
            None,
            TokioRuntimeProvider::new(),
        );
        let (client, bg) = Client::new(Box::new(stream), sender, None).await.unwrap();
        tokio::spawn(bg);
        client
    }

    pub fn new_message(name: Name, rr_type: RecordType) -> Message {
        let mut msg = Message::new();
        msg.set_id(123);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(name, rr_type));
        msg
    }

    /// Converts a [Message] into the server-side [Request] a handler sees.
    pub fn server_request(msg: &Message, client_addr: SocketAddr, protocol: Protocol) -> Request {
        let wire_bytes = msg.to_vec().unwrap();
        let msg_request = MessageRequest::from_bytes(&wire_bytes).unwrap();
        Request::new(msg_request, client_addr, protocol)
    }

    pub fn request_for(name: Name, rr_type: RecordType, protocol: Protocol) -> Request {
        server_request(
            &new_message(name, rr_type),
            socket_addr("127.0.0.1:4096"),
            protocol,
        )
    }

    pub fn a_request(name: Name, client_addr: SocketAddr, protocol: Protocol) -> Request {
        server_request(&new_message(name, RecordType::A), client_addr, protocol)
    }

    /// A [ResponseHandler] that decodes the emitted response back into a
    /// [Message] and hands it to the test.
    pub fn capture_handler() -> (CaptureHandler, mpsc::Receiver<Message>) {
        let (sender, receiver) = mpsc::channel(1);
        (CaptureHandler { sender }, receiver)
    }

    #[derive(Clone)]
    pub struct CaptureHandler {
        sender: mpsc::Sender<Message>,
    }

    #[async_trait::async_trait]
    impl ResponseHandler for CaptureHandler {
        async fn send_response<'a>(
            &mut self,
            response: MessageResponse<
                '_,
                'a,
                impl Iterator<Item = &'a Record> + Send + 'a,
                impl Iterator<Item = &'a Record> + Send + 'a,
                impl Iterator<Item = &'a Record> + Send + 'a,
                impl Iterator<Item = &'a Record> + Send + 'a,
            >,
        ) -> io::Result<ResponseInfo> {
            let mut buf = Vec::with_capacity(4096);
            let mut encoder = BinEncoder::new(&mut buf);
            encoder.set_max_size(4096);
            let info = response.destructive_emit(&mut encoder)?;

            let msg = Message::from_vec(&buf)?;
            self.sender.send(msg).await.unwrap();
            Ok(info)
        }
    }

    /// An in-memory upstream: serves records for registered hosts, NXDOMAIN
    /// for everything else, always non-authoritative like a real recursor.
    #[derive(Default)]
    pub struct FakeForwarder {
        hosts: HashMap<Name, Vec<Record>>,
    }

    impl FakeForwarder {
        pub fn with_host(name: Name, records: Vec<Record>) -> Self {
            Self {
                hosts: HashMap::from([(name, records)]),
            }
        }
    }

    #[async_trait::async_trait]
    impl Forwarder for FakeForwarder {
        async fn forward(&self, request: &Request) -> Result<Answer, LookupError> {
            let info = request.request_info()?;
            let name = Name::from(info.query.name().clone());

            let mut msg = Message::new();
            match self.hosts.get(&name) {
                Some(records) => {
                    msg.insert_answers(records.clone());
                }
                None => {
                    msg.set_response_code(ResponseCode::NXDomain);
                }
            }
            Ok(Answer::forwarded(msg))
        }
    }

    /// The canned reply a [`run_stub_upstream`] server sends back.
    pub struct StubAnswer {
        pub response_code: ResponseCode,
        pub answers: Vec<Record>,
        pub name_servers: Vec<Record>,
    }

    /// Runs a stub upstream resolver on an ephemeral UDP port, answering
    /// every query with the canned reply.
    pub async fn run_stub_upstream(answer: StubAnswer) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
                let query = Message::from_vec(&buf[..len]).unwrap();

                let mut resp = Message::new();
                resp.set_id(query.id());
                resp.set_message_type(MessageType::Response);
                resp.set_op_code(OpCode::Query);
                resp.set_recursion_desired(query.recursion_desired());
                resp.set_recursion_available(true);
                resp.set_response_code(answer.response_code);
                for q in query.queries() {
                    resp.add_query(q.clone());
                }
                resp.insert_answers(answer.answers.clone());
                resp.insert_name_servers(answer.name_servers.clone());

                let wire = resp.to_vec().unwrap();
                socket.send_to(&wire, peer).await.unwrap();
            }
        });
        addr
    }
}
