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

use std::sync::Arc;

use hickory_proto::op::{Edns, Header, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::Record;
use hickory_server::authority::{MessageResponse, MessageResponseBuilder};
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use tracing::{error, warn};

use crate::dns::resolver::{Answer, Resolver};

/// Bridges hickory-server requests to a [Resolver].
pub struct Handler {
    resolver: Arc<dyn Resolver>,
}

impl Handler {
    pub fn new(resolver: Arc<dyn Resolver>) -> Self {
        Self { resolver }
    }

    async fn lookup<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: R,
    ) -> ResponseInfo {
        match self.resolver.lookup(request).await {
            Ok(answer) => send_answer(request, response_handle, answer).await,
            Err(e) => {
                warn!(error = %e, "lookup failed, answering servfail");
                send_servfail(request, response_handle).await
            }
        }
    }
}

#[async_trait::async_trait]
impl RequestHandler for Handler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: R,
    ) -> ResponseInfo {
        match request.message_type() {
            MessageType::Query => match request.op_code() {
                OpCode::Query => self.lookup(request, response_handle).await,
                op_code => {
                    warn!(?op_code, "unimplemented op_code");
                    send_code(request, response_handle, ResponseCode::NotImp).await
                }
            },
            MessageType::Response => {
                warn!(id = request.id(), "got a response as a request");
                send_code(request, response_handle, ResponseCode::FormErr).await
            }
        }
    }
}

/// Forwarded answers are relayed as the upstream sent them: header flags
/// (truncated, AD, CD) and the OPT record come from the [Answer], not from
/// the client's request. Local answers echo the client's EDNS parameters.
async fn send_answer<R: ResponseHandler>(
    request: &Request,
    response_handle: R,
    answer: Answer,
) -> ResponseInfo {
    let mut header = Header::response_from_request(request.header());
    header.set_authoritative(answer.is_authoritative());
    header.set_truncated(answer.truncated());
    header.set_authentic_data(answer.authentic_data());
    header.set_checking_disabled(answer.checking_disabled());
    header.set_recursion_available(answer.recursion_available());
    header.set_response_code(answer.response_code());

    let mut builder = MessageResponseBuilder::from_message_request(request);
    if let Some(edns) = answer.edns().cloned().or_else(|| response_edns(request)) {
        builder.edns(edns);
    }

    let response = builder.build(
        header,
        answer.answers().iter(),
        answer.name_servers().iter(),
        None.iter(),
        answer.additionals().iter(),
    );

    send_response(response, response_handle).await
}

/// Recursion failures are answered with an authoritative SERVFAIL; the stub
/// resolver owns any retry.
async fn send_servfail<R: ResponseHandler>(request: &Request, response_handle: R) -> ResponseInfo {
    let mut header = Header::response_from_request(request.header());
    header.set_authoritative(true);
    header.set_recursion_available(true);
    header.set_response_code(ResponseCode::ServFail);

    let response = MessageResponseBuilder::from_message_request(request).build_no_records(header);
    send_response(response, response_handle).await
}

async fn send_code<R: ResponseHandler>(
    request: &Request,
    response_handle: R,
    code: ResponseCode,
) -> ResponseInfo {
    let response =
        MessageResponseBuilder::from_message_request(request).error_msg(request.header(), code);
    send_response(response, response_handle).await
}

async fn send_response<'a, R: ResponseHandler>(
    response: MessageResponse<
        '_,
        'a,
        impl Iterator<Item = &'a Record> + Send + 'a,
        impl Iterator<Item = &'a Record> + Send + 'a,
        impl Iterator<Item = &'a Record> + Send + 'a,
        impl Iterator<Item = &'a Record> + Send + 'a,
    >,
    mut response_handle: R,
) -> ResponseInfo {
    match response_handle.send_response(response).await {
        Ok(info) => info,
        Err(e) => {
            error!(error = %e, "failed to send response");
            let mut header = Header::new();
            header.set_response_code(ResponseCode::ServFail);
            header.into()
        }
    }
}

/// Echoes the request's EDNS parameters back, for answers synthesized
/// locally rather than relayed from upstream.
fn response_edns(request: &Request) -> Option<Edns> {
    request.edns().map(|req_edns| {
        let mut resp_edns = Edns::new();
        resp_edns.set_max_payload(req_edns.max_payload().max(512));
        resp_edns.set_version(req_edns.version());
        resp_edns.set_dnssec_ok(req_edns.flags().dnssec_ok);
        resp_edns
    })
}
