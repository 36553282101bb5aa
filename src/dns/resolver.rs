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

use hickory_proto::op::{Edns, Message, ResponseCode};
use hickory_proto::rr::Record;
use hickory_server::authority::LookupError;
use hickory_server::server::Request;

/// Answers a single DNS request end-to-end. Unlike a hickory `Authority`,
/// the [Answer] says per-response whether it is authoritative, since a query
/// may be served locally or forwarded upstream.
#[async_trait::async_trait]
pub trait Resolver: Send + Sync {
    async fn lookup(&self, request: &Request) -> Result<Answer, LookupError>;
}

/// Answer returned by a [Resolver]. Carries all response sections, the
/// header flags, and the OPT record so that forwarded upstream messages
/// survive unmodified.
#[derive(Debug)]
pub struct Answer {
    answers: Vec<Record>,
    name_servers: Vec<Record>,
    additionals: Vec<Record>,
    response_code: ResponseCode,
    authoritative: bool,
    truncated: bool,
    authentic_data: bool,
    checking_disabled: bool,
    recursion_available: bool,
    edns: Option<Edns>,
}

impl Answer {
    /// A locally synthesized, authoritative answer.
    pub fn local(answers: Vec<Record>) -> Self {
        Self {
            answers,
            name_servers: Vec::new(),
            additionals: Vec::new(),
            response_code: ResponseCode::NoError,
            authoritative: true,
            truncated: false,
            authentic_data: false,
            checking_disabled: false,
            recursion_available: true,
            edns: None,
        }
    }

    /// An authoritative "no such name" for the synthetic zone.
    pub fn nxdomain() -> Self {
        Self {
            response_code: ResponseCode::NXDomain,
            ..Self::local(Vec::new())
        }
    }

    /// A response recursed from the upstream resolver, relayed with its
    /// sections, header flags (truncated, AD, CD), and OPT record intact.
    pub fn forwarded(message: Message) -> Self {
        Self {
            response_code: message.response_code(),
            authoritative: message.authoritative(),
            truncated: message.truncated(),
            authentic_data: message.authentic_data(),
            checking_disabled: message.checking_disabled(),
            recursion_available: message.recursion_available(),
            edns: message.edns().cloned(),
            answers: message.answers().to_vec(),
            name_servers: message.name_servers().to_vec(),
            additionals: message.additionals().to_vec(),
        }
    }

    pub fn answers(&self) -> &[Record] {
        &self.answers
    }

    pub fn name_servers(&self) -> &[Record] {
        &self.name_servers
    }

    pub fn additionals(&self) -> &[Record] {
        &self.additionals
    }

    pub fn response_code(&self) -> ResponseCode {
        self.response_code
    }

    pub fn is_authoritative(&self) -> bool {
        self.authoritative
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn authentic_data(&self) -> bool {
        self.authentic_data
    }

    pub fn checking_disabled(&self) -> bool {
        self.checking_disabled
    }

    pub fn recursion_available(&self) -> bool {
        self.recursion_available
    }

    /// The upstream's OPT record, when this answer was forwarded.
    pub fn edns(&self) -> Option<&Edns> {
        self.edns.as_ref()
    }
}
