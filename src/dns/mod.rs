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

//! The DNS hijack server.
//!
//! Names inside the internal zone get synthesized loopback answers so that
//! the child's connections land on the local reverse proxy; every other name
//! is recursed verbatim to the platform's resolver.

use std::io;
use std::net::SocketAddr;

use hickory_proto::ProtoError;

pub mod forwarder;
pub mod handler;
pub mod hijack;
pub mod resolver;
pub mod server;

pub use forwarder::{Forwarder, UpstreamForwarder};
pub use hijack::Hijack;
pub use resolver::{Answer, Resolver};
pub use server::Server;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to bind to address {0}: {1}")]
    Bind(SocketAddr, #[source] io::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid internal zone {zone:?}: {source}")]
    InvalidZone {
        zone: String,
        #[source]
        source: ProtoError,
    },
}
