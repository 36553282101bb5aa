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

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_server::authority::LookupError;
use hickory_server::server::Request;
use tracing::{debug, trace};

use crate::dns::forwarder::Forwarder;
use crate::dns::resolver::{Answer, Resolver};
use crate::dns::Error;
use crate::regions;

/// TTL for synthesized records.
const LOCAL_TTL: u32 = 10;

/// The hijacking resolver. Names inside the internal zone are answered with
/// loopback addresses; everything else is recursed through the [Forwarder].
pub struct Hijack {
    zone: Name,
    ndots: u8,
    serve_ipv6: bool,
    forwarder: Arc<dyn Forwarder>,
}

impl Hijack {
    pub fn new(
        zone: &str,
        ndots: u8,
        serve_ipv6: bool,
        forwarder: Arc<dyn Forwarder>,
    ) -> Result<Self, Error> {
        let zone = Name::from_utf8(zone).map_err(|source| Error::InvalidZone {
            zone: zone.to_string(),
            source,
        })?;
        Ok(Self {
            zone,
            ndots,
            serve_ipv6,
            forwarder,
        })
    }

    /// Validates the shape of an internal name: exactly `ndots` labels, and
    /// the label right before the zone must be a known region. `None` means
    /// authoritative NXDOMAIN.
    fn validate(&self, name: &Name) -> Option<()> {
        if name.num_labels() != self.ndots {
            debug!(
                %name,
                labels = name.num_labels(),
                need = self.ndots,
                "name is too short or long, nxdomain",
            );
            return None;
        }

        let prefix_labels = (name.num_labels() - self.zone.num_labels()) as usize;
        let mut prefix = name.iter().take(prefix_labels).skip(1);
        let region_label = prefix.next()?;
        if prefix.next().is_some() {
            // More than svc.region in front of the zone.
            return None;
        }
        let region = String::from_utf8_lossy(region_label);
        if regions::code(&region).is_none() {
            debug!(%name, %region, "unknown region, nxdomain");
            return None;
        }
        Some(())
    }

    fn synthesize(&self, name: Name, record_type: RecordType) -> Answer {
        let mut records = Vec::new();
        match record_type {
            RecordType::A => records.push(Record::from_rdata(
                name,
                LOCAL_TTL,
                RData::A(A(Ipv4Addr::LOCALHOST)),
            )),
            RecordType::AAAA if self.serve_ipv6 => records.push(Record::from_rdata(
                name,
                LOCAL_TTL,
                RData::AAAA(AAAA(Ipv6Addr::LOCALHOST)),
            )),
            // AAAA without a v6 stack: the name exists, there is just no
            // address of that family.
            _ => {}
        }
        Answer::local(records)
    }
}

#[async_trait::async_trait]
impl Resolver for Hijack {
    async fn lookup(&self, request: &Request) -> Result<Answer, LookupError> {
        let info = request.request_info()?;
        let record_type = info.query.query_type();
        let name = Name::from(info.query.name().clone());

        if !self.zone.zone_of(&name) {
            return self.forwarder.forward(request).await;
        }

        // Record types that are meaningless for the synthetic zone defer to
        // recursion: some resolver libraries probe them at startup and an
        // NXDOMAIN here would poison their bootstrap.
        if record_type != RecordType::A && record_type != RecordType::AAAA {
            trace!(%name, %record_type, "unsupported type for internal zone, defer");
            return self.forwarder.forward(request).await;
        }

        if self.validate(&name).is_none() {
            return Ok(Answer::nxdomain());
        }

        trace!(%name, %record_type, "synthesizing loopback answer");
        Ok(self.synthesize(name, record_type))
    }
}
