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

//! The name mapper: internal hostnames to canonical Cloud Run hostnames.
//!
//! This is the single authoritative mapping between the names the child
//! application uses (`hello`, `hello.us-central1`,
//! `hello.us-central1.run.internal`) and the real HTTPS-reachable host
//! (`hello-{hash}-uc.a.run.app`). Pure string manipulation, no I/O.

use crate::regions;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("region {0:?} does not have a region code in this build")]
    UnknownRegion(String),

    #[error("hostname {0:?} has too many labels for the internal zone")]
    TooManyLabels(String),
}

/// Maps `host` to its canonical Cloud Run hostname.
///
/// A host without a dot is a short name in `current_region`. Otherwise the
/// internal zone suffix is stripped and the remainder must be exactly
/// `svc.region` with a known region.
pub fn resolve_canonical_host(
    internal_zone: &str,
    host: &str,
    current_region: &str,
    project_hash: &str,
) -> Result<String, Error> {
    let host = host.to_ascii_lowercase();
    let host = host.strip_suffix('.').unwrap_or(&host);

    if !host.contains('.') {
        let code = regions::code(current_region)
            .ok_or_else(|| Error::UnknownRegion(current_region.to_string()))?;
        return Ok(canonical_host(host, project_hash, code));
    }

    let zone = internal_zone.trim_matches('.');
    let trimmed = host.strip_suffix(&format!(".{zone}")).unwrap_or(host);
    if trimmed.matches('.').count() != 1 {
        return Err(Error::TooManyLabels(host.to_string()));
    }
    let (svc, region) = trimmed
        .split_once('.')
        .expect("trimmed host has exactly one dot");

    let code = regions::code(region).ok_or_else(|| Error::UnknownRegion(region.to_string()))?;
    Ok(canonical_host(svc, project_hash, code))
}

fn canonical_host(svc: &str, project_hash: &str, region_code: &str) -> String {
    format!("{svc}-{project_hash}-{region_code}.a.run.app")
}
