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

//! Reading and rewriting the container's resolver configuration.
//!
//! The file is read once at bootstrap to find the platform's resolver and the
//! pre-existing search list, and rewritten exactly once after the DNS
//! listeners are up. It is never re-read.

use std::fmt::Write as _;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("reading {0}: {1}")]
    Read(PathBuf, #[source] std::io::Error),

    #[error("parsing {0}: {1}")]
    Parse(PathBuf, #[source] resolv_conf::ParseError),

    #[error("writing {0}: {1}")]
    Write(PathBuf, #[source] std::io::Error),
}

/// The parts of a resolv.conf(5) file runsd cares about.
#[derive(Debug, Clone)]
pub struct ResolvConf {
    pub nameservers: Vec<IpAddr>,
    pub search: Vec<String>,
}

pub fn read(path: &Path) -> Result<ResolvConf, Error> {
    let buf = fs::read(path).map_err(|e| Error::Read(path.to_path_buf(), e))?;
    let parsed =
        resolv_conf::Config::parse(&buf).map_err(|e| Error::Parse(path.to_path_buf(), e))?;

    // The whole search list survives; it gets re-appended after the
    // internal zones when the file is rewritten.
    let search = parsed.get_search().cloned().unwrap_or_default();

    Ok(ResolvConf {
        nameservers: parsed.nameservers.iter().map(IpAddr::from).collect(),
        search,
    })
}

/// Overwrites the resolver file so that the child's stub resolver sends every
/// query to the loopback DNS servers, tries the internal zones first, and
/// treats names with fewer than `ndots` dots as unqualified.
pub fn hijack(
    path: &Path,
    nameservers: &[IpAddr],
    search_domains: &[String],
    ndots: u8,
) -> Result<(), Error> {
    let mut out = String::new();
    for ns in nameservers {
        writeln!(out, "nameserver {ns}").expect("writing to a String cannot fail");
    }
    writeln!(out, "search {}", search_domains.join(" ")).expect("writing to a String cannot fail");
    writeln!(out, "options ndots:{ndots}").expect("writing to a String cannot fail");

    fs::write(path, out).map_err(|e| Error::Write(path.to_path_buf(), e))
}

/// The search domains prepended for a region: `{region}.{zone}` first so that
/// a bare `hello` expands to the same-region service, then the zone itself
/// for `hello.us-east1` style names.
pub fn search_zones(region: &str, internal_zone: &str) -> Vec<String> {
    vec![format!("{region}.{internal_zone}"), internal_zone.to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn read_nameservers_and_search() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        fs::write(
            &path,
            "# generated by the platform\nnameserver 169.254.169.254\nsearch c.my-project.internal google.internal\noptions ndots:1\n",
        )
        .unwrap();

        let rc = read(&path).unwrap();
        assert_eq!(
            vec![IpAddr::V4(Ipv4Addr::new(169, 254, 169, 254))],
            rc.nameservers
        );
        assert_eq!(
            vec!["c.my-project.internal".to_string(), "google.internal".to_string()],
            rc.search
        );
    }

    #[test]
    fn read_missing_file() {
        assert!(matches!(
            read(Path::new("/nonexistent/resolv.conf")),
            Err(Error::Read(_, _))
        ));
    }

    #[test]
    fn hijack_writes_expected_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        fs::write(&path, "nameserver 8.8.8.8\n").unwrap();

        let mut search = search_zones("us-central1", "run.internal.");
        search.push("google.internal".to_string());
        let nameservers = [
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
        ];
        hijack(&path, &nameservers, &search, 4).unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(
            "nameserver 127.0.0.1\n\
             nameserver ::1\n\
             search us-central1.run.internal. run.internal. google.internal\n\
             options ndots:4\n",
            written
        );
    }
}
