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

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, TcpListener};
use std::path::PathBuf;

use clap::Parser;
use tracing::debug;

use crate::resolvconf;

/// The metadata server's link-local address, which Cloud Run also installs
/// as the container's resolver. Seeing it as the upstream nameserver is how
/// runsd decides it is running on the platform.
pub const METADATA_SERVER_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(169, 254, 169, 254));

#[derive(Parser, Debug)]
#[command(
    name = "runsd",
    version,
    about = "Cloud Run sidecar: DNS service discovery and automatic service-to-service authentication",
    arg_required_else_help = true
)]
pub struct Args {
    /// Path to the resolv.conf(5) file to read and rewrite.
    #[arg(long = "resolv_conf_file", default_value = "/etc/resolv.conf")]
    pub resolv_conf_file: PathBuf,

    /// Synthetic internal zone.
    #[arg(long = "domain", default_value = "run.internal.")]
    pub domain: String,

    /// Label count of a fully qualified internal name (for --domain=a.b.
    /// this should be 4).
    #[arg(long = "ndots", default_value_t = 4)]
    pub ndots: u8,

    /// Upstream resolver override (default: first entry of the resolver
    /// file).
    #[arg(long = "nameserver")]
    pub nameserver: Option<IpAddr>,

    /// Region override; also forces "on platform" behavior.
    #[arg(long = "gcp_region")]
    pub gcp_region: Option<String>,

    /// Project URL hash (default: CLOUD_RUN_PROJECT_HASH, else discovered
    /// through the admin API).
    #[arg(long = "gcp_project_hash", env = "CLOUD_RUN_PROJECT_HASH")]
    pub gcp_project_hash: Option<String>,

    /// Do not start the DNS server or rewrite the resolver file.
    #[arg(long = "skip_dns_hijack")]
    pub skip_dns_hijack: bool,

    /// Do not start the reverse proxy.
    #[arg(long = "skip_http_proxy")]
    pub skip_http_proxy: bool,

    /// Loopback DNS port (the resolver file cannot express a custom port).
    #[arg(long = "dns_port", default_value_t = 53)]
    pub dns_port: u16,

    /// Loopback reverse proxy port.
    #[arg(long = "http_proxy_port", default_value_t = 80)]
    pub http_proxy_port: u16,

    /// Uid or user name to run the subprocess as.
    #[arg(long = "user")]
    pub user: Option<String>,

    /// Log verbosity (0 = info, 1 = debug, 2+ = trace).
    #[arg(short = 'v', long = "verbosity", default_value_t = 0)]
    pub verbosity: u8,

    /// The application to supervise, after `--`.
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

/// Immutable runtime configuration, established once during bootstrap and
/// shared read-only by the DNS server and the proxy.
#[derive(Debug, Clone)]
pub struct Config {
    /// Fully-qualified internal zone, trailing dot canonical.
    pub internal_zone: String,
    pub ndots: u8,
    pub upstream_nameserver: IpAddr,
    /// Discovered from metadata when empty at load time (on platform).
    pub current_region: String,
    /// Discovered from the admin API when empty at load time (on platform).
    pub project_hash: String,
    /// Whether the loopback IPv6 stack is usable.
    pub serve_ipv6: bool,
    pub dns_port: u16,
    pub http_proxy_port: u16,
    pub on_platform: bool,
    pub skip_dns_hijack: bool,
    pub skip_http_proxy: bool,
    pub resolv_conf_file: PathBuf,
    /// The search list found in the resolver file before hijacking.
    pub original_search: Vec<String>,
    pub user: Option<String>,
    pub command: Vec<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("the application is set to run on PORT=80, which conflicts with the runsd proxy")]
    PortCollision,

    #[error(transparent)]
    ResolvConf(#[from] resolvconf::Error),

    #[error("no nameservers in {0} and none given with --nameserver")]
    NoNameserver(String),
}

impl Config {
    /// Builds the runtime configuration from flags plus the environment:
    /// resolver file, IPv6 probe, platform detection. Region and project
    /// hash discovery need the network and stay empty here when not
    /// supplied.
    pub fn load(args: &Args) -> Result<Config, Error> {
        if std::env::var("PORT").as_deref() == Ok("80") {
            return Err(Error::PortCollision);
        }

        let rc = resolvconf::read(&args.resolv_conf_file)?;
        let upstream_nameserver = match args.nameserver {
            Some(ip) => ip,
            None => *rc.nameservers.first().ok_or_else(|| {
                Error::NoNameserver(args.resolv_conf_file.display().to_string())
            })?,
        };

        let serve_ipv6 = ipv6_available();
        if !serve_ipv6 {
            debug!("ipv6 loopback not available, serving ipv4 only");
        }

        let on_platform = args.gcp_region.is_some() || upstream_nameserver == METADATA_SERVER_IP;

        let mut internal_zone = args.domain.clone();
        if !internal_zone.ends_with('.') {
            internal_zone.push('.');
        }

        Ok(Config {
            internal_zone,
            ndots: args.ndots,
            upstream_nameserver,
            current_region: args.gcp_region.clone().unwrap_or_default(),
            project_hash: args.gcp_project_hash.clone().unwrap_or_default(),
            serve_ipv6,
            dns_port: args.dns_port,
            http_proxy_port: args.http_proxy_port,
            on_platform,
            skip_dns_hijack: args.skip_dns_hijack,
            skip_http_proxy: args.skip_http_proxy,
            resolv_conf_file: args.resolv_conf_file.clone(),
            original_search: rc.search,
            user: args.user.clone(),
            command: args.command.clone(),
        })
    }
}

/// Probes the IPv6 loopback stack by binding a transient listener.
pub fn ipv6_available() -> bool {
    TcpListener::bind((Ipv6Addr::LOCALHOST, 0)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn args(resolv: &std::path::Path) -> Args {
        Args::parse_from([
            "runsd",
            "--resolv_conf_file",
            resolv.to_str().unwrap(),
            "--",
            "true",
        ])
    }

    fn write_resolv(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn detects_platform_from_metadata_nameserver() {
        let (_dir, path) = write_resolv("nameserver 169.254.169.254\nsearch google.internal\n");
        let cfg = Config::load(&args(&path)).unwrap();
        assert!(cfg.on_platform);
        assert_eq!(METADATA_SERVER_IP, cfg.upstream_nameserver);
        assert_eq!(vec!["google.internal".to_string()], cfg.original_search);
    }

    #[test]
    fn off_platform_with_ordinary_resolver() {
        let (_dir, path) = write_resolv("nameserver 8.8.8.8\n");
        let cfg = Config::load(&args(&path)).unwrap();
        assert!(!cfg.on_platform);
    }

    #[test]
    fn region_flag_forces_platform() {
        let (_dir, path) = write_resolv("nameserver 8.8.8.8\n");
        let mut args = args(&path);
        args.gcp_region = Some("us-central1".to_string());
        let cfg = Config::load(&args).unwrap();
        assert!(cfg.on_platform);
        assert_eq!("us-central1", cfg.current_region);
    }

    #[test]
    fn nameserver_flag_overrides_file() {
        let (_dir, path) = write_resolv("nameserver 8.8.8.8\n");
        let mut args = args(&path);
        args.nameserver = Some("1.1.1.1".parse().unwrap());
        let cfg = Config::load(&args).unwrap();
        assert_eq!("1.1.1.1".parse::<IpAddr>().unwrap(), cfg.upstream_nameserver);
    }

    #[test]
    fn empty_resolver_file_is_fatal() {
        let (_dir, path) = write_resolv("# nothing here\n");
        assert!(matches!(
            Config::load(&args(&path)),
            Err(Error::NoNameserver(_))
        ));
    }

    #[test]
    fn zone_gets_trailing_dot() {
        let (_dir, path) = write_resolv("nameserver 8.8.8.8\n");
        let mut args = args(&path);
        args.domain = "run.internal".to_string();
        let cfg = Config::load(&args).unwrap();
        assert_eq!("run.internal.", cfg.internal_zone);
    }

    #[test]
    fn parses_child_command_after_double_dash() {
        let a = Args::parse_from([
            "runsd",
            "-v",
            "2",
            "--",
            "python3",
            "server.py",
            "--port=8080",
        ]);
        assert_eq!(2, a.verbosity);
        assert_eq!(vec!["python3", "server.py", "--port=8080"], a.command);
    }
}
