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

//! Bootstrap and supervision: wires the DNS server, the reverse proxy, and
//! the child process together in a strict order, then proxies the child's
//! lifecycle.

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{bail, Context as _};
use tracing::{debug, error, info};

use crate::config::{Args, Config};
use crate::metadata::{MetadataClient, TokenSource};
use crate::{child, dns, proxy, regions, resolvconf, version};

/// Runs runsd to completion and returns the exit code to propagate. Any
/// error here is a configuration-fatal condition reached before the child
/// was launched.
pub async fn run(args: Args) -> anyhow::Result<i32> {
    let mut cfg = Config::load(&args)?;
    info!(
        version = version::VERSION,
        pid = std::process::id(),
        on_platform = cfg.on_platform,
        "starting runsd",
    );

    // Fail on an unusable --user before anything is bound or rewritten.
    let child_uid = match &cfg.user {
        Some(user) => Some(child::resolve_user(user)?),
        None => None,
    };

    let metadata = MetadataClient::new();
    if cfg.on_platform {
        if cfg.current_region.is_empty() {
            debug!("inferring region from the metadata service");
            cfg.current_region = metadata
                .region()
                .await
                .context("failed to infer region from the metadata service")?;
        }
        if regions::code(&cfg.current_region).is_none() {
            bail!(
                "region {:?} does not have a region code in this version of runsd",
                cfg.current_region
            );
        }
        if cfg.project_hash.is_empty() {
            debug!("inferring project hash from the admin API");
            cfg.project_hash = metadata
                .project_hash(&cfg.current_region)
                .await
                .context("failed to infer project hash from the admin API")?;
        }
        info!(
            region = %cfg.current_region,
            project_hash = %cfg.project_hash,
            "discovered deployment identity",
        );
    }

    let cfg = Arc::new(cfg);

    if cfg.on_platform && !cfg.skip_dns_hijack {
        start_dns(cfg.clone()).await?;
    } else {
        debug!("skipping dns server initialization");
    }

    if cfg.on_platform && !cfg.skip_http_proxy {
        start_proxy(cfg.clone(), Arc::new(metadata)).await?;
    } else {
        debug!("skipping http proxy initialization");
    }

    let code = child::run(&cfg.command, child_uid).await?;
    Ok(code)
}

/// Binds the DNS listeners, then rewrites the resolver file. The order
/// matters: the child must never observe a loopback resolver that is not
/// answering yet.
async fn start_dns(cfg: Arc<Config>) -> anyhow::Result<()> {
    let server = dns::Server::bind(cfg.clone())
        .await
        .context("failed to start DNS server")?;
    info!(
        udp = %server.udp_address(),
        tcp = %server.tcp_address(),
        "dns hijack server listening",
    );
    tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "dns server failed");
        } else {
            error!("dns server exited unexpectedly");
        }
        std::process::exit(1);
    });

    let mut nameservers = vec![IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)];
    if cfg.serve_ipv6 {
        nameservers.push(IpAddr::V6(std::net::Ipv6Addr::LOCALHOST));
    }
    let mut search = resolvconf::search_zones(&cfg.current_region, &cfg.internal_zone);
    search.extend(cfg.original_search.iter().cloned());

    resolvconf::hijack(&cfg.resolv_conf_file, &nameservers, &search, cfg.ndots)
        .context("failed to rewrite resolver configuration")?;
    info!(file = %cfg.resolv_conf_file.display(), "resolver configuration hijacked");
    Ok(())
}

async fn start_proxy(cfg: Arc<Config>, tokens: Arc<dyn TokenSource>) -> anyhow::Result<()> {
    let server = proxy::Server::bind(cfg, tokens)
        .await
        .context("failed to start reverse proxy")?;
    info!(addresses = ?server.addresses(), "reverse proxy listening");
    tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "reverse proxy failed");
        } else {
            error!("reverse proxy exited unexpectedly");
        }
        std::process::exit(1);
    });
    Ok(())
}
