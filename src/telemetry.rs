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

use std::env;
use std::str::FromStr;

use tracing_subscriber::{filter, prelude::*};

/// Installs the global tracing subscriber.
///
/// `verbosity` is the `-v` flag: 0 logs at info, 1 at debug, anything higher
/// at trace. An explicit `RUST_LOG` takes precedence over the flag.
pub fn setup_logging(verbosity: u8) {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(default_filter(verbosity)))
        .try_init();
}

fn default_filter(verbosity: u8) -> filter::Targets {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    // The hickory accept loop logs every malformed packet; keep it quiet
    // unless explicitly re-enabled through RUST_LOG.
    let directives = match env::var("RUST_LOG") {
        Ok(overrides) => format!("hickory_server::server::server_future=off,{overrides}"),
        Err(_) => format!("hickory_server::server::server_future=off,{level}"),
    };
    filter::Targets::from_str(&directives).expect("static filter should build")
}
