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

use clap::Parser;

use runsd::config::Args;
use runsd::{app, telemetry};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    telemetry::setup_logging(args.verbosity);

    match app::run(args).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!("runsd failed: {e:#}");
            std::process::exit(1);
        }
    }
}
