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

//! The child application: spawn, signal forwarding, exit-code proxying.
//!
//! The child owns the container's stdio; runsd only relays SIGINT/SIGTERM
//! and mirrors its exit code so the platform sees the application, not the
//! wrapper.

use std::process::Stdio;

use nix::sys::signal::{kill, Signal};
use nix::unistd::{Pid, Uid, User};
use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no subprocess given; invoke as: runsd [flags] -- <command> [args...]")]
    NoCommand,

    #[error("cannot resolve user {0:?}: {1}")]
    UserLookup(String, #[source] nix::Error),

    #[error("user {0:?} does not exist")]
    UnknownUser(String),

    #[error("failed to start subprocess {0:?}: {1}")]
    Spawn(String, #[source] std::io::Error),

    #[error("failed waiting for subprocess: {0}")]
    Wait(#[source] std::io::Error),

    #[error("subprocess exited without an exit code (status: {0})")]
    NoExitCode(std::process::ExitStatus),
}

/// Resolves a `--user` value, either a numeric uid or a user name, against
/// the user database.
pub fn resolve_user(uid_or_name: &str) -> Result<u32, Error> {
    if let Ok(uid) = uid_or_name.parse::<u32>() {
        User::from_uid(Uid::from_raw(uid))
            .map_err(|e| Error::UserLookup(uid_or_name.to_string(), e))?
            .ok_or_else(|| Error::UnknownUser(uid_or_name.to_string()))?;
        return Ok(uid);
    }
    let user = User::from_name(uid_or_name)
        .map_err(|e| Error::UserLookup(uid_or_name.to_string(), e))?
        .ok_or_else(|| Error::UnknownUser(uid_or_name.to_string()))?;
    Ok(user.uid.as_raw())
}

/// Runs the child to completion and returns its exit code. Stdio handles are
/// inherited; SIGINT and SIGTERM received by runsd are delivered to the
/// child as-is.
pub async fn run(command: &[String], uid: Option<u32>) -> Result<i32, Error> {
    let (program, args) = command.split_first().ok_or(Error::NoCommand)?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    if let Some(uid) = uid {
        cmd.uid(uid);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Spawn(program.clone(), e))?;
    debug!(pid = child.id(), cmd = %program, "subprocess started");

    let forwarder = child
        .id()
        .map(|pid| tokio::spawn(forward_signals(Pid::from_raw(pid as i32))));

    let status = child.wait().await.map_err(Error::Wait);
    if let Some(forwarder) = forwarder {
        forwarder.abort();
    }
    let status = status?;

    match status.code() {
        Some(code) => {
            info!(exit_code = code, "subprocess exited");
            Ok(code)
        }
        None => Err(Error::NoExitCode(status)),
    }
}

async fn forward_signals(pid: Pid) {
    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGINT handler");
            return;
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            return;
        }
    };

    loop {
        let sig = tokio::select! {
            _ = interrupt.recv() => Signal::SIGINT,
            _ = terminate.recv() => Signal::SIGTERM,
        };
        debug!(signal = %sig, child = %pid, "forwarding signal to subprocess");
        if let Err(e) = kill(pid, sig) {
            warn!(signal = %sig, error = %e, "failed to signal subprocess");
        }
    }
}
