//! Command-line mutation arguments.
//!
//! `--route DEST:SRC`, `--label-input PORT:LABEL` and friends are parsed
//! here into a [`BatchPlan`] which is then issued against the hub in one
//! go.

use std::collections::BTreeMap;

use thiserror::Error;
use vhub_core::{CommandTicket, DeviceUpdate, VideoHub};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ArgError(String);

fn port(text: &str) -> Result<u32, ArgError> {
    text.trim()
        .parse()
        .map_err(|_| ArgError(format!("{text:?} is not a port number")))
}

/// `DEST:SRC`
pub fn parse_route(arg: &str) -> Result<(u32, u32), ArgError> {
    let (dest, src) = arg
        .split_once(':')
        .ok_or_else(|| ArgError(format!("expected DEST:SRC, got {arg:?}")))?;
    Ok((port(dest)?, port(src)?))
}

/// `PORT:LABEL`; the label may itself contain colons.
pub fn parse_label(arg: &str) -> Result<(u32, String), ArgError> {
    let (index, label) = arg
        .split_once(':')
        .ok_or_else(|| ArgError(format!("expected PORT:LABEL, got {arg:?}")))?;
    Ok((port(index)?, label.to_string()))
}

/// Everything one invocation asks the device to change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPlan {
    pub routes: BTreeMap<u32, u32>,
    pub update: DeviceUpdate,
}

impl BatchPlan {
    pub fn new(
        routes: &[(u32, u32)],
        locks: &[u32],
        unlocks: &[u32],
        input_labels: &[(u32, String)],
        output_labels: &[(u32, String)],
    ) -> Self {
        let mut plan = Self::default();
        plan.routes.extend(routes.iter().copied());
        plan.update.locks.extend(locks.iter().map(|p| (*p, true)));
        // An unlock given for the same port wins.
        plan.update.locks.extend(unlocks.iter().map(|p| (*p, false)));
        plan.update.input_labels.extend(input_labels.iter().cloned());
        plan.update.output_labels.extend(output_labels.iter().cloned());
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty() && self.update.is_empty()
    }

    /// Enqueue the batch: locks and labels first, routes last.
    pub fn issue(self, hub: &VideoHub) -> Vec<CommandTicket> {
        let mut tickets = hub.apply_update(self.update);
        if !self.routes.is_empty() {
            tickets.push(hub.route(self.routes));
        }
        tickets
    }
}
