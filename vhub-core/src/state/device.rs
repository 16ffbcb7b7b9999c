//! Client-side mirror of the device state.
//!
//! The mirror is only ever written by merging blocks the device
//! reported. Merges overwrite per key: the device may report just the
//! entries that changed, so unmentioned keys keep their last value.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::block::{Block, FieldKey};
use crate::message::{BlockTitle, LOCKED};

/// Info key carrying the model name.
pub const MODEL_NAME: &str = "Model name";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    pub info: BTreeMap<String, String>,
    pub input_labels: BTreeMap<u32, String>,
    pub output_labels: BTreeMap<u32, String>,
    /// Destination output → source input.
    pub routes: BTreeMap<u32, u32>,
    pub locks: BTreeMap<u32, bool>,
    /// The device finished its initial state dump.
    pub prelude_complete: bool,
}

impl DeviceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one block. Returns `false` for titles that are not mirrored.
    pub fn apply(&mut self, block: &Block) -> bool {
        let Some(title) = block.known_title() else {
            debug!(title = block.title(), "ignoring block");
            return false;
        };
        match title {
            t if t.is_info() => {
                for (key, value) in block.fields() {
                    self.info.insert(key.to_string(), value.clone());
                }
            }
            BlockTitle::InputLabels => merge_indexed(&mut self.input_labels, block, |v| {
                Some(v.to_string())
            }),
            BlockTitle::OutputLabels => merge_indexed(&mut self.output_labels, block, |v| {
                Some(v.to_string())
            }),
            BlockTitle::VideoOutputRouting => {
                merge_indexed(&mut self.routes, block, |v| v.trim().parse().ok())
            }
            BlockTitle::VideoOutputLocks => {
                merge_indexed(&mut self.locks, block, |v| Some(v == LOCKED))
            }
            BlockTitle::EndPrelude => self.prelude_complete = true,
            _ => return false,
        }
        true
    }

    pub fn model_name(&self) -> Option<&str> {
        self.info.get(MODEL_NAME).map(String::as_str)
    }

    /// The view handed to presentation layers.
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            meta: StatusMeta {
                name: self.model_name().map(str::to_string),
                size: self.output_labels.len(),
            },
            device_info: self.info.clone(),
            input_labels: self.input_labels.clone(),
            output_labels: self.output_labels.clone(),
            routes: self.routes.clone(),
        }
    }
}

fn merge_indexed<V>(
    target: &mut BTreeMap<u32, V>,
    block: &Block,
    convert: impl Fn(&str) -> Option<V>,
) {
    for (key, value) in block.fields() {
        let FieldKey::Index(index) = key else {
            warn!(title = block.title(), %key, "non-numeric port in indexed block");
            continue;
        };
        match convert(value) {
            Some(v) => {
                target.insert(*index, v);
            }
            None => warn!(title = block.title(), port = *index, %value, "unparsable value"),
        }
    }
}

// ── Presentation boundary ────────────────────────────────────────

/// Current mirror contents, serialized as JSON by presentation layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub meta: StatusMeta,
    pub device_info: BTreeMap<String, String>,
    pub input_labels: BTreeMap<u32, String>,
    pub output_labels: BTreeMap<u32, String>,
    pub routes: BTreeMap<u32, u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusMeta {
    pub name: Option<String>,
    /// Number of outputs with a known label.
    pub size: usize,
}

/// Route one destination to one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRequest {
    #[serde(alias = "dest")]
    pub destination: u32,
    #[serde(alias = "src")]
    pub source: u32,
}

/// Partial label/lock update; absent sections are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeviceUpdate {
    pub input_labels: BTreeMap<u32, String>,
    pub output_labels: BTreeMap<u32, String>,
    pub locks: BTreeMap<u32, bool>,
}

impl DeviceUpdate {
    pub fn is_empty(&self) -> bool {
        self.input_labels.is_empty() && self.output_labels.is_empty() && self.locks.is_empty()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn block(text: &str) -> Block {
        Block::parse(text.as_bytes()).unwrap()
    }

    #[test]
    fn info_blocks_merge_into_info() {
        let mut state = DeviceState::new();
        assert!(state.apply(&block("PROTOCOL PREAMBLE:\nVersion: 2.8\n")));
        assert!(state.apply(&block(
            "VIDEOHUB DEVICE:\nModel name: Smart Videohub 40x40\nVideo inputs: 40\n"
        )));
        assert_eq!(state.info.get("Version").unwrap(), "2.8");
        assert_eq!(state.model_name(), Some("Smart Videohub 40x40"));
        assert_eq!(state.info.len(), 3);
    }

    #[test]
    fn label_merges_are_unions_with_later_values_winning() {
        let mut state = DeviceState::new();
        let sequence = [
            "INPUT LABELS:\n0 Camera 1\n1 Camera 2\n",
            "INPUT LABELS:\n1 Graphics\n2 Replay\n",
            "INPUT LABELS:\n3 Bars\n0 Wide\n",
        ];
        let mut expected = BTreeMap::new();
        for text in sequence {
            let b = block(text);
            for (key, value) in b.fields() {
                expected.insert(key.as_index().unwrap(), value.clone());
            }
            state.apply(&b);
        }
        assert_eq!(state.input_labels, expected);
        assert_eq!(state.input_labels.get(&0).unwrap(), "Wide");
        assert_eq!(state.input_labels.get(&1).unwrap(), "Graphics");
        assert_eq!(state.input_labels.len(), 4);
    }

    #[test]
    fn routes_are_numeric_and_partial() {
        let mut state = DeviceState::new();
        state.apply(&block("VIDEO OUTPUT ROUTING:\n0 5\n1 6\n2 x\n"));
        state.apply(&block("VIDEO OUTPUT ROUTING:\n1 9\n"));
        assert_eq!(state.routes, BTreeMap::from([(0, 5), (1, 9)]));
    }

    #[test]
    fn lock_values() {
        let mut state = DeviceState::new();
        state.apply(&block("VIDEO OUTPUT LOCKS:\n0 L\n1 U\n2 O\n"));
        assert_eq!(
            state.locks,
            BTreeMap::from([(0, true), (1, false), (2, false)])
        );
    }

    #[test]
    fn end_prelude_and_unknown_titles() {
        let mut state = DeviceState::new();
        assert!(!state.apply(&block("CONFIGURATION:\nTake Mode: true\n")));
        assert!(!state.prelude_complete);
        assert!(state.apply(&block("END PRELUDE:\n")));
        assert!(state.prelude_complete);
        assert!(state.info.is_empty());
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let mut state = DeviceState::new();
        state.apply(&block("VIDEOHUB DEVICE:\nModel name: Mini\n"));
        state.apply(&block("OUTPUT LABELS:\n0 Mon 1\n1 Mon 2\n"));
        state.apply(&block("VIDEO OUTPUT ROUTING:\n0 3\n"));

        let json = serde_json::to_value(state.snapshot()).unwrap();
        assert_eq!(json["meta"]["name"], "Mini");
        assert_eq!(json["meta"]["size"], 2);
        assert_eq!(json["deviceInfo"]["Model name"], "Mini");
        assert_eq!(json["outputLabels"]["1"], "Mon 2");
        assert_eq!(json["routes"]["0"], 3);
    }

    #[test]
    fn requests_deserialize() {
        let route: RouteRequest = serde_json::from_str(r#"{"dest": 4, "src": 1}"#).unwrap();
        assert_eq!(
            route,
            RouteRequest {
                destination: 4,
                source: 1
            }
        );

        let update: DeviceUpdate =
            serde_json::from_str(r#"{"inputLabels": {"2": "VT"}, "locks": {"0": true}}"#).unwrap();
        assert_eq!(update.input_labels.get(&2).unwrap(), "VT");
        assert!(update.output_labels.is_empty());
        assert!(!update.is_empty());
    }
}
