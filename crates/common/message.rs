//! Queue record types.
//!
//! Run-queue and per-promise-queue records are persisted as serde JSON with
//! stable field names; the `type` tag values must not change across versions
//! or old databases become unreadable.

use crate::capdata::CapData;
use crate::refs::{KRef, VatId};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// A method call in flight: method name, marshalled arguments, and the
/// promise that receives the outcome (absent for one-way sends).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub method: String,
    pub args: CapData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<KRef>,
}

impl Message {
    pub fn new(method: &str, args: CapData, result: Option<KRef>) -> Message {
        Message {
            method: method.to_string(),
            args,
            result,
        }
    }
}

/// The five GC deliveries a vat can receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum GcActionKind {
    #[serde(rename = "dropExports")]
    DropExports,
    #[serde(rename = "retireExports")]
    RetireExports,
    #[serde(rename = "dropImports")]
    DropImports,
    #[serde(rename = "retireImports")]
    RetireImports,
    #[serde(rename = "abandonExports")]
    AbandonExports,
}

impl Display for GcActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            GcActionKind::DropExports => "dropExports",
            GcActionKind::RetireExports => "retireExports",
            GcActionKind::DropImports => "dropImports",
            GcActionKind::RetireImports => "retireImports",
            GcActionKind::AbandonExports => "abandonExports",
        };
        f.write_str(text)
    }
}

/// One unit of kernel work. The run queue and each per-promise queue hold a
/// FIFO sequence of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RunQueueItem {
    #[serde(rename = "send")]
    Send { target: KRef, message: Message },
    #[serde(rename = "notify")]
    Notify { vat: VatId, kp: KRef },
    #[serde(rename = "gc-action")]
    GcAction {
        vat: VatId,
        kind: GcActionKind,
        krefs: Vec<KRef>,
    },
    #[serde(rename = "bringOutYourDead")]
    BringOutYourDead { vat: VatId },
}

impl RunQueueItem {
    /// Every kref the item mentions, used to pin entries against retirement
    /// while they sit in a queue.
    pub fn mentioned_krefs(&self) -> Vec<KRef> {
        match self {
            RunQueueItem::Send { target, message } => {
                let mut krefs = vec![*target];
                krefs.extend(message.args.slots.iter().copied());
                if let Some(result) = message.result {
                    krefs.push(result);
                }
                krefs
            }
            RunQueueItem::Notify { kp, .. } => vec![*kp],
            RunQueueItem::GcAction { krefs, .. } => krefs.clone(),
            RunQueueItem::BringOutYourDead { .. } => Vec::new(),
        }
    }
}
