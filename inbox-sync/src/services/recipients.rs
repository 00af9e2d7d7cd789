//! Recipient computation for replies
//!
//! Addresses are deduplicated by normalized mailbox and the current user's own
//! addresses never appear in `to` or `cc`.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::addresses::{bare_address, is_own_address, normalize_email};
use crate::types::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyMode {
    /// Only the sender of the message being replied to
    Reply,
    /// Sender plus the original `to` and `cc`
    ReplyAll,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipients {
    pub to: Vec<String>,
    pub cc: Vec<String>,
}

impl Recipients {
    pub fn is_empty(&self) -> bool {
        self.to.is_empty() && self.cc.is_empty()
    }
}

/// Collects addresses in first-seen order, skipping duplicates and own addresses
struct RecipientSet<'a> {
    own: &'a [String],
    seen: HashSet<String>,
}

impl<'a> RecipientSet<'a> {
    fn new(own: &'a [String]) -> Self {
        Self {
            own,
            seen: HashSet::new(),
        }
    }

    fn push(&mut self, out: &mut Vec<String>, raw: &str) {
        let addr = bare_address(raw);
        if addr.is_empty() || is_own_address(&addr, self.own) {
            return;
        }
        if self.seen.insert(normalize_email(&addr)) {
            out.push(addr);
        }
    }
}

/// Build the recipient lists for replying to `original`
///
/// When the original sender is the current user (replying to our own outgoing
/// message) a plain reply goes to the original `to` list instead, so the reply
/// still has somewhere to go.
pub fn reply_recipients(original: &Message, mode: ReplyMode, own: &[String]) -> Recipients {
    let mut set = RecipientSet::new(own);
    let mut to = Vec::new();
    let mut cc = Vec::new();

    set.push(&mut to, &original.from);

    match mode {
        ReplyMode::Reply => {
            if to.is_empty() {
                for addr in &original.to {
                    set.push(&mut to, addr);
                }
            }
        }
        ReplyMode::ReplyAll => {
            for addr in &original.to {
                set.push(&mut to, addr);
            }
            for addr in &original.cc {
                set.push(&mut cc, addr);
            }
        }
    }

    Recipients { to, cc }
}

/// Deduplicate explicit recipients for a new message, dropping own addresses
/// and any `cc` entries already present in `to`.
pub fn explicit_recipients(to: &[String], cc: &[String], own: &[String]) -> Recipients {
    let mut set = RecipientSet::new(own);
    let mut out = Recipients::default();
    for addr in to {
        set.push(&mut out.to, addr);
    }
    for addr in cc {
        set.push(&mut out.cc, addr);
    }
    out
}
