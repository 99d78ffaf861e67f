// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Flow-classification configuration engine for a packet-steering
//! NIC.
//!
//! Two halves live here. The classifier half compiles a protocol
//! description (segments + matched fields) into a hardware
//! field-extraction sequence, and manages the profiles, entries, and
//! RSS configurations built on those sequences. The rule half admits
//! pattern/action flow rules, compiles them into hardware match
//! structures, and deduplicates the action resources they reference.
//!
//! Neither half talks to hardware directly; both go through the
//! collaborator traits in [`engine::device`].

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

pub mod api;
pub mod engine;

pub use api::Direction;
