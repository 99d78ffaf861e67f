// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! API types shared between the steer engine and its consumers.

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

pub mod rule;

pub use rule::*;

/// The overall version of the API. Anytime an API type is added,
/// removed, or modified, this number should increment.
pub const API_VERSION: u64 = 3;

/// The highest software VSI handle the engine tracks membership for.
pub const MAX_VSI: u16 = 768;

/// The direction of a flow relative to the device.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Direction {
    Rx = 1,
    Tx = 2,
}

impl core::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rx" => Ok(Direction::Rx),
            "tx" => Ok(Direction::Tx),
            _ => Err(format!("invalid direction: {}", s)),
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let dirstr = match self {
            Direction::Rx => "RX",
            Direction::Tx => "TX",
        };

        write!(f, "{}", dirstr)
    }
}

/// The kind of failure a flow-configuration operation ran into.
///
/// `TryAgain` is the only caller-retryable kind; it is reserved for the
/// counter-container resize race.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ErrorKind {
    InvalidArgument,
    Conflict,
    ResourceExhausted,
    NotFound,
    Unsupported,
    DeviceFailure,
    OutOfMemory,
    TryAgain,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use ErrorKind::*;

        let s = match self {
            InvalidArgument => "invalid argument",
            Conflict => "conflict",
            ResourceExhausted => "resource exhausted",
            NotFound => "not found",
            Unsupported => "unsupported",
            DeviceFailure => "device failure",
            OutOfMemory => "out of memory",
            TryAgain => "try again",
        };

        write!(f, "{}", s)
    }
}

/// An error from the profile/RSS half of the engine.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize, thiserror::Error)]
#[error("{kind}: {reason}")]
pub struct FlowError {
    pub kind: ErrorKind,
    pub reason: String,
}

impl FlowError {
    pub fn new(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self { kind, reason: reason.into() }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, reason)
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, reason)
    }

    pub fn exhausted(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceExhausted, reason)
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, reason)
    }

    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, reason)
    }

    pub fn device(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::DeviceFailure, reason)
    }
}

/// The rule element an admission failure points at.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ErrorCause {
    Attributes,
    /// Index into the rule's item list.
    Item(usize),
    /// Index into the rule's action list.
    Action(usize),
    Unspecified,
}

impl Display for ErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorCause::Attributes => write!(f, "attributes"),
            ErrorCause::Item(n) => write!(f, "item {}", n),
            ErrorCause::Action(n) => write!(f, "action {}", n),
            ErrorCause::Unspecified => write!(f, "rule"),
        }
    }
}

/// An error from the rule half of the engine, carrying the offending
/// element so an upper layer can report "invalid at element N".
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize, thiserror::Error)]
#[error("{kind} at {cause}: {reason}")]
pub struct RuleError {
    pub kind: ErrorKind,
    pub cause: ErrorCause,
    pub reason: String,
}

impl RuleError {
    pub fn new(
        kind: ErrorKind,
        cause: ErrorCause,
        reason: impl Into<String>,
    ) -> Self {
        Self { kind, cause, reason: reason.into() }
    }

    pub fn attr(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self::new(kind, ErrorCause::Attributes, reason)
    }

    pub fn item(idx: usize, kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self::new(kind, ErrorCause::Item(idx), reason)
    }

    pub fn action(
        idx: usize,
        kind: ErrorKind,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(kind, ErrorCause::Action(idx), reason)
    }
}

impl From<FlowError> for RuleError {
    fn from(e: FlowError) -> Self {
        RuleError::new(e.kind, ErrorCause::Unspecified, e.reason)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn direction_round_trip() {
        assert_eq!("rx".parse::<Direction>().unwrap(), Direction::Rx);
        assert_eq!("TX".parse::<Direction>().unwrap(), Direction::Tx);
        assert!("up".parse::<Direction>().is_err());
        assert_eq!(Direction::Rx.to_string(), "RX");
    }

    #[test]
    fn rule_error_display() {
        let e = RuleError::action(2, ErrorKind::Conflict, "two fate actions");
        assert_eq!(e.to_string(), "conflict at action 2: two fate actions");
    }
}
