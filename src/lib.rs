//! # fidobbs - a multi-line BBS with FidoNet mail
//!
//! fidobbs accepts interactive terminal callers over telnet and serial
//! lines, drives their sessions with a menu scripting engine, moves files
//! with the classic XMODEM/YMODEM/ZMODEM protocols, and exchanges mail and
//! file echoes with FidoNet-technology networks over BinkP.
//!
//! ## Architecture
//!
//! Three loosely coupled runtimes share one process:
//!
//! ```text
//! ┌──────────────────┐   ┌──────────────────┐   ┌───────────────┐
//! │ Session runtime  │   │   FTN mailer     │   │  Desktop UI   │
//! │ (32 line tasks,  │   │ (toss / scan /   │   │  (external;   │
//! │  scripts, xfers) │   │  BinkP sessions) │   │   event feed) │
//! └────────┬─────────┘   └────────┬─────────┘   └───────┬───────┘
//!          │                      │                     │
//!          └──────────┬───────────┴─────────────────────┘
//!                     ▼
//!            ┌──────────────────┐
//!            │   Object store   │  users · messages · files
//!            └──────────────────┘
//! ```
//!
//! Transports and sessions meet only at the **pipe plane**: a pair of
//! bounded byte rings per line with watermark backpressure. Everything a
//! caller sees flows through those rings, which is what makes the file
//! transfer state machines transport-agnostic (telnet IAC transparency
//! happens below them, in the transport).
//!
//! ## Module map
//!
//! - [`pipe`] - the per-line circular-buffer plane
//! - [`transport`] - telnet and serial adapters
//! - [`terminal`] - the 80×25 ANSI terminal model
//! - [`session`] - per-line session state and the script host
//! - [`script`] - the menu scripting language and interpreter
//! - [`transfer`] - XMODEM/YMODEM/ZMODEM state machines
//! - [`storage`] - the filesystem object store
//! - [`ftn`] - packets, tosser, scanner, AreaFix, TIC, BinkP, nodelist
//! - [`bbs`] - the server tying the session runtime together
//! - [`config`] - the typed TOML configuration
//! - [`events`] - the UI boundary (events out, commands in)

pub mod bbs;
pub mod config;
pub mod events;
pub mod ftn;
pub mod logutil;
pub mod pipe;
pub mod script;
pub mod session;
pub mod storage;
pub mod terminal;
pub mod transfer;
pub mod transport;
pub mod validation;
