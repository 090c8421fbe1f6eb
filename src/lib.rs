#![allow(warnings)]
#![cfg_attr(feature = "nightly", feature(backtrace))]

pub(crate) mod deps {
    pub use crossbeam_channel;
    pub use derive_more;
    pub use lazy_static;
    pub use libc;
    pub use log;
    pub use nix;
    pub use parking_lot;
    pub use serde;
    pub use serde_json;
    pub use serde_yaml;
    pub use structopt;
    pub use thiserror;
}

mod fmt;
mod io;

pub mod addr;
pub mod config;
pub mod error;
pub mod heatmap;
pub mod metrics;
pub mod mover;
pub mod node;
pub mod osaccess;
pub mod paths;
pub mod pidwatcher;
pub mod policy;
pub mod prompt;
pub mod stats;
pub mod tracker;
