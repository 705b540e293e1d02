#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! The core driver plane of a MongoDB wire-protocol client: topology monitoring (SDAM), server
//! selection, connection pooling, and wire-protocol command execution. CRUD surface, BSON
//! marshalling internals, concrete authentication mechanism cryptography, and command-level retry
//! policy are intentionally out of scope; see each module's doc comment for the boundary.

pub use ::bson;

pub mod auth;
mod bson_util;
pub mod cmap;
pub mod compression;
pub mod error;
pub mod event;
mod hello;
pub mod operation;
pub mod options;
pub mod sdam;
pub mod selection_criteria;
pub mod session;
pub mod srv;

pub use crate::{
    error::{Error, Result},
    operation::{execute_operation, CommandResponse, RunCommand},
    options::{ClientOptions, ServerAddress},
    sdam::Topology,
    session::ClientSession,
};

/// A boxed future, used where a trait object is needed instead of `impl Future`.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
