//! A Rust client for the AFLOW materials database (AFLUX API).
//!
//! This crate builds typed filters over AFLOW properties, compiles them into
//! AFLUX matchbooks, pages through the results lazily and hands back typed
//! records.
//!
//! ## Quick start
//! - Configure the endpoint via environment variables (`AFLOW_URL`, `AFLOW_PAGE_SIZE`, ...)
//!   or a `.aflowrc` file (current directory or home directory). Defaults target
//!   the public AFLUX endpoint.
//! - Build a filter with the functions in [`filter`] and pull records from
//!   [`Client::query`].
//!
//! ```no_run
//! use anyhow::Result;
//! use aflow::Client;
//! use aflow::filter::{in_set, range};
//!
//! fn main() -> Result<()> {
//!     let client = Client::from_env()?;
//!     let records = client
//!         .query()
//!         .filter(range("density", 2.0, 5.0)? & in_set("species", ["Fe", "Ni"])?)
//!         .select(["compound", "density", "species"])?
//!         .fetch()?;
//!
//!     for record in records {
//!         let record = record?;
//!         println!("{:?} {:?}", record.string("compound"), record.number("density"));
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Missing fields come back as [`Field::Absent`] and values that do not parse
//! as their property's kind as [`Field::Unparseable`]; neither stops the stream.

#![forbid(unsafe_code)]

pub mod catalog;
mod client;
pub mod compiler;
mod config;
mod entry;
mod error;
pub mod executor;
pub mod filter;
mod http;
pub mod materialize;
pub mod registry;
pub mod transport;

pub use catalog::MemoryCatalog;
pub use client::{Client, Query, Records};
pub use compiler::{CompiledRequest, Cursor, Direction, PageRequest, QueryRequest, compile, compile_raw};
pub use config::{ClientConfig, DEFAULT_URL};
pub use entry::KeywordHelp;
pub use error::{AflowError, Result, TransportError};
pub use executor::{CancelToken, ExecutionStats, RetryPolicy};
pub use filter::{FilterNode, Literal, Operator};
pub use http::{HttpConnection, HttpTransport};
pub use materialize::{Field, MaterializeWarning, Record, Value, materialize};
pub use registry::{PropertyDescriptor, ValueKind, keyword, properties, resolve};
pub use transport::{Connection, RawPage, RawRecord, Transport};
