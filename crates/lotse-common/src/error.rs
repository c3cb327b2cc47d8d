//! Common error types for the Lotse port manager.

use std::net::IpAddr;
use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`LotseError`].
pub type LotseResult<T> = Result<T, LotseError>;

/// Errors produced by the port manager and its boundary layer.
#[derive(Error, Diagnostic, Debug)]
pub enum LotseError {
    /// A required argument was NULL at the call boundary.
    #[error("Required argument is NULL: {name}")]
    #[diagnostic(code(lotse::null_argument))]
    NullArgument {
        /// Name of the NULL argument.
        name: &'static str,
    },

    /// A string crossing the call boundary was not valid UTF-8.
    #[error("Invalid UTF-8 in {what}")]
    #[diagnostic(code(lotse::invalid_text))]
    InvalidText {
        /// What the string was supposed to be.
        what: &'static str,
    },

    /// Invalid container ID format.
    #[error("Invalid container ID: {id:?}")]
    #[diagnostic(
        code(lotse::invalid_id),
        help("Container IDs must be alphanumeric with hyphens and underscores, 1-64 characters")
    )]
    InvalidId {
        /// The invalid container ID.
        id: String,
    },

    /// Host address could not be parsed.
    #[error("Invalid host address: {value}")]
    #[diagnostic(
        code(lotse::invalid_address),
        help("Use an IPv4 or IPv6 address, e.g. '0.0.0.0' or '::1'")
    )]
    InvalidAddress {
        /// The unparseable address text.
        value: String,
    },

    /// Unrecognized protocol string.
    #[error("Invalid protocol: {value}")]
    #[diagnostic(code(lotse::invalid_protocol), help("Supported protocols are 'tcp' and 'udp'"))]
    InvalidProtocol {
        /// The unrecognized protocol text.
        value: String,
    },

    /// One mapping in a submitted batch is malformed.
    #[error("Invalid port mapping at index {index}: {reason}")]
    #[diagnostic(code(lotse::invalid_mapping))]
    InvalidMapping {
        /// Position of the mapping in the submitted batch.
        index: usize,
        /// Why the mapping was rejected.
        reason: String,
    },

    /// An add was submitted without any mappings.
    #[error("Empty mapping set for container {id}")]
    #[diagnostic(code(lotse::empty_mapping_set))]
    EmptyMappingSet {
        /// The container ID of the rejected add.
        id: String,
    },

    /// A record for the container ID already exists.
    #[error("Container {id} already has port mappings")]
    #[diagnostic(
        code(lotse::duplicate_id),
        help("Remove the existing mappings before adding new ones")
    )]
    DuplicateId {
        /// The conflicting container ID.
        id: String,
    },

    /// A host port tuple is already reserved by another container.
    #[error("Port {address}:{port}/{protocol} is already in use by container {owner}")]
    #[diagnostic(code(lotse::port_in_use))]
    PortInUse {
        /// Host address of the colliding tuple.
        address: IpAddr,
        /// Host port of the colliding tuple.
        port: u16,
        /// Protocol of the colliding tuple.
        protocol: String,
        /// Container currently owning the tuple.
        owner: String,
    },

    /// No record exists for the container ID.
    #[error("No port mappings found for container {id}")]
    #[diagnostic(code(lotse::not_found))]
    NotFound {
        /// The unknown container ID.
        id: String,
    },

    /// The storage path is locked by another port manager.
    #[error("Storage path is locked by another process: {path}")]
    #[diagnostic(
        code(lotse::locked),
        help("Only one port manager may own a storage path at a time")
    )]
    Locked {
        /// The contended storage path.
        path: PathBuf,
    },

    /// Persisted state failed validation on load.
    #[error("Corrupted storage at {path}: {message}")]
    #[diagnostic(code(lotse::corrupted))]
    Corrupted {
        /// Path of the offending storage entry.
        path: PathBuf,
        /// What was wrong with it.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(lotse::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(lotse::serialization))]
    Serialization(String),

    /// The rule installer could not realize a forwarding rule.
    #[error("Failed to install forwarding rule: {message}")]
    #[diagnostic(code(lotse::install))]
    Install {
        /// The installer's failure message.
        message: String,
    },

    /// The record was removed but some rules could not be torn down.
    #[error(
        "Removed mappings for container {id}, but {} rule(s) could not be uninstalled: {}",
        .failures.len(),
        .failures.join("; ")
    )]
    #[diagnostic(
        code(lotse::partial_removal),
        help("The listed rules may still be active and require manual cleanup")
    )]
    PartialRemoval {
        /// The container whose record was removed.
        id: String,
        /// One message per rule that could not be uninstalled.
        failures: Vec<String>,
    },

    /// Logging subsystem initialization failed.
    #[error("Failed to initialize logging: {message}")]
    #[diagnostic(code(lotse::logging))]
    Logging {
        /// Why initialization failed.
        message: String,
    },
}

impl From<serde_json::Error> for LotseError {
    fn from(err: serde_json::Error) -> Self {
        LotseError::Serialization(err.to_string())
    }
}
