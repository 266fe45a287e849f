//! Error types and result handling for telemetry-relay.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! Errors fall into three groups that the relay treats differently:
//!
//! - store errors ([`Error::StoreUnavailable`], [`Error::RecordNotFound`]),
//!   which make the poll loop back off or are simply logged;
//! - per-record validation errors ([`Error::Validation`]), which skip the
//!   record without retrying;
//! - broker errors ([`Error::BrokerUnavailable`], [`Error::BrokerRejected`],
//!   [`Error::Kafka`]), which are retried within the publisher's budget.
//!
//! # Example
//!
//! ```rust
//! use telemetry_relay::{Error, Result};
//!
//! fn send() -> Result<()> {
//!     Err(Error::BrokerUnavailable {
//!         message: "all brokers down".to_string(),
//!     })
//! }
//!
//! match send() {
//!     Ok(()) => println!("sent"),
//!     Err(e) if e.is_retryable() => eprintln!("will retry: {}", e),
//!     Err(e) => eprintln!("giving up: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for telemetry-relay operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, from a bad file, environment override or value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// PostgreSQL client or protocol error.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Failure to check a connection out of the PostgreSQL pool.
    #[error("Connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// Kafka client or producer error.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// JSON serialization error when encoding envelopes.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The store could not be reached or a query against it failed.
    #[error("Store unavailable: {message}")]
    StoreUnavailable {
        /// Description of the underlying failure
        message: String,
    },

    /// A mark-sent update matched no row.
    #[error("Record not found: {key}")]
    RecordNotFound {
        /// Display form of the record's store key
        key: String,
    },

    /// A record cannot be turned into an envelope.
    #[error("Validation error: {message}")]
    Validation {
        /// Description of what was invalid
        message: String,
    },

    /// The broker could not be reached or timed out.
    #[error("Broker unavailable: {message}")]
    BrokerUnavailable {
        /// Description of the transport failure
        message: String,
    },

    /// The broker answered but refused the write.
    #[error("Broker rejected message: {message}")]
    BrokerRejected {
        /// Description of the rejection
        message: String,
    },
}

impl Error {
    /// Returns `true` for errors the publisher may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::BrokerUnavailable { .. } | Error::BrokerRejected { .. } | Error::Kafka(_)
        )
    }

    pub(crate) fn store_unavailable(err: impl std::fmt::Display) -> Self {
        Error::StoreUnavailable {
            message: err.to_string(),
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

/// A convenient Result type alias for telemetry-relay operations.
///
/// This is equivalent to `std::result::Result<T, telemetry_relay::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
