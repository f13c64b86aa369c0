use alloy::primitives::Address;

use crate::chain::ChainId;

/// A failure to decode or validate a query message.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of input while reading {0}")]
    Truncated(&'static str),
    #[error("unsupported message version: {0}")]
    UnsupportedVersion(u8),
    #[error("unsupported query type: {0}")]
    UnsupportedQueryType(u8),
    #[error("{0} excess bytes after {1}")]
    ExcessBytes(usize, &'static str),
    #[error("request does not contain any per chain queries")]
    NoPerChainQueries,
    #[error("too many {0}: {1}")]
    TooMany(&'static str, usize),
    #[error("{0} is too long: {1} bytes")]
    TooLong(&'static str, usize),
    #[error("invalid block id: {0:?}")]
    InvalidBlockId(String),
    #[error("eth call query does not contain any call data")]
    NoCallData,
    #[error("signature must be 65 bytes, got {0}")]
    InvalidSignatureLength(usize),
    #[error("per chain response does not match request: {0}")]
    ResponseMismatch(String),
}

/// Why a signed query request was turned away before entering the request table.
#[derive(thiserror::Error, Debug)]
pub enum AdmissionError {
    #[error("failed to recover signer: {0}")]
    Signature(#[source] anyhow::Error),
    #[error("signer {0} is not an allowed requester")]
    NotAllowed(Address),
    #[error("malformed query request: {0}")]
    Malformed(#[from] CodecError),
    #[error("chain {0} does not support queries")]
    UnsupportedChain(ChainId),
    #[error("no watcher is configured for chain {0}")]
    NoRoute(ChainId),
}

impl AdmissionError {
    /// A short, stable label for logs and metric attributes.
    pub fn kind(&self) -> &'static str {
        match self {
            AdmissionError::Signature(_) => "bad-signature",
            AdmissionError::NotAllowed(_) => "not-allowed",
            AdmissionError::Malformed(_) => "malformed",
            AdmissionError::UnsupportedChain(_) => "unsupported-chain",
            AdmissionError::NoRoute(_) => "no-route",
        }
    }
}

/// A failure to parse the allowed requesters list.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseRequestersError {
    #[error("allowed requesters list is empty")]
    Empty,
    #[error("allowed requesters list contains an empty entry")]
    EmptyEntry,
    #[error("invalid requester address {0:?}")]
    InvalidAddress(String),
}
