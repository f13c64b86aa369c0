//! Admission control for signed query requests.

use std::collections::HashSet;

use alloy::primitives::Address;
use tracing::*;

use crate::{
    cfg::Environment,
    chain::ChainId,
    crypto::{query_request_digest, recover_signer},
    error::{AdmissionError, ParseRequestersError},
    message::{QueryRequest, RequestId, SignedQueryRequest},
};

pub type AllowedRequesters = HashSet<Address>;

/// Parses a comma separated list of hex-encoded addresses. The `0x` prefix is optional.
pub fn parse_allowed_requesters(requesters: &str) -> Result<AllowedRequesters, ParseRequestersError> {
    if requesters.trim().is_empty() {
        return Err(ParseRequestersError::Empty);
    }

    requesters
        .split(',')
        .map(str::trim)
        .map(|entry| {
            if entry.is_empty() {
                return Err(ParseRequestersError::EmptyEntry);
            }
            entry
                .parse::<Address>()
                .map_err(|_| ParseRequestersError::InvalidAddress(entry.to_owned()))
        })
        .collect()
}

/// A request which passed admission and is ready to be split into legs.
#[derive(Debug, Clone)]
pub struct AdmittedRequest {
    pub request_id: RequestId,
    pub signer: Address,
    pub signed_request: SignedQueryRequest,
    pub request: QueryRequest,
}

#[derive(Debug, Clone)]
pub struct AdmissionValidator {
    environment: Environment,
    allowed_requesters: AllowedRequesters,
    supported_chains: HashSet<ChainId>,
    routed_chains: HashSet<ChainId>,
}

impl AdmissionValidator {
    pub fn new(
        environment: Environment,
        allowed_requesters: AllowedRequesters,
        supported_chains: impl IntoIterator<Item = ChainId>,
        routed_chains: impl IntoIterator<Item = ChainId>,
    ) -> Self {
        let supported_chains: HashSet<_> = supported_chains.into_iter().collect();
        let routed_chains: HashSet<_> = routed_chains.into_iter().collect();
        for chain in routed_chains.difference(&supported_chains) {
            warn!(chain_id = %chain, "watcher configured for a chain which does not support queries");
        }
        AdmissionValidator {
            environment,
            allowed_requesters,
            supported_chains,
            routed_chains,
        }
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Decides whether a signed request may enter the request table.
    ///
    /// Checks the signer, then decodes the request, then checks every leg can be routed. A single unroutable leg
    /// rejects the whole request.
    pub fn admit(
        &self,
        signed_request: &SignedQueryRequest,
    ) -> Result<AdmittedRequest, AdmissionError> {
        let digest = query_request_digest(self.environment, &signed_request.query_request);
        let signer = recover_signer(&digest, &signed_request.signature)
            .map_err(AdmissionError::Signature)?;
        if !self.allowed_requesters.contains(&signer) {
            return Err(AdmissionError::NotAllowed(signer));
        }

        let request = QueryRequest::unmarshal(&signed_request.query_request)?;

        for pcq in &request.per_chain_queries {
            if !self.supported_chains.contains(&pcq.chain_id) {
                return Err(AdmissionError::UnsupportedChain(pcq.chain_id));
            }
            if !self.routed_chains.contains(&pcq.chain_id) {
                return Err(AdmissionError::NoRoute(pcq.chain_id));
            }
        }

        Ok(AdmittedRequest {
            request_id: signed_request.request_id(),
            signer,
            signed_request: signed_request.clone(),
            request,
        })
    }
}
