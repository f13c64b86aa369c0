//! Query messages and their wire format.
//!
//! All integers are big-endian. Counts of per-chain entries and call data items are a single byte, so a request holds
//! at most 255 of each. Variable-length fields are prefixed with a `u32` length.

use std::fmt::{self, Debug, Formatter};

use alloy::primitives::{Address, B256, Bytes};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{
    cfg::Environment,
    chain::ChainId,
    crypto::{Hash, SIGNATURE_LEN, SecretKey},
    error::CodecError,
};

/// The only message version we produce and accept.
pub const MSG_VERSION: u8 = 1;

const ADDRESS_LEN: usize = 20;

/// A serialized [QueryRequest] and a signature over its domain-separated digest.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedQueryRequest {
    pub query_request: Bytes,
    pub signature: Bytes,
}

impl SignedQueryRequest {
    /// Serializes and signs `request` for `environment`.
    pub fn sign(
        request: &QueryRequest,
        key: &SecretKey,
        environment: Environment,
    ) -> anyhow::Result<SignedQueryRequest> {
        let query_request = request.marshal()?;
        let signature = key.sign_query_request(environment, &query_request)?;
        Ok(SignedQueryRequest {
            query_request: query_request.into(),
            signature: Bytes::copy_from_slice(&signature),
        })
    }

    /// Identifies this request for the rest of its life in the node.
    pub fn request_id(&self) -> RequestId {
        RequestId(Hash::compute([&self.signature]))
    }
}

impl Debug for SignedQueryRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedQueryRequest")
            .field("request_id", &self.request_id())
            .field("len", &self.query_request.len())
            .finish()
    }
}

/// Derived from the signature of a [SignedQueryRequest].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Hash);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Debug for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub nonce: u32,
    pub per_chain_queries: Vec<PerChainQueryRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerChainQueryRequest {
    pub chain_id: ChainId,
    pub query: ChainSpecificQuery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueryType {
    EthCall = 1,
}

impl TryFrom<u8> for QueryType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(QueryType::EthCall),
            other => Err(CodecError::UnsupportedQueryType(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainSpecificQuery {
    EthCall(EthCallQueryRequest),
}

impl ChainSpecificQuery {
    pub fn query_type(&self) -> QueryType {
        match self {
            ChainSpecificQuery::EthCall(_) => QueryType::EthCall,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EthCallQueryRequest {
    /// A block number or hash, as a `0x`-prefixed hex string.
    pub block_id: String,
    pub call_data: Vec<EthCallData>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EthCallData {
    pub to: Address,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerChainQueryResponse {
    pub chain_id: ChainId,
    pub response: ChainSpecificResponse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainSpecificResponse {
    EthCall(EthCallQueryResponse),
}

impl ChainSpecificResponse {
    pub fn query_type(&self) -> QueryType {
        match self {
            ChainSpecificResponse::EthCall(_) => QueryType::EthCall,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EthCallQueryResponse {
    pub block_number: u64,
    pub hash: B256,
    /// Block timestamp in microseconds since the unix epoch.
    pub time_us: u64,
    /// One result per call, in call order.
    pub results: Vec<Bytes>,
}

/// The aggregated answer to a query: the original request, echoed verbatim, followed by one response per leg in
/// request order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponsePublication {
    pub request: SignedQueryRequest,
    pub per_chain_responses: Vec<PerChainQueryResponse>,
}

fn take<'a>(buf: &mut &'a [u8], len: usize, what: &'static str) -> Result<&'a [u8], CodecError> {
    if buf.remaining() < len {
        return Err(CodecError::Truncated(what));
    }
    let slice: &'a [u8] = *buf;
    let (head, tail) = slice.split_at(len);
    *buf = tail;
    Ok(head)
}

fn get_u8(buf: &mut &[u8], what: &'static str) -> Result<u8, CodecError> {
    if buf.remaining() < 1 {
        return Err(CodecError::Truncated(what));
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut &[u8], what: &'static str) -> Result<u16, CodecError> {
    if buf.remaining() < 2 {
        return Err(CodecError::Truncated(what));
    }
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut &[u8], what: &'static str) -> Result<u32, CodecError> {
    if buf.remaining() < 4 {
        return Err(CodecError::Truncated(what));
    }
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut &[u8], what: &'static str) -> Result<u64, CodecError> {
    if buf.remaining() < 8 {
        return Err(CodecError::Truncated(what));
    }
    Ok(buf.get_u64())
}

fn get_sized<'a>(buf: &mut &'a [u8], what: &'static str) -> Result<&'a [u8], CodecError> {
    let len = get_u32(buf, what)? as usize;
    take(buf, len, what)
}

fn put_sized(out: &mut BytesMut, bytes: &[u8], what: &'static str) -> Result<(), CodecError> {
    let len = u32::try_from(bytes.len()).map_err(|_| CodecError::TooLong(what, bytes.len()))?;
    out.put_u32(len);
    out.put_slice(bytes);
    Ok(())
}

fn count_u8(len: usize, what: &'static str) -> Result<u8, CodecError> {
    u8::try_from(len).map_err(|_| CodecError::TooMany(what, len))
}

fn ensure_consumed(buf: &[u8], what: &'static str) -> Result<(), CodecError> {
    if buf.has_remaining() {
        return Err(CodecError::ExcessBytes(buf.remaining(), what));
    }
    Ok(())
}

impl QueryRequest {
    pub fn marshal(&self) -> Result<Vec<u8>, CodecError> {
        self.validate()?;
        let mut out = BytesMut::new();
        out.put_u8(MSG_VERSION);
        out.put_u32(self.nonce);
        out.put_u8(count_u8(self.per_chain_queries.len(), "per chain queries")?);
        for pcq in &self.per_chain_queries {
            pcq.marshal_into(&mut out)?;
        }
        Ok(out.to_vec())
    }

    pub fn unmarshal(data: &[u8]) -> Result<QueryRequest, CodecError> {
        let mut buf = data;
        let version = get_u8(&mut buf, "version")?;
        if version != MSG_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let nonce = get_u32(&mut buf, "nonce")?;
        let count = get_u8(&mut buf, "number of per chain queries")?;
        let per_chain_queries = (0..count)
            .map(|_| PerChainQueryRequest::unmarshal_from(&mut buf))
            .collect::<Result<Vec<_>, _>>()?;
        ensure_consumed(buf, "query request")?;

        let request = QueryRequest {
            nonce,
            per_chain_queries,
        };
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<(), CodecError> {
        if self.per_chain_queries.is_empty() {
            return Err(CodecError::NoPerChainQueries);
        }
        count_u8(self.per_chain_queries.len(), "per chain queries")?;
        self.per_chain_queries
            .iter()
            .try_for_each(PerChainQueryRequest::validate)
    }
}

impl PerChainQueryRequest {
    fn marshal_into(&self, out: &mut BytesMut) -> Result<(), CodecError> {
        out.put_u16(self.chain_id.0);
        out.put_u8(self.query.query_type() as u8);
        let query = match &self.query {
            ChainSpecificQuery::EthCall(q) => q.marshal()?,
        };
        put_sized(out, &query, "per chain query")
    }

    fn unmarshal_from(buf: &mut &[u8]) -> Result<PerChainQueryRequest, CodecError> {
        let chain_id = ChainId(get_u16(buf, "chain id")?);
        let query_type = QueryType::try_from(get_u8(buf, "query type")?)?;
        let mut query = get_sized(buf, "per chain query")?;
        let query = match query_type {
            QueryType::EthCall => {
                ChainSpecificQuery::EthCall(EthCallQueryRequest::unmarshal_from(&mut query)?)
            }
        };
        Ok(PerChainQueryRequest { chain_id, query })
    }

    pub fn validate(&self) -> Result<(), CodecError> {
        match &self.query {
            ChainSpecificQuery::EthCall(q) => q.validate(),
        }
    }
}

impl EthCallQueryRequest {
    fn marshal(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = BytesMut::new();
        put_sized(&mut out, self.block_id.as_bytes(), "block id")?;
        out.put_u8(count_u8(self.call_data.len(), "call data")?);
        for call in &self.call_data {
            out.put_slice(call.to.as_slice());
            put_sized(&mut out, &call.data, "call data")?;
        }
        Ok(out.to_vec())
    }

    fn unmarshal_from(buf: &mut &[u8]) -> Result<EthCallQueryRequest, CodecError> {
        let block_id = get_sized(buf, "block id")?;
        let block_id = String::from_utf8(block_id.to_vec())
            .map_err(|e| CodecError::InvalidBlockId(String::from_utf8_lossy(e.as_bytes()).into()))?;
        let count = get_u8(buf, "number of call data")?;
        let call_data = (0..count)
            .map(|_| {
                let to = Address::from_slice(take(buf, ADDRESS_LEN, "call to")?);
                let data = Bytes::copy_from_slice(get_sized(buf, "call data")?);
                Ok(EthCallData { to, data })
            })
            .collect::<Result<Vec<_>, CodecError>>()?;
        ensure_consumed(buf, "eth call query")?;
        Ok(EthCallQueryRequest {
            block_id,
            call_data,
        })
    }

    pub fn validate(&self) -> Result<(), CodecError> {
        let hex_digits = self
            .block_id
            .strip_prefix("0x")
            .ok_or_else(|| CodecError::InvalidBlockId(self.block_id.clone()))?;
        if hex_digits.is_empty() || !hex_digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CodecError::InvalidBlockId(self.block_id.clone()));
        }
        if self.call_data.is_empty() {
            return Err(CodecError::NoCallData);
        }
        count_u8(self.call_data.len(), "call data")?;
        Ok(())
    }
}

impl EthCallQueryResponse {
    fn marshal(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = BytesMut::new();
        out.put_u64(self.block_number);
        out.put_slice(self.hash.as_slice());
        out.put_u64(self.time_us);
        out.put_u8(count_u8(self.results.len(), "results")?);
        for result in &self.results {
            put_sized(&mut out, result, "result")?;
        }
        Ok(out.to_vec())
    }

    fn unmarshal_from(buf: &mut &[u8]) -> Result<EthCallQueryResponse, CodecError> {
        let block_number = get_u64(buf, "block number")?;
        let hash = B256::from_slice(take(buf, 32, "block hash")?);
        let time_us = get_u64(buf, "block time")?;
        let count = get_u8(buf, "number of results")?;
        let results = (0..count)
            .map(|_| Ok(Bytes::copy_from_slice(get_sized(buf, "result")?)))
            .collect::<Result<Vec<_>, CodecError>>()?;
        ensure_consumed(buf, "eth call response")?;
        Ok(EthCallQueryResponse {
            block_number,
            hash,
            time_us,
            results,
        })
    }
}

impl PerChainQueryResponse {
    fn marshal_into(&self, out: &mut BytesMut) -> Result<(), CodecError> {
        out.put_u16(self.chain_id.0);
        out.put_u8(self.response.query_type() as u8);
        let response = match &self.response {
            ChainSpecificResponse::EthCall(r) => r.marshal()?,
        };
        put_sized(out, &response, "per chain response")
    }

    fn unmarshal_from(buf: &mut &[u8]) -> Result<PerChainQueryResponse, CodecError> {
        let chain_id = ChainId(get_u16(buf, "chain id")?);
        let query_type = QueryType::try_from(get_u8(buf, "query type")?)?;
        let mut response = get_sized(buf, "per chain response")?;
        let response = match query_type {
            QueryType::EthCall => {
                ChainSpecificResponse::EthCall(EthCallQueryResponse::unmarshal_from(&mut response)?)
            }
        };
        Ok(PerChainQueryResponse { chain_id, response })
    }
}

impl QueryResponsePublication {
    pub fn marshal(&self) -> Result<Vec<u8>, CodecError> {
        if self.request.signature.len() != SIGNATURE_LEN {
            return Err(CodecError::InvalidSignatureLength(
                self.request.signature.len(),
            ));
        }
        let mut out = BytesMut::new();
        out.put_u8(MSG_VERSION);
        out.put_slice(&self.request.signature);
        put_sized(&mut out, &self.request.query_request, "query request")?;
        out.put_u8(count_u8(
            self.per_chain_responses.len(),
            "per chain responses",
        )?);
        for response in &self.per_chain_responses {
            response.marshal_into(&mut out)?;
        }
        Ok(out.to_vec())
    }

    pub fn unmarshal(data: &[u8]) -> Result<QueryResponsePublication, CodecError> {
        let mut buf = data;
        let version = get_u8(&mut buf, "version")?;
        if version != MSG_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let signature = Bytes::copy_from_slice(take(&mut buf, SIGNATURE_LEN, "signature")?);
        let query_request = Bytes::copy_from_slice(get_sized(&mut buf, "query request")?);
        let count = get_u8(&mut buf, "number of per chain responses")?;
        let per_chain_responses = (0..count)
            .map(|_| PerChainQueryResponse::unmarshal_from(&mut buf))
            .collect::<Result<Vec<_>, _>>()?;
        ensure_consumed(buf, "query response")?;
        Ok(QueryResponsePublication {
            request: SignedQueryRequest {
                query_request,
                signature,
            },
            per_chain_responses,
        })
    }

    /// Checks that this publication answers `request` leg for leg.
    pub fn matches(&self, request: &QueryRequest) -> Result<(), CodecError> {
        if self.per_chain_responses.len() != request.per_chain_queries.len() {
            return Err(CodecError::ResponseMismatch(format!(
                "{} responses for {} queries",
                self.per_chain_responses.len(),
                request.per_chain_queries.len()
            )));
        }
        for (idx, (response, query)) in self
            .per_chain_responses
            .iter()
            .zip(&request.per_chain_queries)
            .enumerate()
        {
            if response.chain_id != query.chain_id {
                return Err(CodecError::ResponseMismatch(format!(
                    "leg {idx} answered by chain {} but asked of chain {}",
                    response.chain_id, query.chain_id
                )));
            }
            if response.response.query_type() != query.query.query_type() {
                return Err(CodecError::ResponseMismatch(format!(
                    "leg {idx} has the wrong query type"
                )));
            }
        }
        Ok(())
    }
}
