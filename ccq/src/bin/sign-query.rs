use std::io;

use alloy::primitives::{Address, Bytes};
use anyhow::Result;
use ccq::{
    cfg::Environment,
    chain::ChainId,
    crypto::SecretKey,
    message::{
        ChainSpecificQuery, EthCallData, EthCallQueryRequest, PerChainQueryRequest, QueryRequest,
        SignedQueryRequest,
    },
};
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use tracing::*;
use tracing_subscriber::EnvFilter;

/// Builds and signs a cross chain query request described by JSON on stdin.
#[derive(Parser, Debug)]
struct Args {
    #[arg(value_parser = SecretKey::from_hex)]
    secret_key: SecretKey,
    #[clap(long, short, default_value = "mainnet")]
    environment: Environment,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Input {
    nonce: u32,
    queries: Vec<InputQuery>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct InputQuery {
    chain_id: ChainId,
    block_id: String,
    calls: Vec<InputCall>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct InputCall {
    to: Address,
    data: Bytes,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();

    let input: Input = serde_json::from_reader(io::stdin())?;

    let request = QueryRequest {
        nonce: input.nonce,
        per_chain_queries: input
            .queries
            .into_iter()
            .map(|q| PerChainQueryRequest {
                chain_id: q.chain_id,
                query: ChainSpecificQuery::EthCall(EthCallQueryRequest {
                    block_id: q.block_id,
                    call_data: q
                        .calls
                        .into_iter()
                        .map(|c| EthCallData {
                            to: c.to,
                            data: c.data,
                        })
                        .collect(),
                }),
            })
            .collect(),
    };

    let signed = SignedQueryRequest::sign(&request, &args.secret_key, args.environment)?;
    let signer = args.secret_key.address();
    debug!(%signer, environment = ?args.environment, "signed query request");

    let output = json!({
        "request": hex::encode(&signed.query_request),
        "signature": hex::encode(&signed.signature),
        "signer": signer,
        "request_id": signed.request_id().to_string(),
    });

    println!("{output}");

    Ok(())
}
