use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bcc_core::{Block, Chain, ChainError, Ledger, Transaction};
use futures::future::join_all;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

/// Version tag prepended to every peer payload. Peers on a different wire
/// version reject the payload instead of misreading it.
pub const WIRE_VERSION: u16 = 1;

const PEER_TIMEOUT: Duration = Duration::from_secs(5);

pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(&(WIRE_VERSION, value))?)
}

pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (version, value): (u16, T) = bincode::deserialize(bytes)?;
    if version != WIRE_VERSION {
        return Err(anyhow!(
            "wire version mismatch: got {version}, want {WIRE_VERSION}"
        ));
    }
    Ok(value)
}

/// Network coordinates of one ring member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddr {
    pub ip: String,
    pub port: String,
}

impl PeerAddr {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.ip, self.port)
    }

    /// Every ring member, the local node included; broadcasts go to all of
    /// them so the sender commits through the same path as everyone else.
    pub fn ring_of(ledger: &Ledger) -> Vec<PeerAddr> {
        ledger
            .accounts()
            .map(|a| PeerAddr {
                ip: a.ip.clone(),
                port: a.port.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub public_key: String,
    pub ip: String,
    pub port: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterReply {
    pub message: String,
    #[serde(default)]
    pub id: Option<u64>,
}

/// The fan-out seam between the node and its peers. Broadcasts are
/// best-effort: an unreachable peer is logged and skipped, the rest still
/// get the payload. Targeted sends surface their errors.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn broadcast_transaction(&self, ring: &[PeerAddr], tx: &Transaction);
    async fn broadcast_block(&self, ring: &[PeerAddr], block: &Block);
    async fn share_ring(&self, peer: &PeerAddr, ring: &Ledger) -> Result<()>;
    async fn share_chain(&self, peer: &PeerAddr, chain: &Chain) -> Result<()>;
}

/// HTTP transport: bincode envelopes POSTed to each peer with a bounded
/// per-peer timeout, concurrently across the ring.
pub struct HttpPeers {
    client: Client,
}

impl HttpPeers {
    pub fn new() -> Result<Self> {
        let client = Client::builder().timeout(PEER_TIMEOUT).build()?;
        Ok(Self { client })
    }

    async fn post(&self, url: String, body: Vec<u8>) -> Result<()> {
        let response = self
            .client
            .post(&url)
            .body(body)
            .send()
            .await
            .map_err(|e| ChainError::PeerUnreachable(format!("{url}: {e}")))?;
        debug!(%url, status = %response.status(), "peer post");
        Ok(())
    }

    async fn fan_out(&self, ring: &[PeerAddr], path: &str, body: Vec<u8>) {
        let posts = ring.iter().map(|peer| {
            let url = format!("{}{}", peer.base_url(), path);
            self.post(url, body.clone())
        });
        for result in join_all(posts).await {
            if let Err(e) = result {
                warn!("broadcast: {e}");
            }
        }
    }

    /// Asks the bootstrap node for a ring id. Unlike broadcasts this must
    /// succeed; a node that cannot register cannot join.
    pub async fn register_with_bootstrap(
        &self,
        bootstrap: &PeerAddr,
        request: &RegisterRequest,
    ) -> Result<u64> {
        let url = format!("{}/register_node", bootstrap.base_url());
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| anyhow!("bootstrap unreachable: {e}"))?;
        let status = response.status();
        let reply: RegisterReply = response.json().await?;
        if !status.is_success() {
            return Err(anyhow!("registration refused: {}", reply.message));
        }
        reply
            .id
            .ok_or_else(|| anyhow!("registration reply carried no id"))
    }
}

#[async_trait]
impl PeerTransport for HttpPeers {
    async fn broadcast_transaction(&self, ring: &[PeerAddr], tx: &Transaction) {
        match encode_payload(tx) {
            Ok(body) => self.fan_out(ring, "/validate_transaction", body).await,
            Err(e) => warn!("transaction encode failed: {e}"),
        }
    }

    async fn broadcast_block(&self, ring: &[PeerAddr], block: &Block) {
        match encode_payload(block) {
            Ok(body) => self.fan_out(ring, "/get_block", body).await,
            Err(e) => warn!("block encode failed: {e}"),
        }
    }

    async fn share_ring(&self, peer: &PeerAddr, ring: &Ledger) -> Result<()> {
        let body = encode_payload(ring)?;
        self.post(format!("{}/get_ring", peer.base_url()), body).await
    }

    async fn share_chain(&self, peer: &PeerAddr, chain: &Chain) -> Result<()> {
        let body = encode_payload(chain)?;
        self.post(format!("{}/get_chain", peer.base_url()), body).await
    }
}
