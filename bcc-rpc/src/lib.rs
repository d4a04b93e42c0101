use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use bcc_config::BlockchatConfig;
use bcc_core::{Block, Chain, ChainError, Ledger, Transaction, RESERVED_ADDRESS};
use bcc_crypto::generate_rsa;
use bcc_network::{decode_payload, encode_payload, HttpPeers, PeerAddr, RegisterRequest};
use bcc_node::Node;
use bcc_wallet::TxStatus;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// The HTTP layer is a plain handler set bound to an explicit node context;
/// nothing here is process-global.
#[derive(Clone)]
pub struct RpcState {
    pub node: Arc<Node>,
    pub is_bootstrap: bool,
}

pub struct NodeOptions {
    pub port: u16,
    pub total_nodes: u64,
    pub capacity: usize,
    pub bootstrap: bool,
    pub config: BlockchatConfig,
}

pub fn init_logging() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Brings up one node: generates its wallet keys, seeds or registers, and
/// serves the peer and client endpoints until the process ends.
pub async fn run_node(opts: NodeOptions) -> Result<()> {
    let keys = generate_rsa()?;
    let peers = Arc::new(HttpPeers::new()?);
    let node = Arc::new(Node::new(
        keys,
        opts.capacity,
        opts.total_nodes,
        peers.clone(),
    ));

    let (bind_ip, bind_port) = if opts.bootstrap {
        (
            opts.config.bootstrap_ip.clone(),
            opts.config.bootstrap_port.parse::<u16>()?,
        )
    } else {
        (opts.config.advertised_ip(), opts.port)
    };

    if opts.bootstrap {
        node.bootstrap_genesis(&bind_ip, &opts.config.bootstrap_port)?;
    } else {
        let node = node.clone();
        let config = opts.config.clone();
        let advertised = bind_ip.clone();
        let port = opts.port.to_string();
        tokio::spawn(async move {
            // Give the local server a moment to bind before the bootstrap
            // starts talking back to us.
            tokio::time::sleep(Duration::from_secs(2)).await;
            let bootstrap = PeerAddr {
                ip: config.bootstrap_ip.clone(),
                port: config.bootstrap_port.clone(),
            };
            let request = RegisterRequest {
                public_key: node.public_key().to_string(),
                ip: advertised,
                port,
            };
            match peers.register_with_bootstrap(&bootstrap, &request).await {
                Ok(id) => {
                    node.set_id(id);
                    info!(id, "registered with bootstrap");
                }
                Err(e) => {
                    error!("registration failed: {e}");
                    std::process::exit(1);
                }
            }
        });
    }

    let state = RpcState {
        node,
        is_bootstrap: opts.bootstrap,
    };
    let addr: SocketAddr = format!("{bind_ip}:{bind_port}").parse()?;
    info!(%addr, "node listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

pub fn router(state: RpcState) -> Router {
    Router::new()
        .route("/validate_transaction", post(validate_transaction))
        .route("/get_block", post(get_block))
        .route("/register_node", post(register_node))
        .route("/get_ring", post(get_ring))
        .route("/get_chain", post(get_chain))
        .route("/send_chain", get(send_chain))
        .route("/api/create_transaction", post(create_transaction))
        .route("/api/get_balance", get(get_balance))
        .route("/api/get_stake", get(get_stake))
        .route("/api/view_block", get(view_block))
        .route("/api/get_my_transactions", get(get_my_transactions))
        .route("/api/get_id", get(get_id))
        .route("/api/get_metrics", get(get_metrics))
        .with_state(state)
}

type Reply = (StatusCode, Json<Value>);

fn ok() -> Reply {
    (StatusCode::OK, Json(json!({ "message": "OK" })))
}

fn bad_request(message: String) -> Reply {
    (StatusCode::BAD_REQUEST, Json(json!({ "message": message })))
}

async fn validate_transaction(State(state): State<RpcState>, body: Bytes) -> Reply {
    let tx: Transaction = match decode_payload(&body) {
        Ok(tx) => tx,
        Err(e) => return bad_request(format!("undecodable transaction: {e}")),
    };
    match state.node.handle_transaction(tx).await {
        Ok(()) => ok(),
        Err(e) => bad_request(format!("The transaction is invalid: {e}")),
    }
}

async fn get_block(State(state): State<RpcState>, body: Bytes) -> Reply {
    let block: Block = match decode_payload(&body) {
        Ok(block) => block,
        Err(e) => return bad_request(format!("undecodable block: {e}")),
    };
    match state.node.handle_block(block).await {
        // A buffered block is success-shaped: it will commit once its
        // predecessor arrives.
        Ok(_) => ok(),
        Err(e) => bad_request(format!("Block rejected: {e}")),
    }
}

async fn register_node(
    State(state): State<RpcState>,
    Json(request): Json<RegisterRequest>,
) -> Reply {
    if !state.is_bootstrap {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "message": "Node is not the bootstrap" })),
        );
    }
    let id = match state
        .node
        .register_peer(request.public_key, request.ip, request.port)
    {
        Ok(id) => id,
        Err(e @ ChainError::SystemFull(_)) => {
            return (StatusCode::UNAUTHORIZED, Json(json!({ "message": e.to_string() })))
        }
        Err(e) => return bad_request(e.to_string()),
    };
    if id == state.node.total_nodes() - 1 {
        let node = state.node.clone();
        tokio::spawn(async move {
            if let Err(e) = node.finish_bootstrap().await {
                error!("bootstrap fan-out failed: {e}");
                std::process::exit(1);
            }
        });
    }
    (StatusCode::OK, Json(json!({ "message": "OK", "id": id })))
}

async fn get_ring(State(state): State<RpcState>, body: Bytes) -> Reply {
    let ring: Ledger = match decode_payload(&body) {
        Ok(ring) => ring,
        Err(e) => return bad_request(format!("undecodable ring: {e}")),
    };
    state.node.install_ring(ring);
    ok()
}

async fn get_chain(State(state): State<RpcState>, body: Bytes) -> Reply {
    let chain: Chain = match decode_payload(&body) {
        Ok(chain) => chain,
        Err(e) => return bad_request(format!("undecodable chain: {e}")),
    };
    match state.node.install_chain(chain) {
        Ok(()) => ok(),
        Err(e) => bad_request(format!("Chain rejected: {e}")),
    }
}

async fn send_chain(State(state): State<RpcState>) -> Result<Vec<u8>, Reply> {
    encode_payload(&state.node.chain_snapshot())
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "message": e.to_string() }))))
}

#[derive(Debug, Deserialize)]
struct CreateTxRequest {
    receiver: Option<u64>,
    amount: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    stake: bool,
}

fn wallet_summary(node: &Node, message: &str) -> Value {
    json!({
        "message": message,
        "balance": node.soft_balance(),
        "stake": node.soft_stake(),
    })
}

async fn create_transaction(
    State(state): State<RpcState>,
    Json(request): Json<CreateTxRequest>,
) -> Reply {
    let node = &state.node;
    let outcome = if request.stake {
        node.create_stake(request.amount).await
    } else {
        if request.amount == 0 && request.message.is_empty() {
            return bad_request("Transaction failed. Nothing to send.".into());
        }
        let receiver_key = request.receiver.and_then(|id| node.key_of_id(id));
        match receiver_key {
            Some(key) if key != node.public_key() => {
                node.create_transaction(&key, request.amount, &request.message).await
            }
            _ => {
                return bad_request("Transaction failed. Wrong receiver id.".into());
            }
        }
    };
    match outcome {
        Ok(_) => (
            StatusCode::OK,
            Json(wallet_summary(node, "The transaction was created successfully.")),
        ),
        Err(ChainError::InsufficientBalance { .. }) => (
            StatusCode::BAD_REQUEST,
            Json(wallet_summary(node, "Not enough BCCs.")),
        ),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(wallet_summary(node, &e.to_string())),
        ),
    }
}

async fn get_balance(State(state): State<RpcState>) -> Json<Value> {
    Json(json!({ "balance": state.node.soft_balance() }))
}

async fn get_stake(State(state): State<RpcState>) -> Json<Value> {
    Json(json!({ "stake": state.node.soft_stake() }))
}

/// Renders one transaction the way the clients print it: ids instead of PEM
/// keys, stake updates called out.
fn render_tx(tx: &Transaction, ring: &Ledger) -> Value {
    let receiver: Value = if tx.receiver_address == RESERVED_ADDRESS {
        json!("--")
    } else {
        json!(ring.id_of_key(&tx.receiver_address))
    };
    let message = if tx.receiver_address == RESERVED_ADDRESS {
        "stake update"
    } else {
        tx.message.as_str()
    };
    json!({
        "sender": ring.id_of_key(&tx.sender_address),
        "receiver": receiver,
        "amount": tx.amount,
        "message": message,
    })
}

async fn view_block(State(state): State<RpcState>) -> Reply {
    let Some(block) = state.node.last_block() else {
        return bad_request("No blocks yet.".into());
    };
    let ring = state.node.ring_snapshot();
    let validator = ring.id_of_key(&block.validator);
    let transactions: Vec<Value> = block
        .transactions
        .iter()
        .map(|tx| {
            let mut rendered = render_tx(tx, &ring);
            rendered["validator"] = json!(validator);
            rendered
        })
        .collect();
    (
        StatusCode::OK,
        Json(json!({ "index": block.index, "transactions": transactions })),
    )
}

async fn get_my_transactions(State(state): State<RpcState>) -> Json<Value> {
    let ring = state.node.ring_snapshot();
    let records: Vec<Value> = state
        .node
        .wallet_records()
        .iter()
        .map(|record| {
            let mut rendered = render_tx(&record.transaction, &ring);
            rendered["validator"] = match &record.validator {
                Some(key) => json!(ring.id_of_key(key)),
                None => json!("None"),
            };
            rendered["status"] = match record.status {
                TxStatus::Confirmed => json!("Confirmed"),
                TxStatus::Unconfirmed => json!("Unconfirmed"),
            };
            rendered
        })
        .collect();
    Json(json!({ "transactions": records }))
}

async fn get_id(State(state): State<RpcState>) -> Json<Value> {
    Json(json!({ "id": state.node.id() }))
}

async fn get_metrics(State(state): State<RpcState>) -> Json<Value> {
    Json(json!({
        "num_blocks": state.node.chain_len(),
        "capacity": state.node.capacity(),
    }))
}
