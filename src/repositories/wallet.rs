use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::connect_async;
use tungstenite::protocol::Message;
use uuid::Uuid;

use crate::chain::{Address, HexBytes, TxHash};

type PendingRequests = Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>;

/// JSON-RPC client over a WebSocket. Responses are routed back to callers
/// through a uuid-keyed pending map; the wallet bridge does not push
/// notifications we care about, so frames without an id are dropped.
pub struct JsonRpcClient {
    sender: mpsc::UnboundedSender<Message>,
    pending_requests: PendingRequests,
}

impl JsonRpcClient {
    pub async fn connect(url: &str) -> Result<Self, anyhow::Error> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let pending_requests: PendingRequests = Arc::new(Mutex::new(HashMap::new()));

        // Forwards outgoing requests to the bridge
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    log::error!("Error sending message to wallet bridge: {}", e);
                    break;
                }
            }
        });

        // Reads responses and routes them by request id
        let pending_read_requests = pending_requests.clone();
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let msg = match frame {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::error!("Error reading from wallet bridge: {}", e);
                        continue;
                    }
                };

                let text = match msg {
                    Message::Text(text) => text,
                    _ => continue, // ignore non-text frames
                };

                let value: Value = match serde_json::from_str(&text) {
                    Ok(value) => value,
                    Err(e) => {
                        log::error!("Bad JSON from wallet bridge: {} in {}", e, text);
                        continue;
                    }
                };

                if let Some(id) = value.get("id").and_then(Value::as_str) {
                    let mut pending = pending_read_requests.lock().await;
                    if let Some(sender) = pending.remove(id) {
                        if sender.send(value.clone()).is_err() {
                            log::warn!("Receiver for wallet request {} dropped", id);
                        }
                    }
                }
            }
        });

        Ok(Self {
            sender: tx,
            pending_requests,
        })
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value, anyhow::Error> {
        let id = Uuid::new_v4().to_string();
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let (resp_tx, resp_rx) = oneshot::channel();
        self.pending_requests
            .lock()
            .await
            .insert(id.clone(), resp_tx);

        if let Err(e) = self.sender.send(Message::Text(request.to_string().into())) {
            self.pending_requests.lock().await.remove(&id);
            bail!("wallet bridge connection closed: {e}");
        }

        let response = resp_rx.await?;
        if let Some(error) = response.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("wallet rejected the request");
            bail!("{method}: {message}");
        }

        response
            .get("result")
            .cloned()
            .ok_or_else(|| anyhow!("{method}: response carried no result"))
    }
}

fn parse_quantity(raw: &str) -> Result<u64, anyhow::Error> {
    let stripped = raw.strip_prefix("0x").unwrap_or(raw);
    u64::from_str_radix(stripped, 16).map_err(|e| anyhow!("bad hex quantity {raw}: {e}"))
}

/// The connected wallet, reached over JSON-RPC. Signing and broadcasting
/// happen on the far side; this end only submits call requests and polls
/// receipts.
pub struct WalletBridge {
    rpc: JsonRpcClient,
}

pub struct TxRequest {
    pub from: Address,
    pub to: Address,
    pub data: HexBytes,
}

impl WalletBridge {
    pub async fn connect(url: &str) -> Result<Self, anyhow::Error> {
        let rpc = JsonRpcClient::connect(url).await?;
        Ok(Self { rpc })
    }

    pub async fn chain_id(&self) -> Result<u64, anyhow::Error> {
        let result = self.rpc.call("eth_chainId", json!([])).await?;
        let raw = result
            .as_str()
            .ok_or_else(|| anyhow!("eth_chainId: non-string result"))?;
        parse_quantity(raw)
    }

    pub async fn switch_chain(&self, chain_id: u64) -> Result<(), anyhow::Error> {
        self.rpc
            .call(
                "wallet_switchEthereumChain",
                json!([{ "chainId": format!("0x{chain_id:x}") }]),
            )
            .await?;
        Ok(())
    }

    pub async fn send_transaction(&self, tx: &TxRequest) -> Result<TxHash, anyhow::Error> {
        let result = self
            .rpc
            .call(
                "eth_sendTransaction",
                json!([{
                    "from": tx.from.to_string(),
                    "to": tx.to.to_string(),
                    "data": tx.data.to_string(),
                }]),
            )
            .await?;

        let raw = result
            .as_str()
            .ok_or_else(|| anyhow!("eth_sendTransaction: non-string result"))?;
        raw.parse()
            .map_err(|e| anyhow!("eth_sendTransaction: bad hash {raw}: {e}"))
    }

    /// One receipt poll. `None` means the transaction is still pending;
    /// `Some(true)` confirmed, `Some(false)` reverted.
    pub async fn transaction_receipt(&self, tx: TxHash) -> Result<Option<bool>, anyhow::Error> {
        let result = self
            .rpc
            .call("eth_getTransactionReceipt", json!([tx.to_string()]))
            .await?;

        if result.is_null() {
            return Ok(None);
        }

        let status = result
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("eth_getTransactionReceipt: receipt missing status"))?;
        Ok(Some(parse_quantity(status)? == 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantities_parse_with_and_without_prefix() {
        assert_eq!(parse_quantity("0x2105").unwrap(), 8453);
        assert_eq!(parse_quantity("0x1").unwrap(), 1);
        assert_eq!(parse_quantity("1").unwrap(), 1);
        assert!(parse_quantity("0xzz").is_err());
    }
}
