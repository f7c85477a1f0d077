//! In-process relay speaking the wire protocol over a real localhost
//! WebSocket, for exercising the client end to end.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use clearway_core::{Method, ResponseFrame, RpcMessage};

use crate::transport::{ConnectionState, Transport};

type Script = Arc<dyn Fn(&RpcMessage) -> Vec<String> + Send + Sync>;

/// A scripted relay: for every parsed inbound frame the script returns the
/// raw text frames to send back, in order.
pub(crate) struct MockRelay {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<String>>>,
    task: tokio::task::JoinHandle<()>,
}

impl MockRelay {
    pub(crate) async fn spawn(
        script: impl Fn(&RpcMessage) -> Vec<String> + Send + Sync + 'static,
    ) -> Self {
        Self::spawn_with_delay(Duration::ZERO, script).await
    }

    /// Like `spawn`, but sleeps `delay` before writing each reply. Lets a
    /// test get a second pending request registered before the first
    /// response lands.
    pub(crate) async fn spawn_with_delay(
        delay: Duration,
        script: impl Fn(&RpcMessage) -> Vec<String> + Send + Sync + 'static,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock relay");
        let addr = listener.local_addr().expect("local addr");
        let connections = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));
        let script: Script = Arc::new(script);

        let task = tokio::spawn({
            let connections = Arc::clone(&connections);
            let received = Arc::clone(&received);
            async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    connections.fetch_add(1, Ordering::SeqCst);
                    let script = Arc::clone(&script);
                    let received = Arc::clone(&received);
                    tokio::spawn(async move {
                        let Ok(ws) = accept_async(stream).await else {
                            return;
                        };
                        let (mut sink, mut stream) = ws.split();
                        while let Some(Ok(frame)) = stream.next().await {
                            let Message::Text(text) = frame else {
                                continue;
                            };
                            received.lock().unwrap().push(text.to_string());
                            let Ok(message) = RpcMessage::parse(text.as_str()) else {
                                continue;
                            };
                            for out in script(&message) {
                                if !delay.is_zero() {
                                    tokio::time::sleep(delay).await;
                                }
                                if sink.send(Message::Text(out.into())).await.is_err() {
                                    return;
                                }
                            }
                        }
                    });
                }
            }
        });

        Self {
            addr,
            connections,
            received,
            task,
        }
    }

    pub(crate) fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub(crate) fn received_texts(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    /// Count of received frames carrying the given method.
    pub(crate) fn requests_of(&self, method: Method) -> usize {
        self.received_texts()
            .iter()
            .filter_map(|text| RpcMessage::parse(text).ok())
            .filter(|message| message.method == method)
            .count()
    }

    pub(crate) async fn wait_for_received(&self, count: usize) {
        for _ in 0..200 {
            if self.received.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "relay received {} frames, expected {}",
            self.received.lock().unwrap().len(),
            count
        );
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A relay response frame as raw text.
pub(crate) fn reply(request_id: u64, method: Method, params: serde_json::Value) -> String {
    ResponseFrame::new(request_id, method, params)
        .to_text()
        .expect("serialize mock reply")
}

/// The standard scripted relay: full auth handshake plus session
/// lifecycle, assigning session id `0xs1` and echoing ids elsewhere.
pub(crate) fn lifecycle_script(message: &RpcMessage) -> Vec<String> {
    let id = message.request_id;
    match message.method {
        Method::AuthRequest => vec![reply(
            id,
            Method::AuthChallenge,
            serde_json::json!({"challenge_message": "challenge-nonce-1"}),
        )],
        Method::AuthVerify => vec![reply(
            id,
            Method::AuthVerify,
            serde_json::json!({"success": true, "bearer_token": "token-1"}),
        )],
        Method::CreateAppSession => vec![reply(
            id,
            Method::CreateAppSession,
            serde_json::json!({"app_session_id": "0xs1", "status": "active"}),
        )],
        Method::SubmitAppState | Method::CloseAppSession => {
            let session = message
                .params
                .get("app_session_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            vec![reply(
                id,
                message.method,
                serde_json::json!({"app_session_id": session}),
            )]
        }
        Method::GetAppSessions => vec![reply(
            id,
            Method::GetAppSessions,
            serde_json::json!({"app_sessions": [{
                "app_session_id": "0xs1",
                "participants": ["0xa", "0xb"],
                "status": "active",
            }]}),
        )],
        Method::GetLedgerBalances => vec![reply(
            id,
            Method::GetLedgerBalances,
            serde_json::json!({"ledger_balances": [
                {"asset": "usdc", "amount": "125"},
                {"asset": "points", "amount": "3"},
            ]}),
        )],
        _ => Vec::new(),
    }
}

/// Poll until the transport reaches `status` or give up loudly.
pub(crate) async fn wait_for_state(transport: &Transport, status: ConnectionState) {
    for _ in 0..200 {
        if transport.state() == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("transport never reached {:?}", status);
}

static TEMP_DIR_SEQ: AtomicU64 = AtomicU64::new(0);

/// A unique scratch directory for keystore tests.
pub(crate) fn temp_dir(label: &str) -> std::path::PathBuf {
    let seq = TEMP_DIR_SEQ.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir().join(format!(
        "clearway-{}-{}-{}",
        label,
        std::process::id(),
        seq
    ))
}
