//! Request/response correlation over the shared transport.
//!
//! The relay does not echo a literal request id on every message type, so
//! responses are claimed structurally: each outstanding call holds a
//! matcher predicate, and every inbound message is offered to outstanding
//! matchers in registration order until one claims it. Matchers must carry
//! a discriminator narrow enough to avoid cross-matching concurrent calls
//! (a session id, typically). The one id-based rule: `error` envelopes
//! echo the offending request's wire id and terminate that call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use clearway_core::{ClearwayError, ClearwayResult, Method, RequestFrame, RpcMessage};

use crate::transport::{ListenerId, Transport};

/// Predicate claiming an inbound message for one outstanding call.
pub type Matcher = Box<dyn Fn(&RpcMessage) -> bool + Send + Sync>;

/// Matches any non-error message with the given method.
pub fn method_matcher(method: Method) -> Matcher {
    Box::new(move |message| message.method == method)
}

/// Matches a message with the given method carrying the expected
/// `app_session_id`, the discriminator that keeps concurrent lifecycle
/// calls on different sessions from cross-matching.
pub fn session_matcher(method: Method, app_session_id: impl Into<String>) -> Matcher {
    let expected = app_session_id.into();
    Box::new(move |message| {
        message.method == method
            && message
                .params
                .get("app_session_id")
                .and_then(|v| v.as_str())
                == Some(expected.as_str())
    })
}

struct PendingRequest {
    token: u64,
    request_id: u64,
    matcher: Matcher,
    resolver: oneshot::Sender<ClearwayResult<RpcMessage>>,
}

/// Correlates outbound requests with inbound responses.
pub struct Correlator {
    transport: Transport,
    pending: Arc<Mutex<Vec<PendingRequest>>>,
    next_token: AtomicU64,
    next_request_id: AtomicU64,
    listener: ListenerId,
}

impl Correlator {
    pub fn new(transport: Transport) -> Self {
        let pending: Arc<Mutex<Vec<PendingRequest>>> = Arc::new(Mutex::new(Vec::new()));
        let listener = transport.add_message_listener({
            let pending = Arc::clone(&pending);
            move |message| dispatch(&pending, message)
        });
        Self {
            transport,
            pending,
            next_token: AtomicU64::new(1),
            next_request_id: AtomicU64::new(1),
            listener,
        }
    }

    /// Allocate a wire request id. Monotonic per client.
    pub fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Outstanding call count, for diagnostics and tests.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Send `frame` and wait for the first inbound message `matcher`
    /// claims, or fail with [`ClearwayError::Timeout`] after `timeout`.
    /// The matcher is deregistered on every exit path.
    pub async fn correlate(
        &self,
        frame: RequestFrame,
        matcher: Matcher,
        timeout: Duration,
    ) -> ClearwayResult<RpcMessage> {
        let text = frame.to_text()?;
        let request_id = frame.request_id();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (resolver, waiter) = oneshot::channel();

        // Register before sending so a fast response cannot slip past.
        self.pending.lock().push(PendingRequest {
            token,
            request_id,
            matcher,
            resolver,
        });
        self.transport.send(text);

        match tokio::time::timeout(timeout, waiter).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClearwayError::Protocol(
                "pending request dropped without resolution".to_string(),
            )),
            Err(_) => {
                self.deregister(token);
                tracing::debug!(request_id, "correlated call timed out");
                Err(ClearwayError::Timeout(timeout))
            }
        }
    }

    fn deregister(&self, token: u64) {
        self.pending.lock().retain(|p| p.token != token);
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        self.transport.remove_message_listener(self.listener);
    }
}

fn dispatch(pending: &Arc<Mutex<Vec<PendingRequest>>>, message: &RpcMessage) {
    // Offer the message to matchers in registration order until a claim
    // sticks. A claimant whose waiter already went away (timeout racing
    // the response) must not consume the message; the next candidate in
    // line gets it instead.
    loop {
        let claimed = {
            let mut pending = pending.lock();
            let index = pending.iter().position(|p| {
                (p.matcher)(message)
                    || (message.is_error() && message.request_id == p.request_id)
            });
            index.map(|i| pending.remove(i))
        };
        let Some(entry) = claimed else {
            return;
        };

        let result = if message.is_error() && !(entry.matcher)(message) {
            Err(ClearwayError::Relay(
                message
                    .error_message()
                    .unwrap_or_else(|| "unspecified relay error".to_string()),
            ))
        } else {
            Ok(message.clone())
        };

        if entry.resolver.send(result).is_ok() {
            return;
        }
        tracing::debug!(
            request_id = message.request_id,
            "skipped stale pending request"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{reply, wait_for_state, MockRelay};
    use crate::transport::ConnectionState;
    use clearway_core::SessionReply;

    async fn connected(relay: &MockRelay) -> Correlator {
        let transport = Transport::new(relay.url());
        transport.connect();
        wait_for_state(&transport, ConnectionState::Connected).await;
        Correlator::new(transport)
    }

    #[tokio::test]
    async fn resolves_on_structural_match_not_id_echo() {
        let relay = MockRelay::spawn(|message| {
            // Deliberately wrong id: structural matching must still claim it.
            vec![reply(
                message.request_id + 1000,
                Method::GetAppSessions,
                serde_json::json!({"app_sessions": []}),
            )]
        })
        .await;
        let correlator = connected(&relay).await;

        let frame = RequestFrame::new(
            correlator.next_request_id(),
            Method::GetAppSessions,
            serde_json::json!({"participant": "0xa"}),
        );
        let message = correlator
            .correlate(
                frame,
                method_matcher(Method::GetAppSessions),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert_eq!(message.method, Method::GetAppSessions);
        assert_eq!(correlator.pending_len(), 0);
    }

    #[tokio::test]
    async fn timeout_rejects_and_deregisters() {
        let relay = MockRelay::spawn(|_| Vec::new()).await;
        let correlator = connected(&relay).await;

        let frame = RequestFrame::new(
            correlator.next_request_id(),
            Method::GetAppSessions,
            serde_json::json!({}),
        );
        let err = correlator
            .correlate(
                frame,
                method_matcher(Method::GetAppSessions),
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClearwayError::Timeout(_)));
        assert_eq!(correlator.pending_len(), 0);
    }

    #[tokio::test]
    async fn concurrent_calls_resolve_by_their_own_matchers() {
        // One request triggers both replies, create-for-S2 first; each
        // pending call must still receive the message its matcher accepts.
        let relay = MockRelay::spawn(|message| {
            if message.method == Method::SubmitAppState {
                vec![
                    reply(
                        9001,
                        Method::CreateAppSession,
                        serde_json::json!({"app_session_id": "0xs2"}),
                    ),
                    reply(
                        9002,
                        Method::SubmitAppState,
                        serde_json::json!({"app_session_id": "0xs1"}),
                    ),
                ]
            } else {
                Vec::new()
            }
        })
        .await;
        let correlator = connected(&relay).await;

        let create_wait = correlator.correlate(
            RequestFrame::new(
                correlator.next_request_id(),
                Method::GetAppSessions,
                serde_json::json!({}),
            ),
            method_matcher(Method::CreateAppSession),
            Duration::from_secs(2),
        );
        let submit = correlator.correlate(
            RequestFrame::new(
                correlator.next_request_id(),
                Method::SubmitAppState,
                serde_json::json!({"app_session_id": "0xs1", "session_data": "{}"}),
            ),
            session_matcher(Method::SubmitAppState, "0xs1"),
            Duration::from_secs(2),
        );

        let (create_msg, submit_msg) = tokio::join!(create_wait, submit);
        let create_reply: SessionReply = create_msg.unwrap().params_as().unwrap();
        let submit_reply: SessionReply = submit_msg.unwrap().params_as().unwrap();
        assert_eq!(create_reply.app_session_id, "0xs2");
        assert_eq!(submit_reply.app_session_id, "0xs1");
    }

    #[tokio::test]
    async fn first_registered_matcher_wins() {
        // Single delayed reply; both calls' matchers accept it. The call
        // registered first must win, the second times out.
        let relay = MockRelay::spawn_with_delay(Duration::from_millis(150), |message| {
            if message.method == Method::GetAppSessions {
                vec![reply(
                    1,
                    Method::GetAppSessions,
                    serde_json::json!({"app_sessions": []}),
                )]
            } else {
                Vec::new()
            }
        })
        .await;
        let correlator = connected(&relay).await;

        let first = correlator.correlate(
            RequestFrame::new(
                correlator.next_request_id(),
                Method::GetAppSessions,
                serde_json::json!({}),
            ),
            method_matcher(Method::GetAppSessions),
            Duration::from_secs(2),
        );
        let second = correlator.correlate(
            RequestFrame::new(
                correlator.next_request_id(),
                Method::SubmitAppState,
                serde_json::json!({"app_session_id": "0xnone"}),
            ),
            method_matcher(Method::GetAppSessions),
            Duration::from_millis(500),
        );

        // join! polls in order, so `first` registers before `second`.
        let (first, second) = tokio::join!(first, second);
        assert!(first.is_ok());
        assert!(matches!(second.unwrap_err(), ClearwayError::Timeout(_)));
    }

    #[tokio::test]
    async fn error_envelope_terminates_matching_request() {
        let relay = MockRelay::spawn(|message| {
            if message.method == Method::CreateAppSession {
                vec![reply(
                    message.request_id,
                    Method::Error,
                    serde_json::json!({"error": "quota exceeded"}),
                )]
            } else {
                Vec::new()
            }
        })
        .await;
        let correlator = connected(&relay).await;

        let frame = RequestFrame::new(
            correlator.next_request_id(),
            Method::CreateAppSession,
            serde_json::json!({}),
        );
        let err = correlator
            .correlate(
                frame,
                method_matcher(Method::CreateAppSession),
                Duration::from_secs(2),
            )
            .await
            .unwrap_err();
        match err {
            ClearwayError::Relay(message) => assert_eq!(message, "quota exceeded"),
            other => panic!("expected relay error, got {:?}", other),
        }
        assert_eq!(correlator.pending_len(), 0);
    }

    #[tokio::test]
    async fn unrelated_error_does_not_terminate() {
        let relay = MockRelay::spawn(|message| {
            if message.method == Method::CreateAppSession {
                // Error for some other request's id.
                vec![reply(
                    message.request_id + 500,
                    Method::Error,
                    serde_json::json!({"error": "not yours"}),
                )]
            } else {
                Vec::new()
            }
        })
        .await;
        let correlator = connected(&relay).await;

        let frame = RequestFrame::new(
            correlator.next_request_id(),
            Method::CreateAppSession,
            serde_json::json!({}),
        );
        let err = correlator
            .correlate(
                frame,
                method_matcher(Method::CreateAppSession),
                Duration::from_millis(200),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClearwayError::Timeout(_)));
    }
}
