//! End-to-end scenarios over loopback UDP: two (or three) endpoints
//! exchanging real packets.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use super::{Builder, Endpoint};
use crate::auth::DigestVerifier;
use crate::dialog::{CallState, DialogSetup};
use crate::dialplan::{Dialplan, Handler, IncomingCall};
use crate::error::{Error, Result};
use crate::headers::{Expires, Header, Headers, WWWAuthenticate};
use crate::message::auth::{Challenge, Credential};
use crate::message::{SipMethod, StatusCode, TransportKind, Uri};
use crate::transport::IncomingRequest;

async fn udp_endpoint(builder: Builder) -> (Endpoint, SocketAddr) {
    let endpoint = builder.build();
    let addr = endpoint
        .listen(TransportKind::Udp, "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    let pump = endpoint.clone();
    tokio::spawn(async move {
        let _ = pump.run().await;
    });

    (endpoint, addr)
}

fn setup_towards(server: SocketAddr) -> DialogSetup {
    DialogSetup::new(
        "sip:alice@127.0.0.1",
        &format!("sip:bob@{}", server),
    )
    .unwrap()
}

/// Serves SUBSCRIBE: accepts with 200, then sends NOTIFYs "1", "2", "3"
/// and answers any refresh.
struct NotifyThrice;

#[async_trait::async_trait]
impl Handler for NotifyThrice {
    async fn call(&self, call: IncomingCall) -> Result<()> {
        let expires = call.request().request.headers.expires().unwrap_or(1800);
        let headers = Headers::from([Header::Expires(Expires::new(expires))]);

        let dialog = call.prepare(StatusCode::Ok, Some(headers)).await?;

        for payload in ["1", "2", "3"] {
            let response = dialog
                .notify(Some(Bytes::from(payload.to_string())), None)
                .await?;
            assert_eq!(response.code(), StatusCode::Ok);
        }

        // Serve refreshes until the subscription is taken down.
        while let Some(request) = dialog.recv().await {
            let expires = request.request.headers.expires().unwrap_or(0);
            let headers = Headers::from([Header::Expires(Expires::new(expires))]);
            dialog
                .reply(&request, StatusCode::Ok, Some(headers), None)
                .await?;
            if expires == 0 {
                break;
            }
        }

        Ok(())
    }
}

struct RouteAll<H: Handler + Clone>(H);

#[async_trait::async_trait]
impl<H: Handler + Clone> Dialplan for RouteAll<H> {
    async fn resolve(
        &self,
        _method: SipMethod,
        _request: &IncomingRequest,
    ) -> Option<Arc<dyn Handler>> {
        Some(Arc::new(self.0.clone()))
    }
}

impl Clone for NotifyThrice {
    fn clone(&self) -> Self {
        NotifyThrice
    }
}

#[tokio::test]
async fn test_subscribe_and_notify() {
    let (_server, server_addr) =
        udp_endpoint(Builder::new().with_dialplan(RouteAll(NotifyThrice))).await;
    let (client, _) = udp_endpoint(Builder::new()).await;

    let peer = client
        .connect(TransportKind::Udp, server_addr, None)
        .await
        .unwrap();

    let (dialog, response) = peer
        .subscribe(setup_towards(server_addr), 1800)
        .await
        .unwrap();
    assert_eq!(response.code(), StatusCode::Ok);
    assert_eq!(response.headers.expires(), Some(1800));

    // The three NOTIFYs arrive in order; each gets a 200.
    for expected in ["1", "2", "3"] {
        let notify = tokio::time::timeout(Duration::from_secs(5), dialog.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(notify.method(), SipMethod::Notify);
        assert_eq!(notify.request.body.as_deref(), Some(expected.as_bytes()));

        dialog
            .reply(&notify, StatusCode::Ok, None, None)
            .await
            .unwrap();
    }

    dialog.close().await.unwrap();
}

/// Challenges the first request, validates the second.
#[derive(Clone)]
struct ChallengeOnce {
    verifier: Arc<Mutex<DigestVerifier>>,
    requests_seen: Arc<AtomicU32>,
}

impl ChallengeOnce {
    fn new(realm: &str) -> Self {
        Self {
            verifier: Arc::new(Mutex::new(DigestVerifier::new(realm))),
            requests_seen: Arc::new(AtomicU32::new(0)),
        }
    }
}

#[async_trait::async_trait]
impl Handler for ChallengeOnce {
    async fn call(&self, call: IncomingCall) -> Result<()> {
        self.requests_seen.fetch_add(1, Ordering::SeqCst);

        let credential = call.request().request.headers.find_map(|h| match h {
            Header::Authorization(auth) => Some(&auth.0),
            _ => None,
        });

        let valid = match credential {
            Some(Credential::Digest(digest)) => self.verifier.lock().unwrap().verify(
                digest,
                call.method().as_str(),
                "p",
                call.request().request.body.as_deref(),
            ),
            _ => false,
        };

        if valid {
            call.reply(StatusCode::Ok, None, None).await
        } else {
            let challenge = self.verifier.lock().unwrap().challenge().clone();
            let headers = Headers::from([Header::WWWAuthenticate(WWWAuthenticate(
                Challenge::Digest(challenge),
            ))]);
            call.reply(StatusCode::Unauthorized, Some(headers), None).await
        }
    }
}

#[tokio::test]
async fn test_digest_challenge_loop() {
    let handler = ChallengeOnce::new("x");
    let requests_seen = handler.requests_seen.clone();

    let (_server, server_addr) =
        udp_endpoint(Builder::new().with_dialplan(RouteAll(handler))).await;
    let (client, _) = udp_endpoint(Builder::new()).await;

    let peer = client
        .connect(TransportKind::Udp, server_addr, None)
        .await
        .unwrap();

    let (dialog, response) = peer
        .subscribe(setup_towards(server_addr).password("p"), 1800)
        .await
        .unwrap();

    assert_eq!(response.code(), StatusCode::Ok);
    // Exactly two requests reached the server: the challenged one and
    // the credentialed retry.
    assert_eq!(requests_seen.load(Ordering::SeqCst), 2);

    dialog.close().await.unwrap();
}

#[tokio::test]
async fn test_digest_wrong_password_exhausts_budget() {
    let handler = ChallengeOnce::new("x");
    let requests_seen = handler.requests_seen.clone();

    let (_server, server_addr) =
        udp_endpoint(Builder::new().with_dialplan(RouteAll(handler))).await;
    let (client, _) = udp_endpoint(Builder::new()).await;

    let peer = client
        .connect(TransportKind::Udp, server_addr, None)
        .await
        .unwrap();

    // Wrong password: the server keeps challenging until the retry
    // budget runs out.
    let result = peer
        .subscribe(setup_towards(server_addr).password("wrong"), 1800)
        .await;

    assert_matches!(result, Err(Error::AuthenticationFailed(_)));
    // The original request plus the full retry budget.
    assert_eq!(
        requests_seen.load(Ordering::SeqCst),
        1 + crate::auth::DEFAULT_AUTH_RETRIES
    );
}

/// Answers an INVITE with 180 then 200, then serves the BYE.
#[derive(Clone)]
struct AnswerCall;

#[async_trait::async_trait]
impl Handler for AnswerCall {
    async fn call(&self, call: IncomingCall) -> Result<()> {
        let dialog = call.prepare(StatusCode::Ringing, None).await?;
        dialog
            .reply(call.request(), StatusCode::Ok, None, None)
            .await?;

        if let Some(request) = dialog.recv().await {
            assert_eq!(request.method(), SipMethod::Bye);
            dialog.reply(&request, StatusCode::Ok, None, None).await?;
        }

        Ok(())
    }
}

#[tokio::test]
async fn test_invite_happy_path() {
    let (_server, server_addr) =
        udp_endpoint(Builder::new().with_dialplan(RouteAll(AnswerCall))).await;
    let (client, _) = udp_endpoint(Builder::new()).await;

    let peer = client
        .connect(TransportKind::Udp, server_addr, None)
        .await
        .unwrap();

    let dialog = peer.invite(setup_towards(server_addr)).await.unwrap();

    let response = tokio::time::timeout(Duration::from_secs(5), dialog.ready())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.code(), StatusCode::Ok);
    assert_eq!(dialog.call_state(), CallState::Terminated);

    let bye_response = dialog.bye().await.unwrap();
    assert_eq!(bye_response.code(), StatusCode::Ok);
}

/// Rings forever; the caller is expected to CANCEL.
#[derive(Clone)]
struct RingForever;

#[async_trait::async_trait]
impl Handler for RingForever {
    async fn call(&self, call: IncomingCall) -> Result<()> {
        let dialog = call.prepare(StatusCode::Ringing, None).await?;
        // Wait for whatever ends the call; the 487 goes out through the
        // INVITE transaction when the CANCEL lands.
        let _ = dialog.recv().await;
        Ok(())
    }
}

#[tokio::test]
async fn test_cancel_during_proceeding() {
    let (_server, server_addr) =
        udp_endpoint(Builder::new().with_dialplan(RouteAll(RingForever))).await;
    let (client, _) = udp_endpoint(Builder::new()).await;

    let peer = client
        .connect(TransportKind::Udp, server_addr, None)
        .await
        .unwrap();

    let dialog = peer.invite(setup_towards(server_addr)).await.unwrap();

    // Wait until the 180 moved the call to Proceeding.
    tokio::time::timeout(Duration::from_secs(5), async {
        while dialog.call_state() != CallState::Proceeding {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let cancel_response = dialog.cancel().await.unwrap();
    assert_eq!(cancel_response.code(), StatusCode::Ok);

    // The INVITE completes with 487 Request Terminated, which the
    // transaction ACKs.
    let final_response = tokio::time::timeout(Duration::from_secs(5), dialog.ready())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(final_response.code(), StatusCode::RequestTerminated);
    assert_eq!(dialog.call_state(), CallState::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_request_times_out_against_black_hole() {
    let (client, _) = udp_endpoint(Builder::new()).await;

    // Nothing listens there; timer F fires after 64 * T1.
    let black_hole: SocketAddr = "127.0.0.1:9".parse().unwrap();
    let peer = client
        .connect(TransportKind::Udp, black_hole, None)
        .await
        .unwrap();

    let result = peer
        .request(SipMethod::Register, setup_towards(black_hole))
        .await;

    assert_matches!(result, Err(Error::Timeout));
}

/// Captures the request it serves, then accepts with 200.
#[derive(Clone)]
struct CaptureSubscribe {
    seen: Arc<Mutex<Option<IncomingRequest>>>,
}

#[async_trait::async_trait]
impl Handler for CaptureSubscribe {
    async fn call(&self, call: IncomingCall) -> Result<()> {
        *self.seen.lock().unwrap() = Some(call.request().clone());
        call.reply(StatusCode::Ok, None, None).await
    }
}

/// Forwards everything to a fixed downstream target.
#[derive(Clone)]
struct ForwardTo {
    target: Uri,
}

#[async_trait::async_trait]
impl Handler for ForwardTo {
    async fn call(&self, call: IncomingCall) -> Result<()> {
        call.proxy(&self.target).await?;
        Ok(())
    }
}

#[tokio::test]
async fn test_proxy_forwarding() {
    let seen = Arc::new(Mutex::new(None));
    let capture = CaptureSubscribe { seen: seen.clone() };

    let (_server, server_addr) =
        udp_endpoint(Builder::new().with_dialplan(RouteAll(capture))).await;

    let target: Uri = format!("sip:bob@{}", server_addr).parse().unwrap();
    let (_proxy, proxy_addr) =
        udp_endpoint(Builder::new().with_dialplan(RouteAll(ForwardTo { target }))).await;

    let (client, _) = udp_endpoint(Builder::new()).await;
    let peer = client
        .connect(TransportKind::Udp, proxy_addr, None)
        .await
        .unwrap();

    let mut setup = setup_towards(server_addr);
    setup.body = Some(Bytes::from_static(b"presence"));
    let (dialog, response) = peer.subscribe(setup, 1800).await.unwrap();

    // The 200 traversed the reverse path unchanged.
    assert_eq!(response.code(), StatusCode::Ok);

    let forwarded = seen.lock().unwrap().take().expect("server saw the request");

    // One extra Via (the proxy's) on top, ours below it.
    let vias: Vec<_> = forwarded.request.headers.vias().collect();
    assert_eq!(vias.len(), 2);
    assert_eq!(
        vias[0].sent_by().port,
        Some(proxy_addr.port()),
    );

    // Same Call-ID and body end to end.
    assert_eq!(
        forwarded.headers.call_id.value(),
        dialog.call_id().value()
    );
    assert_eq!(forwarded.request.body.as_deref(), Some(&b"presence"[..]));
    assert_eq!(forwarded.headers.cseq.method, SipMethod::Subscribe);
}

#[tokio::test]
async fn test_options_gets_default_200() {
    let (_server, server_addr) = udp_endpoint(Builder::new()).await;
    let (client, _) = udp_endpoint(Builder::new()).await;

    let peer = client
        .connect(TransportKind::Udp, server_addr, None)
        .await
        .unwrap();

    let (_dialog, response) = peer
        .request(SipMethod::Options, setup_towards(server_addr))
        .await
        .unwrap();

    assert_eq!(response.code(), StatusCode::Ok);
    assert!(response.headers.get_other("Allow").is_some());
}

#[tokio::test]
async fn test_unroutable_method_gets_501() {
    let (_server, server_addr) = udp_endpoint(Builder::new()).await;
    let (client, _) = udp_endpoint(Builder::new()).await;

    let peer = client
        .connect(TransportKind::Udp, server_addr, None)
        .await
        .unwrap();

    let (_dialog, response) = peer
        .request(SipMethod::Message, setup_towards(server_addr))
        .await
        .unwrap();

    assert_eq!(response.code(), StatusCode::NotImplemented);
}

#[tokio::test]
async fn test_close_unregisters_refreshing_dialogs() {
    let requests: Arc<Mutex<Vec<(SipMethod, Option<u32>)>>> = Arc::new(Mutex::new(Vec::new()));

    #[derive(Clone)]
    struct Accept {
        requests: Arc<Mutex<Vec<(SipMethod, Option<u32>)>>>,
    }

    #[async_trait::async_trait]
    impl Handler for Accept {
        async fn call(&self, call: IncomingCall) -> Result<()> {
            self.requests
                .lock()
                .unwrap()
                .push((call.method(), call.request().request.headers.expires()));
            let expires = call.request().request.headers.expires().unwrap_or(60);
            let headers = Headers::from([Header::Expires(Expires::new(expires))]);
            call.reply(StatusCode::Ok, Some(headers), None).await
        }
    }

    let (_server, server_addr) = udp_endpoint(
        Builder::new().with_dialplan(RouteAll(Accept {
            requests: requests.clone(),
        })),
    )
    .await;
    let (client, _) = udp_endpoint(Builder::new()).await;

    let peer = client
        .connect(TransportKind::Udp, server_addr, None)
        .await
        .unwrap();

    let (_dialog, response) = peer
        .register(setup_towards(server_addr), 600)
        .await
        .unwrap();
    assert_eq!(response.code(), StatusCode::Ok);

    // Closing the application drains the registration with Expires: 0.
    client.close().await.unwrap();

    let seen = requests.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], (SipMethod::Register, Some(600)));
    assert_eq!(seen[1], (SipMethod::Register, Some(0)));
}
