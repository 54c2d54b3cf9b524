//! End-to-end HFP session scenarios, §8 "End-to-end scenarios".
//!
//! Each test drives `bt::session::Session` over an in-memory
//! `tokio::io::duplex` pair standing in for the RFCOMM socket (§10.6):
//! no real Bluetooth hardware is touched. Scenario 1 (inbound-call
//! handshake-then-ring) lives as an inline `#[tokio::test]` in
//! `bt::session`'s own test module since it exercises private
//! handshake-internal state directly; the scenarios here only need the
//! public `SessionHandle`/`SessionEvent` surface, so they're exercised
//! black-box from the crate's public API instead.

use std::time::Duration;

use hfp_hf::bt::session::{Session, SessionEvent, SessionTimers};
use tokio::io::AsyncWriteExt;

async fn read_line(stream: &mut tokio::io::DuplexStream) -> String {
    use tokio::io::AsyncReadExt;
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await.unwrap();
        if byte[0] == b'\r' {
            break;
        }
        buf.push(byte[0]);
    }
    String::from_utf8(buf).unwrap()
}

/// Handshake is strictly sequential (one command written, its
/// terminator awaited, before the next is written), so a test double
/// must reply to each line as it arrives rather than batch-draining
/// the whole script up front.
async fn respond_to(ag: &mut tokio::io::DuplexStream, expected: &str, response: &[u8]) {
    assert_eq!(read_line(ag).await, expected);
    ag.write_all(response).await.unwrap();
}

/// Drives a handshake for an AG whose `AT+BRSF` reports no three-way
/// calling support (so `AT+CHLD=?` is skipped) and whose `+CIND=?` list
/// omits `callsetup` entirely, the precondition for §8 scenario 2.
async fn drive_handshake_no_callsetup(ag: &mut tokio::io::DuplexStream) {
    respond_to(ag, "AT+BRSF=0", b"+BRSF: 0\r\nOK\r\n").await;
    respond_to(
        ag,
        "AT+CIND=?",
        b"+CIND: (\"service\",(0,1)),(\"call\",(0,1)),(\"signal\",(0-5)),\
          (\"roam\",(0,1)),(\"battchg\",(0-5))\r\nOK\r\n",
    )
    .await;
    respond_to(ag, "AT+CMER=3,0,0,1", b"OK\r\n").await;
    respond_to(ag, "AT+CLIP=1", b"OK\r\n").await;
    respond_to(ag, "AT+CCWA=1", b"OK\r\n").await;
    respond_to(ag, "AT+CIND?", b"+CIND: 1,0,4,0,3\r\nOK\r\n").await;
}

/// Drives a handshake for an AG that reports three-way calling and a
/// full indicator set including `callsetup`, the precondition for §8
/// scenario 6's disconnect-aborts-in-flight-commands test.
async fn drive_handshake_with_callsetup(ag: &mut tokio::io::DuplexStream) {
    respond_to(ag, "AT+BRSF=0", b"+BRSF: 0\r\nOK\r\n").await;
    respond_to(
        ag,
        "AT+CIND=?",
        b"+CIND: (\"service\",(0,1)),(\"call\",(0,1)),(\"callsetup\",(0-3)),\
          (\"signal\",(0-5)),(\"roam\",(0,1)),(\"battchg\",(0-5))\r\nOK\r\n",
    )
    .await;
    respond_to(ag, "AT+CMER=3,0,0,1", b"OK\r\n").await;
    respond_to(ag, "AT+CLIP=1", b"OK\r\n").await;
    respond_to(ag, "AT+CCWA=1", b"OK\r\n").await;
    respond_to(ag, "AT+CIND?", b"+CIND: 1,0,0,4,0,3\r\nOK\r\n").await;
}

async fn next_call_state(
    events: &mut tokio::sync::broadcast::Receiver<SessionEvent>,
) -> Option<hfp_hf::bt::indicators::CallState> {
    loop {
        match tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
            Ok(Ok(SessionEvent::CallState(state))) => return Some(state),
            Ok(Ok(_)) => continue,
            _ => return None,
        }
    }
}

/// §8 scenario 2: outbound dial on an AG whose `+CIND=?` test list omits
/// `callsetup`. `dial()` must still report `has_connecting=true` via the
/// emulation layer, reverting to idle after the 20s dial timeout absent
/// any further signal from the AG.
#[tokio::test(start_paused = true)]
async fn outbound_dial_on_no_callsetup_ag_emulates_then_times_out() {
    let (mut ag, hf) = tokio::io::duplex(4096);
    let timers = SessionTimers {
        ring: Duration::from_secs(5),
        dial_or_waiting: Duration::from_millis(50),
    };
    let (session, handle) = Session::new(hf, 0, None, timers);

    let mut events = handle.subscribe();
    let join = tokio::spawn(session.run());

    drive_handshake_no_callsetup(&mut ag).await;

    let mut connected = false;
    while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
        if let SessionEvent::Connected = event {
            connected = true;
            break;
        }
    }
    assert!(connected, "expected the session to reach Connected");

    let dial = tokio::spawn({
        let handle = handle.clone();
        async move { handle.dial("15551212").await }
    });

    let dial_line = read_line(&mut ag).await;
    assert_eq!(dial_line, "ATD15551212;");
    ag.write_all(b"OK\r\n").await.unwrap();

    let outcome = dial.await.unwrap().unwrap();
    assert_eq!(outcome, hfp_hf::bt::at::CommandOutcome::Ok);

    let state = next_call_state(&mut events)
        .await
        .expect("dial should emulate a call-state change");
    assert_eq!(state, hfp_hf::bt::indicators::CallState::ConnectingOutbound);

    // Advance past the 20s (here 50ms) dial timeout with no further
    // AG signal; emulation must revert callsetup to 0.
    let reverted = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(state) = next_call_state(&mut events).await {
                if state == hfp_hf::bt::indicators::CallState::Idle {
                    return true;
                }
            } else {
                return false;
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(reverted, "expected callsetup to revert to idle after the dial timeout");

    drop(ag);
    let _ = join.await;
}

/// §8 scenario 6 (session half): disconnecting the RFCOMM session while
/// unrelated request traffic is in flight aborts every queued command
/// and leaves the session in a clean, non-connected state. The SCO-half
/// of scenario 6 (teardown-notification suppression) is covered by
/// `bt::sco`'s own unit tests, since it only needs the `ScoTeardown`
/// type directly.
#[tokio::test]
async fn disconnect_aborts_in_flight_commands() {
    let (mut ag, hf) = tokio::io::duplex(4096);
    let (session, handle) = Session::new(hf, 0, None, SessionTimers::default());

    let mut events = handle.subscribe();
    let join = tokio::spawn(session.run());

    drive_handshake_with_callsetup(&mut ag).await;

    let mut connected = false;
    while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
        if let SessionEvent::Connected = event {
            connected = true;
            break;
        }
    }
    assert!(connected);

    let answer = tokio::spawn({
        let handle = handle.clone();
        async move { handle.answer().await }
    });
    let _ = read_line(&mut ag).await; // "ATA" in flight, never answered.

    handle.disconnect().await;

    let outcome = answer.await.unwrap();
    match outcome {
        Ok(hfp_hf::bt::at::CommandOutcome::Aborted) => {}
        other => panic!("expected the in-flight command to resolve Aborted on disconnect, got {other:?}"),
    }

    let mut saw_disconnect = false;
    while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
        if let SessionEvent::Disconnected { .. } = event {
            saw_disconnect = true;
            break;
        }
    }
    assert!(saw_disconnect);

    let _ = join.await;
}
