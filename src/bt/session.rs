//! HFP protocol state machine (component D).
//!
//! Runs as a single-task actor per §5's single-threaded cooperative
//! model: one task owns the transport, the command queue and all
//! protocol state; callers reach it through a cloneable [`SessionHandle`]
//! that sends requests over an `mpsc` channel and awaits a `oneshot`
//! reply, the same request/response shape the teacher's `EspNotify`
//! background task uses internally (subscribe/post against a task-owned
//! state object) generalized from a pub/sub bitmask to typed requests.
//! Subscribers interested in connection/indicator/call-state changes are
//! "ordinary listener sets on the session" per the design notes, modeled
//! here as a `tokio::sync::broadcast` channel.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use enumset::EnumSet;
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::bt::at::{classify_line, AtCommand, AtQueue, CommandOutcome, LineKind, LineReader};
use crate::bt::chld::{parse_chld_test, ChldCap};
use crate::bt::features::{decode_ag_features, AgFeature};
use crate::bt::indicators::{
    derive_call_state, CallState, CallingLineIdentity, CallsetupEmulation, EmulationTimer,
    IndicatorTable, IndicatorValues,
};
use crate::bt::rfcomm::Transport;
use crate::bt::telephony;
use crate::errors::{Error, ProtocolError, Result, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    RfcommConnecting,
    Handshaking,
    Connected,
}

/// Durations for the three emulation/reconnect timers, §7/§4.4 (the
/// config module supplies the production defaults).
#[derive(Debug, Clone, Copy)]
pub struct SessionTimers {
    pub ring: Duration,
    pub dial_or_waiting: Duration,
}

impl Default for SessionTimers {
    fn default() -> Self {
        Self {
            ring: Duration::from_secs(5),
            dial_or_waiting: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    Disconnected { reason: Option<String> },
    IndicatorChanged { name: String, value: i32 },
    CallState(CallState),
    Waiting(CallingLineIdentity),
}

enum SessionRequest {
    Dial(String, oneshot::Sender<Result<CommandOutcome>>),
    Redial(oneshot::Sender<Result<CommandOutcome>>),
    Answer(oneshot::Sender<Result<CommandOutcome>>),
    HangUp(oneshot::Sender<Result<CommandOutcome>>),
    Dtmf(char, oneshot::Sender<Result<CommandOutcome>>),
    DropHeldUdub(oneshot::Sender<Result<CommandOutcome>>),
    SwapDropActive(oneshot::Sender<Result<CommandOutcome>>),
    DropActive(u32, oneshot::Sender<Result<CommandOutcome>>),
    SwapHoldActive(oneshot::Sender<Result<CommandOutcome>>),
    PrivateConsult(u32, oneshot::Sender<Result<CommandOutcome>>),
    LinkCalls(oneshot::Sender<Result<CommandOutcome>>),
    Transfer(oneshot::Sender<Result<CommandOutcome>>),
    Disconnect(oneshot::Sender<()>),
}

/// Side effect to run once a queued command's own completion (the ack
/// sent back to the `SessionHandle` caller) is resolved from inside
/// `on_line`'s `Terminator` branch, rather than at submission time.
enum PendingAction {
    None,
    ForceDialOrRedialCallsetup,
}

/// One entry per command in flight, kept in strict FIFO correspondence
/// with `Session::queue` so a `Terminator` line always resolves the
/// right caller (§5's per-command ordering guarantee).
struct PendingAck {
    ack: oneshot::Sender<Result<CommandOutcome>>,
    action: PendingAction,
}

/// A cheaply-cloneable front end to a running [`Session`] actor.
#[derive(Clone)]
pub struct SessionHandle {
    requests: mpsc::Sender<SessionRequest>,
    events: broadcast::Sender<SessionEvent>,
}

macro_rules! simple_request {
    ($name:ident, $variant:ident) => {
        pub async fn $name(&self) -> Result<CommandOutcome> {
            let (tx, rx) = oneshot::channel();
            self.requests
                .send(SessionRequest::$variant(tx))
                .await
                .map_err(|_| Error::Transport(TransportError::NotConnected))?;
            rx.await.map_err(|_| Error::Transport(TransportError::NotConnected))?
        }
    };
}

impl SessionHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn dial(&self, number: impl Into<String>) -> Result<CommandOutcome> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(SessionRequest::Dial(number.into(), tx))
            .await
            .map_err(|_| Error::Transport(TransportError::NotConnected))?;
        rx.await.map_err(|_| Error::Transport(TransportError::NotConnected))?
    }

    simple_request!(redial, Redial);
    simple_request!(answer, Answer);
    simple_request!(hang_up, HangUp);
    simple_request!(drop_held_udub, DropHeldUdub);
    simple_request!(swap_drop_active, SwapDropActive);
    simple_request!(swap_hold_active, SwapHoldActive);
    simple_request!(link_calls, LinkCalls);
    simple_request!(transfer, Transfer);

    pub async fn send_dtmf(&self, digit: char) -> Result<CommandOutcome> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(SessionRequest::Dtmf(digit, tx))
            .await
            .map_err(|_| Error::Transport(TransportError::NotConnected))?;
        rx.await.map_err(|_| Error::Transport(TransportError::NotConnected))?
    }

    pub async fn drop_active(&self, index: u32) -> Result<CommandOutcome> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(SessionRequest::DropActive(index, tx))
            .await
            .map_err(|_| Error::Transport(TransportError::NotConnected))?;
        rx.await.map_err(|_| Error::Transport(TransportError::NotConnected))?
    }

    pub async fn private_consult(&self, index: u32) -> Result<CommandOutcome> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(SessionRequest::PrivateConsult(index, tx))
            .await
            .map_err(|_| Error::Transport(TransportError::NotConnected))?;
        rx.await.map_err(|_| Error::Transport(TransportError::NotConnected))?
    }

    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.requests.send(SessionRequest::Disconnect(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// The session actor. Construct with [`Session::new`], then drive it
/// with [`Session::run`] inside a spawned task; interact with it via the
/// [`SessionHandle`] returned alongside it.
pub struct Session<T: Transport> {
    state: SessionState,
    reader: LineReader<T>,
    queue: AtQueue,
    local_features: u32,
    cached_ag_features: Option<u32>,
    ag_features: EnumSet<AgFeature>,
    cind_table: IndicatorTable,
    indicators: IndicatorValues,
    chld_caps: HashSet<ChldCap>,
    waiting_cli: Option<CallingLineIdentity>,
    emulation: CallsetupEmulation,
    timers: SessionTimers,
    events: broadcast::Sender<SessionEvent>,
    requests: mpsc::Receiver<SessionRequest>,
    sco_teardown: Option<Box<dyn FnOnce(Option<&Error>) + Send>>,
    acks: VecDeque<PendingAck>,
}

impl<T: Transport> Session<T> {
    /// Wraps an already-open RFCOMM transport. `sdp_features` is the
    /// feature bitmap discovered during the SDP lookup that preceded
    /// this connection, used as a fallback if `AT+BRSF` errors (§7).
    pub fn new(
        transport: T,
        local_features: u32,
        sdp_features: Option<u32>,
        timers: SessionTimers,
    ) -> (Self, SessionHandle) {
        let (events_tx, _) = broadcast::channel(32);
        let (requests_tx, requests_rx) = mpsc::channel(32);

        let session = Self {
            state: SessionState::Handshaking,
            reader: LineReader::new(transport),
            queue: AtQueue::new(),
            local_features,
            cached_ag_features: sdp_features,
            ag_features: EnumSet::new(),
            cind_table: IndicatorTable::default(),
            indicators: IndicatorValues::default(),
            chld_caps: HashSet::new(),
            waiting_cli: None,
            emulation: CallsetupEmulation::new(),
            timers,
            events: events_tx.clone(),
            requests: requests_rx,
            sco_teardown: None,
            acks: VecDeque::new(),
        };

        let handle = SessionHandle {
            requests: requests_tx,
            events: events_tx,
        };

        (session, handle)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn chld_caps(&self) -> &HashSet<ChldCap> {
        &self.chld_caps
    }

    /// Registers a one-shot hook invoked (at most once) when the session
    /// faults, letting the SCO endpoint tear itself down atomically with
    /// the RFCOMM link, per §7's "a lost RFCOMM link atomically tears
    /// down any SCO link."
    pub fn set_sco_teardown_hook(&mut self, hook: impl FnOnce(Option<&Error>) + Send + 'static) {
        self.sco_teardown = Some(Box::new(hook));
    }

    pub fn clear_sco_teardown_hook(&mut self) {
        self.sco_teardown = None;
    }

    /// Drives the session to completion: runs the handshake, then
    /// serves requests and incoming lines until disconnected.
    pub async fn run(mut self) {
        if let Err(e) = self.handshake().await {
            self.fault(Some(e)).await;
            return;
        }

        self.state = SessionState::Connected;
        let _ = self.events.send(SessionEvent::Connected);
        info!("HFP session connected");

        loop {
            tokio::select! {
                line = self.reader.next_line() => {
                    match line {
                        Ok(Some(line)) => self.on_line(line).await,
                        Ok(None) => {
                            self.fault(Some(Error::Transport(TransportError::NotConnected))).await;
                            return;
                        }
                        Err(e) => {
                            self.fault(Some(e)).await;
                            return;
                        }
                    }
                }
                kind = self.emulation.wait() => self.on_emulation_timeout(kind),
                request = self.requests.recv() => {
                    match request {
                        Some(SessionRequest::Disconnect(ack)) => {
                            self.fault(None).await;
                            let _ = ack.send(());
                            return;
                        }
                        Some(request) => self.on_request(request).await,
                        None => {
                            self.fault(None).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    // ---- Handshake (§4.3) ----

    async fn handshake(&mut self) -> Result<()> {
        // Step 1: AT+BRSF.
        let (brsf_outcome, brsf_lines) = self
            .run_step_lines(format!("AT+BRSF={}", self.local_features))
            .await?;
        let parsed_ag_features = brsf_lines.iter().find_map(|line| {
            line.strip_prefix("+BRSF:")
                .and_then(|body| body.trim().parse::<u32>().ok())
                .map(decode_ag_features)
        });

        if brsf_outcome == CommandOutcome::Error {
            // Non-fatal per §4.3; fall back to SDP-cached features if any.
            if let Some(bits) = self.cached_ag_features {
                self.ag_features = decode_ag_features(bits);
                warn!("AT+BRSF returned ERROR; using SDP-cached feature bitmap");
            } else {
                warn!("AT+BRSF returned ERROR and no SDP-cached features are available");
            }
        } else if let Some(features) = parsed_ag_features {
            self.ag_features = features;
        }

        // Step 2: AT+CHLD=? only if three-way-calling was advertised.
        if self.ag_features.contains(AgFeature::ThreeWayCalling) {
            // ERROR (or a transport fault) here is non-fatal, §4.3 step prefix 1..6.
            if let Ok((_, lines)) = self.run_step_lines("AT+CHLD=?".to_string()).await {
                if let Some(caps) = lines.iter().find_map(|line| parse_chld_test(line).ok()) {
                    self.chld_caps = caps;
                }
            }
        }

        // Step 3: AT+CIND=?.
        if let Ok((_, lines)) = self.run_step_lines("AT+CIND=?".to_string()).await {
            if let Some(table) = lines.iter().find_map(|line| IndicatorTable::parse(line).ok()) {
                self.cind_table = table_or_current(table, &self.cind_table);
            }
        }

        // Steps 4-6: CMER, CLIP, CCWA — ERROR tolerated.
        let _ = self.run_step("AT+CMER=3,0,0,1".to_string()).await;
        let _ = self.run_step("AT+CLIP=1".to_string()).await;
        let _ = self.run_step("AT+CCWA=1".to_string()).await;

        // Step 7: AT+CIND? — ERROR here disconnects.
        let (outcome, lines) = self.run_step_lines("AT+CIND?".to_string()).await?;
        if outcome == CommandOutcome::Error {
            return Err(Error::Protocol(ProtocolError::CommandRejected(
                "AT+CIND? returned ERROR".to_string(),
            )));
        }
        let mut values = IndicatorValues::default();
        for line in &lines {
            let _ = values.apply_read(line, &self.cind_table);
        }
        self.indicators = values;
        self.refresh_emulation_after_handshake();

        Ok(())
    }

    /// Sends one handshake command, waits for its terminator, and returns
    /// every intermediate line collected along the way. The handshake is
    /// strictly sequential (§4.3: "send in order and await OK of each"),
    /// so this never competes with a second in-flight command, and the
    /// lines are parsed back at the call site (where `self` is available
    /// again) rather than inside the `'static` response handler.
    async fn run_step_lines(&mut self, text: String) -> Result<(CommandOutcome, Vec<String>)> {
        use std::sync::{Arc, Mutex};

        let lines: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let (cmd, rx) = AtCommand::with_handler(text.clone(), move |line| {
            sink.lock().expect("capture mutex poisoned").push(line.to_string());
        });

        let outcome = self.send_and_await(cmd, rx).await?;

        let collected = Arc::try_unwrap(lines)
            .map(|m| m.into_inner().expect("capture mutex poisoned"))
            .unwrap_or_default();
        Ok((outcome, collected))
    }

    async fn run_step(&mut self, text: String) -> Result<CommandOutcome> {
        let (cmd, rx) = AtCommand::new(text);
        self.send_and_await(cmd, rx).await
    }

    async fn send_and_await(
        &mut self,
        cmd: AtCommand,
        rx: oneshot::Receiver<CommandOutcome>,
    ) -> Result<CommandOutcome> {
        let text = cmd.text.clone();
        let became_head = self.queue.push(cmd);
        debug_assert!(became_head, "handshake commands must run one at a time");
        crate::bt::at::write_command(self.reader.transport_mut(), &text).await?;

        loop {
            match self.reader.next_line().await? {
                Some(line) => match classify_line(&line) {
                    LineKind::Terminator(outcome) => {
                        self.queue.complete_head(outcome);
                        let result =
                            rx.await.map_err(|_| Error::Protocol(ProtocolError::CommandAborted))?;
                        return Ok(result);
                    }
                    LineKind::Intermediate(text) => self.queue.deliver_intermediate(&text),
                    LineKind::Unsolicited(text) => self.on_unsolicited(&text),
                },
                None => {
                    return Err(Error::Transport(TransportError::NotConnected));
                }
            }
        }
    }

    fn refresh_emulation_after_handshake(&mut self) {
        if !self.cind_table.has("callsetup") {
            debug!("AG lacks a callsetup indicator; enabling emulation layer");
        }
    }

    // ---- Connected-state line/event handling ----

    async fn on_line(&mut self, line: String) {
        match classify_line(&line) {
            LineKind::Terminator(outcome) => {
                if let Some(became_head) = self.queue.complete_head(outcome) {
                    if let Some(pending) = self.acks.pop_front() {
                        if outcome == CommandOutcome::Ok {
                            match pending.action {
                                PendingAction::ForceDialOrRedialCallsetup => self.force_dial_callsetup(),
                                PendingAction::None => {}
                            }
                        }
                        let _ = pending.ack.send(Ok(outcome));
                    }
                    if became_head {
                        if let Some(next) = self.queue.head() {
                            let text = next.text.clone();
                            if let Err(e) =
                                crate::bt::at::write_command(self.reader.transport_mut(), &text).await
                            {
                                self.fault(Some(e)).await;
                            }
                        }
                    }
                }
            }
            LineKind::Intermediate(text) => self.queue.deliver_intermediate(&text),
            LineKind::Unsolicited(text) => self.on_unsolicited(&text),
        }
    }

    fn on_unsolicited(&mut self, line: &str) {
        if line == "RING" {
            if !self.cind_table.has("callsetup") {
                self.indicators.set("callsetup", 1);
                self.emulation.arm(EmulationTimer::Ring, self.timers.ring);
                self.notify_call_state();
            }
            return;
        }

        if let Some(rest) = line.strip_prefix("+CIEV:") {
            let _ = rest;
            if let Ok((name, value)) = self.indicators.apply_ciev(line, &self.cind_table) {
                let name = name.to_string();
                let _ = self.events.send(SessionEvent::IndicatorChanged {
                    name: name.clone(),
                    value,
                });
                if name == "call" || name == "callsetup" {
                    self.notify_call_state();
                }
            }
            return;
        }

        if line.starts_with("+CLIP:") {
            if let Ok(clip) = CallingLineIdentity::parse_clip(line) {
                if self.waiting_cli.as_ref() != Some(&clip) {
                    self.waiting_cli = Some(clip.clone());
                    let _ = self.events.send(SessionEvent::Waiting(clip));
                }
            }
            return;
        }

        if line.starts_with("+CCWA:") {
            if let Ok(ccwa) = CallingLineIdentity::parse_ccwa(line) {
                if !self.cind_table.has("callsetup") {
                    self.indicators.set("callsetup", 2);
                    self.emulation
                        .arm(EmulationTimer::DialOrWaiting, self.timers.dial_or_waiting);
                    self.notify_call_state();
                }
                self.waiting_cli = Some(ccwa.clone());
                let _ = self.events.send(SessionEvent::Waiting(ccwa));
            }
        }
    }

    fn on_emulation_timeout(&mut self, kind: EmulationTimer) {
        match kind {
            EmulationTimer::Ring | EmulationTimer::DialOrWaiting => {
                if !self.cind_table.has("callsetup") {
                    self.indicators.set("callsetup", 0);
                    self.notify_call_state();
                }
            }
        }
    }

    fn notify_call_state(&mut self) {
        let call = self.indicators.get("call").unwrap_or(0);
        let callsetup = self.indicators.get("callsetup").unwrap_or(0);
        let _ = self
            .events
            .send(SessionEvent::CallState(derive_call_state(call, callsetup)));
    }

    /// `ATD<num>;`/`AT+BLDN` success on an AG lacking a `callsetup`
    /// indicator forces the emulation layer into outbound-dialling
    /// state and arms the 20s dial timeout (§4.4).
    fn force_dial_callsetup(&mut self) {
        if !self.cind_table.has("callsetup") {
            self.indicators.set("callsetup", 3);
            self.emulation
                .arm(EmulationTimer::DialOrWaiting, self.timers.dial_or_waiting);
            self.notify_call_state();
        }
    }

    // ---- Telephony requests ----

    async fn on_request(&mut self, request: SessionRequest) {
        match request {
            SessionRequest::Dial(number, ack) => match telephony::dial_command(&number) {
                Ok(text) => self.issue_async(text, ack, PendingAction::ForceDialOrRedialCallsetup).await,
                Err(e) => {
                    let _ = ack.send(Err(e));
                }
            },
            SessionRequest::Redial(ack) => {
                self.issue_async(telephony::redial_command(), ack, PendingAction::ForceDialOrRedialCallsetup)
                    .await;
            }
            SessionRequest::Answer(ack) => {
                self.issue_async(telephony::answer_command(), ack, PendingAction::None).await;
            }
            SessionRequest::HangUp(ack) => {
                self.issue_async(telephony::hang_up_command(), ack, PendingAction::None).await;
            }
            SessionRequest::Dtmf(digit, ack) => match telephony::dtmf_command(digit) {
                Ok(text) => self.issue_async(text, ack, PendingAction::None).await,
                Err(e) => {
                    let _ = ack.send(Err(e));
                }
            },
            SessionRequest::DropHeldUdub(ack) => {
                let text = telephony::drop_held_udub_command(&self.chld_caps);
                self.issue_async(text, ack, PendingAction::None).await;
            }
            SessionRequest::SwapDropActive(ack) => {
                let text = telephony::swap_drop_active_command(&self.chld_caps);
                self.issue_async(text, ack, PendingAction::None).await;
            }
            SessionRequest::DropActive(index, ack) => {
                let text = telephony::drop_active_command(&self.chld_caps, index);
                self.issue_async(text, ack, PendingAction::None).await;
            }
            SessionRequest::SwapHoldActive(ack) => {
                let text = telephony::swap_hold_active_command(&self.chld_caps);
                self.issue_async(text, ack, PendingAction::None).await;
            }
            SessionRequest::PrivateConsult(index, ack) => {
                let text = telephony::private_consult_command(&self.chld_caps, index);
                self.issue_async(text, ack, PendingAction::None).await;
            }
            SessionRequest::LinkCalls(ack) => {
                let text = telephony::link_calls_command(&self.chld_caps);
                self.issue_async(text, ack, PendingAction::None).await;
            }
            SessionRequest::Transfer(ack) => {
                let text = telephony::transfer_command(&self.chld_caps);
                self.issue_async(text, ack, PendingAction::None).await;
            }
            SessionRequest::Disconnect(_) => unreachable!("handled in run()"),
        }
    }

    /// Queues a command while the session is serving the connected-state
    /// loop and returns immediately: the run loop must stay free to read
    /// the AG's response concurrently, so completion is delivered later
    /// by `on_line`'s `Terminator` branch, which pops `self.acks` in the
    /// same FIFO order commands were pushed (§5's ordering guarantee:
    /// "pending command futures complete in submission order").
    async fn issue_async(&mut self, text: String, ack: oneshot::Sender<Result<CommandOutcome>>, action: PendingAction) {
        let (cmd, _completion) = AtCommand::new(text.clone());
        let became_head = self.queue.push(cmd);
        self.acks.push_back(PendingAck { ack, action });
        if became_head {
            if let Err(e) = crate::bt::at::write_command(self.reader.transport_mut(), &text).await {
                self.fault(Some(e)).await;
            }
        }
    }

    async fn fault(&mut self, reason: Option<Error>) {
        if self.state == SessionState::Disconnected {
            return;
        }
        self.state = SessionState::Disconnected;
        self.queue.abort_all();
        while let Some(pending) = self.acks.pop_front() {
            let _ = pending.ack.send(Ok(CommandOutcome::Aborted));
        }
        self.emulation.cancel();

        if let Some(hook) = self.sco_teardown.take() {
            hook(reason.as_ref());
        }

        if let Some(e) = &reason {
            error!("HFP session fault: {e}");
        }
        let _ = self.events.send(SessionEvent::Disconnected {
            reason: reason.map(|e| e.to_string()),
        });
    }
}

fn table_or_current(parsed: IndicatorTable, current: &IndicatorTable) -> IndicatorTable {
    if parsed.has("service")
        || parsed.has("call")
        || parsed.has("callsetup")
        || parsed.has("signal")
        || parsed.has("roam")
        || parsed.has("battchg")
    {
        parsed
    } else {
        current.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn local_features() -> u32 {
        crate::config::DEFAULT_LOCAL_FEATURES
    }

    /// Handshake is strictly sequential (one command written, its
    /// terminator awaited, before the next is written), so a test
    /// double must reply to each line as it arrives rather than
    /// batch-draining the whole script up front.
    async fn respond_to(ag: &mut tokio::io::DuplexStream, expected: &str, response: &[u8]) {
        assert_eq!(read_line(ag).await, expected);
        ag.write_all(response).await.unwrap();
    }

    #[tokio::test]
    async fn inbound_call_handshake_then_ring() {
        let (mut ag, hf) = tokio::io::duplex(4096);
        let (session, handle) = Session::new(hf, local_features(), None, SessionTimers::default());

        let mut events = handle.subscribe();
        let join = tokio::spawn(session.run());

        // Drive the handshake's seven AT lines one at a time, replying
        // per §8 scenario 1 (BRSF=3 sets both ThreeWayCalling and EcNr,
        // so AT+CHLD=? is issued as step 2).
        respond_to(&mut ag, &format!("AT+BRSF={}", local_features()), b"+BRSF: 3\r\nOK\r\n").await;
        respond_to(&mut ag, "AT+CHLD=?", b"+CHLD: (0,1,2,3)\r\nOK\r\n").await;
        respond_to(
            &mut ag,
            "AT+CIND=?",
            b"+CIND: (\"service\",(0,1)),(\"call\",(0,1)),(\"callsetup\",(0-3)),\
              (\"signal\",(0-5)),(\"roam\",(0,1)),(\"battchg\",(0-5))\r\nOK\r\n",
        )
        .await;
        respond_to(&mut ag, "AT+CMER=3,0,0,1", b"OK\r\n").await;
        respond_to(&mut ag, "AT+CLIP=1", b"OK\r\n").await;
        respond_to(&mut ag, "AT+CCWA=1", b"OK\r\n").await;
        respond_to(&mut ag, "AT+CIND?", b"+CIND: 1,0,0,4,0,3\r\nOK\r\n").await;

        let mut saw_connected = false;
        while let Ok(event) = tokio::time::timeout(std::time::Duration::from_secs(1), events.recv()).await {
            if let Ok(SessionEvent::Connected) = event {
                saw_connected = true;
                break;
            }
        }
        assert!(saw_connected);

        ag.write_all(b"RING\r\n+CLIP: \"5551212\",129\r\n").await.unwrap();

        let mut saw_waiting = None;
        while let Ok(Ok(event)) =
            tokio::time::timeout(std::time::Duration::from_secs(1), events.recv()).await
        {
            if let SessionEvent::Waiting(cli) = event {
                saw_waiting = Some(cli);
                break;
            }
        }
        let cli = saw_waiting.expect("expected a Waiting event for the CLIP line");
        assert_eq!(cli.number.as_deref(), Some("5551212"));
        assert_eq!(cli.type_of_number, Some(129));

        drop(ag);
        let _ = join.await;
    }

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
}
