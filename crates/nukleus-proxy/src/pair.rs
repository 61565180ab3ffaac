//! Proxy Pair + Timer: the paired half-stream state machine, frame routing
//! between the two halves, and the expiry/challenge timer.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use nukleus_wire::{
    AbortFrame, AffinityId, Authorization, BeginFrame, Capabilities, DataFrame, EndFrame, GRANT_VALIDATION, HttpExtension,
    ResetFrame, StreamId, StreamRef, WindowFrame,
};

use crate::frame_writer::{challenge_extension, unauthorized_extension, FrameSink};
use crate::grant::{AccessGrant, GrantTable, NEVER};

/// External clock, injected so the timer math is driven without a real
/// wall-clock sleep in tests.
pub trait Clock {
    fn now_millis(&self) -> i64;
}

/// The external collaborator that schedules and cancels `GRANT_VALIDATION`
/// signals. Cancellation must be harmless if the signal already fired
/// (core spec §5): a stale fire is detected here by `remaining <= 0` on an
/// already-detached grant/correlation, not by the executor.
pub trait SignalingExecutor {
    type TimerHandle;

    fn schedule(&mut self, stream: StreamRef, signal_id: u32, deadline_millis: i64) -> Self::TimerHandle;
    fn cancel(&mut self, handle: Self::TimerHandle);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalfState {
    PendingReply,
    Active,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalfRole {
    Initial,
    Reply,
}

pub struct ProxyHalf<H> {
    pub source: StreamRef,
    pub target: StreamRef,
    pub target_auth: Authorization,
    pub capabilities: Capabilities,
    pub grant: Rc<RefCell<AccessGrant>>,
    pub state: HalfState,
    pub timer: Option<H>,
}

/// Two halves per logical connection, sharing one grant.
pub struct Pair<H> {
    pub affinity: AffinityId,
    pub initial: ProxyHalf<H>,
    pub reply: ProxyHalf<H>,
}

impl<H> Pair<H> {
    pub fn accept_initial_id(&self) -> StreamId {
        self.initial.source.stream_id
    }
}

/// Deadline for the reply half's single outstanding timer, or `None` if no
/// timer is warranted (core spec §4.5, "Timer scheduling").
fn schedule_deadline(grant: &AccessGrant, capabilities: Capabilities) -> Option<i64> {
    let exp = grant.expires_at_millis();
    let delta = grant.challenge_delta_millis();
    if capabilities.can_challenge() && delta > 0 {
        Some(exp - delta)
    } else if exp != NEVER {
        Some(exp)
    } else {
        None
    }
}

/// Owns the Grant Table and every live proxy pair for one worker.
pub struct Proxy<H> {
    grants: GrantTable,
    pairs: HashMap<StreamRef, Pair<H>>,
    /// `connectReplyId -> accept-initial key`, present iff the reply half's
    /// downstream BEGIN has not yet arrived.
    pending_reply: HashMap<StreamRef, StreamRef>,
    by_source: HashMap<StreamRef, (StreamRef, HalfRole)>,
    by_target: HashMap<StreamRef, (StreamRef, HalfRole)>,
}

impl<H> Default for Proxy<H> {
    fn default() -> Self {
        Self {
            grants: GrantTable::new(),
            pairs: HashMap::new(),
            pending_reply: HashMap::new(),
            by_source: HashMap::new(),
            by_target: HashMap::new(),
        }
    }
}

impl<H> Proxy<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/diagnostic visibility into the Grant Table (core spec §8,
    /// properties 3/4).
    pub fn live_grant_count(&self) -> usize {
        self.grants.live_grant_count()
    }

    /// Handles an inbound accept-side BEGIN: acquires the shared grant,
    /// schedules the reply half's timer, and emits the paired connect-side
    /// BEGIN. `realm_index` is `None` when the token failed verification
    /// (pass-through authorization, grant keyed under realm 0 but never
    /// shared across subjects since `subject` is also `None` in that case).
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all, fields(stream = %begin.stream, subject = subject.unwrap_or("-")))]
    pub fn open<E>(
        &mut self,
        begin: &BeginFrame,
        connect: StreamRef,
        connect_reply: StreamRef,
        accept_reply: StreamRef,
        realm_index: Option<u32>,
        subject: Option<&str>,
        authorization: Authorization,
        expires_at_millis: i64,
        challenge_delta_millis: i64,
        sink: &mut impl FrameSink,
        exec: &mut E,
    ) where
        E: SignalingExecutor<TimerHandle = H>,
    {
        let grant = self.grants.supply_grant(realm_index.unwrap_or(0), begin.affinity, subject);
        grant.borrow_mut().reauthorize(authorization, expires_at_millis, challenge_delta_millis);
        grant.borrow_mut().acquire();
        grant.borrow_mut().acquire();

        let initial = ProxyHalf {
            source: begin.stream,
            target: connect,
            target_auth: authorization,
            capabilities: begin.capabilities,
            grant: grant.clone(),
            state: HalfState::Active,
            timer: None,
        };

        let mut reply = ProxyHalf {
            source: connect_reply,
            target: accept_reply,
            target_auth: authorization,
            capabilities: begin.capabilities,
            grant: grant.clone(),
            state: HalfState::PendingReply,
            timer: None,
        };

        if let Some(deadline) = schedule_deadline(&grant.borrow(), reply.capabilities) {
            reply.timer = Some(exec.schedule(reply.source, GRANT_VALIDATION, deadline));
        }

        self.by_source.insert(initial.source, (begin.stream, HalfRole::Initial));
        self.by_target.insert(initial.target, (begin.stream, HalfRole::Initial));
        self.by_source.insert(reply.source, (begin.stream, HalfRole::Reply));
        self.pending_reply.insert(connect_reply, begin.stream);

        self.pairs.insert(
            begin.stream,
            Pair {
                affinity: begin.affinity,
                initial,
                reply,
            },
        );

        debug!(authorization = %authorization, "Opened proxy pair");
        sink.do_begin(connect, begin.trace, authorization, begin.affinity, begin.extension.clone(), begin.capabilities);
    }

    /// Handles the downstream BEGIN completing the reply half: moves it out
    /// of the correlation table and emits the accept-side reply BEGIN,
    /// carrying the upstream's own trace/authorization/extension through.
    pub fn new_reply_stream(&mut self, incoming: &BeginFrame, sink: &mut impl FrameSink) {
        let Some(pair_key) = self.pending_reply.remove(&incoming.stream) else {
            return;
        };
        let Some(pair) = self.pairs.get_mut(&pair_key) else { return };

        pair.reply.state = HalfState::Active;
        pair.reply.capabilities = incoming.capabilities;
        self.by_target.insert(pair.reply.target, (pair_key, HalfRole::Reply));

        sink.do_begin(
            pair.reply.target,
            incoming.trace,
            incoming.authorization,
            pair.affinity,
            incoming.extension.clone(),
            incoming.capabilities,
        );
    }

    fn half(&self, stream: StreamRef) -> Option<(StreamRef, HalfRole)> {
        self.by_source.get(&stream).copied()
    }

    pub fn on_data(&mut self, frame: DataFrame, sink: &mut impl FrameSink) {
        let Some((pair_key, role)) = self.half(frame.stream) else { return };
        let pair = &self.pairs[&pair_key];
        let half = half_by_role(pair, role);
        sink.do_data(half.target, frame.trace, frame.padding, half.target_auth, frame.group_id, frame.payload, frame.extension);
    }

    pub fn on_end(&mut self, frame: EndFrame, sink: &mut impl FrameSink, exec: &mut impl SignalingExecutor<TimerHandle = H>) {
        let Some((pair_key, role)) = self.half(frame.stream) else { return };
        let (target, target_auth) = {
            let pair = &self.pairs[&pair_key];
            let half = half_by_role(pair, role);
            (half.target, half.target_auth)
        };
        sink.do_end(target, frame.trace, target_auth, frame.extension);
        self.close_half(pair_key, role, sink, exec);
    }

    pub fn on_abort(&mut self, frame: AbortFrame, sink: &mut impl FrameSink, exec: &mut impl SignalingExecutor<TimerHandle = H>) {
        let Some((pair_key, role)) = self.half(frame.stream) else { return };
        let (target, target_auth) = {
            let pair = &self.pairs[&pair_key];
            let half = half_by_role(pair, role);
            (half.target, half.target_auth)
        };
        sink.do_abort(target, frame.trace, target_auth);
        self.close_half(pair_key, role, sink, exec);
    }

    /// Unknown message type on an active stream: reset the source and tear
    /// down that half without propagating anything further.
    pub fn reject_unknown(&mut self, stream: StreamRef, sink: &mut impl FrameSink, exec: &mut impl SignalingExecutor<TimerHandle = H>) {
        sink.do_reset(stream);
        if let Some((pair_key, role)) = self.half(stream) {
            self.close_half(pair_key, role, sink, exec);
        }
    }

    /// Throttle frame: `WINDOW` arrives on a half's *target* address and is
    /// forwarded back to that half's source, after updating capabilities.
    pub fn on_window(&mut self, frame: WindowFrame, sink: &mut impl FrameSink) {
        let Some(&(pair_key, role)) = self.by_target.get(&frame.stream) else { return };
        let Some(pair) = self.pairs.get_mut(&pair_key) else { return };
        let half = half_by_role_mut(pair, role);
        half.capabilities = frame.capabilities;
        sink.do_window(half.source, frame.credit, frame.padding, frame.group_id, frame.capabilities);
    }

    /// Throttle frame: `RESET` arrives on a half's target, is forwarded to
    /// its source, and tears the half (and correlation, if pending) down.
    pub fn on_reset(&mut self, frame: ResetFrame, sink: &mut impl FrameSink, exec: &mut impl SignalingExecutor<TimerHandle = H>) {
        let Some(&(pair_key, role)) = self.by_target.get(&frame.stream) else { return };
        let source = half_by_role(&self.pairs[&pair_key], role).source;
        sink.do_reset(source);
        self.close_half(pair_key, role, sink, exec);
    }

    /// Handles a fired `GRANT_VALIDATION` signal for `stream` (a half's own
    /// source address, per how the timer was scheduled).
    #[instrument(skip_all, fields(%stream))]
    pub fn on_timer_fire(
        &mut self,
        stream: StreamRef,
        sink: &mut impl FrameSink,
        exec: &mut impl SignalingExecutor<TimerHandle = H>,
        clock: &impl Clock,
    ) {
        let Some(&(pair_key, role)) = self.by_source.get(&stream) else { return };
        let now = clock.now_millis();

        let grant = {
            let pair = &self.pairs[&pair_key];
            half_by_role(pair, role).grant.clone()
        };
        let exp = grant.borrow().expires_at_millis();
        let delta = grant.borrow().challenge_delta_millis();
        let remaining = exp.saturating_sub(now);

        if remaining > 0 {
            let pair = self.pairs.get_mut(&pair_key).expect("pair present for a half we just looked up");
            let half = half_by_role_mut(pair, role);
            half.timer = None;

            let deadline = if half.capabilities.can_challenge() {
                let challenge_at = exp.saturating_sub(delta);
                if challenge_at <= now && now < exp {
                    sink.do_signal(half.source, GRANT_VALIDATION, 0, challenge_extension());
                    exp
                } else if now < challenge_at {
                    challenge_at
                } else {
                    exp
                }
            } else {
                exp
            };
            half.timer = Some(exec.schedule(half.source, GRANT_VALIDATION, deadline));
            return;
        }

        // Expired: reset the source, detach correlation, and either
        // synthesize a 401 (reply never answered) or abort the target.
        let (source, target, target_auth, was_pending_reply) = {
            let pair = &self.pairs[&pair_key];
            let half = half_by_role(pair, role);
            (half.source, half.target, half.target_auth, role == HalfRole::Reply && half.state == HalfState::PendingReply)
        };

        debug!(was_pending_reply, "Grant expired, tearing down half");
        sink.do_reset(source);

        if was_pending_reply {
            sink.do_begin(target, 0, Authorization::NONE, self.pairs[&pair_key].affinity, unauthorized_extension(), Capabilities::default());
            sink.do_end(target, 0, Authorization::NONE, HttpExtension::new());
        } else {
            sink.do_abort(target, 0, target_auth);
        }

        self.close_half(pair_key, role, sink, exec);
    }

    /// Tears a half down: cancels its timer (idempotent), releases its
    /// grant reference exactly once, removes routing entries, detaches a
    /// still-pending correlation (with `clear_throttle`), and drops the
    /// pair entirely once both halves are closed.
    fn close_half(&mut self, pair_key: StreamRef, role: HalfRole, sink: &mut impl FrameSink, exec: &mut impl SignalingExecutor<TimerHandle = H>) {
        let (accept_initial_id, reply_source) = match self.pairs.get(&pair_key) {
            Some(pair) => (pair.accept_initial_id(), pair.reply.source),
            None => return,
        };

        let mut both_closed = false;
        if let Some(pair) = self.pairs.get_mut(&pair_key) {
            let half = half_by_role_mut(pair, role);
            if half.state == HalfState::Closed {
                return;
            }
            if let Some(timer) = half.timer.take() {
                exec.cancel(timer);
            }
            half.grant.borrow_mut().release();
            let (source, target) = (half.source, half.target);
            half.state = HalfState::Closed;
            self.by_source.remove(&source);
            self.by_target.remove(&target);

            both_closed = pair.initial.state == HalfState::Closed && pair.reply.state == HalfState::Closed;
        }

        // Every correlation removal pairs with `clearThrottle` (core spec §4.5 teardown invariant).
        if self.pending_reply.remove(&reply_source).is_some() {
            sink.clear_throttle(accept_initial_id);
        }

        if both_closed {
            self.pairs.remove(&pair_key);
        }
    }
}

fn half_by_role<H>(pair: &Pair<H>, role: HalfRole) -> &ProxyHalf<H> {
    match role {
        HalfRole::Initial => &pair.initial,
        HalfRole::Reply => &pair.reply,
    }
}

fn half_by_role_mut<H>(pair: &mut Pair<H>, role: HalfRole) -> &mut ProxyHalf<H> {
    match role {
        HalfRole::Initial => &mut pair.initial,
        HalfRole::Reply => &mut pair.reply,
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use nukleus_wire::{AffinityId, RouteId, StreamId};

    use super::*;
    use crate::frame_writer::test_support::RecordingSink;

    struct FakeClock(RefCell<i64>);

    impl Clock for FakeClock {
        fn now_millis(&self) -> i64 {
            *self.0.borrow()
        }
    }

    #[derive(Default)]
    struct ManualExecutor {
        scheduled: Vec<(StreamRef, u32, i64)>,
        next_id: u64,
    }

    impl SignalingExecutor for ManualExecutor {
        type TimerHandle = u64;

        fn schedule(&mut self, stream: StreamRef, signal_id: u32, deadline_millis: i64) -> u64 {
            self.next_id += 1;
            self.scheduled.push((stream, signal_id, deadline_millis));
            self.next_id
        }

        fn cancel(&mut self, _handle: u64) {}
    }

    fn stream(route: u64, id: u64) -> StreamRef {
        StreamRef {
            route_id: RouteId(route),
            stream_id: StreamId(id),
        }
    }

    fn begin(stream: StreamRef, authorization: Authorization, affinity: u64, capabilities: Capabilities) -> BeginFrame {
        BeginFrame {
            stream,
            trace: 1,
            authorization,
            affinity: AffinityId(affinity),
            extension: HttpExtension::new(),
            capabilities,
        }
    }

    #[test]
    fn expiry_after_reply_answered_resets_source_and_aborts_target() {
        let mut proxy: Proxy<u64> = Proxy::new();
        let mut sink = RecordingSink::default();
        let mut exec = ManualExecutor::default();
        let clock = FakeClock(RefCell::new(0));

        let accept_initial = stream(1, 1);
        let connect_initial = stream(2, 1);
        let connect_reply = stream(2, 2);
        let accept_reply = stream(1, 2);

        let auth = Authorization::new(1 << 48);
        let b = begin(accept_initial, Authorization::NONE, 7, Capabilities(0));
        proxy.open(&b, connect_initial, connect_reply, accept_reply, Some(0), Some("alice"), auth, 60_000, 0, &mut sink, &mut exec);

        assert_eq!(sink.begins.len(), 1);
        assert_eq!(sink.begins[0].0, connect_initial);
        assert_eq!(sink.begins[0].2, auth);
        assert_eq!(exec.scheduled, vec![(connect_reply, GRANT_VALIDATION, 60_000)]);
        assert_eq!(proxy.live_grant_count(), 1);

        let downstream_begin = begin(connect_reply, auth, 7, Capabilities(0));
        proxy.new_reply_stream(&downstream_begin, &mut sink);
        assert_eq!(sink.begins[1].0, accept_reply);

        *clock.0.borrow_mut() = 60_000;
        proxy.on_timer_fire(connect_reply, &mut sink, &mut exec, &clock);

        assert_eq!(sink.resets, vec![connect_reply]);
        // Reply already answered (Active), so expiry aborts the target rather than synthesizing a 401.
        assert_eq!(sink.aborts, vec![(accept_reply, auth)]);
        assert_eq!(proxy.live_grant_count(), 0);
    }

    #[test]
    fn challenge_before_expiry_reschedules_then_aborts() {
        let mut proxy: Proxy<u64> = Proxy::new();
        let mut sink = RecordingSink::default();
        let mut exec = ManualExecutor::default();
        let clock = FakeClock(RefCell::new(0));

        let accept_initial = stream(1, 1);
        let connect_initial = stream(2, 1);
        let connect_reply = stream(2, 2);
        let accept_reply = stream(1, 2);

        let auth = Authorization::new(1 << 48);
        let b = begin(accept_initial, Authorization::NONE, 9, Capabilities::CHALLENGE);
        proxy.open(&b, connect_initial, connect_reply, accept_reply, Some(0), Some("bob"), auth, 100_000, 30_000, &mut sink, &mut exec);
        assert_eq!(exec.scheduled.last().unwrap().2, 70_000);

        let downstream_begin = begin(connect_reply, auth, 9, Capabilities::CHALLENGE);
        proxy.new_reply_stream(&downstream_begin, &mut sink);

        *clock.0.borrow_mut() = 70_000;
        proxy.on_timer_fire(connect_reply, &mut sink, &mut exec, &clock);
        assert_eq!(sink.signals.len(), 1);
        assert_eq!(exec.scheduled.last().unwrap().2, 100_000);

        *clock.0.borrow_mut() = 100_000;
        proxy.on_timer_fire(connect_reply, &mut sink, &mut exec, &clock);
        assert_eq!(sink.resets, vec![connect_reply]);
        assert_eq!(sink.aborts, vec![(accept_reply, auth)]);
    }

    #[test]
    fn expiry_before_reply_answers_synthesizes_401() {
        let mut proxy: Proxy<u64> = Proxy::new();
        let mut sink = RecordingSink::default();
        let mut exec = ManualExecutor::default();
        let clock = FakeClock(RefCell::new(0));

        let accept_initial = stream(1, 1);
        let connect_initial = stream(2, 1);
        let connect_reply = stream(2, 2);
        let accept_reply = stream(1, 2);

        let auth = Authorization::new(1 << 48);
        let b = begin(accept_initial, Authorization::NONE, 3, Capabilities(0));
        proxy.open(&b, connect_initial, connect_reply, accept_reply, Some(0), Some("carol"), auth, 5_000, 0, &mut sink, &mut exec);

        *clock.0.borrow_mut() = 5_000;
        proxy.on_timer_fire(connect_reply, &mut sink, &mut exec, &clock);

        assert_eq!(sink.resets, vec![connect_reply]);
        assert!(sink.aborts.is_empty());
        assert_eq!(sink.begins.last().unwrap().0, accept_reply);
        assert_eq!(sink.begins.last().unwrap().4, unauthorized_extension());
        assert_eq!(sink.ends.last().unwrap().0, accept_reply);
    }

    #[test]
    fn data_is_forwarded_to_the_twin_with_target_authorization() {
        let mut proxy: Proxy<u64> = Proxy::new();
        let mut sink = RecordingSink::default();
        let mut exec = ManualExecutor::default();

        let accept_initial = stream(1, 1);
        let connect_initial = stream(2, 1);
        let connect_reply = stream(2, 2);
        let accept_reply = stream(1, 2);

        let auth = Authorization::new(1 << 48);
        let b = begin(accept_initial, Authorization::NONE, 1, Capabilities(0));
        proxy.open(&b, connect_initial, connect_reply, accept_reply, None, None, auth, NEVER, 0, &mut sink, &mut exec);

        proxy.on_data(
            DataFrame {
                stream: accept_initial,
                trace: 2,
                padding: 0,
                authorization: Authorization::NONE,
                group_id: 0,
                payload: vec![1, 2, 3],
                extension: HttpExtension::new(),
            },
            &mut sink,
        );

        assert_eq!(sink.data, vec![(connect_initial, auth, vec![1, 2, 3])]);
    }

    #[test]
    fn reauthorization_extends_a_shared_grant_and_the_timer_fires_later() {
        let mut proxy: Proxy<u64> = Proxy::new();
        let mut sink = RecordingSink::default();
        let mut exec = ManualExecutor::default();
        let clock = FakeClock(RefCell::new(0));

        let auth = Authorization::new(1 << 48);

        let accept1 = stream(1, 1);
        let b1 = begin(accept1, Authorization::NONE, 42, Capabilities(0));
        proxy.open(&b1, stream(2, 1), stream(2, 2), stream(1, 2), Some(0), Some("alice"), auth, 10_000, 0, &mut sink, &mut exec);
        assert_eq!(proxy.live_grant_count(), 1);

        let accept2 = stream(1, 3);
        let b2 = begin(accept2, Authorization::NONE, 42, Capabilities(0));
        proxy.open(&b2, stream(2, 3), stream(2, 4), stream(1, 4), Some(0), Some("alice"), auth, 20_000, 0, &mut sink, &mut exec);
        assert_eq!(proxy.live_grant_count(), 1, "sibling streams for the same subject/affinity share one grant");

        *clock.0.borrow_mut() = 10_000;
        proxy.on_timer_fire(stream(2, 2), &mut sink, &mut exec, &clock);
        // The first half's timer was scheduled against the pre-reauth exp (10_000), but by the
        // time it fires the grant has been extended to 20_000 by the sibling stream.
        assert!(sink.resets.is_empty(), "remaining > 0 after the sibling's reauthorization, so no reset yet");
    }
}
