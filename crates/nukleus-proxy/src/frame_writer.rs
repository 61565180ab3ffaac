//! Frame Writer glue: the narrow interface the proxy pair uses to emit
//! frames and throttle signals toward the router. Implemented by whatever
//! owns the real wire codec; this crate only ever calls these methods.

use nukleus_wire::{AffinityId, Authorization, Capabilities, HttpExtension, StreamId, StreamRef, Trace};

/// Emission side of the surrounding event-loop/router.
///
/// Every method corresponds 1:1 to a frame kind in `nukleus_wire::Frame`,
/// field-exact with the core spec's `EXTERNAL INTERFACES` section.
pub trait FrameSink {
    fn do_begin(
        &mut self,
        stream: StreamRef,
        trace: Trace,
        authorization: Authorization,
        affinity: AffinityId,
        extension: HttpExtension,
        capabilities: Capabilities,
    );

    fn do_data(
        &mut self,
        stream: StreamRef,
        trace: Trace,
        padding: u16,
        authorization: Authorization,
        group_id: u32,
        payload: Vec<u8>,
        extension: HttpExtension,
    );

    fn do_end(&mut self, stream: StreamRef, trace: Trace, authorization: Authorization, extension: HttpExtension);

    fn do_abort(&mut self, stream: StreamRef, trace: Trace, authorization: Authorization);

    fn do_window(&mut self, stream: StreamRef, credit: u32, padding: u16, group_id: u32, capabilities: Capabilities);

    fn do_reset(&mut self, stream: StreamRef);

    fn do_signal(&mut self, stream: StreamRef, signal_id: u32, trace: Trace, extension: HttpExtension);

    /// Called on every correlation-table removal, per the teardown
    /// invariant (core spec §4.5, testable property 7).
    fn clear_throttle(&mut self, accept_initial_id: StreamId);
}

/// The HTTP extension written on a challenge SIGNAL (core spec §6).
pub fn challenge_extension() -> HttpExtension {
    HttpExtension::new()
        .with_header(":method", "post")
        .with_header("content-type", "application/x-challenge-response")
}

/// The HTTP extension written on a synthesized 401 when a reply half
/// expires before the downstream ever answered.
pub fn unauthorized_extension() -> HttpExtension {
    HttpExtension::new().with_header(":status", "401")
}
