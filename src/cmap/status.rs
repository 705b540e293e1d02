//! Connection pool lifecycle states (§4.3).

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum PoolState {
    /// Initial state, and the state entered after a `drain()`. Pools still accept checkouts in
    /// this crate's implementation (unlike the full spec's checkout-blocks-until-ready
    /// behavior) because the operation executor is expected to re-select a server rather than
    /// wait on a paused pool directly.
    Paused,
    Ready,
    Closed,
}
