//! Fatal startup errors. Runtime conditions caused by peers (malformed
//! frames, duplicates, MAC send failures) are logged and absorbed instead.

use crate::Addr;

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    /// The `Fixed` parent strategy was selected without naming a parent.
    #[error("fixed parent strategy requires a parent address")]
    FixedParentWithoutAddress,

    /// The configured fixed parent was never heard during neighbour sensing.
    #[error("configured parent {0:#04x} is not a neighbour")]
    FixedParentNotNeighbour(Addr),

    /// The node's own address cannot be represented in the neighbour table.
    #[error("self address {0:#04x} is outside the addressable range")]
    InvalidSelfAddress(Addr),

    /// The configured sink address cannot be represented in the neighbour
    /// table.
    #[error("sink address {0:#04x} is outside the addressable range")]
    InvalidSinkAddress(Addr),

    /// The configured fixed parent cannot be represented in the neighbour
    /// table.
    #[error("parent address {0:#04x} is outside the addressable range")]
    InvalidParentAddress(Addr),
}
