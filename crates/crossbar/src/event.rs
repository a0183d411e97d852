use crate::conn::{ConnectionId, Endpoint};

/// Everything the user callback can observe, in a total order.
///
/// Per connection the stream is: one birth event (`NewIncomingConnection`,
/// `OutgoingConnectionEstablished` or `OutgoingConnectionFailed`), any number
/// of `IncomingMessage`s, and at most one close event. `Stopped` is always
/// the last event of a bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent<M> {
    /// The bus was stopped locally.
    Stopped,
    /// A peer connected to our listening endpoint.
    NewIncomingConnection { source: Endpoint, id: ConnectionId },
    IncomingConnectionClosed { id: ConnectionId },
    /// A decoded message arrived. Delivered in wire order per connection.
    IncomingMessage { id: ConnectionId, message: M },
    /// An outgoing connect completed; messages may now flow both ways.
    OutgoingConnectionEstablished { id: ConnectionId },
    OutgoingConnectionFailed { id: ConnectionId },
    OutgoingConnectionClosed { id: ConnectionId },
}
