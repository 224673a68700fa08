//! Optimistic mutations: the coordinator and the transport it calls.

mod coordinator;
mod transport;

pub use coordinator::{MutationCoordinator, MutationKind, MutationOutcome, Widget};
pub use transport::{
    HttpMutationTransport, MutationCall, MutationMethod, MutationResponse, MutationTransport,
};
