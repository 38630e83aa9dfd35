//! Error types for the Raft module.
//!
//! Most failure modes described by the protocol (transport failure, a
//! stale reply, an inconsistent client call) are recovered in place and
//! never reach here — see the module-level docs in `lib.rs`. What's left
//! is the small set of conditions that are genuinely fatal (persistence)
//! or a contract violation by a caller/peer.

error_chain! {
    errors {
        /// The persistence adapter failed to durably record state. The
        /// module cannot uphold Raft's safety guarantees without a
        /// working persister, so this is treated as fatal by callers.
        PersistFailed(detail: String) {
            description("persistence adapter failed")
            display("persistence adapter failed: {}", detail)
        }

        /// A peer sent an RPC whose arguments violate the wire contract
        /// (e.g. entries out of index order).
        MalformedRequest(detail: String) {
            description("malformed RPC request")
            display("malformed RPC request: {}", detail)
        }
    }
}
