use crate::Error;
use crate::crypto::DerivedKey;
use crate::ratchet::arena::SkippedKeys;
use crate::ratchet::chain::Chain;
use zeroize::Zeroize;

/// Lifecycle of a session as seen from outside.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Active,
    /// Teardown has started but has not reached both directions yet.
    Closing,
    Closed,
}

/// Why a session was closed. Decides the error later calls report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed on request, for example by a chat wipe.
    Local,
    /// The underlying stream ended.
    Transport,
}

impl CloseReason {
    fn error(self) -> Error {
        match self {
            CloseReason::Local => Error::SessionClosed,
            CloseReason::Transport => Error::TransportClosed,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Status {
    Active,
    Closing(CloseReason),
    Closed(CloseReason),
}

/// Key material for one direction of a session. Always accessed under that
/// direction's lock, and the status tag is checked under the same lock.
///
/// Every key here is wiped when the state is dropped, closed or not.
pub(crate) struct DirectionState {
    pub(crate) status: Status,
    pub(crate) chain: Chain,
    pub(crate) header_key: DerivedKey,
    pub(crate) skipped: SkippedKeys,
}

impl DirectionState {
    pub(crate) fn new(chain_key: DerivedKey, header_key: DerivedKey) -> Self {
        Self {
            status: Status::Active,
            chain: Chain::new(chain_key),
            header_key,
            skipped: SkippedKeys::default(),
        }
    }

    pub(crate) fn ensure_active(&self) -> Result<(), Error> {
        match self.status {
            Status::Active => Ok(()),
            Status::Closing(reason) | Status::Closed(reason) => Err(reason.error()),
        }
    }

    /// Wipes the keys and marks the direction closed. A direction that is
    /// already closed keeps its original reason.
    pub(crate) fn close(&mut self, reason: CloseReason) -> bool {
        if self.status != Status::Active {
            return false;
        }

        self.status = Status::Closing(reason);
        self.chain.zeroize();
        self.header_key.zeroize();
        self.skipped.clear();
        self.status = Status::Closed(reason);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zeroize::{ZeroizeOnDrop, Zeroizing};

    fn direction_state() -> DirectionState {
        DirectionState::new(
            Zeroizing::new(Box::new([7u8; 32])),
            Zeroizing::new(Box::new([8u8; 32])),
        )
    }

    fn wiped_on_drop<T: ZeroizeOnDrop>(_: &T) {}

    #[test]
    fn test_keys_wiped_on_drop_without_close() {
        let state = direction_state();
        wiped_on_drop(&state.chain);
        wiped_on_drop(&state.header_key);
        assert_eq!(state.status, Status::Active);
    }

    #[test]
    fn test_close_wipes_and_keeps_first_reason() {
        let mut state = direction_state();
        state.chain.next().unwrap();
        assert!(state.ensure_active().is_ok());

        assert!(state.close(CloseReason::Transport));
        assert_eq!(**state.header_key, [0u8; 32]);
        assert_eq!(state.chain.index, 0);
        assert_eq!(state.ensure_active(), Err(Error::TransportClosed));

        assert!(!state.close(CloseReason::Local));
        assert_eq!(state.ensure_active(), Err(Error::TransportClosed));
    }
}
