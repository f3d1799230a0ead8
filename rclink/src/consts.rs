//! Consts used in the whole rclink crate

/// Payload moved by every work request.
pub const MSG: &str = "******************************************************************************/";
pub const MSG_SIZE: usize = MSG.len() + 6;

/// Upper bound of one completion poll, in milliseconds.
pub const MAX_POLL_CQ_TIMEOUT_MS: u64 = 2000;

pub const DEFAULT_TCP_PORT: u16 = 19875;
pub const DEFAULT_IB_PORT: u8 = 1;

/// One send plus one receive completion.
pub const CQ_DEPTH: u32 = 2;

/// Barrier bytes. Their content is never checked.
pub const SYNC_AFTER_RTS: u8 = b'Q';
pub const SYNC_READ: u8 = b'R';
pub const SYNC_WRITE: u8 = b'W';

// QP attributes of the RC bring-up
pub const RC_MAX_RD_ATOMIC: u8 = 1;
pub const RC_MIN_RNR_TIMER: u8 = 0x12;
pub const RC_TIMEOUT: u8 = 0x12;
pub const RC_RETRY_COUNT: u8 = 6;
pub const RC_RNR_RETRY: u8 = 0;
pub const RC_HOP_LIMIT: u8 = 1;
