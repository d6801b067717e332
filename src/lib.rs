// TFTP (RFC 1350) with the option extensions of RFC 2347/2348/2349,
// serving a rooted directory with multi-version overwrite semantics.
//
// Protocol refresher:
//
// A transfer opens with a read (RRQ) or write (WRQ) request to the
// server's well-known port. Each side then picks a transfer identifier, a
// UDP port, and the rest of the exchange runs between those two ports in
// lock step: one data packet, one ack, never more in flight. Block
// numbers start at 1; an ack of 0 accepts a write request or an option
// acknowledgement. A data packet shorter than the negotiated block size
// (512 bytes unless blksize was agreed) is the final one.
//
// Errors are courtesy packets: sent once, never retransmitted, never
// acked. Everything else that can go missing is covered by timeouts, with
// the last packet retransmitted while waiting.
//
// On top of the wire protocol this crate keeps every upload attempt as
// its own version of a file, recorded in SQLite. Downloads reserve the
// committed version that was current when they began and hold it until
// they finish, so an overwrite in progress is never observable and a
// completed overwrite never yanks a file out from under a reader. A
// background sweeper deletes versions once they are superseded and
// unread.

pub mod catalog;
pub mod client;
pub mod logger;
pub mod root;
pub mod server;
pub mod session;
pub mod sweeper;
pub mod wire;

/// Process exit codes shared by the binaries.
pub mod exit {
    pub const OK: i32 = 0;
    pub const CONFIG: i32 = 1;
    pub const CATALOG_INIT: i32 = 2;
    pub const SERVER_INIT: i32 = 3;
    pub const LOGGER_INIT: i32 = 4;
    /// Defined for completeness; the non-blocking sinks cannot report
    /// failure mid-run, so nothing currently exits with it.
    pub const LOGGER_FAILURE: i32 = 11;
    pub const LISTENER_FAILURE: i32 = 12;
    pub const UPLOAD_FAILED: i32 = 21;
    pub const DOWNLOAD_FAILED: i32 = 22;
}
