use std::error::Error;
use std::fmt;
use std::io;

/// Error produced while parsing or dispatching an incoming frame.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RxError {
    /// The buffer is smaller than the minimum header size of the protocol
    /// that was asked to parse it.
    ShortBuffer,

    /// A length field inside a header does not match the amount of data
    /// actually present in the buffer.
    InvalidLengthField,

    /// A verified checksum did not match the one in the header.
    ChecksumMismatch,

    /// The packet was valid but nothing in the stack wanted it, so it was
    /// dropped. Carries a short description of which layer dropped it.
    PacketDrop(String),

    /// The packet uses a protocol feature this stack does not implement.
    Unsupported,

    /// A source address field was all zeroes where a real address is
    /// required.
    ZeroSource,

    /// An internal receive buffer had no room for the payload.
    BufferFull,

    /// The node the packet was dispatched to has been closed. The parent
    /// deregisters the node upon seeing this.
    Closed,
}

impl fmt::Display for RxError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use self::RxError::*;
        fmt.write_str(self.description())?;
        match *self {
            PacketDrop(ref s) => fmt.write_str(&format!(": {}", s)),
            _ => Ok(()),
        }
    }
}

impl Error for RxError {
    fn description(&self) -> &str {
        use self::RxError::*;
        match *self {
            ShortBuffer => "Buffer too short for header",
            InvalidLengthField => "Invalid length field in packet",
            ChecksumMismatch => "Invalid checksum in packet",
            PacketDrop(..) => "Packet dropped",
            Unsupported => "Unsupported protocol feature",
            ZeroSource => "Zero source address",
            BufferFull => "Receive buffer full",
            Closed => "Node is closed",
        }
    }
}

/// Simple type definition for the return type of `demux`.
pub type RxResult = Result<(), RxError>;

/// Error produced while composing outgoing frames or by the user-facing
/// socket calls.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TxError {
    /// The node has been closed and will never produce or accept data
    /// again.
    Closed,

    /// The carrier buffer handed down from the parent layer is too small
    /// for the frame this node wants to emit.
    ShortBuffer,

    /// An internal transmit buffer or queue had no free space.
    BufferFull,

    /// A blocking user call did not finish before its configured deadline.
    DeadlineExceeded,

    /// Invalid argument or state for the requested operation.
    IllegalArgument,
}

impl fmt::Display for TxError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(self.description())
    }
}

impl Error for TxError {
    fn description(&self) -> &str {
        use self::TxError::*;
        match *self {
            Closed => "Connection closed",
            ShortBuffer => "Carrier buffer too short",
            BufferFull => "Transmit buffer full",
            DeadlineExceeded => "Deadline exceeded",
            IllegalArgument => "Illegal argument",
        }
    }
}

impl From<TxError> for io::Error {
    fn from(e: TxError) -> Self {
        let kind = match e {
            TxError::Closed => io::ErrorKind::NotConnected,
            TxError::ShortBuffer => io::ErrorKind::InvalidInput,
            TxError::BufferFull => io::ErrorKind::WouldBlock,
            TxError::DeadlineExceeded => io::ErrorKind::TimedOut,
            TxError::IllegalArgument => io::ErrorKind::InvalidInput,
        };
        io::Error::new(kind, e.description().to_owned())
    }
}

/// Type binding for the type of `Result` that `encapsulate` returns. The
/// success value is the number of frame bytes written to the carrier.
pub type TxResult<T> = Result<T, TxError>;

/// Accumulates parse errors so a whole header can be checked in one pass
/// and the errors inspected afterwards. Frame view `validate_size` methods
/// push into one of these instead of returning on the first problem.
#[derive(Debug, Default)]
pub struct Validator {
    errors: Vec<RxError>,
}

impl Validator {
    pub fn new() -> Validator {
        Validator { errors: Vec::new() }
    }

    /// Records one error. Does not short-circuit anything.
    pub fn push(&mut self, error: RxError) {
        self.errors.push(error);
    }

    pub fn has_error(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Returns all accumulated errors in the order they were pushed.
    pub fn errors(&self) -> &[RxError] {
        &self.errors
    }

    /// Converts the accumulated state into a `RxResult`, keeping the first
    /// recorded error.
    pub fn result(&self) -> RxResult {
        match self.errors.first() {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Forgets all recorded errors so the instance can be reused.
    pub fn reset(&mut self) {
        self.errors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn validator_keeps_first_error() {
        let mut v = Validator::new();
        assert_eq!(Ok(()), v.result());
        v.push(RxError::ShortBuffer);
        v.push(RxError::ChecksumMismatch);
        assert!(v.has_error());
        assert_eq!(Err(RxError::ShortBuffer), v.result());
        assert_eq!(2, v.errors().len());
        v.reset();
        assert_eq!(Ok(()), v.result());
    }

    #[test]
    fn tx_error_io_kinds() {
        let e: io::Error = TxError::DeadlineExceeded.into();
        assert_eq!(io::ErrorKind::TimedOut, e.kind());
        let e: io::Error = TxError::Closed.into();
        assert_eq!(io::ErrorKind::NotConnected, e.kind());
    }
}
